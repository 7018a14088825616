use bucketgate::config::GatewayConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize env logger
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();

    let config = GatewayConfig::load()?;
    bucketgate::server::serve(config).await?;
    Ok(())
}
