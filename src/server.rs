//! HTTP front of the admission layer
use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc};

use hyper::{
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use log::*;
use serde_json::json;

use crate::{config::GatewayConfig, AdmissionControl, BucketRegistry, Error, Result};

pub const LIMIT_PATH: &'static str = "/limit";

fn respond_with_json(code: StatusCode, payload: serde_json::Value) -> Response<Body> {
    let mut response = Response::new(Body::from(payload.to_string()));
    *response.status_mut() = code;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn respond_with_error(code: StatusCode, message: &str) -> Response<Body> {
    respond_with_json(code, json!({ "error": message }))
}

/// Handle one request: route, extract the API key from `key_header`, then ask
/// `admission` whether the client may proceed.
pub async fn handle<A>(
    admission: &A,
    key_header: &str,
    req: Request<Body>,
) -> std::result::Result<Response<Body>, Infallible>
where
    A: AdmissionControl + ?Sized,
{
    if req.uri().path() != LIMIT_PATH {
        return Ok(respond_with_error(StatusCode::NOT_FOUND, "not found"));
    }

    let key = req
        .headers()
        .get(key_header)
        .and_then(|value| value.to_str().ok())
        .filter(|key| !key.is_empty());
    let key = match key {
        Some(key) => key,
        None => {
            debug!(target: "server::handle", "request without API key");
            return Ok(respond_with_error(StatusCode::FORBIDDEN, "missing api key"));
        }
    };

    let response = match admission.admit(key).await {
        Ok(()) => respond_with_json(StatusCode::OK, json!("hit endpoint successfully")),
        Err(Error::CapacityExceeded) => {
            respond_with_error(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded")
        }
        Err(e) => {
            error!(target: "server::handle", "admission failed: {e}");
            respond_with_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    };
    Ok(response)
}

/// Serve on `addr` until `signal` resolves.
pub async fn serve_with_shutdown<A, F>(
    admission: Arc<A>,
    key_header: Arc<str>,
    addr: SocketAddr,
    signal: F,
) -> Result<()>
where
    A: AdmissionControl + 'static,
    F: Future<Output = ()>,
{
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        trace!(target: "server::serve", "connection from {}", conn.remote_addr());
        let admission = admission.clone();
        let key_header = key_header.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let admission = admission.clone();
                let key_header = key_header.clone();
                async move { handle(admission.as_ref(), &key_header, req).await }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!(target: "server::serve", "listening on {}", server.local_addr());
    server.with_graceful_shutdown(signal).await?;
    Ok(())
}

/// Run the gateway described by `config` until ctrl-c, then stop every bucket.
pub async fn serve(config: GatewayConfig) -> Result<()> {
    config.validate()?;
    let addr: SocketAddr = config.listen.parse().map_err(|e| {
        let msg = format!("Invalid listen address {}: {e}", config.listen);
        error!("{msg}");
        Error::Config(msg)
    })?;

    let registry = Arc::new(BucketRegistry::new(config.policy)?);
    let key_header: Arc<str> = Arc::from(config.key_header.as_str());

    let result = serve_with_shutdown(registry.clone(), key_header, addr, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(target: "server::serve", "fail to listen for ctrl-c: {e}");
        }
        info!(target: "server::serve", "shutting down");
    })
    .await;

    registry.shutdown().await;
    result
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::BucketPolicy;
    use async_trait::async_trait;
    use std::time::Duration;

    struct AlwaysFailing;

    #[async_trait]
    impl AdmissionControl for AlwaysFailing {
        async fn admit(&self, _key: &str) -> Result<()> {
            Err(Error::RegistryClosed)
        }
    }

    fn request(path: &str, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri(path);
        if let Some(key) = key {
            builder = builder.header("X-API-KEY", key);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn registry(capacity: u64) -> BucketRegistry {
        BucketRegistry::new(BucketPolicy::new(capacity, Duration::from_secs(1), capacity)).unwrap()
    }

    #[tokio::test]
    async fn test_admitted_then_rate_limited() {
        let registry = registry(2);
        for _ in 0..2 {
            let response = handle(&registry, "X-API-KEY", request("/limit", Some("k")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers().get(CONTENT_TYPE).unwrap(),
                "application/json"
            );
            assert_eq!(body_json(response).await, json!("hit endpoint successfully"));
        }

        let response = handle(&registry, "X-API-KEY", request("/limit", Some("k")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "rate limit exceeded" })
        );
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_or_empty_key() {
        let registry = registry(2);
        for key in [None, Some("")] {
            let response = handle(&registry, "X-API-KEY", request("/limit", key))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN);
        }
        // rejected before reaching the registry
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_header_name_is_case_insensitive() {
        let registry = registry(2);
        let response = handle(&registry, "x-api-key", request("/limit", Some("k")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let registry = registry(2);
        let response = handle(&registry, "X-API-KEY", request("/other", Some("k")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_internal_error() {
        let response = handle(&AlwaysFailing, "X-API-KEY", request("/limit", Some("k")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_serve_stops_on_signal() {
        let registry = Arc::new(registry(2));
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        serve_with_shutdown(registry, Arc::from("X-API-KEY"), addr, async {})
            .await
            .unwrap();
    }
}
