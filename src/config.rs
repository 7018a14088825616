use std::{path::Path, time::Duration};

use log::*;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const CONFIG_PATH_ENV: &'static str = "BUCKETGATE_CONFIG";
pub const LISTEN_ENV: &'static str = "BUCKETGATE_LISTEN";
pub const KEY_HEADER_ENV: &'static str = "BUCKETGATE_KEY_HEADER";
pub const CAPACITY_ENV: &'static str = "BUCKETGATE_CAPACITY";
pub const REFILL_INTERVAL_ENV: &'static str = "BUCKETGATE_REFILL_INTERVAL_MS";
pub const REFILL_AMOUNT_ENV: &'static str = "BUCKETGATE_REFILL_AMOUNT";

pub const DEFAULT_LISTEN: &'static str = "0.0.0.0:3000";
pub const DEFAULT_KEY_HEADER: &'static str = "X-API-KEY";
pub const DEFAULT_CAPACITY: u64 = 10;
pub const DEFAULT_REFILL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_REFILL_AMOUNT: u64 = 10;

/// Refill policy shared by every client bucket.
/// Fixed at startup; all callers get the same limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(default)]
pub struct BucketPolicy {
    /// Maximum number of outstanding consumption units per client.
    pub capacity: u64,

    /// Time between two refill ticks. Written as (possibly fractional)
    /// milliseconds in configuration files.
    #[serde(rename = "refill_interval_ms", with = "millis")]
    pub refill_interval: Duration,

    /// Units restored on every refill tick.
    pub refill_amount: u64,
}

impl Default for BucketPolicy {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            refill_interval: Duration::from_millis(DEFAULT_REFILL_INTERVAL_MS),
            refill_amount: DEFAULT_REFILL_AMOUNT,
        }
    }
}

impl BucketPolicy {
    pub fn new(capacity: u64, refill_interval: Duration, refill_amount: u64) -> Self {
        Self {
            capacity,
            refill_interval,
            refill_amount,
        }
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    pub fn validate(&self) -> Result<()> {
        // tokio's interval panics on a zero period
        if self.refill_interval.is_zero() {
            let msg = "refill interval must be positive".to_string();
            error!("{msg}");
            return Err(Error::Config(msg));
        }
        Ok(())
    }
}

/// Serde form of a refill interval: whole milliseconds as an integer,
/// anything finer as a fractional number of milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    const NANOS_PER_MILLI: u128 = 1_000_000;

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Millis {
        Whole(u64),
        Fractional(f64),
    }

    pub fn serialize<S: Serializer>(interval: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = interval.as_nanos();
        let millis = if nanos % NANOS_PER_MILLI == 0 {
            Millis::Whole((nanos / NANOS_PER_MILLI) as u64)
        } else {
            Millis::Fractional(nanos as f64 / NANOS_PER_MILLI as f64)
        };
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Millis::deserialize(deserializer)? {
            Millis::Whole(ms) => Ok(Duration::from_millis(ms)),
            Millis::Fractional(ms) if ms.is_finite() && ms >= 0.0 => {
                Ok(Duration::from_nanos((ms * NANOS_PER_MILLI as f64).round() as u64))
            }
            Millis::Fractional(ms) => Err(de::Error::custom(format!(
                "invalid refill interval {ms} ms"
            ))),
        }
    }
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(default)]
pub struct GatewayConfig {
    /// Socket address the HTTP server binds to, e.g. "0.0.0.0:3000".
    pub listen: String,

    /// Request header carrying the client's API key.
    pub key_header: String,

    /// Token bucket policy applied to every client key.
    #[serde(flatten)]
    pub policy: BucketPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            key_header: DEFAULT_KEY_HEADER.to_string(),
            policy: BucketPolicy::default(),
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.listen.parse::<std::net::SocketAddr>().is_err() {
            let msg = format!("Invalid listen address {}", self.listen);
            error!("{msg}");
            return Err(Error::Config(msg));
        }
        if self.key_header.is_empty() {
            let msg = "API key header name must not be empty".to_string();
            error!("{msg}");
            return Err(Error::Config(msg));
        }
        self.policy.validate()
    }

    /// Read configuration from a JSON file. Missing fields fall back to defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| {
            let msg = format!("Fail to decode configuration: {e}");
            error!("{msg}");
            Error::Decode(msg)
        })
    }

    /// Build configuration from `BUCKETGATE_*` environment variables,
    /// using defaults for the ones that are not set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(listen) = std::env::var(LISTEN_ENV) {
            config.listen = listen;
        }
        if let Ok(header) = std::env::var(KEY_HEADER_ENV) {
            config.key_header = header;
        }
        config.policy.capacity = env_u64(CAPACITY_ENV, config.policy.capacity)?;
        if std::env::var(REFILL_INTERVAL_ENV).is_ok() {
            config.policy.refill_interval =
                Duration::from_millis(env_u64(REFILL_INTERVAL_ENV, DEFAULT_REFILL_INTERVAL_MS)?);
        }
        config.policy.refill_amount = env_u64(REFILL_AMOUNT_ENV, config.policy.refill_amount)?;
        Ok(config)
    }

    /// Load from the file named by `BUCKETGATE_CONFIG` if set, otherwise from the environment.
    pub fn load() -> Result<Self> {
        let config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => {
                info!("Loading configuration from {path}");
                Self::from_json_file(path)?
            }
            Err(_) => Self::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }
}

fn env_u64(name: &'static str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(s) => s.trim().parse().map_err(|e| {
            let msg = format!("Invalid {name} value {s:?}: {e}");
            error!("{msg}");
            Error::Config(msg)
        }),
        Err(_) => Ok(default),
    }
}
