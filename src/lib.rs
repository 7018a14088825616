//! Per-client token-bucket admission control.
//!
//! A [`BucketRegistry`] hands out one [`TokenBucket`] per client key; each bucket
//! refills itself in the background until it is stopped. The [`server`] module
//! puts an HTTP front on top of it.
pub mod bucket;
pub mod config;
mod error;
pub mod registry;
pub mod server;
pub use crate::bucket::{BucketStatus, TokenBucket};
pub use crate::error::{Error, Result};
pub use crate::registry::{AdmissionControl, BucketRegistry};
