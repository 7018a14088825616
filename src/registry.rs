use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use async_trait::async_trait;
use log::*;

use crate::{bucket::BucketStatus, config::BucketPolicy, Error, Result, TokenBucket};

/// Admission seam used by the HTTP layer.
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Charge one unit to the client identified by `key`.
    /// `Err(Error::CapacityExceeded)` is the routine rejection.
    async fn admit(&self, key: &str) -> Result<()>;
}

/// Owns one running [`TokenBucket`] per client key.
///
/// Lookups of known keys share a read lock; only creating a bucket for a new key
/// takes the write lock. Buckets are never removed while the registry lives.
#[derive(Debug)]
pub struct BucketRegistry {
    policy: BucketPolicy,
    entries: RwLock<HashMap<String, Arc<TokenBucket>>>,
    is_closed: AtomicBool,
    /// Buckets this registry has started, i.e. refill tasks it has spawned.
    started: AtomicUsize,
}

impl BucketRegistry {
    pub fn new(policy: BucketPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            entries: RwLock::new(HashMap::new()),
            is_closed: AtomicBool::new(false),
            started: AtomicUsize::new(0),
        })
    }

    pub fn policy(&self) -> &BucketPolicy {
        &self.policy
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        self.is_closed.store(true, Ordering::Release);
    }

    /// Number of buckets started over the registry's lifetime. Equals `len()`:
    /// a bucket is started only when it is inserted.
    pub fn started_count(&self) -> usize {
        self.started.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The bucket of `key`, if one has been created. Never creates.
    pub fn get(&self, key: &str) -> Option<Arc<TokenBucket>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Get-or-create. Concurrent first calls for the same key all receive the
    /// same bucket, and only that one bucket gets started.
    pub fn resolve(&self, key: &str) -> Result<Arc<TokenBucket>> {
        if self.is_closed() {
            return Err(Error::RegistryClosed);
        }
        if let Some(bucket) = self.get(key) {
            return Ok(bucket);
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        // shutdown may have drained the map while we waited for the lock
        if self.is_closed() {
            return Err(Error::RegistryClosed);
        }
        // another caller may have created it while we waited for the lock
        if let Some(bucket) = entries.get(key) {
            return Ok(bucket.clone());
        }

        let bucket = Arc::new(TokenBucket::from_policy(&self.policy));
        bucket.start()?;
        self.started.fetch_add(1, Ordering::AcqRel);
        entries.insert(key.to_string(), bucket.clone());
        info!(target: "BucketRegistry::resolve", "created bucket for new client, {} client(s) known", entries.len());
        Ok(bucket)
    }

    /// Close the registry, stop every running bucket and wait for their
    /// refill tasks to exit.
    pub async fn shutdown(&self) {
        let buckets: Vec<Arc<TokenBucket>> = {
            let entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            self.mark_closed();
            entries.values().cloned().collect()
        };

        info!(target: "BucketRegistry::shutdown", "stopping {} bucket(s)", buckets.len());
        for bucket in buckets.iter() {
            match bucket.retire() {
                Ok(()) => (),
                // already retired by its holder
                Err(Error::NotStarted) => {
                    debug!(target: "BucketRegistry::shutdown", "bucket already stopped")
                }
                Err(e) => warn!(target: "BucketRegistry::shutdown", "fail to stop bucket: {e}"),
            }
        }
        for bucket in buckets.iter() {
            bucket.join().await;
        }
    }
}

#[async_trait]
impl AdmissionControl for BucketRegistry {
    async fn admit(&self, key: &str) -> Result<()> {
        let bucket = self.resolve(key)?;
        bucket.try_consume(1).await
    }
}
