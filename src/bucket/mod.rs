//! Token bucket of a single client.
//!
//! A bucket counts the units a client has consumed. Admission is granted while
//! `consumed + units <= capacity`; a [`RefillScheduler`] running in the background
//! gives back `refill_amount` units on every tick of `refill_interval`.
//!
//! ```text
//! Created --start()--> Running --stop()--> Stopped
//! ```
//!
//! A stopped bucket is retired: its counter is frozen and it cannot be restarted.
mod scheduler;

use std::{
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::*;
use tokio::{sync::Mutex, task::JoinHandle};

use crate::{config::BucketPolicy, Error, Result};
use scheduler::RefillScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BucketStatus {
    Created, // refill process not started yet
    Running, // refill process ticking
    Stopped, // refill process cancelled, bucket retired
}

#[derive(Debug)]
struct Lifecycle {
    status: BucketStatus,
    /// Buffered (capacity 1) so that `stop` never waits for the scheduler.
    cancel: Option<async_channel::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill_interval: Duration,
    refill_amount: u64,
    /// Shared with the refill scheduler. Every read-modify-write happens under this lock.
    consumed: Arc<Mutex<u64>>,
    lifecycle: StdMutex<Lifecycle>,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_interval: Duration, refill_amount: u64) -> Self {
        Self {
            capacity,
            refill_interval,
            refill_amount,
            consumed: Arc::new(Mutex::new(0)),
            lifecycle: StdMutex::new(Lifecycle {
                status: BucketStatus::Created,
                cancel: None,
                task: None,
            }),
        }
    }

    pub fn from_policy(policy: &BucketPolicy) -> Self {
        Self::new(
            policy.capacity,
            policy.refill_interval(),
            policy.refill_amount,
        )
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    pub fn refill_amount(&self) -> u64 {
        self.refill_amount
    }

    pub fn status(&self) -> BucketStatus {
        self.lifecycle().status
    }

    /// Whether the refill task is alive. It may still be winding down
    /// for a short while after `stop`.
    pub fn is_refilling(&self) -> bool {
        self.lifecycle()
            .task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        // nothing panics while holding this lock, keep going if it ever got poisoned
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launch the refill process. Must be called from within a tokio runtime.
    /// Valid only once, from `Created`.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.status != BucketStatus::Created {
            error!(target: "TokenBucket::start", "bucket already started ({:?})", lifecycle.status);
            return Err(Error::AlreadyStarted);
        }
        if tokio::runtime::Handle::try_current().is_err() {
            let msg = "cannot start refill process outside of a tokio runtime".to_string();
            error!(target: "TokenBucket::start", "{msg}");
            return Err(Error::Runtime(msg));
        }

        let (cancel_tx, cancel_rx) = async_channel::bounded(1);
        let scheduler = RefillScheduler::new(
            self.consumed.clone(),
            self.refill_interval,
            self.refill_amount,
            cancel_rx,
        );
        lifecycle.task = Some(scheduler.spawn());
        lifecycle.cancel = Some(cancel_tx);
        lifecycle.status = BucketStatus::Running;
        Ok(())
    }

    /// Signal the refill process to exit and retire the bucket. Never blocks.
    /// Valid only from `Running`.
    pub fn stop(&self) -> Result<()> {
        self.retire().map_err(|e| {
            error!(target: "TokenBucket::stop", "bucket not running ({:?})", self.status());
            e
        })
    }

    /// `stop` without the error report, for owners that may race with another stopper.
    pub(crate) fn retire(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.status != BucketStatus::Running {
            return Err(Error::NotStarted);
        }
        if let Some(cancel) = lifecycle.cancel.take() {
            // only ever one message on a channel of capacity one, so it cannot be full
            if cancel.try_send(()).is_err() {
                warn!(target: "TokenBucket::stop", "refill process already gone");
            }
        }
        lifecycle.status = BucketStatus::Stopped;
        Ok(())
    }

    /// Wait for the refill task to finish. Returns immediately if it was never
    /// started or has already been joined. On a running bucket this waits until
    /// someone else calls `stop`.
    pub async fn join(&self) {
        let task = self.lifecycle().task.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(target: "TokenBucket::join", "refill task ended abnormally: {e}");
            }
        }
    }

    /// Admission decision: take `units` from the bucket if they are available.
    /// On rejection nothing is consumed.
    pub async fn try_consume(&self, units: u64) -> Result<()> {
        let mut consumed = self.consumed.lock().await;
        if self.capacity - *consumed < units {
            debug!(target: "TokenBucket::try_consume", "rejecting {units} unit(s), {} left", self.capacity - *consumed);
            return Err(Error::CapacityExceeded);
        }
        *consumed += units;
        Ok(())
    }

    /// Units consumed and not yet refilled.
    pub async fn consumed(&self) -> u64 {
        *self.consumed.lock().await
    }

    /// Units that can still be consumed right now.
    pub async fn available(&self) -> u64 {
        self.capacity - *self.consumed.lock().await
    }
}
