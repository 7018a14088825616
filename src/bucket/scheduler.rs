//! Background refill task of a single bucket
use std::{sync::Arc, time::Duration};

use log::*;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};

/// Periodically gives back `amount` units to the counter it shares with its bucket.
/// Runs until the cancel channel yields a message or is closed (bucket dropped).
#[derive(Debug)]
pub(crate) struct RefillScheduler {
    consumed: Arc<Mutex<u64>>,
    interval: Duration,
    amount: u64,
    cancel: async_channel::Receiver<()>,
}

impl RefillScheduler {
    pub(crate) fn new(
        consumed: Arc<Mutex<u64>>,
        interval: Duration,
        amount: u64,
        cancel: async_channel::Receiver<()>,
    ) -> Self {
        Self {
            consumed,
            interval,
            amount,
            cancel,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        // first tick one full interval after start, not immediately
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(target: "RefillScheduler::run", "refilling {} every {:?}", self.amount, self.interval);

        loop {
            tokio::select! {
                // a pending cancel wins over a tick that became ready at the same time
                biased;
                msg = self.cancel.recv() => {
                    match msg {
                        Ok(()) => debug!(target: "RefillScheduler::run", "cancelled"),
                        Err(_) => debug!(target: "RefillScheduler::run", "bucket gone, exiting"),
                    }
                    return;
                }
                _ = ticker.tick() => self.refill().await,
            }
        }
    }

    async fn refill(&self) {
        let mut consumed = self.consumed.lock().await;
        *consumed = consumed.saturating_sub(self.amount);
    }
}
