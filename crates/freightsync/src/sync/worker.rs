//! Background sync loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::processor::SyncProcessor;
use crate::error::Error;
use crate::handle::ServiceHandle;
use crate::network::NetworkMonitor;
use crate::queue::OperationQueue;

/// Owns the processor and decides when a pass runs.
///
/// A pass is attempted on every interval tick, whenever the queue signals
/// new work, when the network comes back online, and when the earliest
/// scheduled retry becomes due. Passes only run while online.
#[derive(Debug)]
pub struct SyncWorker {
    processor: Arc<SyncProcessor>,
    queue: Arc<OperationQueue>,
    network: Arc<NetworkMonitor>,
    interval: Duration,
    retention: Duration,
}

impl SyncWorker {
    /// Create a worker.
    ///
    /// `retention` is how long completed operations are kept before the
    /// periodic tick purges them.
    #[must_use]
    pub fn new(
        processor: Arc<SyncProcessor>,
        queue: Arc<OperationQueue>,
        network: Arc<NetworkMonitor>,
        interval: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            processor,
            queue,
            network,
            interval,
            retention,
        }
    }

    /// Ask for a pass as soon as possible.
    pub fn trigger(&self) {
        self.queue.wake_handle().notify_one();
    }

    /// Spawn the loop on the current runtime.
    pub fn start(self: Arc<Self>, handle: ServiceHandle) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(handle).await })
    }

    /// Run the loop until `handle` is stopped.
    pub async fn run(&self, handle: ServiceHandle) {
        info!(interval_secs = self.interval.as_secs(), "Sync worker started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut network = self.network.subscribe();
        let wake = self.queue.wake_handle();
        let mut retry_at: Option<Instant> = None;

        loop {
            tokio::select! {
                () = handle.stopped() => {
                    info!("Sync worker received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    self.purge_completed();
                }
                () = wake.notified() => {
                    debug!("Sync worker woken by queue");
                }
                changed = network.changed() => {
                    if changed.is_err() {
                        warn!("Network monitor went away, stopping sync worker");
                        break;
                    }
                    if !network.borrow_and_update().is_online() {
                        continue;
                    }
                    debug!("Back online, draining queue");
                }
                () = sleep_until(retry_at) => {
                    debug!("Scheduled retry due");
                }
            }

            retry_at = self.run_pass().await;
        }

        info!("Sync worker stopped");
    }

    /// Run one pass and return when the next one should happen.
    async fn run_pass(&self) -> Option<Instant> {
        if !self.network.is_online() {
            debug!("Skipping sync pass while offline");
            return None;
        }

        match self.processor.process_pending().await {
            Ok(report) if report.skipped => None,
            Ok(report) => report.next_retry_in.map(|wait| Instant::now() + wait),
            Err(Error::Offline) => None,
            Err(e) => {
                error!(error = %e, "Sync pass failed");
                None
            }
        }
    }

    fn purge_completed(&self) {
        if let Err(e) = self.queue.purge_completed(self.retention) {
            warn!(error = %e, "Failed to purge completed operations");
        }
    }
}

fn sleep_until(at: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}
