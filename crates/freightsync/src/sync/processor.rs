//! Queue draining.
//!
//! A pass claims due operations oldest first, delivers them one by one, and
//! records the outcome. Successful CREATEs swap the temporary id for the
//! server id everywhere it is referenced. Failures are either rescheduled
//! with backoff or marked failed for good.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::backoff::RetryPolicy;
use crate::api::RemoteApi;
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::model::{ids, is_temp_id, EntityTable, OfflineOperation, OperationType};
use crate::network::NetworkMonitor;
use crate::queue::{EntityGate, OperationQueue};
use crate::storage::{format_timestamp, LocalStore, META_LAST_SYNC};

/// Outcome of one processing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Operations a request was sent for.
    pub processed: usize,
    /// Operations delivered.
    pub completed: usize,
    /// Operations that failed and will be retried later.
    pub rescheduled: usize,
    /// Operations that failed for good.
    pub failed: usize,
    /// Another pass was already running; nothing was done.
    pub skipped: bool,
    /// The pass stopped early (session rejected or connectivity lost).
    pub aborted: bool,
    /// Time until the next pending operation becomes due.
    pub next_retry_in: Option<Duration>,
}

impl PassReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

impl std::fmt::Display for PassReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.skipped {
            return write!(f, "skipped (another pass is running)");
        }
        write!(
            f,
            "{} processed, {} completed, {} rescheduled, {} failed",
            self.processed, self.completed, self.rescheduled, self.failed
        )?;
        if self.aborted {
            write!(f, " (aborted)")?;
        }
        Ok(())
    }
}

enum FailureOutcome {
    Rescheduled,
    Failed,
}

/// Clears the running flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self(flag))
        }
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Delivers queued operations to the remote API.
#[derive(Debug)]
pub struct SyncProcessor {
    queue: Arc<OperationQueue>,
    api: Arc<dyn RemoteApi>,
    network: Arc<NetworkMonitor>,
    policy: RetryPolicy,
    batch_size: usize,
    running: AtomicBool,
}

impl SyncProcessor {
    /// Create a processor with the given retry policy and batch size.
    #[must_use]
    pub fn new(
        queue: Arc<OperationQueue>,
        api: Arc<dyn RemoteApi>,
        network: Arc<NetworkMonitor>,
        policy: RetryPolicy,
        batch_size: usize,
    ) -> Self {
        Self {
            queue,
            api,
            network,
            policy,
            batch_size: batch_size.max(1),
            running: AtomicBool::new(false),
        }
    }

    /// Create a processor from the `sync` configuration section.
    #[must_use]
    pub fn from_config(
        config: &SyncConfig,
        queue: Arc<OperationQueue>,
        api: Arc<dyn RemoteApi>,
        network: Arc<NetworkMonitor>,
    ) -> Self {
        Self::new(
            queue,
            api,
            network,
            RetryPolicy::from_config(config),
            config.batch_size,
        )
    }

    /// The retry policy in use.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Whether a pass is in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn store(&self) -> &Arc<dyn LocalStore> {
        self.queue.store()
    }

    /// Run one pass over up to `batch_size` due operations.
    ///
    /// Returns a skipped report immediately if a pass is already running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Offline`] if the device is offline, or a storage
    /// error if the queue cannot be read or updated. An operation whose
    /// outcome could not be recorded is marked failed before the error is
    /// returned.
    pub async fn process_pending(&self) -> Result<PassReport> {
        let Some(_guard) = PassGuard::acquire(&self.running) else {
            debug!("Sync pass already running");
            return Ok(PassReport::skipped());
        };
        self.network.require_online()?;

        let batch = self.queue.dequeue_pending(self.batch_size)?;
        let mut report = PassReport::default();
        let mut gate = EntityGate::default();

        for queued in batch {
            if !self.network.is_online() {
                info!("Connectivity lost, stopping sync pass");
                report.aborted = true;
                break;
            }
            if gate.is_blocked(&queued) || !self.queue.mark_syncing(&queued.id)? {
                continue;
            }
            // Earlier operations in this pass may have remapped ids in this one.
            let Some(op) = self.queue.get(&queued.id)? else {
                continue;
            };

            report.processed += 1;
            match self.deliver(&op).await {
                Ok(response) => {
                    if let Err(e) = self.on_success(&op, &response) {
                        self.abandon(&op, &format!("delivered, but recording it failed: {e}"));
                        return Err(e);
                    }
                    report.completed += 1;
                }
                Err(e) if e.is_session_expired() => {
                    self.queue.release(&op.id)?;
                    warn!(id = %op.id, "Session rejected, stopping sync pass");
                    report.aborted = true;
                    break;
                }
                Err(e) => {
                    gate.block(&op);
                    match self.on_failure(&op, &e) {
                        Ok(FailureOutcome::Rescheduled) => report.rescheduled += 1,
                        Ok(FailureOutcome::Failed) => report.failed += 1,
                        Err(store_err) => {
                            self.abandon(&op, &e.to_string());
                            return Err(store_err);
                        }
                    }
                }
            }
        }

        report.next_retry_in = if report.aborted {
            None
        } else {
            self.queue
                .next_due_at()?
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
        };
        self.store()
            .set_meta(META_LAST_SYNC, &format_timestamp(Utc::now()))?;

        if report.processed > 0 {
            info!(
                processed = report.processed,
                completed = report.completed,
                rescheduled = report.rescheduled,
                failed = report.failed,
                "Sync pass finished"
            );
        }
        Ok(report)
    }

    /// Take a claimed operation out of `syncing` after its outcome could
    /// not be recorded. It is failed rather than released so that a request
    /// the server may already have applied is not sent again on its own.
    fn abandon(&self, op: &OfflineOperation, reason: &str) {
        match self.queue.mark_failed(&op.id, op.retry_count, reason) {
            Ok(()) => error!(id = %op.id, reason, "Operation abandoned"),
            Err(e) => error!(id = %op.id, error = %e, "Operation left claimed"),
        }
    }

    async fn deliver(&self, op: &OfflineOperation) -> Result<Value> {
        let body = match op.op_type {
            OperationType::Delete => None,
            _ if op.payload.is_null() => None,
            _ => Some(&op.payload),
        };
        debug!(id = %op.id, op = %op.op_type, endpoint = %op.endpoint, "Delivering operation");

        match self
            .api
            .request(op.op_type.http_method(), &op.endpoint, body)
            .await
        {
            Err(e) if op.op_type == OperationType::Delete && e.is_not_found() => {
                debug!(id = %op.id, "Row already gone on the server");
                Ok(Value::Null)
            }
            other => other,
        }
    }

    fn on_success(&self, op: &OfflineOperation, response: &Value) -> Result<()> {
        let table = EntityTable::from_name(&op.table_name);

        if let (Some(table), Some(local_id)) = (table, op.entity_id.as_deref()) {
            match op.op_type {
                OperationType::Create => {
                    let row_id = match response.get("id").and_then(ids::from_value) {
                        Some(server_id) if server_id != local_id => {
                            self.store().reconcile_id(table, local_id, &server_id)?;
                            self.queue.remap(local_id, &server_id)?;
                            info!(table = %table, temp_id = local_id, server_id = %server_id, "Reconciled id");
                            server_id
                        }
                        Some(server_id) => server_id,
                        None => {
                            warn!(id = %op.id, "CREATE response carried no id");
                            local_id.to_string()
                        }
                    };
                    self.finish_row(table, &row_id, &op.id)?;
                }
                OperationType::Update => self.finish_row(table, local_id, &op.id)?,
                OperationType::Delete => {
                    if !self.queue.has_outstanding_for(table.as_str(), local_id, &op.id)? {
                        self.store().purge_row(table, local_id)?;
                    }
                }
            }
        }

        self.queue.mark_completed(&op.id)
    }

    /// Mark a row clean unless more changes to it are still queued.
    fn finish_row(&self, table: EntityTable, id: &str, op_id: &str) -> Result<()> {
        if self.queue.has_outstanding_for(table.as_str(), id, op_id)? {
            return Ok(());
        }
        self.store().mark_synced(table, id)
    }

    fn on_failure(&self, op: &OfflineOperation, err: &Error) -> Result<FailureOutcome> {
        let retry_count = op.retry_count + 1;
        let message = err.to_string();

        if err.is_retryable() && !self.policy.is_exhausted(retry_count) {
            let delay = self.policy.delay_for_attempt(retry_count);
            let at = Utc::now()
                + chrono::Duration::from_std(delay)
                    .map_err(|e| Error::internal(format!("retry delay out of range: {e}")))?;
            self.queue
                .schedule_retry(&op.id, retry_count, at, &message)?;
            warn!(
                id = %op.id,
                attempt = retry_count,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Operation failed, retry scheduled"
            );
            Ok(FailureOutcome::Rescheduled)
        } else {
            self.queue.mark_failed(&op.id, retry_count, &message)?;
            error!(
                id = %op.id,
                op = %op.op_type,
                endpoint = %op.endpoint,
                attempts = retry_count,
                error = %err,
                "Operation failed permanently"
            );
            if op.op_type == OperationType::Create
                && op.entity_id.as_deref().is_some_and(is_temp_id)
            {
                self.queue.fail_dependents(op)?;
            }
            Ok(FailureOutcome::Failed)
        }
    }
}
