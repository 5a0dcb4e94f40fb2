//! The offline operations queue.
//!
//! Every local mutation becomes an [`OfflineOperation`] here. Enqueueing
//! never touches the network; it only wakes the sync worker when the device
//! is currently online.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{
    is_temp_id, EntityTable, OfflineOperation, OperationStatus, OperationType, QueueStats,
};
use crate::network::NetworkState;
use crate::storage::LocalStore;

/// Tracks entities whose operations must not run yet.
///
/// Once an operation is held back (not due, or failed in this pass), every
/// later operation on the same entity, and every operation referencing its
/// temporary id, is held back too.
#[derive(Debug, Default)]
pub(crate) struct EntityGate {
    keys: HashSet<String>,
    temp_ids: HashSet<String>,
}

impl EntityGate {
    pub(crate) fn is_blocked(&self, op: &OfflineOperation) -> bool {
        op.entity_key().is_some_and(|key| self.keys.contains(&key))
            || op
                .referenced_temp_ids()
                .iter()
                .any(|id| self.temp_ids.contains(*id))
    }

    pub(crate) fn block(&mut self, op: &OfflineOperation) {
        if let Some(key) = op.entity_key() {
            self.keys.insert(key);
        }
        if let Some(id) = op.entity_id.as_deref().filter(|id| is_temp_id(id)) {
            self.temp_ids.insert(id.to_string());
        }
    }
}

/// Persistent queue of mutations awaiting delivery.
#[derive(Debug)]
pub struct OperationQueue {
    store: Arc<dyn LocalStore>,
    network: watch::Receiver<NetworkState>,
    wake: Arc<Notify>,
}

impl OperationQueue {
    /// Create a queue over `store`, consulting `network` on enqueue.
    #[must_use]
    pub fn new(store: Arc<dyn LocalStore>, network: watch::Receiver<NetworkState>) -> Self {
        Self {
            store,
            network,
            wake: Arc::new(Notify::new()),
        }
    }

    /// The notifier signalled whenever new work may be ready.
    #[must_use]
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// The store this queue persists to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Record a mutation. Returns the new operation id.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation cannot be persisted.
    pub fn enqueue(
        &self,
        op_type: OperationType,
        table: EntityTable,
        entity_id: Option<&str>,
        endpoint: &str,
        payload: Value,
    ) -> Result<String> {
        let op = OfflineOperation::new(
            op_type,
            table.as_str(),
            entity_id.map(String::from),
            endpoint,
            payload,
        );
        let stored = self.store.insert_operation(&op)?;
        info!(
            id = %stored.id,
            op = %stored.op_type,
            table = %stored.table_name,
            entity = stored.entity_id.as_deref().unwrap_or("-"),
            "Operation queued"
        );

        if self.network.borrow().is_online() {
            self.wake.notify_one();
        }
        Ok(stored.id)
    }

    /// A gate holding back everything that depends on a failed CREATE.
    ///
    /// A temporary id whose CREATE failed has no server counterpart, so
    /// nothing referencing it may be sent until that CREATE is re-armed and
    /// delivered.
    fn failed_creates_gate(&self) -> Result<EntityGate> {
        let mut gate = EntityGate::default();
        for op in self
            .store
            .list_operations(Some(OperationStatus::Failed), usize::MAX)?
        {
            if op.op_type == OperationType::Create
                && op.entity_id.as_deref().is_some_and(is_temp_id)
            {
                gate.block(&op);
            }
        }
        Ok(gate)
    }

    /// Up to `limit` due operations, oldest first.
    ///
    /// An operation is held back while an older operation on the same entity,
    /// or the CREATE of a temporary id it references, is still waiting or has
    /// failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read.
    pub fn dequeue_pending(&self, limit: usize) -> Result<Vec<OfflineOperation>> {
        let now = Utc::now();
        let mut gate = self.failed_creates_gate()?;
        let mut due = Vec::new();

        for op in self.store.pending_operations()? {
            if due.len() >= limit {
                break;
            }
            if !op.is_due(now) || gate.is_blocked(&op) {
                gate.block(&op);
                continue;
            }
            due.push(op);
        }
        Ok(due)
    }

    /// Look up an operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read.
    pub fn get(&self, id: &str) -> Result<Option<OfflineOperation>> {
        self.store.get_operation(id)
    }

    /// Claim an operation for delivery. Returns `false` if it was not pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn mark_syncing(&self, id: &str) -> Result<bool> {
        let claimed = self.store.claim_operation(id)?;
        if !claimed {
            debug!(id, "Operation already claimed or no longer pending");
        }
        Ok(claimed)
    }

    /// Record successful delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation does not exist or the write fails.
    pub fn mark_completed(&self, id: &str) -> Result<()> {
        self.modify(id, |op| {
            op.status = OperationStatus::Completed;
            op.last_error = None;
            op.completed_at = Some(Utc::now());
        })
    }

    /// Give up on an operation after `retry_count` attempts.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation does not exist or the write fails.
    pub fn mark_failed(&self, id: &str, retry_count: u32, error: &str) -> Result<()> {
        self.modify(id, |op| {
            op.status = OperationStatus::Failed;
            op.retry_count = retry_count;
            op.last_error = Some(error.to_string());
        })
    }

    /// Return an operation to `pending`, due again at `at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation does not exist or the write fails.
    pub fn schedule_retry(
        &self,
        id: &str,
        retry_count: u32,
        at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        self.modify(id, |op| {
            op.status = OperationStatus::Pending;
            op.retry_count = retry_count;
            op.next_attempt_at = at;
            op.last_error = Some(error.to_string());
        })
    }

    /// Return a claimed operation to `pending` without counting an attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation does not exist or the write fails.
    pub fn release(&self, id: &str) -> Result<()> {
        self.modify(id, |op| {
            op.status = OperationStatus::Pending;
        })
    }

    /// Fail every pending operation that depends on `parent`.
    ///
    /// Dependents are operations on the same row and operations referencing
    /// its temporary id, followed transitively. Returns how many were failed.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read or updated.
    pub fn fail_dependents(&self, parent: &OfflineOperation) -> Result<usize> {
        let mut gate = EntityGate::default();
        gate.block(parent);
        let reason = format!("depends on failed operation {}", parent.id);
        let mut failed = 0;

        for op in self.store.pending_operations()? {
            if op.id != parent.id && gate.is_blocked(&op) {
                gate.block(&op);
                self.mark_failed(&op.id, op.retry_count, &reason)?;
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(parent = %parent.id, failed, "Failed operations queued behind a failed one");
        }
        Ok(failed)
    }

    fn modify(&self, id: &str, apply: impl FnOnce(&mut OfflineOperation)) -> Result<()> {
        let mut op = self.store.get_operation(id)?.ok_or_else(|| Error::RowNotFound {
            table: "offline_operations",
            id: id.to_string(),
        })?;
        apply(&mut op);
        self.store.update_operation(&op)
    }

    /// When the next operation [`dequeue_pending`](Self::dequeue_pending)
    /// could hand out becomes due.
    ///
    /// Only the oldest pending operation of each entity counts; the ones
    /// queued behind it wait for it regardless of their own schedule.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read.
    pub fn next_due_at(&self) -> Result<Option<DateTime<Utc>>> {
        let mut gate = self.failed_creates_gate()?;
        let mut earliest: Option<DateTime<Utc>> = None;

        for op in self.store.pending_operations()? {
            if !gate.is_blocked(&op) {
                earliest = Some(earliest.map_or(op.next_attempt_at, |at| at.min(op.next_attempt_at)));
            }
            gate.block(&op);
        }
        Ok(earliest)
    }

    /// Whether other pending operations target the same row.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read.
    pub fn has_outstanding_for(&self, table: &str, entity_id: &str, except_id: &str) -> Result<bool> {
        Ok(self.store.pending_operations()?.iter().any(|op| {
            op.id != except_id
                && op.table_name == table
                && op.entity_id.as_deref() == Some(entity_id)
        }))
    }

    /// Rewrite a temporary id in every undelivered operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be updated.
    pub fn remap(&self, temp_id: &str, server_id: &str) -> Result<usize> {
        let changed = self.store.remap_operations(temp_id, server_id)?;
        if changed > 0 {
            debug!(temp_id, server_id, changed, "Remapped queued operations");
        }
        Ok(changed)
    }

    /// Counts per status.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read.
    pub fn stats(&self) -> Result<QueueStats> {
        self.store.queue_stats()
    }

    /// Operations filtered by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read.
    pub fn list(
        &self,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<OfflineOperation>> {
        self.store.list_operations(status, limit)
    }

    /// Re-arm every permanently failed operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be updated.
    pub fn retry_failed(&self) -> Result<usize> {
        let count = self.store.reset_failed_operations()?;
        if count > 0 {
            info!(count, "Failed operations re-armed");
            self.wake.notify_one();
        }
        Ok(count)
    }

    /// Delete completed operations older than `retention`.
    ///
    /// # Errors
    ///
    /// Returns an error if the retention is out of range or the write fails.
    pub fn purge_completed(&self, retention: Duration) -> Result<usize> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| Error::invalid_input(format!("retention out of range: {e}")))?;
        let purged = self.store.purge_completed_operations(Utc::now() - retention)?;
        if purged > 0 {
            debug!(purged, "Purged completed operations");
        }
        Ok(purged)
    }

    /// Return operations left in `syncing` by an interrupted run to `pending`.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be updated.
    pub fn recover_stale(&self) -> Result<usize> {
        let recovered = self.store.recover_stale_operations()?;
        if recovered > 0 {
            warn!(recovered, "Recovered operations interrupted mid-sync");
        }
        Ok(recovered)
    }
}
