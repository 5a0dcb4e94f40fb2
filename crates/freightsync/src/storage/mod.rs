//! Local persistence for freightsync.
//!
//! Everything the sync subsystem keeps on the device goes through the
//! [`LocalStore`] trait: the operations queue, the mirrored reference data,
//! route pages and routes, cached API responses, and small metadata values.
//!
//! Two implementations exist and one of them is picked at startup:
//! - [`SqliteStore`] for native targets, an embedded `SQLite` database
//! - [`KeyValueStore`] for the web target, JSON blobs under string keys

pub mod kv;
pub mod migrations;
pub mod schema;
pub mod sqlite;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::config::{Config, Platform};
use crate::error::Result;
use crate::model::{
    EntityTable, OfflineOperation, OperationStatus, QueueStats, Route, RoutePage, Truck,
    TruckObject,
};

pub use kv::KeyValueStore;
pub use sqlite::SqliteStore;

/// Which backend a store uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Embedded `SQLite` database.
    Sqlite,
    /// Key-value blobs.
    KeyValue,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite => write!(f, "sqlite"),
            Self::KeyValue => write!(f, "key_value"),
        }
    }
}

/// Storage capability shared by both backends.
///
/// Implementations serialize access internally, so a store can be shared
/// behind an `Arc` by every service. Reads of pages and routes never return
/// rows that are tombstoned with `is_deleted`.
pub trait LocalStore: Send + Sync + std::fmt::Debug {
    /// The backend in use.
    fn kind(&self) -> StoreKind;

    // === Operations queue ===

    /// Persist a new operation. Returns it with its assigned sequence number.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn insert_operation(&self, op: &OfflineOperation) -> Result<OfflineOperation>;

    /// Look up an operation by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn get_operation(&self, id: &str) -> Result<Option<OfflineOperation>>;

    /// All `pending` operations, oldest first, whether due or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn pending_operations(&self) -> Result<Vec<OfflineOperation>>;

    /// Operations filtered by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn list_operations(
        &self,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<OfflineOperation>>;

    /// Atomically flip an operation from `pending` to `syncing`.
    ///
    /// Returns `false` if the operation was not pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn claim_operation(&self, id: &str) -> Result<bool>;

    /// Overwrite the mutable fields of an operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn update_operation(&self, op: &OfflineOperation) -> Result<()>;

    /// Rewrite references to `temp_id` in every undelivered operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the read or write fails.
    fn remap_operations(&self, temp_id: &str, server_id: &str) -> Result<usize>;

    /// Move every `failed` operation back to `pending` with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn reset_failed_operations(&self) -> Result<usize>;

    /// Move operations stuck in `syncing` (from an interrupted pass) back to `pending`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn recover_stale_operations(&self) -> Result<usize>;

    /// Delete `completed` operations recorded before `before`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn purge_completed_operations(&self, before: DateTime<Utc>) -> Result<usize>;

    /// Counts per status.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn queue_stats(&self) -> Result<QueueStats>;

    // === Mirrored reference data ===

    /// Replace all trucks with a fresh download.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn replace_trucks(&self, trucks: &[Truck]) -> Result<()>;

    /// All trucks.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn trucks(&self) -> Result<Vec<Truck>>;

    /// Replace all truck objects with a fresh download.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn replace_truck_objects(&self, objects: &[TruckObject]) -> Result<()>;

    /// All truck objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn truck_objects(&self) -> Result<Vec<TruckObject>>;

    // === Route pages and routes ===

    /// Replace clean pages and routes with a fresh download.
    ///
    /// Rows with unsynced local changes are kept as they are.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn replace_route_pages(&self, pages: &[RoutePage], routes: &[Route]) -> Result<()>;

    /// All live route pages, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn route_pages(&self) -> Result<Vec<RoutePage>>;

    /// A live route page by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn route_page(&self, id: &str) -> Result<Option<RoutePage>>;

    /// Insert or update a route page, recomputing its aggregates.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn save_route_page(&self, page: &RoutePage) -> Result<()>;

    /// Tombstone a route page and its routes. Returns `false` if not found.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn mark_route_page_deleted(&self, id: &str) -> Result<bool>;

    /// Live routes of a page, in start order.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn routes(&self, route_page_id: &str) -> Result<Vec<Route>>;

    /// A live route by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn route(&self, id: &str) -> Result<Option<Route>>;

    /// Insert or update a route and recompute its page's aggregates.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn save_route(&self, route: &Route) -> Result<()>;

    /// Tombstone a route and recompute its page. Returns `false` if not found.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn mark_route_deleted(&self, id: &str) -> Result<bool>;

    /// The unfinished route of a truck, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn active_route_for_truck(&self, truck_id: &str) -> Result<Option<Route>>;

    // === Reconciliation ===

    /// Re-key a row from its temporary id to the server id and update every
    /// local reference to it. Returns `false` if no row had `temp_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn reconcile_id(&self, table: EntityTable, temp_id: &str, server_id: &str) -> Result<bool>;

    /// Clear the dirty flag of a row and stamp `synced_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn mark_synced(&self, table: EntityTable, id: &str) -> Result<()>;

    /// Physically remove a row (after its deletion reached the server).
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn purge_row(&self, table: EntityTable, id: &str) -> Result<()>;

    // === Cached responses and metadata ===

    /// Store a serialized API response under a cache key.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn put_cached(&self, key: &str, value: &Value) -> Result<()>;

    /// Read a cached API response.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn cached(&self, key: &str) -> Result<Option<Value>>;

    /// Set a metadata value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn set_meta(&self, key: &str, value: &str) -> Result<()>;

    /// Read a metadata value.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn meta(&self, key: &str) -> Result<Option<String>>;
}

/// Metadata key of the persisted forced-offline flag.
pub const META_FORCED_OFFLINE: &str = "forced_offline";

/// Metadata key of the last successful download.
pub const META_LAST_DOWNLOAD: &str = "last_download_at";

/// Metadata key of the last finished sync pass.
pub const META_LAST_SYNC: &str = "last_sync_at";

/// Open the store matching the configured platform.
///
/// # Errors
///
/// Returns an error if the backing database or file cannot be opened.
pub fn open_store(config: &Config) -> Result<Arc<dyn LocalStore>> {
    let store: Arc<dyn LocalStore> = match config.storage.platform {
        Platform::Mobile => Arc::new(SqliteStore::open(config.database_path())?),
        Platform::Web => Arc::new(KeyValueStore::open(config.kv_path())?),
    };
    info!(kind = %store.kind(), platform = %config.storage.platform, "Local store ready");
    Ok(store)
}

/// Timestamp format used by both backends; fixed width so text order is time order.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Parse a stored timestamp, falling back to now for corrupt values.
pub(crate) fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
