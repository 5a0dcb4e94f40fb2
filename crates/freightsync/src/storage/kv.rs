//! Key-value [`LocalStore`] for the web target.
//!
//! Each collection is one JSON blob stored under a fixed string key, the way
//! browser storage holds them. The whole map is optionally mirrored to a
//! single JSON file so the state survives restarts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{
    EntityTable, OfflineOperation, OperationStatus, QueueStats, Route, RoutePage, SyncMeta,
    Truck, TruckObject,
};

use super::{LocalStore, StoreKind};

const KEY_OPERATIONS: &str = "offline_operations";
const KEY_OPERATION_SEQ: &str = "offline_operations_seq";
const KEY_TRUCKS: &str = "trucks";
const KEY_TRUCK_OBJECTS: &str = "truck_objects";
const KEY_ROUTE_PAGES: &str = "route_pages";
const KEY_ROUTES: &str = "routes";
const CACHE_PREFIX: &str = "cache:";
const META_PREFIX: &str = "meta:";

type Blobs = BTreeMap<String, String>;

/// Local store holding serialized JSON blobs under string keys.
#[derive(Debug)]
pub struct KeyValueStore {
    /// Backing file, if persistent.
    path: Option<PathBuf>,
    /// Serialized collections by key.
    blobs: Mutex<Blobs>,
}

impl KeyValueStore {
    /// Open or create a store persisted at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or an
    /// existing file cannot be read or parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let blobs = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|e| Error::KeyValue {
                path: path.clone(),
                message: e.to_string(),
            })?;
            if raw.trim().is_empty() {
                Blobs::new()
            } else {
                serde_json::from_str(&raw).map_err(|e| Error::KeyValue {
                    path: path.clone(),
                    message: e.to_string(),
                })?
            }
        } else {
            Blobs::new()
        };

        info!(keys = blobs.len(), "Key-value store opened at {}", path.display());
        Ok(Self {
            path: Some(path),
            blobs: Mutex::new(blobs),
        })
    }

    /// Create a store that lives only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            blobs: Mutex::new(Blobs::new()),
        }
    }

    /// Backing file, if persistent.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read<R>(&self, f: impl FnOnce(&Blobs) -> Result<R>) -> Result<R> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| Error::internal("key-value store lock poisoned"))?;
        f(&blobs)
    }

    /// Apply `f` to a draft copy and commit it only if `f` and the flush succeed.
    fn write<R>(&self, f: impl FnOnce(&mut Blobs) -> Result<R>) -> Result<R> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| Error::internal("key-value store lock poisoned"))?;
        let mut draft = blobs.clone();
        let out = f(&mut draft)?;
        self.flush(&draft)?;
        *blobs = draft;
        Ok(out)
    }

    fn flush(&self, blobs: &Blobs) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let kv_error = |e: &dyn std::fmt::Display| Error::KeyValue {
            path: path.clone(),
            message: e.to_string(),
        };

        let raw = serde_json::to_string(blobs).map_err(|e| kv_error(&e))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, raw).map_err(|e| kv_error(&e))?;
        std::fs::rename(&tmp, path).map_err(|e| kv_error(&e))?;
        Ok(())
    }
}

fn load<T: DeserializeOwned>(blobs: &Blobs, key: &str) -> Result<Vec<T>> {
    blobs
        .get(key)
        .map_or_else(|| Ok(Vec::new()), |raw| Ok(serde_json::from_str(raw)?))
}

fn save<T: Serialize>(blobs: &mut Blobs, key: &str, items: &[T]) -> Result<()> {
    blobs.insert(key.to_string(), serde_json::to_string(items)?);
    Ok(())
}

fn sorted_by_age(mut ops: Vec<OfflineOperation>) -> Vec<OfflineOperation> {
    ops.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
    ops
}

fn keep_row(sync: &SyncMeta) -> bool {
    sync.is_dirty || sync.is_deleted || sync.awaiting_reconciliation
}

fn recompute(pages: &mut [RoutePage], routes: &[Route], page_id: &str) {
    if let Some(page) = pages
        .iter_mut()
        .find(|p| p.id == page_id && !p.sync.is_deleted)
    {
        page.recompute_aggregates(routes);
    }
}

fn upsert<T>(items: &mut Vec<T>, item: T, id_of: impl Fn(&T) -> &str) {
    match items.iter().position(|existing| id_of(existing) == id_of(&item)) {
        Some(index) => items[index] = item,
        None => items.push(item),
    }
}

/// Re-key one collection and report whether the temporary row existed.
fn rekey<T: Serialize + DeserializeOwned>(
    blobs: &mut Blobs,
    key: &str,
    temp_id: &str,
    server_id: &str,
    id_of: impl Fn(&mut T) -> (&mut String, &mut SyncMeta),
) -> Result<bool> {
    let mut rows: Vec<T> = load(blobs, key)?;
    let exists = rows.iter_mut().any(|row| id_of(row).0.as_str() == temp_id);
    if !exists {
        return Ok(false);
    }
    if temp_id != server_id {
        rows.retain_mut(|row| id_of(row).0.as_str() != server_id);
    }
    for row in &mut rows {
        let (id, sync) = id_of(row);
        if id.as_str() == temp_id {
            *id = server_id.to_string();
            sync.awaiting_reconciliation = false;
        }
    }
    save(blobs, key, &rows)?;
    Ok(true)
}

fn update_sync<T: Serialize + DeserializeOwned>(
    blobs: &mut Blobs,
    key: &str,
    id: &str,
    id_of: impl Fn(&mut T) -> (&mut String, &mut SyncMeta),
) -> Result<()> {
    let mut rows: Vec<T> = load(blobs, key)?;
    for row in &mut rows {
        let (row_id, sync) = id_of(row);
        if row_id.as_str() == id {
            sync.is_dirty = false;
            sync.synced_at = Some(Utc::now());
        }
    }
    save(blobs, key, &rows)
}

fn collection_key(table: EntityTable) -> &'static str {
    match table {
        EntityTable::Trucks => KEY_TRUCKS,
        EntityTable::TruckObjects => KEY_TRUCK_OBJECTS,
        EntityTable::RoutePages => KEY_ROUTE_PAGES,
        EntityTable::Routes => KEY_ROUTES,
    }
}

impl LocalStore for KeyValueStore {
    fn kind(&self) -> StoreKind {
        StoreKind::KeyValue
    }

    fn insert_operation(&self, op: &OfflineOperation) -> Result<OfflineOperation> {
        self.write(|blobs| {
            let seq = blobs
                .get(KEY_OPERATION_SEQ)
                .and_then(|raw| raw.parse::<i64>().ok())
                .unwrap_or(0)
                + 1;
            blobs.insert(KEY_OPERATION_SEQ.to_string(), seq.to_string());

            let mut stored = op.clone();
            stored.seq = seq;
            let mut ops: Vec<OfflineOperation> = load(blobs, KEY_OPERATIONS)?;
            ops.push(stored.clone());
            save(blobs, KEY_OPERATIONS, &ops)?;

            debug!(id = %stored.id, seq, "Inserted operation");
            Ok(stored)
        })
    }

    fn get_operation(&self, id: &str) -> Result<Option<OfflineOperation>> {
        self.read(|blobs| {
            let ops: Vec<OfflineOperation> = load(blobs, KEY_OPERATIONS)?;
            Ok(ops.into_iter().find(|op| op.id == id))
        })
    }

    fn pending_operations(&self) -> Result<Vec<OfflineOperation>> {
        self.read(|blobs| {
            let ops: Vec<OfflineOperation> = load(blobs, KEY_OPERATIONS)?;
            Ok(sorted_by_age(
                ops.into_iter()
                    .filter(|op| op.status == OperationStatus::Pending)
                    .collect(),
            ))
        })
    }

    fn list_operations(
        &self,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<OfflineOperation>> {
        self.read(|blobs| {
            let ops: Vec<OfflineOperation> = load(blobs, KEY_OPERATIONS)?;
            let mut ops = sorted_by_age(
                ops.into_iter()
                    .filter(|op| status.map_or(true, |s| op.status == s))
                    .collect(),
            );
            ops.truncate(limit);
            Ok(ops)
        })
    }

    fn claim_operation(&self, id: &str) -> Result<bool> {
        self.write(|blobs| {
            let mut ops: Vec<OfflineOperation> = load(blobs, KEY_OPERATIONS)?;
            let Some(op) = ops
                .iter_mut()
                .find(|op| op.id == id && op.status == OperationStatus::Pending)
            else {
                return Ok(false);
            };
            op.status = OperationStatus::Syncing;
            save(blobs, KEY_OPERATIONS, &ops)?;
            Ok(true)
        })
    }

    fn update_operation(&self, op: &OfflineOperation) -> Result<()> {
        self.write(|blobs| {
            let mut ops: Vec<OfflineOperation> = load(blobs, KEY_OPERATIONS)?;
            let existing = ops
                .iter_mut()
                .find(|existing| existing.id == op.id)
                .ok_or_else(|| Error::RowNotFound {
                    table: "offline_operations",
                    id: op.id.clone(),
                })?;
            existing.entity_id.clone_from(&op.entity_id);
            existing.endpoint.clone_from(&op.endpoint);
            existing.payload = op.payload.clone();
            existing.retry_count = op.retry_count;
            existing.status = op.status;
            existing.next_attempt_at = op.next_attempt_at;
            existing.last_error.clone_from(&op.last_error);
            existing.completed_at = op.completed_at;
            save(blobs, KEY_OPERATIONS, &ops)
        })
    }

    fn remap_operations(&self, temp_id: &str, server_id: &str) -> Result<usize> {
        self.write(|blobs| {
            let mut ops: Vec<OfflineOperation> = load(blobs, KEY_OPERATIONS)?;
            let remapped = ops
                .iter_mut()
                .filter(|op| op.status != OperationStatus::Completed)
                .map(|op| op.remap_id(temp_id, server_id))
                .filter(|changed| *changed)
                .count();
            save(blobs, KEY_OPERATIONS, &ops)?;
            Ok(remapped)
        })
    }

    fn reset_failed_operations(&self) -> Result<usize> {
        self.write(|blobs| {
            let mut ops: Vec<OfflineOperation> = load(blobs, KEY_OPERATIONS)?;
            let now = Utc::now();
            let mut reset = 0;
            for op in ops
                .iter_mut()
                .filter(|op| op.status == OperationStatus::Failed)
            {
                op.status = OperationStatus::Pending;
                op.retry_count = 0;
                op.next_attempt_at = now;
                op.last_error = None;
                reset += 1;
            }
            save(blobs, KEY_OPERATIONS, &ops)?;
            Ok(reset)
        })
    }

    fn recover_stale_operations(&self) -> Result<usize> {
        self.write(|blobs| {
            let mut ops: Vec<OfflineOperation> = load(blobs, KEY_OPERATIONS)?;
            let mut recovered = 0;
            for op in ops
                .iter_mut()
                .filter(|op| op.status == OperationStatus::Syncing)
            {
                op.status = OperationStatus::Pending;
                recovered += 1;
            }
            save(blobs, KEY_OPERATIONS, &ops)?;
            Ok(recovered)
        })
    }

    fn purge_completed_operations(&self, before: DateTime<Utc>) -> Result<usize> {
        self.write(|blobs| {
            let mut ops: Vec<OfflineOperation> = load(blobs, KEY_OPERATIONS)?;
            let total = ops.len();
            ops.retain(|op| {
                op.status != OperationStatus::Completed
                    || op.completed_at.unwrap_or(op.timestamp) >= before
            });
            save(blobs, KEY_OPERATIONS, &ops)?;
            Ok(total - ops.len())
        })
    }

    fn queue_stats(&self) -> Result<QueueStats> {
        self.read(|blobs| {
            let ops: Vec<OfflineOperation> = load(blobs, KEY_OPERATIONS)?;
            let mut stats = QueueStats::default();
            for op in &ops {
                match op.status {
                    OperationStatus::Pending => {
                        stats.pending += 1;
                        stats.oldest_pending = Some(
                            stats
                                .oldest_pending
                                .map_or(op.timestamp, |t| t.min(op.timestamp)),
                        );
                    }
                    OperationStatus::Syncing => stats.syncing += 1,
                    OperationStatus::Failed => stats.failed += 1,
                    OperationStatus::Completed => stats.completed += 1,
                }
            }
            Ok(stats)
        })
    }

    fn replace_trucks(&self, trucks: &[Truck]) -> Result<()> {
        self.write(|blobs| {
            let trucks: Vec<Truck> = trucks
                .iter()
                .cloned()
                .map(|mut t| {
                    t.sync = SyncMeta::synced_now();
                    t
                })
                .collect();
            save(blobs, KEY_TRUCKS, &trucks)
        })
    }

    fn trucks(&self) -> Result<Vec<Truck>> {
        self.read(|blobs| {
            let mut trucks: Vec<Truck> = load(blobs, KEY_TRUCKS)?;
            trucks.sort_by(|a, b| {
                a.registration_number
                    .cmp(&b.registration_number)
                    .then_with(|| a.id.cmp(&b.id))
            });
            Ok(trucks)
        })
    }

    fn replace_truck_objects(&self, objects: &[TruckObject]) -> Result<()> {
        self.write(|blobs| {
            let objects: Vec<TruckObject> = objects
                .iter()
                .cloned()
                .map(|mut o| {
                    o.sync = SyncMeta::synced_now();
                    o
                })
                .collect();
            save(blobs, KEY_TRUCK_OBJECTS, &objects)
        })
    }

    fn truck_objects(&self) -> Result<Vec<TruckObject>> {
        self.read(|blobs| {
            let mut objects: Vec<TruckObject> = load(blobs, KEY_TRUCK_OBJECTS)?;
            objects.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
            Ok(objects)
        })
    }

    fn replace_route_pages(&self, pages: &[RoutePage], routes: &[Route]) -> Result<()> {
        self.write(|blobs| {
            let mut local_pages: Vec<RoutePage> = load(blobs, KEY_ROUTE_PAGES)?;
            let mut local_routes: Vec<Route> = load(blobs, KEY_ROUTES)?;
            local_pages.retain(|p| keep_row(&p.sync));
            local_routes.retain(|r| keep_row(&r.sync));

            for page in pages {
                if !local_pages.iter().any(|p| p.id == page.id) {
                    let mut page = page.clone();
                    page.sync = SyncMeta::synced_now();
                    local_pages.push(page);
                }
            }
            for route in routes {
                if !local_routes.iter().any(|r| r.id == route.id) {
                    let mut route = route.clone();
                    route.sync = SyncMeta::synced_now();
                    local_routes.push(route);
                }
            }

            for page in local_pages.iter_mut().filter(|p| !p.sync.is_deleted) {
                page.recompute_aggregates(&local_routes);
            }

            save(blobs, KEY_ROUTE_PAGES, &local_pages)?;
            save(blobs, KEY_ROUTES, &local_routes)?;
            debug!(pages = pages.len(), routes = routes.len(), "Replaced route pages");
            Ok(())
        })
    }

    fn route_pages(&self) -> Result<Vec<RoutePage>> {
        self.read(|blobs| {
            let pages: Vec<RoutePage> = load(blobs, KEY_ROUTE_PAGES)?;
            let mut pages: Vec<RoutePage> =
                pages.into_iter().filter(|p| !p.sync.is_deleted).collect();
            pages.sort_by(|a, b| b.date_from.cmp(&a.date_from).then_with(|| a.id.cmp(&b.id)));
            Ok(pages)
        })
    }

    fn route_page(&self, id: &str) -> Result<Option<RoutePage>> {
        self.read(|blobs| {
            let pages: Vec<RoutePage> = load(blobs, KEY_ROUTE_PAGES)?;
            Ok(pages
                .into_iter()
                .find(|p| p.id == id && !p.sync.is_deleted))
        })
    }

    fn save_route_page(&self, page: &RoutePage) -> Result<()> {
        self.write(|blobs| {
            let mut pages: Vec<RoutePage> = load(blobs, KEY_ROUTE_PAGES)?;
            let routes: Vec<Route> = load(blobs, KEY_ROUTES)?;
            upsert(&mut pages, page.clone(), |p| p.id.as_str());
            recompute(&mut pages, &routes, &page.id);
            save(blobs, KEY_ROUTE_PAGES, &pages)
        })
    }

    fn mark_route_page_deleted(&self, id: &str) -> Result<bool> {
        self.write(|blobs| {
            let mut pages: Vec<RoutePage> = load(blobs, KEY_ROUTE_PAGES)?;
            let Some(page) = pages
                .iter_mut()
                .find(|p| p.id == id && !p.sync.is_deleted)
            else {
                return Ok(false);
            };
            page.sync.is_deleted = true;
            page.sync.is_dirty = true;

            let mut routes: Vec<Route> = load(blobs, KEY_ROUTES)?;
            for route in routes.iter_mut().filter(|r| r.route_page_id == id) {
                route.sync.is_deleted = true;
            }

            save(blobs, KEY_ROUTE_PAGES, &pages)?;
            save(blobs, KEY_ROUTES, &routes)?;
            Ok(true)
        })
    }

    fn routes(&self, route_page_id: &str) -> Result<Vec<Route>> {
        self.read(|blobs| {
            let routes: Vec<Route> = load(blobs, KEY_ROUTES)?;
            let mut routes: Vec<Route> = routes
                .into_iter()
                .filter(|r| r.route_page_id == route_page_id && !r.sync.is_deleted)
                .collect();
            routes.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
            Ok(routes)
        })
    }

    fn route(&self, id: &str) -> Result<Option<Route>> {
        self.read(|blobs| {
            let routes: Vec<Route> = load(blobs, KEY_ROUTES)?;
            Ok(routes
                .into_iter()
                .find(|r| r.id == id && !r.sync.is_deleted))
        })
    }

    fn save_route(&self, route: &Route) -> Result<()> {
        self.write(|blobs| {
            let mut pages: Vec<RoutePage> = load(blobs, KEY_ROUTE_PAGES)?;
            let mut routes: Vec<Route> = load(blobs, KEY_ROUTES)?;
            upsert(&mut routes, route.clone(), |r| r.id.as_str());
            recompute(&mut pages, &routes, &route.route_page_id);
            save(blobs, KEY_ROUTES, &routes)?;
            save(blobs, KEY_ROUTE_PAGES, &pages)
        })
    }

    fn mark_route_deleted(&self, id: &str) -> Result<bool> {
        self.write(|blobs| {
            let mut routes: Vec<Route> = load(blobs, KEY_ROUTES)?;
            let Some(route) = routes
                .iter_mut()
                .find(|r| r.id == id && !r.sync.is_deleted)
            else {
                return Ok(false);
            };
            route.sync.is_deleted = true;
            route.sync.is_dirty = true;
            let page_id = route.route_page_id.clone();

            let mut pages: Vec<RoutePage> = load(blobs, KEY_ROUTE_PAGES)?;
            recompute(&mut pages, &routes, &page_id);
            save(blobs, KEY_ROUTES, &routes)?;
            save(blobs, KEY_ROUTE_PAGES, &pages)?;
            Ok(true)
        })
    }

    fn active_route_for_truck(&self, truck_id: &str) -> Result<Option<Route>> {
        self.read(|blobs| {
            let routes: Vec<Route> = load(blobs, KEY_ROUTES)?;
            Ok(routes
                .into_iter()
                .filter(|r| r.truck_id == truck_id && r.is_active())
                .max_by_key(|r| r.started_at))
        })
    }

    fn reconcile_id(&self, table: EntityTable, temp_id: &str, server_id: &str) -> Result<bool> {
        self.write(|blobs| {
            let key = collection_key(table);
            let exists = match table {
                EntityTable::Trucks => {
                    rekey::<Truck>(blobs, key, temp_id, server_id, |t| (&mut t.id, &mut t.sync))?
                }
                EntityTable::TruckObjects => rekey::<TruckObject>(
                    blobs,
                    key,
                    temp_id,
                    server_id,
                    |o| (&mut o.id, &mut o.sync),
                )?,
                EntityTable::RoutePages => rekey::<RoutePage>(
                    blobs,
                    key,
                    temp_id,
                    server_id,
                    |p| (&mut p.id, &mut p.sync),
                )?,
                EntityTable::Routes => {
                    rekey::<Route>(blobs, key, temp_id, server_id, |r| (&mut r.id, &mut r.sync))?
                }
            };

            let swap = |field: &mut String| {
                if field.as_str() == temp_id {
                    *field = server_id.to_string();
                }
            };
            let swap_opt = |field: &mut Option<String>| {
                if field.as_deref() == Some(temp_id) {
                    *field = Some(server_id.to_string());
                }
            };

            match table {
                EntityTable::RoutePages => {
                    let mut routes: Vec<Route> = load(blobs, KEY_ROUTES)?;
                    routes.iter_mut().for_each(|r| swap(&mut r.route_page_id));
                    save(blobs, KEY_ROUTES, &routes)?;
                }
                EntityTable::Trucks => {
                    let mut routes: Vec<Route> = load(blobs, KEY_ROUTES)?;
                    routes.iter_mut().for_each(|r| swap(&mut r.truck_id));
                    save(blobs, KEY_ROUTES, &routes)?;
                    let mut pages: Vec<RoutePage> = load(blobs, KEY_ROUTE_PAGES)?;
                    pages.iter_mut().for_each(|p| swap(&mut p.truck_id));
                    save(blobs, KEY_ROUTE_PAGES, &pages)?;
                }
                EntityTable::TruckObjects => {
                    let mut routes: Vec<Route> = load(blobs, KEY_ROUTES)?;
                    for route in &mut routes {
                        swap_opt(&mut route.object_from_id);
                        swap_opt(&mut route.object_to_id);
                    }
                    save(blobs, KEY_ROUTES, &routes)?;
                }
                EntityTable::Routes => {}
            }

            debug!(table = %table, temp_id, server_id, exists, "Reconciled id");
            Ok(exists)
        })
    }

    fn mark_synced(&self, table: EntityTable, id: &str) -> Result<()> {
        self.write(|blobs| {
            let key = collection_key(table);
            match table {
                EntityTable::Trucks => {
                    update_sync::<Truck>(blobs, key, id, |t| (&mut t.id, &mut t.sync))
                }
                EntityTable::TruckObjects => {
                    update_sync::<TruckObject>(blobs, key, id, |o| (&mut o.id, &mut o.sync))
                }
                EntityTable::RoutePages => {
                    update_sync::<RoutePage>(blobs, key, id, |p| (&mut p.id, &mut p.sync))
                }
                EntityTable::Routes => {
                    update_sync::<Route>(blobs, key, id, |r| (&mut r.id, &mut r.sync))
                }
            }
        })
    }

    fn purge_row(&self, table: EntityTable, id: &str) -> Result<()> {
        self.write(|blobs| match table {
            EntityTable::Trucks => {
                let mut trucks: Vec<Truck> = load(blobs, KEY_TRUCKS)?;
                trucks.retain(|t| t.id != id);
                save(blobs, KEY_TRUCKS, &trucks)
            }
            EntityTable::TruckObjects => {
                let mut objects: Vec<TruckObject> = load(blobs, KEY_TRUCK_OBJECTS)?;
                objects.retain(|o| o.id != id);
                save(blobs, KEY_TRUCK_OBJECTS, &objects)
            }
            EntityTable::RoutePages => {
                let mut pages: Vec<RoutePage> = load(blobs, KEY_ROUTE_PAGES)?;
                let mut routes: Vec<Route> = load(blobs, KEY_ROUTES)?;
                pages.retain(|p| p.id != id);
                routes.retain(|r| r.route_page_id != id);
                save(blobs, KEY_ROUTE_PAGES, &pages)?;
                save(blobs, KEY_ROUTES, &routes)
            }
            EntityTable::Routes => {
                let mut routes: Vec<Route> = load(blobs, KEY_ROUTES)?;
                let parent = routes
                    .iter()
                    .find(|r| r.id == id)
                    .map(|r| r.route_page_id.clone());
                routes.retain(|r| r.id != id);
                if let Some(page_id) = parent {
                    let mut pages: Vec<RoutePage> = load(blobs, KEY_ROUTE_PAGES)?;
                    recompute(&mut pages, &routes, &page_id);
                    save(blobs, KEY_ROUTE_PAGES, &pages)?;
                }
                save(blobs, KEY_ROUTES, &routes)
            }
        })
    }

    fn put_cached(&self, key: &str, value: &Value) -> Result<()> {
        self.write(|blobs| {
            blobs.insert(format!("{CACHE_PREFIX}{key}"), serde_json::to_string(value)?);
            Ok(())
        })
    }

    fn cached(&self, key: &str) -> Result<Option<Value>> {
        self.read(|blobs| {
            blobs
                .get(&format!("{CACHE_PREFIX}{key}"))
                .map(|raw| serde_json::from_str(raw).map_err(Error::from))
                .transpose()
        })
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.write(|blobs| {
            blobs.insert(format!("{META_PREFIX}{key}"), value.to_string());
            Ok(())
        })
    }

    fn meta(&self, key: &str) -> Result<Option<String>> {
        self.read(|blobs| Ok(blobs.get(&format!("{META_PREFIX}{key}")).cloned()))
    }
}
