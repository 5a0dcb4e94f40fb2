//! Fixtures and behavior checks run against every [`LocalStore`] backend.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::model::{
    EntityTable, OfflineOperation, OperationStatus, OperationType, QueueStats, Route, RoutePage,
    SyncMeta, Truck, TruckObject,
};

use super::{LocalStore, SqliteStore, StoreKind};

pub fn create_op(table: &str, entity_id: &str) -> OfflineOperation {
    let endpoint = EntityTable::from_name(table).map_or("/unknown", EntityTable::endpoint);
    OfflineOperation::new(
        OperationType::Create,
        table,
        Some(entity_id.to_string()),
        endpoint,
        json!({ "id": entity_id }),
    )
}

pub fn sample_truck(id: &str, registration: &str) -> Truck {
    Truck {
        id: id.to_string(),
        registration_number: registration.to_string(),
        model: Some("Volvo FH".to_string()),
        fuel_tank_capacity: Some(600.0),
        sync: SyncMeta::default(),
    }
}

pub fn sample_object(id: &str, name: &str) -> TruckObject {
    TruckObject {
        id: id.to_string(),
        name: name.to_string(),
        address: None,
        sync: SyncMeta::default(),
    }
}

pub fn sample_page(id: &str) -> RoutePage {
    RoutePage {
        id: id.to_string(),
        truck_id: "truck-1".to_string(),
        date_from: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        date_to: NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        fuel_balance_start: 100.0,
        fuel_balance_end: 100.0,
        odometer_start: Some(1000),
        odometer_end: None,
        total_fuel_received: 0.0,
        total_fuel_consumed: 0.0,
        computed_route_length: 0,
        sync: SyncMeta::default(),
    }
}

pub fn sample_route(id: &str, page_id: &str, start: i64, finish: Option<i64>) -> Route {
    Route {
        id: id.to_string(),
        route_page_id: page_id.to_string(),
        truck_id: "truck-1".to_string(),
        object_from_id: None,
        object_to_id: None,
        odometer_start: start,
        odometer_finish: finish,
        fuel_consumed: 10.0,
        fuel_received: 5.0,
        started_at: Utc::now(),
        finished_at: finish.map(|_| Utc::now()),
        sync: SyncMeta::default(),
    }
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

pub fn check_queue_lifecycle(store: &dyn LocalStore) {
    let op = store.insert_operation(&create_op("routes", "tmp-1")).unwrap();
    assert!(op.seq > 0);

    let loaded = store.get_operation(&op.id).unwrap().unwrap();
    assert_eq!(loaded.status, OperationStatus::Pending);
    assert_eq!(loaded.payload, json!({ "id": "tmp-1" }));
    assert_eq!(loaded.entity_id.as_deref(), Some("tmp-1"));

    assert!(store.claim_operation(&op.id).unwrap());
    assert!(!store.claim_operation(&op.id).unwrap());
    assert_eq!(
        store.get_operation(&op.id).unwrap().unwrap().status,
        OperationStatus::Syncing
    );

    let mut done = loaded;
    done.status = OperationStatus::Completed;
    store.update_operation(&done).unwrap();

    let stats = store.queue_stats().unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.pending, 0);
    assert!(stats.oldest_pending.is_none());
    assert!(store.get_operation("missing").unwrap().is_none());
}

pub fn check_pending_order(store: &dyn LocalStore) {
    let base = Utc::now();
    let mut first = create_op("routes", "a");
    first.timestamp = base;
    let mut second = create_op("routes", "b");
    second.timestamp = base;
    let mut earliest = create_op("routes", "c");
    earliest.timestamp = base - Duration::seconds(5);

    let first = store.insert_operation(&first).unwrap();
    let second = store.insert_operation(&second).unwrap();
    let earliest = store.insert_operation(&earliest).unwrap();
    assert!(first.seq < second.seq);

    let ids: Vec<String> = store
        .pending_operations()
        .unwrap()
        .into_iter()
        .map(|op| op.id)
        .collect();
    assert_eq!(ids, vec![earliest.id.clone(), first.id.clone(), second.id]);

    let stats = store.queue_stats().unwrap();
    assert_eq!(stats.pending, 3);
    assert_eq!(
        stats.oldest_pending.map(|t| t.timestamp_micros()),
        Some(earliest.timestamp.timestamp_micros())
    );

    let limited = store
        .list_operations(Some(OperationStatus::Pending), 2)
        .unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].id, earliest.id);
    assert!(store
        .list_operations(Some(OperationStatus::Failed), 10)
        .unwrap()
        .is_empty());
    assert_eq!(store.list_operations(None, 10).unwrap().len(), 3);
}

pub fn check_remap_operations(store: &dyn LocalStore) {
    let create_page = store
        .insert_operation(&create_op("route_pages", "tmp-1"))
        .unwrap();
    let update_page = store
        .insert_operation(&OfflineOperation::new(
            OperationType::Update,
            "route_pages",
            Some("tmp-1".to_string()),
            "/route-pages/tmp-1",
            json!({ "id": "tmp-1", "fuel_balance_start": 5.0 }),
        ))
        .unwrap();
    let create_route = store
        .insert_operation(&OfflineOperation::new(
            OperationType::Create,
            "routes",
            Some("tmp-2".to_string()),
            "/routes",
            json!({ "id": "tmp-2", "route_page_id": "tmp-1" }),
        ))
        .unwrap();
    let mut delivered = store
        .insert_operation(&create_op("route_pages", "tmp-1"))
        .unwrap();
    delivered.status = OperationStatus::Completed;
    store.update_operation(&delivered).unwrap();

    assert_eq!(store.remap_operations("tmp-1", "srv-1").unwrap(), 3);

    let page = store.get_operation(&create_page.id).unwrap().unwrap();
    assert_eq!(page.entity_id.as_deref(), Some("srv-1"));
    assert_eq!(page.payload["id"], "srv-1");

    let update = store.get_operation(&update_page.id).unwrap().unwrap();
    assert_eq!(update.endpoint, "/route-pages/srv-1");

    let route = store.get_operation(&create_route.id).unwrap().unwrap();
    assert_eq!(route.entity_id.as_deref(), Some("tmp-2"));
    assert_eq!(route.payload["route_page_id"], "srv-1");

    let untouched = store.get_operation(&delivered.id).unwrap().unwrap();
    assert_eq!(untouched.entity_id.as_deref(), Some("tmp-1"));

    assert_eq!(store.remap_operations("tmp-9", "srv-9").unwrap(), 0);
}

pub fn check_recovery(store: &dyn LocalStore) {
    let stuck = store.insert_operation(&create_op("routes", "a")).unwrap();
    assert!(store.claim_operation(&stuck.id).unwrap());
    assert_eq!(store.recover_stale_operations().unwrap(), 1);
    assert_eq!(
        store.get_operation(&stuck.id).unwrap().unwrap().status,
        OperationStatus::Pending
    );

    let mut failed = store.insert_operation(&create_op("routes", "b")).unwrap();
    failed.status = OperationStatus::Failed;
    failed.retry_count = 3;
    failed.last_error = Some("server error".to_string());
    failed.next_attempt_at = Utc::now() + Duration::hours(1);
    store.update_operation(&failed).unwrap();

    assert_eq!(store.reset_failed_operations().unwrap(), 1);
    let rearmed = store.get_operation(&failed.id).unwrap().unwrap();
    assert_eq!(rearmed.status, OperationStatus::Pending);
    assert_eq!(rearmed.retry_count, 0);
    assert!(rearmed.last_error.is_none());
    assert!(rearmed.next_attempt_at <= Utc::now());
    assert_eq!(store.reset_failed_operations().unwrap(), 0);
}

pub fn check_purge_completed(store: &dyn LocalStore) {
    let old = Utc::now() - Duration::hours(48);

    let mut stale = create_op("routes", "a");
    stale.timestamp = old;
    let mut stale = store.insert_operation(&stale).unwrap();
    stale.status = OperationStatus::Completed;
    stale.completed_at = Some(old);
    store.update_operation(&stale).unwrap();

    let mut recent = store.insert_operation(&create_op("routes", "b")).unwrap();
    recent.status = OperationStatus::Completed;
    recent.completed_at = Some(Utc::now());
    store.update_operation(&recent).unwrap();

    // Queued long ago but only just delivered.
    let mut late = create_op("routes", "d");
    late.timestamp = old;
    let mut late = store.insert_operation(&late).unwrap();
    late.status = OperationStatus::Completed;
    late.completed_at = Some(Utc::now());
    store.update_operation(&late).unwrap();

    let mut old_pending = create_op("routes", "c");
    old_pending.timestamp = old;
    store.insert_operation(&old_pending).unwrap();

    let purged = store
        .purge_completed_operations(Utc::now() - Duration::hours(24))
        .unwrap();
    assert_eq!(purged, 1);

    let stats = store.queue_stats().unwrap();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.pending, 1);
    assert!(store.get_operation(&stale.id).unwrap().is_none());

    let kept = store.get_operation(&late.id).unwrap().unwrap();
    assert!(kept.completed_at.is_some());
}

pub fn check_reference_data(store: &dyn LocalStore) {
    store
        .replace_trucks(&[sample_truck("2", "ZZ-9"), sample_truck("1", "AA-1")])
        .unwrap();
    let trucks = store.trucks().unwrap();
    assert_eq!(trucks.len(), 2);
    assert_eq!(trucks[0].registration_number, "AA-1");
    assert!(trucks.iter().all(|t| t.sync.synced_at.is_some() && !t.sync.is_dirty));

    store.replace_trucks(&[sample_truck("3", "BB-2")]).unwrap();
    let trucks = store.trucks().unwrap();
    assert_eq!(trucks.len(), 1);
    assert_eq!(trucks[0].id, "3");

    store
        .replace_truck_objects(&[sample_object("o2", "Warehouse"), sample_object("o1", "Depot")])
        .unwrap();
    let objects = store.truck_objects().unwrap();
    assert_eq!(objects.len(), 2);
    assert_eq!(objects[0].name, "Depot");
}

pub fn check_route_aggregates(store: &dyn LocalStore) {
    store.save_route_page(&sample_page("p1")).unwrap();
    store
        .save_route(&sample_route("r1", "p1", 1000, Some(1050)))
        .unwrap();
    store.save_route(&sample_route("r2", "p1", 1050, None)).unwrap();

    let page = store.route_page("p1").unwrap().unwrap();
    assert!(approx(page.total_fuel_received, 10.0));
    assert!(approx(page.total_fuel_consumed, 20.0));
    assert_eq!(page.computed_route_length, 50);
    assert!(approx(page.fuel_balance_end, 90.0));
    assert_eq!(page.odometer_end, Some(1050));

    assert_eq!(store.routes("p1").unwrap().len(), 2);

    assert!(store.mark_route_deleted("r1").unwrap());
    assert!(!store.mark_route_deleted("r1").unwrap());
    let page = store.route_page("p1").unwrap().unwrap();
    assert!(approx(page.total_fuel_consumed, 10.0));
    assert_eq!(page.computed_route_length, 0);
    assert_eq!(store.routes("p1").unwrap().len(), 1);
    assert!(store.route("r1").unwrap().is_none());

    // Saving a page keeps aggregates consistent with stored routes.
    let mut edited = store.route_page("p1").unwrap().unwrap();
    edited.fuel_balance_start = 200.0;
    edited.total_fuel_consumed = 999.0;
    store.save_route_page(&edited).unwrap();
    let page = store.route_page("p1").unwrap().unwrap();
    assert!(approx(page.total_fuel_consumed, 10.0));
    assert!(approx(page.fuel_balance_end, 195.0));
}

pub fn check_replace_keeps_dirty(store: &dyn LocalStore) {
    let mut local = sample_page("tmp-1");
    local.sync = SyncMeta::created_locally();
    store.save_route_page(&local).unwrap();

    let mut edited = sample_page("srv-3");
    edited.fuel_balance_start = 42.0;
    edited.sync.is_dirty = true;
    store.save_route_page(&edited).unwrap();

    store.save_route_page(&sample_page("srv-1")).unwrap();

    let mut downloaded_edit = sample_page("srv-3");
    downloaded_edit.fuel_balance_start = 7.0;
    store
        .replace_route_pages(
            &[sample_page("srv-2"), downloaded_edit],
            &[sample_route("srv-r", "srv-2", 10, Some(20))],
        )
        .unwrap();

    let mut ids: Vec<String> = store
        .route_pages()
        .unwrap()
        .into_iter()
        .map(|p| p.id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["srv-2", "srv-3", "tmp-1"]);

    let kept = store.route_page("srv-3").unwrap().unwrap();
    assert!(approx(kept.fuel_balance_start, 42.0));
    assert!(kept.sync.is_dirty);

    let fresh = store.route_page("srv-2").unwrap().unwrap();
    assert!(fresh.sync.synced_at.is_some());
    assert_eq!(fresh.computed_route_length, 10);
    assert_eq!(store.routes("srv-2").unwrap().len(), 1);
}

pub fn check_deletion(store: &dyn LocalStore) {
    store.save_route_page(&sample_page("p1")).unwrap();
    store.save_route(&sample_route("r1", "p1", 0, Some(5))).unwrap();

    assert!(store.mark_route_page_deleted("p1").unwrap());
    assert!(!store.mark_route_page_deleted("p1").unwrap());
    assert!(store.route_page("p1").unwrap().is_none());
    assert!(store.routes("p1").unwrap().is_empty());
    assert!(store.route_pages().unwrap().is_empty());

    // The tombstone blocks a download from resurrecting the page.
    store
        .replace_route_pages(&[sample_page("p1")], &[])
        .unwrap();
    assert!(store.route_page("p1").unwrap().is_none());

    store.purge_row(EntityTable::RoutePages, "p1").unwrap();
    store
        .replace_route_pages(&[sample_page("p1")], &[])
        .unwrap();
    assert!(store.route_page("p1").unwrap().is_some());
    assert!(store.routes("p1").unwrap().is_empty());
}

pub fn check_reconcile(store: &dyn LocalStore) {
    let mut page = sample_page("tmp-p");
    page.sync = SyncMeta::created_locally();
    store.save_route_page(&page).unwrap();

    let mut route = sample_route("tmp-r", "tmp-p", 0, None);
    route.sync = SyncMeta::created_locally();
    store.save_route(&route).unwrap();

    assert!(store
        .reconcile_id(EntityTable::RoutePages, "tmp-p", "srv-p")
        .unwrap());
    assert!(store.route_page("tmp-p").unwrap().is_none());

    let page = store.route_page("srv-p").unwrap().unwrap();
    assert!(!page.sync.awaiting_reconciliation);
    assert!(page.sync.is_dirty);

    let route = store.route("tmp-r").unwrap().unwrap();
    assert_eq!(route.route_page_id, "srv-p");
    assert_eq!(store.routes("srv-p").unwrap().len(), 1);

    assert!(!store
        .reconcile_id(EntityTable::RoutePages, "tmp-p", "srv-p")
        .unwrap());

    store.mark_synced(EntityTable::RoutePages, "srv-p").unwrap();
    let page = store.route_page("srv-p").unwrap().unwrap();
    assert!(!page.sync.is_dirty);
    assert!(page.sync.synced_at.is_some());

    // A server copy that arrived by download is replaced by the local row.
    store.save_route_page(&sample_page("srv-x")).unwrap();
    let mut local = sample_page("tmp-x");
    local.fuel_balance_start = 55.0;
    local.sync = SyncMeta::created_locally();
    store.save_route_page(&local).unwrap();
    assert!(store
        .reconcile_id(EntityTable::RoutePages, "tmp-x", "srv-x")
        .unwrap());
    let merged = store.route_page("srv-x").unwrap().unwrap();
    assert!(approx(merged.fuel_balance_start, 55.0));
    assert_eq!(
        store
            .route_pages()
            .unwrap()
            .iter()
            .filter(|p| p.id == "srv-x")
            .count(),
        1
    );
}

pub fn check_active_route(store: &dyn LocalStore) {
    store.save_route_page(&sample_page("p1")).unwrap();
    store
        .save_route(&sample_route("r1", "p1", 0, Some(10)))
        .unwrap();
    store.save_route(&sample_route("r2", "p1", 10, None)).unwrap();

    let active = store.active_route_for_truck("truck-1").unwrap().unwrap();
    assert_eq!(active.id, "r2");
    assert!(store.active_route_for_truck("truck-2").unwrap().is_none());

    assert!(store.mark_route_deleted("r2").unwrap());
    assert!(store.active_route_for_truck("truck-1").unwrap().is_none());
}

pub fn check_cache_and_meta(store: &dyn LocalStore) {
    assert!(store.cached("route_pages").unwrap().is_none());
    store
        .put_cached("route_pages", &json!([{ "id": 1 }]))
        .unwrap();
    store.put_cached("route_pages", &json!([{ "id": 2 }])).unwrap();
    assert_eq!(
        store.cached("route_pages").unwrap(),
        Some(json!([{ "id": 2 }]))
    );

    assert!(store.meta("forced_offline").unwrap().is_none());
    store.set_meta("forced_offline", "true").unwrap();
    assert_eq!(store.meta("forced_offline").unwrap().as_deref(), Some("true"));
}

/// A [`SqliteStore`] whose id reconciliation can be switched to fail.
#[derive(Debug)]
pub struct FlakyStore {
    inner: SqliteStore,
    fail_reconcile: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteStore::open_in_memory().unwrap(),
            fail_reconcile: AtomicBool::new(false),
        }
    }

    pub fn fail_reconcile(&self, fail: bool) {
        self.fail_reconcile.store(fail, Ordering::SeqCst);
    }
}

impl LocalStore for FlakyStore {
    fn kind(&self) -> StoreKind {
        self.inner.kind()
    }

    fn insert_operation(&self, op: &OfflineOperation) -> Result<OfflineOperation> {
        self.inner.insert_operation(op)
    }

    fn get_operation(&self, id: &str) -> Result<Option<OfflineOperation>> {
        self.inner.get_operation(id)
    }

    fn pending_operations(&self) -> Result<Vec<OfflineOperation>> {
        self.inner.pending_operations()
    }

    fn list_operations(
        &self,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<OfflineOperation>> {
        self.inner.list_operations(status, limit)
    }

    fn claim_operation(&self, id: &str) -> Result<bool> {
        self.inner.claim_operation(id)
    }

    fn update_operation(&self, op: &OfflineOperation) -> Result<()> {
        self.inner.update_operation(op)
    }

    fn remap_operations(&self, temp_id: &str, server_id: &str) -> Result<usize> {
        self.inner.remap_operations(temp_id, server_id)
    }

    fn reset_failed_operations(&self) -> Result<usize> {
        self.inner.reset_failed_operations()
    }

    fn recover_stale_operations(&self) -> Result<usize> {
        self.inner.recover_stale_operations()
    }

    fn purge_completed_operations(&self, before: DateTime<Utc>) -> Result<usize> {
        self.inner.purge_completed_operations(before)
    }

    fn queue_stats(&self) -> Result<QueueStats> {
        self.inner.queue_stats()
    }

    fn replace_trucks(&self, trucks: &[Truck]) -> Result<()> {
        self.inner.replace_trucks(trucks)
    }

    fn trucks(&self) -> Result<Vec<Truck>> {
        self.inner.trucks()
    }

    fn replace_truck_objects(&self, objects: &[TruckObject]) -> Result<()> {
        self.inner.replace_truck_objects(objects)
    }

    fn truck_objects(&self) -> Result<Vec<TruckObject>> {
        self.inner.truck_objects()
    }

    fn replace_route_pages(&self, pages: &[RoutePage], routes: &[Route]) -> Result<()> {
        self.inner.replace_route_pages(pages, routes)
    }

    fn route_pages(&self) -> Result<Vec<RoutePage>> {
        self.inner.route_pages()
    }

    fn route_page(&self, id: &str) -> Result<Option<RoutePage>> {
        self.inner.route_page(id)
    }

    fn save_route_page(&self, page: &RoutePage) -> Result<()> {
        self.inner.save_route_page(page)
    }

    fn mark_route_page_deleted(&self, id: &str) -> Result<bool> {
        self.inner.mark_route_page_deleted(id)
    }

    fn routes(&self, route_page_id: &str) -> Result<Vec<Route>> {
        self.inner.routes(route_page_id)
    }

    fn route(&self, id: &str) -> Result<Option<Route>> {
        self.inner.route(id)
    }

    fn save_route(&self, route: &Route) -> Result<()> {
        self.inner.save_route(route)
    }

    fn mark_route_deleted(&self, id: &str) -> Result<bool> {
        self.inner.mark_route_deleted(id)
    }

    fn active_route_for_truck(&self, truck_id: &str) -> Result<Option<Route>> {
        self.inner.active_route_for_truck(truck_id)
    }

    fn reconcile_id(&self, table: EntityTable, temp_id: &str, server_id: &str) -> Result<bool> {
        if self.fail_reconcile.load(Ordering::SeqCst) {
            return Err(Error::internal("disk I/O error"));
        }
        self.inner.reconcile_id(table, temp_id, server_id)
    }

    fn mark_synced(&self, table: EntityTable, id: &str) -> Result<()> {
        self.inner.mark_synced(table, id)
    }

    fn purge_row(&self, table: EntityTable, id: &str) -> Result<()> {
        self.inner.purge_row(table, id)
    }

    fn put_cached(&self, key: &str, value: &Value) -> Result<()> {
        self.inner.put_cached(key, value)
    }

    fn cached(&self, key: &str) -> Result<Option<Value>> {
        self.inner.cached(key)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set_meta(key, value)
    }

    fn meta(&self, key: &str) -> Result<Option<String>> {
        self.inner.meta(key)
    }
}
