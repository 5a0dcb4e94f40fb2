//! `SQLite`-backed [`LocalStore`] for native targets.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{
    EntityTable, OfflineOperation, OperationStatus, QueueStats, Route, RoutePage, SyncMeta,
    Truck, TruckObject,
};

use super::{format_timestamp, migrations, parse_timestamp, LocalStore, StoreKind};

const OPERATION_COLUMNS: &str = "seq, id, op_type, table_name, entity_id, endpoint, payload, \
     timestamp, retry_count, status, next_attempt_at, last_error, completed_at";

const SYNC_COLUMNS: &str = "is_dirty, is_deleted, synced_at, awaiting_reconciliation";

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Local store backed by an embedded `SQLite` database.
///
/// The connection sits behind a mutex; every trait call takes the lock for
/// the duration of one statement or one transaction.
#[derive(Debug)]
pub struct SqliteStore {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    /// Initializes the schema if this is a new database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
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

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        migrations::initialize_schema(&conn)?;

        info!("Database opened successfully at {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::internal("database connection lock poisoned"))
    }
}

// === Row conversion ===

fn conversion_error(row: &Row<'_>, column: &str, message: String) -> rusqlite::Error {
    let index = row.as_ref().column_index(column).unwrap_or(0);
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, message.into())
}

fn timestamp_column(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    Ok(parse_timestamp(&raw))
}

fn optional_timestamp_column(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    Ok(raw.as_deref().map(parse_timestamp))
}

fn date_column(row: &Row<'_>, column: &str) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(column)?;
    NaiveDate::parse_from_str(&raw, DATE_FORMAT)
        .map_err(|e| conversion_error(row, column, format!("invalid date {raw}: {e}")))
}

fn sync_meta(row: &Row<'_>) -> rusqlite::Result<SyncMeta> {
    Ok(SyncMeta {
        is_dirty: row.get("is_dirty")?,
        is_deleted: row.get("is_deleted")?,
        synced_at: optional_timestamp_column(row, "synced_at")?,
        awaiting_reconciliation: row.get("awaiting_reconciliation")?,
    })
}

fn row_to_operation(row: &Row<'_>) -> rusqlite::Result<OfflineOperation> {
    let op_type: String = row.get("op_type")?;
    let status: String = row.get("status")?;
    let payload: String = row.get("payload")?;

    Ok(OfflineOperation {
        seq: row.get("seq")?,
        id: row.get("id")?,
        op_type: op_type
            .parse()
            .map_err(|e: Error| conversion_error(row, "op_type", e.to_string()))?,
        table_name: row.get("table_name")?,
        entity_id: row.get("entity_id")?,
        endpoint: row.get("endpoint")?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| conversion_error(row, "payload", e.to_string()))?,
        timestamp: timestamp_column(row, "timestamp")?,
        retry_count: row.get("retry_count")?,
        status: status
            .parse()
            .map_err(|e: Error| conversion_error(row, "status", e.to_string()))?,
        next_attempt_at: timestamp_column(row, "next_attempt_at")?,
        last_error: row.get("last_error")?,
        completed_at: optional_timestamp_column(row, "completed_at")?,
    })
}

fn row_to_truck(row: &Row<'_>) -> rusqlite::Result<Truck> {
    Ok(Truck {
        id: row.get("id")?,
        registration_number: row.get("registration_number")?,
        model: row.get("model")?,
        fuel_tank_capacity: row.get("fuel_tank_capacity")?,
        sync: sync_meta(row)?,
    })
}

fn row_to_truck_object(row: &Row<'_>) -> rusqlite::Result<TruckObject> {
    Ok(TruckObject {
        id: row.get("id")?,
        name: row.get("name")?,
        address: row.get("address")?,
        sync: sync_meta(row)?,
    })
}

fn row_to_route_page(row: &Row<'_>) -> rusqlite::Result<RoutePage> {
    Ok(RoutePage {
        id: row.get("id")?,
        truck_id: row.get("truck_id")?,
        date_from: date_column(row, "date_from")?,
        date_to: date_column(row, "date_to")?,
        fuel_balance_start: row.get("fuel_balance_start")?,
        fuel_balance_end: row.get("fuel_balance_end")?,
        odometer_start: row.get("odometer_start")?,
        odometer_end: row.get("odometer_end")?,
        total_fuel_received: row.get("total_fuel_received")?,
        total_fuel_consumed: row.get("total_fuel_consumed")?,
        computed_route_length: row.get("computed_route_length")?,
        sync: sync_meta(row)?,
    })
}

fn row_to_route(row: &Row<'_>) -> rusqlite::Result<Route> {
    Ok(Route {
        id: row.get("id")?,
        route_page_id: row.get("route_page_id")?,
        truck_id: row.get("truck_id")?,
        object_from_id: row.get("object_from_id")?,
        object_to_id: row.get("object_to_id")?,
        odometer_start: row.get("odometer_start")?,
        odometer_finish: row.get("odometer_finish")?,
        fuel_consumed: row.get("fuel_consumed")?,
        fuel_received: row.get("fuel_received")?,
        started_at: timestamp_column(row, "started_at")?,
        finished_at: optional_timestamp_column(row, "finished_at")?,
        sync: sync_meta(row)?,
    })
}

// === Row writes shared by single and bulk paths ===

fn write_truck(conn: &Connection, truck: &Truck) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO trucks (id, registration_number, model, fuel_tank_capacity, {SYNC_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        ),
        params![
            truck.id,
            truck.registration_number,
            truck.model,
            truck.fuel_tank_capacity,
            truck.sync.is_dirty,
            truck.sync.is_deleted,
            truck.sync.synced_at.map(format_timestamp),
            truck.sync.awaiting_reconciliation,
        ],
    )?;
    Ok(())
}

fn write_truck_object(conn: &Connection, object: &TruckObject) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO truck_objects (id, name, address, {SYNC_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
        ),
        params![
            object.id,
            object.name,
            object.address,
            object.sync.is_dirty,
            object.sync.is_deleted,
            object.sync.synced_at.map(format_timestamp),
            object.sync.awaiting_reconciliation,
        ],
    )?;
    Ok(())
}

fn write_route_page(conn: &Connection, page: &RoutePage, verb: &str) -> Result<()> {
    conn.execute(
        &format!(
            "{verb} INTO route_pages (id, truck_id, date_from, date_to, fuel_balance_start,
                 fuel_balance_end, odometer_start, odometer_end, total_fuel_received,
                 total_fuel_consumed, computed_route_length, {SYNC_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        ),
        params![
            page.id,
            page.truck_id,
            page.date_from.format(DATE_FORMAT).to_string(),
            page.date_to.format(DATE_FORMAT).to_string(),
            page.fuel_balance_start,
            page.fuel_balance_end,
            page.odometer_start,
            page.odometer_end,
            page.total_fuel_received,
            page.total_fuel_consumed,
            page.computed_route_length,
            page.sync.is_dirty,
            page.sync.is_deleted,
            page.sync.synced_at.map(format_timestamp),
            page.sync.awaiting_reconciliation,
        ],
    )?;
    Ok(())
}

fn write_route(conn: &Connection, route: &Route, verb: &str) -> Result<()> {
    conn.execute(
        &format!(
            "{verb} INTO routes (id, route_page_id, truck_id, object_from_id, object_to_id,
                 odometer_start, odometer_finish, fuel_consumed, fuel_received, started_at,
                 finished_at, {SYNC_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        ),
        params![
            route.id,
            route.route_page_id,
            route.truck_id,
            route.object_from_id,
            route.object_to_id,
            route.odometer_start,
            route.odometer_finish,
            route.fuel_consumed,
            route.fuel_received,
            format_timestamp(route.started_at),
            route.finished_at.map(format_timestamp),
            route.sync.is_dirty,
            route.sync.is_deleted,
            route.sync.synced_at.map(format_timestamp),
            route.sync.awaiting_reconciliation,
        ],
    )?;
    Ok(())
}

fn load_route_page(conn: &Connection, id: &str) -> Result<Option<RoutePage>> {
    let page = conn
        .query_row(
            "SELECT * FROM route_pages WHERE id = ?1 AND is_deleted = 0",
            [id],
            row_to_route_page,
        )
        .optional()?;
    Ok(page)
}

fn load_routes(conn: &Connection, route_page_id: &str) -> Result<Vec<Route>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM routes WHERE route_page_id = ?1 AND is_deleted = 0
         ORDER BY started_at, id",
    )?;
    let routes = stmt
        .query_map([route_page_id], row_to_route)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(routes)
}

/// Recalculate and persist the aggregates of one page.
fn recompute_page(conn: &Connection, route_page_id: &str) -> Result<()> {
    let Some(mut page) = load_route_page(conn, route_page_id)? else {
        return Ok(());
    };
    let routes = load_routes(conn, route_page_id)?;
    page.recompute_aggregates(&routes);

    conn.execute(
        "UPDATE route_pages SET total_fuel_received = ?2, total_fuel_consumed = ?3,
             computed_route_length = ?4, fuel_balance_end = ?5, odometer_end = ?6
         WHERE id = ?1",
        params![
            page.id,
            page.total_fuel_received,
            page.total_fuel_consumed,
            page.computed_route_length,
            page.fuel_balance_end,
            page.odometer_end,
        ],
    )?;
    Ok(())
}

fn route_page_of(conn: &Connection, route_id: &str) -> Result<Option<String>> {
    let page_id = conn
        .query_row(
            "SELECT route_page_id FROM routes WHERE id = ?1",
            [route_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(page_id)
}

impl LocalStore for SqliteStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Sqlite
    }

    fn insert_operation(&self, op: &OfflineOperation) -> Result<OfflineOperation> {
        let conn = self.conn()?;
        conn.execute(
            r"
            INSERT INTO offline_operations (id, op_type, table_name, entity_id, endpoint, payload,
                timestamp, retry_count, status, next_attempt_at, last_error, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ",
            params![
                op.id,
                op.op_type.as_str(),
                op.table_name,
                op.entity_id,
                op.endpoint,
                op.payload.to_string(),
                format_timestamp(op.timestamp),
                op.retry_count,
                op.status.as_str(),
                format_timestamp(op.next_attempt_at),
                op.last_error,
                op.completed_at.map(format_timestamp),
            ],
        )?;

        let mut stored = op.clone();
        stored.seq = conn.last_insert_rowid();
        debug!(id = %stored.id, seq = stored.seq, "Inserted operation");
        Ok(stored)
    }

    fn get_operation(&self, id: &str) -> Result<Option<OfflineOperation>> {
        let conn = self.conn()?;
        let op = conn
            .query_row(
                &format!("SELECT {OPERATION_COLUMNS} FROM offline_operations WHERE id = ?1"),
                [id],
                row_to_operation,
            )
            .optional()?;
        Ok(op)
    }

    fn pending_operations(&self) -> Result<Vec<OfflineOperation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OPERATION_COLUMNS} FROM offline_operations
             WHERE status = 'pending' ORDER BY timestamp, seq"
        ))?;
        let ops = stmt
            .query_map([], row_to_operation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ops)
    }

    fn list_operations(
        &self,
        status: Option<OperationStatus>,
        limit: usize,
    ) -> Result<Vec<OfflineOperation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OPERATION_COLUMNS} FROM offline_operations
             WHERE (?1 IS NULL OR status = ?1) ORDER BY timestamp, seq LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let ops = stmt
            .query_map(params![status.map(OperationStatus::as_str), limit], row_to_operation)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ops)
    }

    fn claim_operation(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE offline_operations SET status = 'syncing' WHERE id = ?1 AND status = 'pending'",
            [id],
        )?;
        Ok(changed == 1)
    }

    fn update_operation(&self, op: &OfflineOperation) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r"
            UPDATE offline_operations
            SET entity_id = ?2, endpoint = ?3, payload = ?4, retry_count = ?5, status = ?6,
                next_attempt_at = ?7, last_error = ?8, completed_at = ?9
            WHERE id = ?1
            ",
            params![
                op.id,
                op.entity_id,
                op.endpoint,
                op.payload.to_string(),
                op.retry_count,
                op.status.as_str(),
                format_timestamp(op.next_attempt_at),
                op.last_error,
                op.completed_at.map(format_timestamp),
            ],
        )?;
        if changed == 0 {
            return Err(Error::RowNotFound {
                table: "offline_operations",
                id: op.id.clone(),
            });
        }
        Ok(())
    }

    fn remap_operations(&self, temp_id: &str, server_id: &str) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let mut ops = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {OPERATION_COLUMNS} FROM offline_operations WHERE status != 'completed'"
            ))?;
            let ops = stmt
                .query_map([], row_to_operation)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ops
        };

        let mut remapped = 0;
        for op in &mut ops {
            if op.remap_id(temp_id, server_id) {
                tx.execute(
                    "UPDATE offline_operations SET entity_id = ?2, endpoint = ?3, payload = ?4
                     WHERE id = ?1",
                    params![op.id, op.entity_id, op.endpoint, op.payload.to_string()],
                )?;
                remapped += 1;
            }
        }

        tx.commit()?;
        Ok(remapped)
    }

    fn reset_failed_operations(&self) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE offline_operations
             SET status = 'pending', retry_count = 0, next_attempt_at = ?1, last_error = NULL
             WHERE status = 'failed'",
            [format_timestamp(Utc::now())],
        )?;
        Ok(changed)
    }

    fn recover_stale_operations(&self) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE offline_operations SET status = 'pending' WHERE status = 'syncing'",
            [],
        )?;
        Ok(changed)
    }

    fn purge_completed_operations(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM offline_operations
             WHERE status = 'completed' AND COALESCE(completed_at, timestamp) < ?1",
            [format_timestamp(before)],
        )?;
        Ok(deleted)
    }

    fn queue_stats(&self) -> Result<QueueStats> {
        let conn = self.conn()?;
        let mut stats = QueueStats::default();

        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM offline_operations GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            let count = u64::try_from(count).unwrap_or(0);
            match status.parse::<OperationStatus>() {
                Ok(OperationStatus::Pending) => stats.pending = count,
                Ok(OperationStatus::Syncing) => stats.syncing = count,
                Ok(OperationStatus::Failed) => stats.failed = count,
                Ok(OperationStatus::Completed) => stats.completed = count,
                Err(_) => {}
            }
        }

        let oldest: Option<String> = conn.query_row(
            "SELECT MIN(timestamp) FROM offline_operations WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        stats.oldest_pending = oldest.as_deref().map(parse_timestamp);

        Ok(stats)
    }

    fn replace_trucks(&self, trucks: &[Truck]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM trucks", [])?;
        for truck in trucks {
            let mut truck = truck.clone();
            truck.sync = SyncMeta::synced_now();
            write_truck(&tx, &truck)?;
        }
        tx.commit()?;
        debug!(count = trucks.len(), "Replaced trucks");
        Ok(())
    }

    fn trucks(&self) -> Result<Vec<Truck>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM trucks ORDER BY registration_number, id")?;
        let trucks = stmt
            .query_map([], row_to_truck)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(trucks)
    }

    fn replace_truck_objects(&self, objects: &[TruckObject]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM truck_objects", [])?;
        for object in objects {
            let mut object = object.clone();
            object.sync = SyncMeta::synced_now();
            write_truck_object(&tx, &object)?;
        }
        tx.commit()?;
        debug!(count = objects.len(), "Replaced truck objects");
        Ok(())
    }

    fn truck_objects(&self) -> Result<Vec<TruckObject>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM truck_objects ORDER BY name, id")?;
        let objects = stmt
            .query_map([], row_to_truck_object)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(objects)
    }

    fn replace_route_pages(&self, pages: &[RoutePage], routes: &[Route]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        // Rows with local changes or tombstones survive; everything else is replaced.
        tx.execute(
            "DELETE FROM routes WHERE is_dirty = 0 AND is_deleted = 0 AND awaiting_reconciliation = 0",
            [],
        )?;
        tx.execute(
            "DELETE FROM route_pages WHERE is_dirty = 0 AND is_deleted = 0 AND awaiting_reconciliation = 0",
            [],
        )?;

        for page in pages {
            let mut page = page.clone();
            page.sync = SyncMeta::synced_now();
            write_route_page(&tx, &page, "INSERT OR IGNORE")?;
        }
        for route in routes {
            let mut route = route.clone();
            route.sync = SyncMeta::synced_now();
            write_route(&tx, &route, "INSERT OR IGNORE")?;
        }

        let page_ids = {
            let mut stmt = tx.prepare("SELECT id FROM route_pages WHERE is_deleted = 0")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids
        };
        for page_id in &page_ids {
            recompute_page(&tx, page_id)?;
        }

        tx.commit()?;
        debug!(pages = pages.len(), routes = routes.len(), "Replaced route pages");
        Ok(())
    }

    fn route_pages(&self) -> Result<Vec<RoutePage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM route_pages WHERE is_deleted = 0 ORDER BY date_from DESC, id",
        )?;
        let pages = stmt
            .query_map([], row_to_route_page)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(pages)
    }

    fn route_page(&self, id: &str) -> Result<Option<RoutePage>> {
        let conn = self.conn()?;
        load_route_page(&conn, id)
    }

    fn save_route_page(&self, page: &RoutePage) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        write_route_page(&tx, page, "INSERT OR REPLACE")?;
        recompute_page(&tx, &page.id)?;
        tx.commit()?;
        Ok(())
    }

    fn mark_route_page_deleted(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE route_pages SET is_deleted = 1, is_dirty = 1 WHERE id = ?1 AND is_deleted = 0",
            [id],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE routes SET is_deleted = 1 WHERE route_page_id = ?1",
            [id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn routes(&self, route_page_id: &str) -> Result<Vec<Route>> {
        let conn = self.conn()?;
        load_routes(&conn, route_page_id)
    }

    fn route(&self, id: &str) -> Result<Option<Route>> {
        let conn = self.conn()?;
        let route = conn
            .query_row(
                "SELECT * FROM routes WHERE id = ?1 AND is_deleted = 0",
                [id],
                row_to_route,
            )
            .optional()?;
        Ok(route)
    }

    fn save_route(&self, route: &Route) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        write_route(&tx, route, "INSERT OR REPLACE")?;
        recompute_page(&tx, &route.route_page_id)?;
        tx.commit()?;
        Ok(())
    }

    fn mark_route_deleted(&self, id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE routes SET is_deleted = 1, is_dirty = 1 WHERE id = ?1 AND is_deleted = 0",
            [id],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        if let Some(page_id) = route_page_of(&tx, id)? {
            recompute_page(&tx, &page_id)?;
        }
        tx.commit()?;
        Ok(true)
    }

    fn active_route_for_truck(&self, truck_id: &str) -> Result<Option<Route>> {
        let conn = self.conn()?;
        let route = conn
            .query_row(
                "SELECT * FROM routes
                 WHERE truck_id = ?1 AND finished_at IS NULL AND is_deleted = 0
                 ORDER BY started_at DESC LIMIT 1",
                [truck_id],
                row_to_route,
            )
            .optional()?;
        Ok(route)
    }

    fn reconcile_id(&self, table: EntityTable, temp_id: &str, server_id: &str) -> Result<bool> {
        let name = table.as_str();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {name} WHERE id = ?1)"),
            [temp_id],
            |row| row.get(0),
        )?;

        if exists && temp_id != server_id {
            // A download may already have brought the server copy in.
            tx.execute(&format!("DELETE FROM {name} WHERE id = ?1"), [server_id])?;
        }
        tx.execute(
            &format!("UPDATE {name} SET id = ?2, awaiting_reconciliation = 0 WHERE id = ?1"),
            [temp_id, server_id],
        )?;

        let references: &[(&str, &str)] = match table {
            EntityTable::RoutePages => &[("routes", "route_page_id")],
            EntityTable::Trucks => &[("routes", "truck_id"), ("route_pages", "truck_id")],
            EntityTable::TruckObjects => {
                &[("routes", "object_from_id"), ("routes", "object_to_id")]
            }
            EntityTable::Routes => &[],
        };
        for (ref_table, column) in references {
            tx.execute(
                &format!("UPDATE {ref_table} SET {column} = ?2 WHERE {column} = ?1"),
                [temp_id, server_id],
            )?;
        }

        tx.commit()?;
        debug!(table = name, temp_id, server_id, exists, "Reconciled id");
        Ok(exists)
    }

    fn mark_synced(&self, table: EntityTable, id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "UPDATE {} SET is_dirty = 0, synced_at = ?2 WHERE id = ?1",
                table.as_str()
            ),
            params![id, format_timestamp(Utc::now())],
        )?;
        Ok(())
    }

    fn purge_row(&self, table: EntityTable, id: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let parent = match table {
            EntityTable::Routes => route_page_of(&tx, id)?,
            _ => None,
        };

        tx.execute(&format!("DELETE FROM {} WHERE id = ?1", table.as_str()), [id])?;
        if table == EntityTable::RoutePages {
            tx.execute("DELETE FROM routes WHERE route_page_id = ?1", [id])?;
        }
        if let Some(page_id) = parent {
            recompute_page(&tx, &page_id)?;
        }

        tx.commit()?;
        Ok(())
    }

    fn put_cached(&self, key: &str, value: &Value) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO response_cache (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value.to_string(), format_timestamp(Utc::now())],
        )?;
        Ok(())
    }

    fn cached(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM response_cache WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(Error::from))
            .transpose()
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            [key, value],
        )?;
        Ok(())
    }

    fn meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing;

    fn create_test_store() -> SqliteStore {
        SqliteStore::open_in_memory().expect("failed to create test store")
    }

    #[test]
    fn test_open_in_memory() {
        let store = create_test_store();
        assert_eq!(store.path(), Path::new(":memory:"));
        assert_eq!(store.kind(), StoreKind::Sqlite);
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sync.db");

        let store = SqliteStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.path(), path);
    }

    #[test]
    fn test_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .insert_operation(&testing::create_op("route_pages", "tmp-1"))
                .unwrap();
            store.set_meta("forced_offline", "true").unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.pending_operations().unwrap().len(), 1);
        assert_eq!(store.meta("forced_offline").unwrap().as_deref(), Some("true"));
    }

    #[test]
    fn test_queue_lifecycle() {
        testing::check_queue_lifecycle(&create_test_store());
    }

    #[test]
    fn test_pending_order_and_seq() {
        testing::check_pending_order(&create_test_store());
    }

    #[test]
    fn test_remap_operations() {
        testing::check_remap_operations(&create_test_store());
    }

    #[test]
    fn test_failed_and_stale_recovery() {
        testing::check_recovery(&create_test_store());
    }

    #[test]
    fn test_purge_completed() {
        testing::check_purge_completed(&create_test_store());
    }

    #[test]
    fn test_reference_data_replace() {
        testing::check_reference_data(&create_test_store());
    }

    #[test]
    fn test_route_aggregates_follow_children() {
        testing::check_route_aggregates(&create_test_store());
    }

    #[test]
    fn test_replace_route_pages_keeps_dirty_rows() {
        testing::check_replace_keeps_dirty(&create_test_store());
    }

    #[test]
    fn test_deletion_tombstones_and_purge() {
        testing::check_deletion(&create_test_store());
    }

    #[test]
    fn test_reconcile_id_updates_references() {
        testing::check_reconcile(&create_test_store());
    }

    #[test]
    fn test_active_route_lookup() {
        testing::check_active_route(&create_test_store());
    }

    #[test]
    fn test_cache_and_meta() {
        testing::check_cache_and_meta(&create_test_store());
    }

    #[test]
    fn test_update_missing_operation_fails() {
        let store = create_test_store();
        let op = testing::create_op("routes", "tmp-1");
        let err = store.update_operation(&op).unwrap_err();
        assert!(matches!(err, Error::RowNotFound { .. }));
    }

    #[test]
    fn test_corrupt_status_is_reported() {
        let store = create_test_store();
        let op = store
            .insert_operation(&testing::create_op("routes", "tmp-1"))
            .unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "UPDATE offline_operations SET status = 'bogus' WHERE id = ?1",
                [&op.id],
            )
            .unwrap();

        assert!(store.get_operation(&op.id).is_err());
    }
}
