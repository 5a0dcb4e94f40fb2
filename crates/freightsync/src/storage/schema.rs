//! `SQLite` schema definitions for freightsync.
//!
//! This module contains the SQL statements for creating and managing
//! the database schema.

/// SQL statement to create the offline operations queue.
pub const CREATE_OPERATIONS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS offline_operations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    op_type TEXT NOT NULL,
    table_name TEXT NOT NULL,
    entity_id TEXT,
    endpoint TEXT NOT NULL,
    payload TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    next_attempt_at TEXT NOT NULL,
    last_error TEXT,
    completed_at TEXT
)
";

/// SQL statement adding the completion time to a version 1 queue table.
pub const ADD_OPERATIONS_COMPLETED_AT: &str = r"
ALTER TABLE offline_operations ADD COLUMN completed_at TEXT
";

/// SQL statement to create an index on queue status.
pub const CREATE_OPERATIONS_STATUS_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_operations_status ON offline_operations(status, timestamp)
";

/// SQL statement to create an index on the targeted entity.
pub const CREATE_OPERATIONS_ENTITY_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_operations_entity ON offline_operations(table_name, entity_id)
";

/// SQL statement to create the trucks mirror.
pub const CREATE_TRUCKS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS trucks (
    id TEXT PRIMARY KEY,
    registration_number TEXT NOT NULL,
    model TEXT,
    fuel_tank_capacity REAL,
    is_dirty INTEGER NOT NULL DEFAULT 0,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    synced_at TEXT,
    awaiting_reconciliation INTEGER NOT NULL DEFAULT 0
)
";

/// SQL statement to create the truck objects mirror.
pub const CREATE_TRUCK_OBJECTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS truck_objects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    address TEXT,
    is_dirty INTEGER NOT NULL DEFAULT 0,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    synced_at TEXT,
    awaiting_reconciliation INTEGER NOT NULL DEFAULT 0
)
";

/// SQL statement to create the route pages table.
pub const CREATE_ROUTE_PAGES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS route_pages (
    id TEXT PRIMARY KEY,
    truck_id TEXT NOT NULL,
    date_from TEXT NOT NULL,
    date_to TEXT NOT NULL,
    fuel_balance_start REAL NOT NULL DEFAULT 0,
    fuel_balance_end REAL NOT NULL DEFAULT 0,
    odometer_start INTEGER,
    odometer_end INTEGER,
    total_fuel_received REAL NOT NULL DEFAULT 0,
    total_fuel_consumed REAL NOT NULL DEFAULT 0,
    computed_route_length INTEGER NOT NULL DEFAULT 0,
    is_dirty INTEGER NOT NULL DEFAULT 0,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    synced_at TEXT,
    awaiting_reconciliation INTEGER NOT NULL DEFAULT 0
)
";

/// SQL statement to create the routes table.
pub const CREATE_ROUTES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS routes (
    id TEXT PRIMARY KEY,
    route_page_id TEXT NOT NULL,
    truck_id TEXT NOT NULL,
    object_from_id TEXT,
    object_to_id TEXT,
    odometer_start INTEGER NOT NULL,
    odometer_finish INTEGER,
    fuel_consumed REAL NOT NULL DEFAULT 0,
    fuel_received REAL NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    is_dirty INTEGER NOT NULL DEFAULT 0,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    synced_at TEXT,
    awaiting_reconciliation INTEGER NOT NULL DEFAULT 0
)
";

/// SQL statement to create an index on a route's page.
pub const CREATE_ROUTES_PAGE_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_routes_page ON routes(route_page_id)
";

/// SQL statement to create an index for active-route lookups.
pub const CREATE_ROUTES_ACTIVE_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_routes_active ON routes(truck_id, finished_at)
";

/// SQL statement to create the response cache table.
pub const CREATE_CACHE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS response_cache (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_OPERATIONS_TABLE,
    CREATE_OPERATIONS_STATUS_INDEX,
    CREATE_OPERATIONS_ENTITY_INDEX,
    CREATE_TRUCKS_TABLE,
    CREATE_TRUCK_OBJECTS_TABLE,
    CREATE_ROUTE_PAGES_TABLE,
    CREATE_ROUTES_TABLE,
    CREATE_ROUTES_PAGE_INDEX,
    CREATE_ROUTES_ACTIVE_INDEX,
    CREATE_CACHE_TABLE,
    CREATE_METADATA_TABLE,
];
