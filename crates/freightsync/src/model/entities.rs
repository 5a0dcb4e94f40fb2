//! Locally mirrored domain entities.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids;

/// Local tables that hold mirrored entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityTable {
    /// Reference list of trucks.
    Trucks,
    /// Reference list of pickup/drop-off objects.
    TruckObjects,
    /// Truck usage records.
    RoutePages,
    /// Legs within a route page.
    Routes,
}

impl EntityTable {
    /// Table name as stored in the queue.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trucks => "trucks",
            Self::TruckObjects => "truck_objects",
            Self::RoutePages => "route_pages",
            Self::Routes => "routes",
        }
    }

    /// REST collection path for this table.
    #[must_use]
    pub const fn endpoint(self) -> &'static str {
        match self {
            Self::Trucks => "/trucks",
            Self::TruckObjects => "/truck-objects",
            Self::RoutePages => "/route-pages",
            Self::Routes => "/routes",
        }
    }

    /// Parse a stored table name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "trucks" => Some(Self::Trucks),
            "truck_objects" => Some(Self::TruckObjects),
            "route_pages" => Some(Self::RoutePages),
            "routes" => Some(Self::Routes),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync bookkeeping carried by every mirrored row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncMeta {
    /// The row has local changes the server has not seen.
    pub is_dirty: bool,
    /// The row was deleted locally; kept as a tombstone until delivered.
    pub is_deleted: bool,
    /// Last time the row matched the server.
    pub synced_at: Option<DateTime<Utc>>,
    /// The row is keyed by a temporary id waiting for a server id.
    pub awaiting_reconciliation: bool,
}

impl SyncMeta {
    /// Bookkeeping for a row that was just received from the server.
    #[must_use]
    pub fn synced_now() -> Self {
        Self {
            synced_at: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Bookkeeping for a row created locally under a temporary id.
    #[must_use]
    pub fn created_locally() -> Self {
        Self {
            is_dirty: true,
            awaiting_reconciliation: true,
            ..Self::default()
        }
    }
}

/// Strip bookkeeping from a serialized entity so it can be sent to the API.
fn payload_of<T: Serialize>(entity: &T) -> Value {
    let mut value = serde_json::to_value(entity).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.remove("sync");
    }
    value
}

/// A truck, mirrored from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Truck {
    /// Server id.
    #[serde(deserialize_with = "ids::string")]
    pub id: String,
    /// Registration plate.
    pub registration_number: String,
    /// Make and model.
    #[serde(default)]
    pub model: Option<String>,
    /// Fuel tank capacity in litres.
    #[serde(default)]
    pub fuel_tank_capacity: Option<f64>,
    /// Sync bookkeeping.
    #[serde(default)]
    pub sync: SyncMeta,
}

/// A pickup or drop-off location, mirrored from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TruckObject {
    /// Server id.
    #[serde(deserialize_with = "ids::string")]
    pub id: String,
    /// Display name.
    pub name: String,
    /// Street address.
    #[serde(default)]
    pub address: Option<String>,
    /// Sync bookkeeping.
    #[serde(default)]
    pub sync: SyncMeta,
}

/// A time-bounded usage record for one truck.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePage {
    /// Server id or temporary id.
    #[serde(deserialize_with = "ids::string")]
    pub id: String,
    /// Truck this page belongs to.
    #[serde(deserialize_with = "ids::string")]
    pub truck_id: String,
    /// First day covered.
    pub date_from: NaiveDate,
    /// Last day covered.
    pub date_to: NaiveDate,
    /// Fuel in the tank when the page was opened.
    #[serde(default)]
    pub fuel_balance_start: f64,
    /// Fuel in the tank at the end, derived from the routes.
    #[serde(default)]
    pub fuel_balance_end: f64,
    /// Odometer reading when the page was opened.
    #[serde(default)]
    pub odometer_start: Option<i64>,
    /// Highest odometer reading recorded by a finished route.
    #[serde(default)]
    pub odometer_end: Option<i64>,
    /// Sum of fuel received across routes.
    #[serde(default)]
    pub total_fuel_received: f64,
    /// Sum of fuel consumed across routes.
    #[serde(default)]
    pub total_fuel_consumed: f64,
    /// Sum of finished route lengths in kilometres.
    #[serde(default)]
    pub computed_route_length: i64,
    /// Sync bookkeeping.
    #[serde(default)]
    pub sync: SyncMeta,
}

impl RoutePage {
    /// Recalculate the derived totals from this page's routes.
    ///
    /// Routes belonging to other pages and deleted routes are ignored.
    pub fn recompute_aggregates(&mut self, routes: &[Route]) {
        let children = || {
            routes
                .iter()
                .filter(|r| r.route_page_id == self.id && !r.sync.is_deleted)
        };

        self.total_fuel_received = children().map(|r| r.fuel_received).sum();
        self.total_fuel_consumed = children().map(|r| r.fuel_consumed).sum();
        self.computed_route_length = children().filter_map(Route::length).sum();
        self.fuel_balance_end =
            self.fuel_balance_start + self.total_fuel_received - self.total_fuel_consumed;
        if let Some(max_finish) = children().filter_map(|r| r.odometer_finish).max() {
            self.odometer_end = Some(max_finish);
        }
    }

    /// Request body for the API.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        payload_of(self)
    }
}

/// A single leg within a route page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Server id or temporary id.
    #[serde(deserialize_with = "ids::string")]
    pub id: String,
    /// Parent page.
    #[serde(deserialize_with = "ids::string")]
    pub route_page_id: String,
    /// Truck driven on this leg.
    #[serde(deserialize_with = "ids::string")]
    pub truck_id: String,
    /// Origin object.
    #[serde(default, deserialize_with = "ids::optional")]
    pub object_from_id: Option<String>,
    /// Destination object.
    #[serde(default, deserialize_with = "ids::optional")]
    pub object_to_id: Option<String>,
    /// Odometer at departure.
    pub odometer_start: i64,
    /// Odometer at arrival.
    #[serde(default)]
    pub odometer_finish: Option<i64>,
    /// Fuel consumed on this leg.
    #[serde(default)]
    pub fuel_consumed: f64,
    /// Fuel received on this leg.
    #[serde(default)]
    pub fuel_received: f64,
    /// Departure time.
    pub started_at: DateTime<Utc>,
    /// Arrival time; `None` while the route is active.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Sync bookkeeping.
    #[serde(default)]
    pub sync: SyncMeta,
}

impl Route {
    /// Whether the route has not been finished yet.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.finished_at.is_none() && !self.sync.is_deleted
    }

    /// Distance driven, if the route is finished.
    #[must_use]
    pub fn length(&self) -> Option<i64> {
        self.odometer_finish
            .map(|finish| (finish - self.odometer_start).max(0))
    }

    /// Request body for the API.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        payload_of(self)
    }
}
