//! Routes: legs within a route page.
//!
//! A truck has at most one active (unfinished) route at a time. Starting a
//! second one is rejected locally, without waiting for the server.

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::{swallow, ManagerContext};
use crate::config::Platform;
use crate::error::{Error, Result};
use crate::model::{new_temp_id, EntityTable, OperationType, Route, SyncMeta};

/// Fields needed to start a route.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StartRoute {
    /// Page the route belongs to; also decides the truck.
    pub route_page_id: String,
    /// Origin.
    #[serde(default)]
    pub object_from_id: Option<String>,
    /// Destination, if already known.
    #[serde(default)]
    pub object_to_id: Option<String>,
    /// Odometer at departure.
    pub odometer_start: i64,
    /// Fuel taken on at departure.
    #[serde(default)]
    pub fuel_received: f64,
}

/// Fields recorded when a route ends.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FinishRoute {
    /// Odometer at arrival.
    pub odometer_finish: i64,
    /// Fuel used on the way.
    pub fuel_consumed: f64,
    /// Additional fuel taken on during the route.
    #[serde(default)]
    pub fuel_received: Option<f64>,
    /// Destination, if it changed or was not set at start.
    #[serde(default)]
    pub object_to_id: Option<String>,
}

/// Editable fields of an existing route. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RouteChanges {
    /// New origin.
    pub object_from_id: Option<String>,
    /// New destination.
    pub object_to_id: Option<String>,
    /// New departure odometer.
    pub odometer_start: Option<i64>,
    /// New arrival odometer; only for finished routes.
    pub odometer_finish: Option<i64>,
    /// New fuel consumed.
    pub fuel_consumed: Option<f64>,
    /// New fuel received.
    pub fuel_received: Option<f64>,
}

fn check_route(route: &Route) -> Result<()> {
    if route.odometer_start < 0 {
        return Err(Error::invalid_input("odometer_start must not be negative"));
    }
    if let Some(finish) = route.odometer_finish {
        if finish < route.odometer_start {
            return Err(Error::invalid_input(format!(
                "odometer_finish ({finish}) is below odometer_start ({})",
                route.odometer_start
            )));
        }
    }
    if route.fuel_consumed < 0.0 || route.fuel_received < 0.0 {
        return Err(Error::invalid_input("fuel amounts must not be negative"));
    }
    Ok(())
}

/// Routes.
#[derive(Debug, Clone)]
pub struct RouteManager {
    ctx: ManagerContext,
}

impl RouteManager {
    /// Create a manager.
    #[must_use]
    pub fn new(ctx: ManagerContext) -> Self {
        Self { ctx }
    }

    /// Routes of a page, in start order.
    pub async fn get_routes(&self, route_page_id: &str) -> Vec<Route> {
        match self.ctx.platform {
            Platform::Web => {
                self.ctx
                    .read_remote_list(&format!(
                        "{}?route_page_id={route_page_id}",
                        EntityTable::Routes.endpoint()
                    ))
                    .await
            }
            Platform::Mobile => swallow("routes", self.ctx.store.routes(route_page_id)),
        }
    }

    /// A route by id.
    pub async fn get_route(&self, id: &str) -> Option<Route> {
        match self.ctx.platform {
            Platform::Web => {
                self.ctx
                    .read_remote_one(&format!("{}/{id}", EntityTable::Routes.endpoint()))
                    .await
            }
            Platform::Mobile => swallow("route", self.ctx.store.route(id)),
        }
    }

    /// The unfinished route of a truck, if any.
    pub fn active_route(&self, truck_id: &str) -> Option<Route> {
        swallow(
            "active_route",
            self.ctx.store.active_route_for_truck(truck_id),
        )
    }

    /// Start a route on a page's truck and queue its CREATE.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RowNotFound`] for an unknown page,
    /// [`Error::ActiveRouteExists`] if the truck is already on a route,
    /// [`Error::InvalidInput`] for bad readings, or a storage error.
    pub fn start_route(&self, start: StartRoute) -> Result<Route> {
        let page = self
            .ctx
            .store
            .route_page(&start.route_page_id)?
            .ok_or_else(|| Error::RowNotFound {
                table: "route_pages",
                id: start.route_page_id.clone(),
            })?;

        if let Some(active) = self.ctx.store.active_route_for_truck(&page.truck_id)? {
            return Err(Error::ActiveRouteExists {
                truck_id: page.truck_id,
                route_id: active.id,
            });
        }

        let route = Route {
            id: new_temp_id(),
            route_page_id: page.id,
            truck_id: page.truck_id,
            object_from_id: start.object_from_id,
            object_to_id: start.object_to_id,
            odometer_start: start.odometer_start,
            odometer_finish: None,
            fuel_consumed: 0.0,
            fuel_received: start.fuel_received,
            started_at: Utc::now(),
            finished_at: None,
            sync: SyncMeta::created_locally(),
        };
        check_route(&route)?;

        self.ctx.store.save_route(&route)?;
        self.ctx.queue.enqueue(
            OperationType::Create,
            EntityTable::Routes,
            Some(&route.id),
            EntityTable::Routes.endpoint(),
            route.to_payload(),
        )?;
        info!(id = %route.id, truck = %route.truck_id, "Route started");
        Ok(route)
    }

    /// Finish an active route and queue an UPDATE.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RowNotFound`] for an unknown route,
    /// [`Error::InvalidInput`] if it is already finished or the readings are
    /// inconsistent, or a storage error.
    pub fn finish_route(&self, id: &str, finish: FinishRoute) -> Result<Route> {
        let mut route = self.load(id)?;
        if !route.is_active() {
            return Err(Error::invalid_input(format!("route {id} is already finished")));
        }

        route.odometer_finish = Some(finish.odometer_finish);
        route.fuel_consumed = finish.fuel_consumed;
        if let Some(fuel) = finish.fuel_received {
            route.fuel_received = fuel;
        }
        if finish.object_to_id.is_some() {
            route.object_to_id = finish.object_to_id;
        }
        route.finished_at = Some(Utc::now());

        let route = self.save_and_enqueue(route)?;
        info!(id, length = route.length(), "Route finished");
        Ok(route)
    }

    /// Apply `changes` locally and queue an UPDATE.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RowNotFound`] for an unknown route,
    /// [`Error::InvalidInput`] for inconsistent readings, or a storage error.
    pub fn update_route(&self, id: &str, changes: RouteChanges) -> Result<Route> {
        let mut route = self.load(id)?;
        if changes.odometer_finish.is_some() && route.is_active() {
            return Err(Error::invalid_input(
                "odometer_finish can only be changed on a finished route",
            ));
        }

        if let Some(from) = changes.object_from_id {
            route.object_from_id = Some(from);
        }
        if let Some(to) = changes.object_to_id {
            route.object_to_id = Some(to);
        }
        if let Some(start) = changes.odometer_start {
            route.odometer_start = start;
        }
        if let Some(finish) = changes.odometer_finish {
            route.odometer_finish = Some(finish);
        }
        if let Some(fuel) = changes.fuel_consumed {
            route.fuel_consumed = fuel;
        }
        if let Some(fuel) = changes.fuel_received {
            route.fuel_received = fuel;
        }

        self.save_and_enqueue(route)
    }

    /// Tombstone a route, recompute its page, and queue a DELETE.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RowNotFound`] for an unknown route, or a storage error.
    pub fn delete_route(&self, id: &str) -> Result<()> {
        if !self.ctx.store.mark_route_deleted(id)? {
            return Err(Error::RowNotFound {
                table: "routes",
                id: id.to_string(),
            });
        }
        self.enqueue_on_route(OperationType::Delete, id, Value::Null)?;
        info!(id, "Route deleted");
        Ok(())
    }

    fn save_and_enqueue(&self, mut route: Route) -> Result<Route> {
        check_route(&route)?;
        route.sync.is_dirty = true;
        self.ctx.store.save_route(&route)?;
        self.enqueue_on_route(OperationType::Update, &route.id, route.to_payload())?;
        Ok(route)
    }

    fn load(&self, id: &str) -> Result<Route> {
        self.ctx.store.route(id)?.ok_or_else(|| Error::RowNotFound {
            table: "routes",
            id: id.to_string(),
        })
    }

    fn enqueue_on_route(&self, op_type: OperationType, id: &str, payload: Value) -> Result<String> {
        self.ctx.queue.enqueue(
            op_type,
            EntityTable::Routes,
            Some(id),
            &format!("{}/{id}", EntityTable::Routes.endpoint()),
            payload,
        )
    }
}
