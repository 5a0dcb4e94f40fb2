//! Reference data: trucks and truck objects.
//!
//! Both are read-only locally. They are mirrored so that pickers keep
//! working offline.

use tracing::info;

use super::{swallow, DownloadOutcome, ManagerContext};
use crate::api::fetch_list;
use crate::config::Platform;
use crate::error::Result;
use crate::model::{EntityTable, Truck, TruckObject};

/// Trucks.
#[derive(Debug, Clone)]
pub struct TruckManager {
    ctx: ManagerContext,
}

impl TruckManager {
    /// Create a manager.
    #[must_use]
    pub fn new(ctx: ManagerContext) -> Self {
        Self { ctx }
    }

    /// Replace the local trucks with the server's.
    ///
    /// Skipped on the web target and while offline.
    ///
    /// # Errors
    ///
    /// Returns the API error, or a storage error if the rows cannot be written.
    pub async fn download(&self) -> Result<DownloadOutcome> {
        if let Some(reason) = self.ctx.download_blocked() {
            return Ok(DownloadOutcome::Skipped(reason));
        }
        let trucks: Vec<Truck> =
            fetch_list(&*self.ctx.api, EntityTable::Trucks.endpoint()).await?;
        self.ctx.store.replace_trucks(&trucks)?;
        self.ctx.record_download();
        info!(count = trucks.len(), "Trucks downloaded");
        Ok(DownloadOutcome::Replaced(trucks.len()))
    }

    /// All trucks.
    pub async fn get_trucks(&self) -> Vec<Truck> {
        match self.ctx.platform {
            Platform::Web => {
                self.ctx
                    .read_remote_list(EntityTable::Trucks.endpoint())
                    .await
            }
            Platform::Mobile => swallow("trucks", self.ctx.store.trucks()),
        }
    }

    /// A truck by id.
    pub async fn get_truck(&self, id: &str) -> Option<Truck> {
        self.get_trucks().await.into_iter().find(|t| t.id == id)
    }
}

/// Pickup and drop-off locations.
#[derive(Debug, Clone)]
pub struct TruckObjectManager {
    ctx: ManagerContext,
}

impl TruckObjectManager {
    /// Create a manager.
    #[must_use]
    pub fn new(ctx: ManagerContext) -> Self {
        Self { ctx }
    }

    /// Replace the local truck objects with the server's.
    ///
    /// Skipped on the web target and while offline.
    ///
    /// # Errors
    ///
    /// Returns the API error, or a storage error if the rows cannot be written.
    pub async fn download(&self) -> Result<DownloadOutcome> {
        if let Some(reason) = self.ctx.download_blocked() {
            return Ok(DownloadOutcome::Skipped(reason));
        }
        let objects: Vec<TruckObject> =
            fetch_list(&*self.ctx.api, EntityTable::TruckObjects.endpoint()).await?;
        self.ctx.store.replace_truck_objects(&objects)?;
        self.ctx.record_download();
        info!(count = objects.len(), "Truck objects downloaded");
        Ok(DownloadOutcome::Replaced(objects.len()))
    }

    /// All truck objects.
    pub async fn get_truck_objects(&self) -> Vec<TruckObject> {
        match self.ctx.platform {
            Platform::Web => {
                self.ctx
                    .read_remote_list(EntityTable::TruckObjects.endpoint())
                    .await
            }
            Platform::Mobile => swallow("truck_objects", self.ctx.store.truck_objects()),
        }
    }
}
