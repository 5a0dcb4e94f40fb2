//! Per-entity read/write facades.
//!
//! Reads choose between the API and local data by platform: the web target
//! reads live while online and falls back to the last cached response, while
//! the mobile target always reads the embedded store. Reads never fail; any
//! error is logged and turned into an empty result.
//!
//! Writes never call the network. They update the local row and enqueue an
//! operation for the sync processor.

pub mod route_pages;
pub mod routes;
pub mod trucks;

use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::api::{decode_list, RemoteApi};
use crate::config::Platform;
use crate::error::{Error, Result};
use crate::network::NetworkMonitor;
use crate::queue::OperationQueue;
use crate::storage::{format_timestamp, LocalStore, META_LAST_DOWNLOAD};

pub use route_pages::{NewRoutePage, RoutePageChanges, RoutePageManager};
pub use routes::{FinishRoute, RouteChanges, RouteManager, StartRoute};
pub use trucks::{TruckManager, TruckObjectManager};

/// Why a download did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The web target never mirrors data locally.
    WebTarget,
    /// The device is offline, forced or detected.
    Offline,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WebTarget => write!(f, "web target"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Result of a `download()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadOutcome {
    /// Nothing was fetched.
    Skipped(SkipReason),
    /// This many rows were received and stored.
    Replaced(usize),
}

impl std::fmt::Display for DownloadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Skipped(reason) => write!(f, "skipped ({reason})"),
            Self::Replaced(count) => write!(f, "{count} rows"),
        }
    }
}

/// Services every manager needs.
#[derive(Debug, Clone)]
pub struct ManagerContext {
    /// Local rows and cached responses.
    pub store: Arc<dyn LocalStore>,
    /// Where writes are recorded.
    pub queue: Arc<OperationQueue>,
    /// Live reads and downloads.
    pub api: Arc<dyn RemoteApi>,
    /// Connectivity.
    pub network: Arc<NetworkMonitor>,
    /// Which read strategy applies.
    pub platform: Platform,
}

impl ManagerContext {
    /// Why a download must be skipped, if it must.
    fn download_blocked(&self) -> Option<SkipReason> {
        if self.platform == Platform::Web {
            Some(SkipReason::WebTarget)
        } else if !self.network.is_online() {
            Some(SkipReason::Offline)
        } else {
            None
        }
    }

    /// Read a list through the API, caching the response, or from the cache.
    async fn read_remote_list<T: DeserializeOwned>(&self, endpoint: &str) -> Vec<T> {
        let body = self.read_remote(endpoint).await;
        body.map_or_else(Vec::new, |body| {
            swallow(endpoint, decode_list(endpoint, body))
        })
    }

    /// Read a single object through the API, caching the response, or from the cache.
    async fn read_remote_one<T: DeserializeOwned>(&self, endpoint: &str) -> Option<T> {
        let body = self.read_remote(endpoint).await?;
        swallow(
            endpoint,
            serde_json::from_value(body).map(Some).map_err(Error::from),
        )
    }

    async fn read_remote(&self, endpoint: &str) -> Option<serde_json::Value> {
        if self.network.is_online() {
            match self.api.get(endpoint).await {
                Ok(body) => {
                    if let Err(e) = self.store.put_cached(endpoint, &body) {
                        warn!(endpoint, error = %e, "Failed to cache response");
                    }
                    return Some(body);
                }
                Err(e) => {
                    warn!(endpoint, error = %e, "Live read failed, using cached response");
                }
            }
        }

        debug!(endpoint, "Reading cached response");
        swallow(endpoint, self.store.cached(endpoint))
    }

    fn record_download(&self) {
        if let Err(e) = self
            .store
            .set_meta(META_LAST_DOWNLOAD, &format_timestamp(Utc::now()))
        {
            warn!(error = %e, "Failed to record download time");
        }
    }
}

/// Log a failed read and answer the empty value instead.
fn swallow<T: Default>(what: &str, result: Result<T>) -> T {
    result.unwrap_or_else(|e| {
        warn!(what, error = %e, "Read failed, returning empty result");
        T::default()
    })
}

/// Summary of a full download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadSummary {
    /// Trucks.
    pub trucks: DownloadOutcome,
    /// Truck objects.
    pub truck_objects: DownloadOutcome,
    /// Route pages with their routes.
    pub route_pages: DownloadOutcome,
}

/// All managers, sharing one context.
#[derive(Debug, Clone)]
pub struct Managers {
    /// Trucks.
    pub trucks: TruckManager,
    /// Truck objects.
    pub truck_objects: TruckObjectManager,
    /// Route pages.
    pub route_pages: RoutePageManager,
    /// Routes.
    pub routes: RouteManager,
}

impl Managers {
    /// Build every manager over `context`.
    #[must_use]
    pub fn new(context: ManagerContext) -> Self {
        Self {
            trucks: TruckManager::new(context.clone()),
            truck_objects: TruckObjectManager::new(context.clone()),
            route_pages: RoutePageManager::new(context.clone()),
            routes: RouteManager::new(context),
        }
    }

    /// Refresh all mirrored data.
    ///
    /// # Errors
    ///
    /// Returns the first API or storage error; earlier downloads are kept.
    pub async fn download_all(&self) -> Result<DownloadSummary> {
        let summary = DownloadSummary {
            trucks: self.trucks.download().await?,
            truck_objects: self.truck_objects.download().await?,
            route_pages: self.route_pages.download().await?,
        };
        info!(
            trucks = %summary.trucks,
            truck_objects = %summary.truck_objects,
            route_pages = %summary.route_pages,
            "Download finished"
        );
        Ok(summary)
    }
}
