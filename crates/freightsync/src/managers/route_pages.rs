//! Route pages: dated truck usage records.

use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::{swallow, DownloadOutcome, ManagerContext};
use crate::api::fetch_list;
use crate::config::Platform;
use crate::error::{Error, Result};
use crate::model::{new_temp_id, EntityTable, OperationType, Route, RoutePage, SyncMeta};

/// Fields of a new route page.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NewRoutePage {
    /// Truck the page is for.
    pub truck_id: String,
    /// First day covered.
    pub date_from: NaiveDate,
    /// Last day covered.
    pub date_to: NaiveDate,
    /// Fuel in the tank at the start.
    #[serde(default)]
    pub fuel_balance_start: f64,
    /// Odometer at the start.
    #[serde(default)]
    pub odometer_start: Option<i64>,
}

/// Editable fields of an existing route page. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RoutePageChanges {
    /// New first day.
    pub date_from: Option<NaiveDate>,
    /// New last day.
    pub date_to: Option<NaiveDate>,
    /// New starting fuel balance.
    pub fuel_balance_start: Option<f64>,
    /// New starting odometer.
    pub odometer_start: Option<i64>,
}

fn check_dates(from: NaiveDate, to: NaiveDate) -> Result<()> {
    if to < from {
        return Err(Error::invalid_input(format!(
            "date_to ({to}) is before date_from ({from})"
        )));
    }
    Ok(())
}

/// Route pages.
#[derive(Debug, Clone)]
pub struct RoutePageManager {
    ctx: ManagerContext,
}

impl RoutePageManager {
    /// Create a manager.
    #[must_use]
    pub fn new(ctx: ManagerContext) -> Self {
        Self { ctx }
    }

    /// Replace clean local pages and routes with the server's.
    ///
    /// Pages and routes with unsynced local changes are kept. Skipped on the
    /// web target and while offline.
    ///
    /// # Errors
    ///
    /// Returns the API error, or a storage error if the rows cannot be written.
    pub async fn download(&self) -> Result<DownloadOutcome> {
        if let Some(reason) = self.ctx.download_blocked() {
            return Ok(DownloadOutcome::Skipped(reason));
        }
        let pages: Vec<RoutePage> =
            fetch_list(&*self.ctx.api, EntityTable::RoutePages.endpoint()).await?;
        let routes: Vec<Route> =
            fetch_list(&*self.ctx.api, EntityTable::Routes.endpoint()).await?;
        self.ctx.store.replace_route_pages(&pages, &routes)?;
        self.ctx.record_download();
        info!(pages = pages.len(), routes = routes.len(), "Route pages downloaded");
        Ok(DownloadOutcome::Replaced(pages.len() + routes.len()))
    }

    /// All route pages, newest first.
    pub async fn get_route_pages(&self) -> Vec<RoutePage> {
        match self.ctx.platform {
            Platform::Web => {
                self.ctx
                    .read_remote_list(EntityTable::RoutePages.endpoint())
                    .await
            }
            Platform::Mobile => swallow("route_pages", self.ctx.store.route_pages()),
        }
    }

    /// A route page by id.
    pub async fn get_route_page(&self, id: &str) -> Option<RoutePage> {
        match self.ctx.platform {
            Platform::Web => {
                self.ctx
                    .read_remote_one(&format!("{}/{id}", EntityTable::RoutePages.endpoint()))
                    .await
            }
            Platform::Mobile => swallow("route_page", self.ctx.store.route_page(id)),
        }
    }

    /// Create a page locally under a temporary id and queue its CREATE.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for an inverted date range, or a
    /// storage error.
    pub fn create_route_page(&self, new: NewRoutePage) -> Result<RoutePage> {
        check_dates(new.date_from, new.date_to)?;

        let mut page = RoutePage {
            id: new_temp_id(),
            truck_id: new.truck_id,
            date_from: new.date_from,
            date_to: new.date_to,
            fuel_balance_start: new.fuel_balance_start,
            fuel_balance_end: new.fuel_balance_start,
            odometer_start: new.odometer_start,
            odometer_end: None,
            total_fuel_received: 0.0,
            total_fuel_consumed: 0.0,
            computed_route_length: 0,
            sync: SyncMeta::created_locally(),
        };
        page.recompute_aggregates(&[]);

        self.ctx.store.save_route_page(&page)?;
        self.ctx.queue.enqueue(
            OperationType::Create,
            EntityTable::RoutePages,
            Some(&page.id),
            EntityTable::RoutePages.endpoint(),
            page.to_payload(),
        )?;
        info!(id = %page.id, truck = %page.truck_id, "Route page created");
        Ok(page)
    }

    /// Apply `changes` locally and queue an UPDATE.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RowNotFound`] for an unknown page,
    /// [`Error::InvalidInput`] for an inverted date range, or a storage error.
    pub fn update_route_page(&self, id: &str, changes: RoutePageChanges) -> Result<RoutePage> {
        let mut page = self.load(id)?;
        if let Some(date_from) = changes.date_from {
            page.date_from = date_from;
        }
        if let Some(date_to) = changes.date_to {
            page.date_to = date_to;
        }
        if let Some(fuel) = changes.fuel_balance_start {
            page.fuel_balance_start = fuel;
        }
        if let Some(odometer) = changes.odometer_start {
            page.odometer_start = Some(odometer);
        }
        check_dates(page.date_from, page.date_to)?;
        page.sync.is_dirty = true;

        self.ctx.store.save_route_page(&page)?;
        // Aggregates are recomputed by the store.
        let page = self.load(id)?;
        self.enqueue_on_page(OperationType::Update, &page.id, page.to_payload())?;
        Ok(page)
    }

    /// Tombstone a page with its routes and queue a DELETE.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RowNotFound`] for an unknown page, or a storage error.
    pub fn delete_route_page(&self, id: &str) -> Result<()> {
        if !self.ctx.store.mark_route_page_deleted(id)? {
            return Err(Error::RowNotFound {
                table: "route_pages",
                id: id.to_string(),
            });
        }
        self.enqueue_on_page(OperationType::Delete, id, Value::Null)?;
        info!(id, "Route page deleted");
        Ok(())
    }

    fn load(&self, id: &str) -> Result<RoutePage> {
        self.ctx
            .store
            .route_page(id)?
            .ok_or_else(|| Error::RowNotFound {
                table: "route_pages",
                id: id.to_string(),
            })
    }

    fn enqueue_on_page(&self, op_type: OperationType, id: &str, payload: Value) -> Result<String> {
        self.ctx.queue.enqueue(
            op_type,
            EntityTable::RoutePages,
            Some(id),
            &format!("{}/{id}", EntityTable::RoutePages.endpoint()),
            payload,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::fixture;
    use super::*;
    use crate::api::testing::Reply;
    use crate::model::{is_temp_id, OperationStatus};
    use crate::storage::testing::{sample_page, sample_route};
    use reqwest::Method;
    use serde_json::json;

    fn new_page() -> NewRoutePage {
        NewRoutePage {
            truck_id: "1".to_string(),
            date_from: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            date_to: NaiveDate::from_ymd_opt(2024, 5, 31).unwrap(),
            fuel_balance_start: 250.0,
            odometer_start: Some(12_000),
        }
    }

    #[tokio::test]
    async fn test_forced_offline_mobile_reads_locally_only() {
        let f = fixture(Platform::Mobile, true, true).await;
        f.context.store.save_route_page(&sample_page("1")).unwrap();
        let pages = RoutePageManager::new(f.context.clone());

        assert_eq!(
            pages.download().await.unwrap(),
            DownloadOutcome::Skipped(crate::managers::SkipReason::Offline)
        );
        let local = pages.get_route_pages().await;
        assert_eq!(local.len(), 1);
        assert!(pages.get_route_page("1").await.is_some());
        assert_eq!(f.api.call_count(), 0);
    }

    #[tokio::test]
    async fn test_download_replaces_pages_and_routes() {
        let f = fixture(Platform::Mobile, true, false).await;
        f.api.reply(
            Method::GET,
            "/route-pages",
            Reply::Json(json!([{
                "id": 10,
                "truck_id": 1,
                "date_from": "2024-04-01",
                "date_to": "2024-04-30",
                "fuel_balance_start": 100.0,
            }])),
        );
        f.api.reply(
            Method::GET,
            "/routes",
            Reply::Json(json!([{
                "id": 100,
                "route_page_id": 10,
                "truck_id": 1,
                "odometer_start": 500,
                "odometer_finish": 620,
                "fuel_consumed": 30.0,
                "started_at": "2024-04-02T08:00:00Z",
                "finished_at": "2024-04-02T12:00:00Z",
            }])),
        );
        let pages = RoutePageManager::new(f.context.clone());

        assert_eq!(pages.download().await.unwrap(), DownloadOutcome::Replaced(2));
        let page = pages.get_route_page("10").await.unwrap();
        assert_eq!(page.computed_route_length, 120);
        assert!((page.fuel_balance_end - 70.0).abs() < 1e-9);
        assert!(!page.sync.is_dirty);
    }

    #[tokio::test]
    async fn test_create_enqueues_and_marks_row() {
        let f = fixture(Platform::Mobile, false, false).await;
        let pages = RoutePageManager::new(f.context.clone());

        let page = pages.create_route_page(new_page()).unwrap();

        assert!(is_temp_id(&page.id));
        assert!(page.sync.is_dirty);
        assert!(page.sync.awaiting_reconciliation);
        assert_eq!(f.api.call_count(), 0);

        let ops = f.context.queue.list(None, 10).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op_type, OperationType::Create);
        assert_eq!(ops[0].endpoint, "/route-pages");
        assert_eq!(ops[0].entity_id.as_deref(), Some(page.id.as_str()));
        assert_eq!(ops[0].payload["truck_id"], "1");
        assert!(ops[0].payload.get("sync").is_none());
        assert_eq!(ops[0].status, OperationStatus::Pending);
    }

    #[tokio::test]
    async fn test_create_rejects_inverted_dates() {
        let f = fixture(Platform::Mobile, true, false).await;
        let pages = RoutePageManager::new(f.context.clone());

        let mut new = new_page();
        new.date_to = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
        assert!(matches!(
            pages.create_route_page(new),
            Err(Error::InvalidInput(_))
        ));
        assert_eq!(f.context.queue.stats().unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_update_recomputes_and_enqueues() {
        let f = fixture(Platform::Mobile, true, false).await;
        f.context.store.save_route_page(&sample_page("7")).unwrap();
        f.context
            .store
            .save_route(&sample_route("70", "7", 1000, Some(1050)))
            .unwrap();
        let pages = RoutePageManager::new(f.context.clone());

        let updated = pages
            .update_route_page(
                "7",
                RoutePageChanges {
                    fuel_balance_start: Some(200.0),
                    ..RoutePageChanges::default()
                },
            )
            .unwrap();

        assert!(updated.sync.is_dirty);
        assert!((updated.fuel_balance_end - 195.0).abs() < 1e-9);

        let ops = f.context.queue.list(None, 10).unwrap();
        assert_eq!(ops[0].op_type, OperationType::Update);
        assert_eq!(ops[0].endpoint, "/route-pages/7");
        assert_eq!(ops[0].payload["fuel_balance_start"], 200.0);
    }

    #[tokio::test]
    async fn test_update_unknown_page() {
        let f = fixture(Platform::Mobile, true, false).await;
        let pages = RoutePageManager::new(f.context.clone());
        assert!(matches!(
            pages.update_route_page("nope", RoutePageChanges::default()),
            Err(Error::RowNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_tombstones_and_enqueues() {
        let f = fixture(Platform::Web, true, false).await;
        f.context.store.save_route_page(&sample_page("8")).unwrap();
        let pages = RoutePageManager::new(f.context.clone());

        pages.delete_route_page("8").unwrap();

        assert!(f.context.store.route_page("8").unwrap().is_none());
        let ops = f.context.queue.list(None, 10).unwrap();
        assert_eq!(ops[0].op_type, OperationType::Delete);
        assert_eq!(ops[0].endpoint, "/route-pages/8");
        assert!(ops[0].payload.is_null());

        assert!(matches!(
            pages.delete_route_page("8"),
            Err(Error::RowNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_web_single_page_read() {
        let f = fixture(Platform::Web, true, false).await;
        f.api.reply(
            Method::GET,
            "/route-pages/3",
            Reply::Json(json!({
                "id": 3,
                "truck_id": 1,
                "date_from": "2024-04-01",
                "date_to": "2024-04-30",
            })),
        );
        f.api.reply(Method::GET, "/route-pages/4", Reply::Status(404));
        let pages = RoutePageManager::new(f.context.clone());

        assert_eq!(pages.get_route_page("3").await.unwrap().id, "3");
        assert!(pages.get_route_page("4").await.is_none());
    }
}
