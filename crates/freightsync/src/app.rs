//! Application composition root.
//!
//! [`App`] opens the local store and session, connects the API client and
//! network monitor, and wires the queue, processor, worker and managers to
//! each other. Background services are started with [`App::start`].

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{AuthClient, CompanyClient, HttpApi, RemoteApi};
use crate::config::{Config, Platform};
use crate::error::Result;
use crate::handle::ServiceHandle;
use crate::managers::{ManagerContext, Managers};
use crate::model::QueueStats;
use crate::network::{DnsLinkSignal, HttpProbe, NetworkMonitor, NetworkState};
use crate::queue::OperationQueue;
use crate::session::{SessionStore, UserInfo};
use crate::storage::{
    open_store, LocalStore, StoreKind, META_FORCED_OFFLINE, META_LAST_DOWNLOAD, META_LAST_SYNC,
};
use crate::sync::{PassReport, SyncProcessor, SyncWorker};

/// Snapshot of the sync subsystem, for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    /// Target platform.
    pub platform: Platform,
    /// Store backend.
    pub store: StoreKind,
    /// Current connectivity.
    pub network: NetworkState,
    /// Whether forced offline mode is on.
    pub forced_offline: bool,
    /// Queue counts.
    pub queue: QueueStats,
    /// End of the last processing pass.
    pub last_sync_at: Option<String>,
    /// End of the last successful download.
    pub last_download_at: Option<String>,
    /// Signed-in user, if any.
    pub user: Option<UserInfo>,
}

/// Background services started by [`App::start`].
#[derive(Debug)]
pub struct Services {
    handles: Vec<ServiceHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl Services {
    /// Signal every service to stop and wait for them to finish.
    pub async fn shutdown(self) {
        for handle in &self.handles {
            handle.stop();
        }
        for (handle, task) in self.handles.iter().zip(self.tasks) {
            if let Err(e) = task.await {
                warn!(service = handle.name(), error = %e, "Service task ended abnormally");
            }
        }
        info!("Services stopped");
    }
}

/// The assembled sync subsystem.
#[derive(Debug)]
pub struct App {
    config: Config,
    store: Arc<dyn LocalStore>,
    session: Arc<SessionStore>,
    network: Arc<NetworkMonitor>,
    queue: Arc<OperationQueue>,
    processor: Arc<SyncProcessor>,
    worker: Arc<SyncWorker>,
    managers: Managers,
    auth: AuthClient,
    companies: CompanyClient,
}

impl App {
    /// Build every component from `config`.
    ///
    /// Operations left in flight by a previous run are returned to the
    /// queue. The network state stays offline until the first refresh.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be opened or the API base URL
    /// is unusable.
    pub fn build(config: Config) -> Result<Self> {
        let store = open_store(&config)?;
        let session = Arc::new(SessionStore::open(config.session_path()));
        let api: Arc<dyn RemoteApi> =
            Arc::new(HttpApi::from_config(&config, Arc::clone(&session))?);

        let link = Arc::new(DnsLinkSignal::for_url(&config.api.base_url)?);
        let probe = Arc::new(HttpProbe::new(
            &config.api.base_url,
            &config.api.probe_path,
            config.probe_timeout(),
        )?);
        let forced = config.network.forced_offline || persisted_forced_offline(&*store);
        let network = Arc::new(NetworkMonitor::new(link, probe, forced));

        Ok(Self::assemble(config, store, session, api, network))
    }

    /// Wire pre-built services together.
    #[must_use]
    pub fn assemble(
        config: Config,
        store: Arc<dyn LocalStore>,
        session: Arc<SessionStore>,
        api: Arc<dyn RemoteApi>,
        network: Arc<NetworkMonitor>,
    ) -> Self {
        let queue = Arc::new(OperationQueue::new(Arc::clone(&store), network.subscribe()));
        match queue.recover_stale() {
            Ok(0) => {}
            Ok(count) => info!(count, "Recovered operations interrupted by a previous run"),
            Err(e) => warn!(error = %e, "Failed to recover interrupted operations"),
        }

        let processor = Arc::new(SyncProcessor::from_config(
            &config.sync,
            Arc::clone(&queue),
            Arc::clone(&api),
            Arc::clone(&network),
        ));
        let worker = Arc::new(SyncWorker::new(
            Arc::clone(&processor),
            Arc::clone(&queue),
            Arc::clone(&network),
            config.sync_interval(),
            config.completed_retention(),
        ));

        let managers = Managers::new(ManagerContext {
            store: Arc::clone(&store),
            queue: Arc::clone(&queue),
            api: Arc::clone(&api),
            network: Arc::clone(&network),
            platform: config.storage.platform,
        });
        let auth = AuthClient::new(Arc::clone(&api), Arc::clone(&session));
        let companies = CompanyClient::new(api);

        Self {
            config,
            store,
            session,
            network,
            queue,
            processor,
            worker,
            managers,
            auth,
            companies,
        }
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Local store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Session store.
    #[must_use]
    pub fn session(&self) -> &Arc<SessionStore> {
        &self.session
    }

    /// Network monitor.
    #[must_use]
    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    /// Operation queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    /// Sync processor.
    #[must_use]
    pub fn processor(&self) -> &Arc<SyncProcessor> {
        &self.processor
    }

    /// Sync worker.
    #[must_use]
    pub fn worker(&self) -> &Arc<SyncWorker> {
        &self.worker
    }

    /// Entity managers.
    #[must_use]
    pub fn managers(&self) -> &Managers {
        &self.managers
    }

    /// Authentication client.
    #[must_use]
    pub fn auth(&self) -> &AuthClient {
        &self.auth
    }

    /// Company lookup client.
    #[must_use]
    pub fn companies(&self) -> &CompanyClient {
        &self.companies
    }

    /// Switch forced offline mode, remember the choice, and re-evaluate
    /// connectivity.
    ///
    /// # Errors
    ///
    /// Returns an error if the choice cannot be persisted; the mode is then
    /// left unchanged.
    pub async fn set_forced_offline(&self, forced: bool) -> Result<NetworkState> {
        self.store
            .set_meta(META_FORCED_OFFLINE, if forced { "true" } else { "false" })?;
        Ok(self.network.set_forced_offline(forced).await)
    }

    /// Refresh connectivity and run one processing pass.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Offline`] if the device is offline, or the
    /// processor's error.
    pub async fn sync_once(&self) -> Result<PassReport> {
        self.network.refresh().await;
        self.processor.process_pending().await
    }

    /// Current state of the subsystem.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue or metadata cannot be read.
    pub fn status(&self) -> Result<Status> {
        Ok(Status {
            platform: self.config.storage.platform,
            store: self.store.kind(),
            network: self.network.state(),
            forced_offline: self.network.is_forced_offline(),
            queue: self.queue.stats()?,
            last_sync_at: self.store.meta(META_LAST_SYNC)?,
            last_download_at: self.store.meta(META_LAST_DOWNLOAD)?,
            user: self.session.current().and_then(|s| s.user),
        })
    }

    /// Start the network watch and the sync worker.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(&self) -> Services {
        let network_handle = ServiceHandle::new("network");
        let network = Arc::clone(&self.network);
        let interval = self.config.probe_interval();
        let watch_handle = network_handle.clone();
        let network_task = tokio::spawn(async move { network.watch(interval, watch_handle).await });

        let worker_handle = ServiceHandle::new("sync");
        let worker_task = Arc::clone(&self.worker).start(worker_handle.clone());

        info!(platform = %self.config.storage.platform, "Services started");
        Services {
            handles: vec![network_handle, worker_handle],
            tasks: vec![network_task, worker_task],
        }
    }
}

fn persisted_forced_offline(store: &dyn LocalStore) -> bool {
    match store.meta(META_FORCED_OFFLINE) {
        Ok(value) => value.as_deref() == Some("true"),
        Err(e) => {
            warn!(error = %e, "Failed to read persisted offline mode");
            false
        }
    }
}
