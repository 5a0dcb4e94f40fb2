//! `freightsync` - Offline-first sync engine for route and fuel logging
//!
//! This library records mutations locally, queues them, and delivers them to
//! the server with retry and backoff whenever the device is online. Temporary
//! ids created offline are reconciled with server ids as deliveries succeed.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod api;
pub mod app;
pub mod cli;
pub mod config;
pub mod error;
pub mod handle;
pub mod logging;
pub mod managers;
pub mod model;
pub mod network;
pub mod queue;
pub mod session;
pub mod storage;
pub mod sync;

pub use app::{App, Services, Status};
pub use config::{Config, Platform};
pub use error::{Error, Result};
pub use handle::ServiceHandle;
pub use logging::init_logging;
pub use model::{OfflineOperation, OperationStatus, OperationType, QueueStats};
pub use network::{NetworkMonitor, NetworkState, OfflineReason};
pub use queue::OperationQueue;
pub use storage::{open_store, KeyValueStore, LocalStore, SqliteStore};
pub use sync::{PassReport, RetryPolicy, SyncProcessor, SyncWorker};
