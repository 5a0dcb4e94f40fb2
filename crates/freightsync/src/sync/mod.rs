//! Delivery of queued operations to the server.
//!
//! - [`SyncProcessor`] runs a single pass over due operations
//! - [`RetryPolicy`] decides when a failed operation is tried again
//! - [`SyncWorker`] decides when passes run

pub mod backoff;
pub mod processor;
pub mod worker;

pub use backoff::RetryPolicy;
pub use processor::{PassReport, SyncProcessor};
pub use worker::SyncWorker;
