//! Error types for freightsync.
//!
//! This module defines all error types used throughout the freightsync crate,
//! along with the classification helpers the sync processor and the data
//! managers use to decide between retrying, failing, and swallowing.

use std::path::PathBuf;
use thiserror::Error;

/// Fixed user-facing message shown when the server answers 403.
pub const PERMISSION_DENIED_MESSAGE: &str = "You do not have permission to perform this action.";

/// The main error type for freightsync operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    /// The key-value store could not be read or written.
    #[error("key-value store error at {path}: {message}")]
    KeyValue {
        /// Path to the backing file.
        path: PathBuf,
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Remote Errors ===
    /// The HTTP request could not be completed (connect, TLS, body, timeout).
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// The server refused the request (HTTP 403).
    #[error("You do not have permission to perform this action.")]
    PermissionDenied,

    /// The requested resource does not exist (HTTP 404).
    #[error("not found: {endpoint}")]
    NotFound {
        /// The endpoint that answered 404.
        endpoint: String,
    },

    /// The session is missing, expired, or was rejected (HTTP 401).
    #[error("session expired, please sign in again")]
    SessionExpired,

    /// The device is offline (forced or detected).
    #[error("device is offline")]
    Offline,

    /// The server response did not have the expected shape.
    #[error("unexpected response from {endpoint}: {message}")]
    UnexpectedResponse {
        /// The endpoint that was called.
        endpoint: String,
        /// What was wrong with the response.
        message: String,
    },

    // === Domain Errors ===
    /// A truck already has an unfinished route.
    #[error("truck {truck_id} already has an active route ({route_id})")]
    ActiveRouteExists {
        /// The truck in question.
        truck_id: String,
        /// The route that is still active.
        route_id: String,
    },

    /// A referenced local row does not exist.
    #[error("{table} row {id} not found")]
    RowNotFound {
        /// Table that was searched.
        table: &'static str,
        /// Id that was not found.
        id: String,
    },

    /// A domain rule rejected the request.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for freightsync operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a new invalid input error.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create an API error from a status code and body.
    #[must_use]
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is transient and worth retrying later.
    ///
    /// Transport failures, request timeouts, rate limiting and server-side
    /// errors are retryable. Everything the server rejected on purpose is not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Offline => true,
            Self::Api { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Check if this error is a permission issue.
    #[must_use]
    pub fn is_permission_error(&self) -> bool {
        matches!(self, Self::PermissionDenied)
    }

    /// Check if this error means the resource does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if this error requires the user to sign in again.
    #[must_use]
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }
}
