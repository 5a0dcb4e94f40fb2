//! Queued offline mutations.
//!
//! An [`OfflineOperation`] records one CREATE/UPDATE/DELETE intent that still
//! has to reach the server, along with its retry bookkeeping.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Error;

/// Payload fields that may hold a reference to another row's id.
pub const REFERENCE_FIELDS: &[&str] = &[
    "id",
    "route_page_id",
    "truck_id",
    "object_from_id",
    "object_to_id",
];

/// The kind of mutation an operation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    /// A new row; sent with POST.
    Create,
    /// A change to an existing row; sent with PUT.
    Update,
    /// A removal; sent with DELETE.
    Delete,
}

impl OperationType {
    /// Stable string form used in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    /// The HTTP verb this operation is delivered with.
    #[must_use]
    pub fn http_method(self) -> reqwest::Method {
        match self {
            Self::Create => reqwest::Method::POST,
            Self::Update => reqwest::Method::PUT,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(Error::internal(format!("unknown operation type: {other}"))),
        }
    }
}

/// Lifecycle state of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be sent (possibly after a backoff delay).
    Pending,
    /// Claimed by a sync pass; a request is in flight.
    Syncing,
    /// Gave up after exhausting retries or on a non-retryable error.
    Failed,
    /// Delivered to the server.
    Completed,
}

impl OperationStatus {
    /// Stable string form used in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    /// Whether no further automatic processing will happen.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Completed)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            other => Err(Error::internal(format!("unknown operation status: {other}"))),
        }
    }
}

/// A mutation waiting for network delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineOperation {
    /// Client-generated unique id.
    pub id: String,
    /// Kind of mutation.
    pub op_type: OperationType,
    /// Local table the mutation belongs to.
    pub table_name: String,
    /// Local id of the targeted row, if the mutation targets one.
    #[serde(default)]
    pub entity_id: Option<String>,
    /// API endpoint, relative to the configured base URL.
    pub endpoint: String,
    /// Request body sent as-is.
    pub payload: Value,
    /// When the mutation was recorded.
    pub timestamp: DateTime<Utc>,
    /// Failed delivery attempts so far.
    pub retry_count: u32,
    /// Lifecycle state.
    pub status: OperationStatus,
    /// Earliest time the next attempt may happen.
    pub next_attempt_at: DateTime<Utc>,
    /// Message of the most recent failure.
    #[serde(default)]
    pub last_error: Option<String>,
    /// When delivery succeeded. Completed operations are retained from here.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Insertion sequence assigned by the store.
    #[serde(default)]
    pub seq: i64,
}

impl OfflineOperation {
    /// Create a new pending operation, due immediately.
    #[must_use]
    pub fn new(
        op_type: OperationType,
        table_name: impl Into<String>,
        entity_id: Option<String>,
        endpoint: impl Into<String>,
        payload: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            op_type,
            table_name: table_name.into(),
            entity_id,
            endpoint: endpoint.into(),
            payload,
            timestamp: now,
            retry_count: 0,
            status: OperationStatus::Pending,
            next_attempt_at: now,
            last_error: None,
            completed_at: None,
            seq: 0,
        }
    }

    /// Key grouping operations that must be delivered in order.
    #[must_use]
    pub fn entity_key(&self) -> Option<String> {
        self.entity_id
            .as_ref()
            .map(|id| format!("{}:{id}", self.table_name))
    }

    /// Whether the operation may be attempted at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OperationStatus::Pending && self.next_attempt_at <= now
    }

    /// Replace every reference to `temp_id` with `server_id`.
    ///
    /// Only exact matches are rewritten: the targeted entity id, whole
    /// endpoint path segments, and the known reference fields of an object
    /// payload. Returns `true` if anything changed.
    pub fn remap_id(&mut self, temp_id: &str, server_id: &str) -> bool {
        let mut changed = false;

        if self.entity_id.as_deref() == Some(temp_id) {
            self.entity_id = Some(server_id.to_string());
            changed = true;
        }

        if self.endpoint.split('/').any(|segment| segment == temp_id) {
            self.endpoint = self
                .endpoint
                .split('/')
                .map(|segment| if segment == temp_id { server_id } else { segment })
                .collect::<Vec<_>>()
                .join("/");
            changed = true;
        }

        if let Value::Object(map) = &mut self.payload {
            for field in REFERENCE_FIELDS {
                if let Some(value) = map.get_mut(*field) {
                    if value.as_str() == Some(temp_id) {
                        *value = Value::String(server_id.to_string());
                        changed = true;
                    }
                }
            }
        }

        changed
    }

    /// Temporary ids this operation mentions, other than its own target.
    ///
    /// An operation that references a row still waiting for its server id
    /// cannot be delivered before that row's CREATE.
    #[must_use]
    pub fn referenced_temp_ids(&self) -> Vec<&str> {
        let own = self.entity_id.as_deref();
        let from_endpoint = self.endpoint.split('/');
        let from_payload: Vec<&str> = match &self.payload {
            Value::Object(map) => REFERENCE_FIELDS
                .iter()
                .filter_map(|field| map.get(*field).and_then(Value::as_str))
                .collect(),
            _ => Vec::new(),
        };

        let mut ids: Vec<&str> = from_endpoint
            .chain(from_payload)
            .filter(|id| super::is_temp_id(id) && Some(*id) != own)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Counts of queued operations by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Operations waiting to be sent.
    pub pending: u64,
    /// Operations currently in flight.
    pub syncing: u64,
    /// Operations that gave up.
    pub failed: u64,
    /// Operations delivered and not yet purged.
    pub completed: u64,
    /// Timestamp of the oldest pending operation.
    pub oldest_pending: Option<DateTime<Utc>>,
}

impl QueueStats {
    /// Total number of operations in the queue.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.pending + self.syncing + self.failed + self.completed
    }

    /// Whether anything still needs delivery.
    #[must_use]
    pub fn has_outstanding(&self) -> bool {
        self.pending + self.syncing > 0
    }
}
