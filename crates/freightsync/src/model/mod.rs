//! Core data types for freightsync.
//!
//! This module defines the queued mutation record and the locally mirrored
//! domain entities, together with the id helpers shared by both.

pub mod entities;
pub mod operation;

pub use entities::{EntityTable, Route, RoutePage, SyncMeta, Truck, TruckObject};
pub use operation::{OfflineOperation, OperationStatus, OperationType, QueueStats};

use uuid::Uuid;

/// Prefix carried by every client-generated id.
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Generate a new client-side temporary id.
#[must_use]
pub fn new_temp_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4())
}

/// Check whether an id was generated locally and still awaits a server id.
#[must_use]
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Serde helpers that accept ids as either JSON strings or integers.
///
/// The server is not consistent about id types, so everything is normalized
/// to `String` on the way in.
pub(crate) mod ids {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Int(i64),
    }

    impl From<RawId> for String {
        fn from(raw: RawId) -> Self {
            match raw {
                RawId::Text(s) => s,
                RawId::Int(n) => n.to_string(),
            }
        }
    }

    pub fn string<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        RawId::deserialize(deserializer).map(String::from)
    }

    pub fn optional<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<RawId>::deserialize(deserializer).map(|raw| raw.map(String::from))
    }

    /// Extract an id from an arbitrary JSON value.
    pub fn from_value(value: &serde_json::Value) -> Option<String> {
        match value {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}
