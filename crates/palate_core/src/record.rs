//! Record model shared by the domain layer and the sync engine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// A JSON object holding a record's domain content.
pub type Fields = Map<String, Value>;

/// Returns the current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

/// The name of the identity field carried on every wire payload.
pub const ID_FIELD: &str = "id";

/// Prefix marking internal fields that must never be synced.
pub const INTERNAL_PREFIX: char = '_';

/// Control-field names excluded from diffs and snapshots.
pub const CONTROL_FIELDS: &[&str] = &[
    "id",
    "version",
    "syncStatus",
    "syncedSnapshot",
    "syncError",
    "createdAt",
    "updatedAt",
];

/// Returns true if `name` is a control field or carries the internal prefix.
pub fn is_control_field(name: &str) -> bool {
    name.starts_with(INTERNAL_PREFIX) || CONTROL_FIELDS.contains(&name)
}

/// Synchronization status of a record.
///
/// Transitions are driven by the sync engine, except for the domain layer's
/// `synced -> pending` transition on local edit (see [`Record::mark_pending`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Local and remote states agree as of the last round-trip.
    Synced,
    /// Local edits exist that have not been pushed.
    Pending,
    /// A push for this record is in flight.
    Syncing,
    /// The remote store rejected a push on a stale version precondition.
    Conflict,
    /// A push failed with a non-retryable error; see the record's error.
    Failed,
}

impl SyncStatus {
    /// Returns true if the record carries local edits not yet agreed with
    /// the remote store.
    pub fn is_dirty(&self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Conflict)
    }
}

/// A locally-stored document with sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Unique identifier within the record's collection.
    pub id: String,
    /// Remote version; 0 until the remote store first accepts the record.
    pub version: u64,
    /// Opaque domain content.
    pub payload: Fields,
    /// Current synchronization status.
    pub sync_status: SyncStatus,
    /// Payload copy as of the last successful round-trip; used for diffing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synced_snapshot: Option<Fields>,
    /// Diagnostic message attached when the record is `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
    /// Client-assigned creation time.
    pub created_at: Timestamp,
    /// Client-assigned time of the last local mutation.
    pub updated_at: Timestamp,
}

impl Record {
    /// Creates a record with a generated UUID, ready for its first push.
    pub fn new(payload: Fields) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), payload)
    }

    /// Creates a record with the given id, ready for its first push.
    pub fn with_id(id: impl Into<String>, payload: Fields) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            version: 0,
            payload,
            sync_status: SyncStatus::Pending,
            synced_snapshot: None,
            sync_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Marks the record as locally edited.
    ///
    /// This is the only status transition owned by the domain layer.
    pub fn mark_pending(&mut self) {
        self.sync_status = SyncStatus::Pending;
        self.updated_at = now_millis();
    }

    /// Returns a payload field by name.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }
}
