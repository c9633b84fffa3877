//! Field-level change tracking against synced snapshots.
//!
//! The tracker computes the minimal diff between a record's current payload
//! and its last remote-agreed snapshot, and writes fresh snapshots after
//! confirmed round-trips. Comparison is structural: nested objects and
//! arrays are compared by value via [`serde_json::Value`] equality.

use crate::error::SyncResult;
use palate_core::{is_control_field, Fields, LocalStore, Record, ID_FIELD};
use serde_json::Value;
use tracing::debug;

/// Returns a copy of `fields` with control fields and internal-prefixed
/// keys removed.
pub fn sanitize_fields(fields: &Fields) -> Fields {
    fields
        .iter()
        .filter(|(name, _)| !is_control_field(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Returns the sanitized snapshot image of a record: its current payload
/// plus the identity field.
pub fn snapshot_fields(record: &Record) -> Fields {
    let mut fields = sanitize_fields(&record.payload);
    fields.insert(ID_FIELD.into(), Value::String(record.id.clone()));
    fields
}

/// Computes the fields to push for a record.
///
/// The result always carries the identity field verbatim. With a snapshot,
/// it holds exactly the payload fields whose structural value differs from
/// the snapshot; a field present in the snapshot but absent from the payload
/// is emitted as JSON `null` (field removed). Without a snapshot (first
/// sync), it holds the full sanitized payload.
pub fn extract_changed_fields(record: &Record) -> Fields {
    let mut changes = Fields::new();
    changes.insert(ID_FIELD.into(), Value::String(record.id.clone()));

    let current = sanitize_fields(&record.payload);
    match &record.synced_snapshot {
        None => {
            for (name, value) in current {
                changes.insert(name, value);
            }
        }
        Some(snapshot) => {
            for (name, value) in &current {
                if snapshot.get(name) != Some(value) {
                    changes.insert(name.clone(), value.clone());
                }
            }
            for name in snapshot.keys() {
                if is_control_field(name) || current.contains_key(name) {
                    continue;
                }
                // Already removed in a previous round-trip.
                if snapshot.get(name) == Some(&Value::Null) {
                    continue;
                }
                changes.insert(name.clone(), Value::Null);
            }
        }
    }

    changes
}

/// Persists the record's current payload as its new synced snapshot.
///
/// Called exactly once per record per confirmed round-trip, never before the
/// round-trip is confirmed.
pub fn store_snapshot<S: LocalStore + ?Sized>(
    store: &S,
    collection: &str,
    id: &str,
    record: &Record,
) -> SyncResult<()> {
    let snapshot = snapshot_fields(record);
    let found = store.update(collection, id, &mut |stored| {
        stored.synced_snapshot = Some(snapshot.clone());
    })?;
    if !found {
        debug!("snapshot skipped: {}/{} no longer exists locally", collection, id);
    }
    Ok(())
}
