//! Conflict decisions and decision providers.
//!
//! A version conflict means the remote record moved past the version the
//! client pushed against. Resolution is always an explicit decision: keep
//! the local side, keep the server side, or merge. The decision comes from
//! the caller or from a [`ConflictDecisionProvider`], which in an
//! interactive client wraps the UI prompt and in headless contexts is one
//! of the fixed policies below.

use crate::remote::RemoteRecord;
use crate::tracker::sanitize_fields;
use palate_core::{Fields, Record};

/// How to reconcile a diverged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Force-push the local changes, overwriting the server.
    Local,
    /// Replace the local record with the server's current state.
    Server,
    /// Overlay the locally-changed fields onto the server's current state.
    Merge,
}

/// Both sides of a conflict, handed to the decision provider.
#[derive(Debug, Clone)]
pub struct ConflictContext {
    /// Collection holding the record.
    pub collection: String,
    /// Record id.
    pub id: String,
    /// The local record, including its pending edits.
    pub local: Record,
    /// The server's current record.
    pub server: RemoteRecord,
}

/// Supplies resolution decisions for version conflicts.
///
/// Returning `None` defers the conflict: the record stays in `Conflict`
/// status until the caller resolves it explicitly.
pub trait ConflictDecisionProvider: Send + Sync {
    /// Decides how to resolve one conflict.
    fn decide(&self, context: &ConflictContext) -> Option<ConflictDecision>;
}

/// Non-interactive policy: the server side always wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysServer;

impl ConflictDecisionProvider for AlwaysServer {
    fn decide(&self, _context: &ConflictContext) -> Option<ConflictDecision> {
        Some(ConflictDecision::Server)
    }
}

/// Non-interactive policy: the local side always wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysLocal;

impl ConflictDecisionProvider for AlwaysLocal {
    fn decide(&self, _context: &ConflictContext) -> Option<ConflictDecision> {
        Some(ConflictDecision::Local)
    }
}

/// Default policy: never auto-resolves; every conflict is deferred.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deferred;

impl ConflictDecisionProvider for Deferred {
    fn decide(&self, _context: &ConflictContext) -> Option<ConflictDecision> {
        None
    }
}

/// Outcome of one resolver invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// The decision was applied and the record is synced.
    Resolved(ConflictDecision),
    /// No decision was made; the record remains in conflict.
    Deferred,
    /// The merge push hit another version conflict; the record re-entered
    /// conflict state and needs a fresh resolver invocation.
    Conflicted,
    /// The server no longer holds the record; the local copy was removed.
    RemoteDeleted,
}

/// Builds the merge body: server fields overlaid with exactly the
/// locally-changed fields.
///
/// Fields the user changed locally win; everything else comes from the
/// server. The identity field is carried from the local changes.
pub fn merge_fields(server: &Fields, local_changes: &Fields) -> Fields {
    let mut merged = sanitize_fields(server);
    for (name, value) in local_changes {
        merged.insert(name.clone(), value.clone());
    }
    merged
}
