//! Per-session sync state: phase, watermarks, and statistics.

use palate_core::Timestamp;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Phase of the engine's cycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    /// No cycle has run yet, or the session was reset.
    #[default]
    Idle,
    /// A pull pass is in progress.
    Pulling,
    /// A push pass is in progress.
    Pushing,
    /// The last cycle completed.
    Synced,
    /// The last cycle ended with a cycle-level error.
    Error,
    /// Waiting before a retry attempt.
    RetryWait,
}

impl SyncPhase {
    /// Returns true while a cycle is actively touching records.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncPhase::Pulling | SyncPhase::Pushing)
    }

    /// Returns true if a new cycle may start from this phase.
    pub fn can_start_cycle(&self) -> bool {
        matches!(self, SyncPhase::Idle | SyncPhase::Synced | SyncPhase::Error)
    }
}

/// Counters accumulated since session start.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Completed sync cycles.
    pub cycles_completed: u64,
    /// Records pulled from the remote store.
    pub records_pulled: u64,
    /// Records pushed and accepted.
    pub records_pushed: u64,
    /// Version conflicts encountered.
    pub conflicts: u64,
    /// Records marked failed.
    pub failures: u64,
    /// Most recent cycle-level error message.
    pub last_error: Option<String>,
    /// Completion time of the last successful cycle.
    pub last_sync_time: Option<Timestamp>,
}

/// Session-wide sync state, owned by one engine instance.
///
/// Holding the state in an explicit value (rather than ambient globals)
/// keeps independent sync sessions isolated from each other.
#[derive(Debug, Default)]
pub struct SyncSession {
    phase: RwLock<SyncPhase>,
    watermarks: RwLock<HashMap<String, Timestamp>>,
    stats: RwLock<SyncStats>,
}

impl SyncSession {
    /// Creates an idle session with no watermarks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current phase.
    pub fn phase(&self) -> SyncPhase {
        *self.phase.read()
    }

    pub(crate) fn set_phase(&self, phase: SyncPhase) {
        *self.phase.write() = phase;
    }

    /// Returns the incremental-pull watermark for a collection.
    pub fn watermark(&self, collection: &str) -> Option<Timestamp> {
        self.watermarks.read().get(collection).copied()
    }

    /// Advances a collection's watermark, never moving it backward.
    ///
    /// Returns true if the watermark moved.
    pub(crate) fn advance_watermark(&self, collection: &str, timestamp: Timestamp) -> bool {
        let mut watermarks = self.watermarks.write();
        match watermarks.get(collection) {
            Some(&current) if current >= timestamp => false,
            _ => {
                watermarks.insert(collection.to_string(), timestamp);
                true
            }
        }
    }

    /// Returns a copy of the session statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    pub(crate) fn with_stats(&self, apply: impl FnOnce(&mut SyncStats)) {
        apply(&mut self.stats.write());
    }
}
