//! Sync orchestrator: drives pull and push cycles per collection.

use crate::config::SyncConfig;
use crate::conflict::{
    merge_fields, ConflictContext, ConflictDecision, ConflictDecisionProvider, ConflictOutcome,
    Deferred,
};
use crate::error::{SyncError, SyncResult};
use crate::remote::{RemoteClient, RemoteRecord};
use crate::session::{SyncPhase, SyncSession, SyncStats};
use crate::tracker;
use palate_core::{is_control_field, now_millis, LocalStore, Record, SyncStatus, Timestamp};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// External connectivity signal, consulted before a cycle starts.
pub trait OnlineSignal: Send + Sync {
    /// Returns true if the client currently has connectivity.
    fn is_online(&self) -> bool;
}

/// Signal that always reports connectivity. The default when none is given.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl OnlineSignal for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// A record that entered conflict state during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictedRecord {
    /// Collection holding the record.
    pub collection: String,
    /// Record id.
    pub id: String,
}

/// Aggregate result of one pull-then-push cycle across all collections.
#[derive(Debug, Clone, Default)]
pub struct SyncCycleResult {
    /// Records pulled and applied locally.
    pub pulled: u64,
    /// Records pushed and accepted by the remote store.
    pub pushed: u64,
    /// Records that entered conflict state this cycle.
    pub conflicts: Vec<ConflictedRecord>,
    /// Records marked failed this cycle.
    pub failed: u64,
    /// Whether the cycle ran to completion.
    pub success: bool,
    /// Wall-clock duration of the cycle.
    pub duration: Duration,
}

/// The sync engine reconciles the local store with the remote document
/// store, one collection at a time: pull first (the server is authoritative
/// for unedited records), then push pending local edits.
///
/// At most one cycle runs at a time, enforced by a reentrancy gate; a
/// `sync()` call arriving mid-cycle fails fast with [`SyncError::Busy`].
pub struct SyncEngine<R: RemoteClient, S: LocalStore> {
    config: SyncConfig,
    remote: Arc<R>,
    store: Arc<S>,
    session: SyncSession,
    decisions: Box<dyn ConflictDecisionProvider>,
    online: Box<dyn OnlineSignal>,
    in_flight: AtomicBool,
    cancelled: AtomicBool,
    sleeper: Box<dyn Fn(Duration) + Send + Sync>,
    clock: Box<dyn Fn() -> Timestamp + Send + Sync>,
}

impl<R: RemoteClient, S: LocalStore> SyncEngine<R, S> {
    /// Creates an engine with the default decision provider (defer every
    /// conflict) and an always-online signal.
    pub fn new(config: SyncConfig, remote: R, store: S) -> Self {
        Self {
            config,
            remote: Arc::new(remote),
            store: Arc::new(store),
            session: SyncSession::new(),
            decisions: Box::new(Deferred),
            online: Box::new(AlwaysOnline),
            in_flight: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            sleeper: Box::new(std::thread::sleep),
            clock: Box::new(now_millis),
        }
    }

    /// Sets the conflict decision provider.
    pub fn with_decision_provider(
        mut self,
        provider: impl ConflictDecisionProvider + 'static,
    ) -> Self {
        self.decisions = Box::new(provider);
        self
    }

    /// Sets the online signal.
    pub fn with_online_signal(mut self, signal: impl OnlineSignal + 'static) -> Self {
        self.online = Box::new(signal);
        self
    }

    /// Replaces the backoff sleeper. Tests inject a recorder here to verify
    /// retry schedules without waiting.
    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Box::new(sleeper);
        self
    }

    /// Replaces the wall-clock source used for watermarks.
    pub fn with_clock(mut self, clock: impl Fn() -> Timestamp + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Returns the session state (phase, watermarks, statistics).
    pub fn session(&self) -> &SyncSession {
        &self.session
    }

    /// Returns a copy of the session statistics.
    pub fn stats(&self) -> SyncStats {
        self.session.stats()
    }

    /// Returns the shared remote client.
    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Returns the shared local store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Requests cancellation of the in-flight cycle.
    ///
    /// Cancellation stops the engine from initiating new remote calls;
    /// already-applied local writes are never rolled back. Pull and push are
    /// idempotent per record, so a cancelled cycle is safely resumable.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs one pull-then-push cycle over all configured collections.
    ///
    /// Per-record failures never abort the cycle; they are isolated to the
    /// offending record and reported in the returned aggregate. Cycle-level
    /// failures (a pull listing that stays unreachable, local store errors,
    /// the reentrancy gate, cancellation) surface as `Err`.
    pub fn sync(&self) -> SyncResult<SyncCycleResult> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::Busy);
        }

        let result = self.run_cycle();
        self.in_flight.store(false, Ordering::SeqCst);
        result
    }

    /// Runs `sync()` with the configured retry policy on transient
    /// cycle-level failures.
    pub fn sync_with_retry(&self) -> SyncResult<SyncCycleResult> {
        let retry = &self.config.retry;
        let mut last_error = None;

        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                self.session.set_phase(SyncPhase::RetryWait);
                (self.sleeper)(retry.delay_for_attempt(attempt));
            }

            match self.sync() {
                Ok(result) => return Ok(result),
                Err(error) if error.is_retryable() && attempt + 1 < retry.max_attempts => {
                    warn!("sync cycle failed, will retry: {}", error);
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(last_error.unwrap_or_else(|| SyncError::network("no sync attempts made")))
    }

    fn run_cycle(&self) -> SyncResult<SyncCycleResult> {
        let started = Instant::now();
        self.cancelled.store(false, Ordering::SeqCst);

        if !self.online.is_online() {
            debug!("sync cycle skipped: offline");
            return Err(SyncError::Offline);
        }

        let mut result = SyncCycleResult::default();
        match self.run_collections(&mut result) {
            Ok(()) => {
                result.success = true;
                result.duration = started.elapsed();
                self.session.set_phase(SyncPhase::Synced);
                self.session.with_stats(|stats| {
                    stats.cycles_completed += 1;
                    stats.records_pulled += result.pulled;
                    stats.records_pushed += result.pushed;
                    stats.conflicts += result.conflicts.len() as u64;
                    stats.failures += result.failed;
                    stats.last_error = None;
                    stats.last_sync_time = Some((self.clock)());
                });
                info!(
                    "sync cycle complete: pulled {}, pushed {}, conflicts {}, failed {}",
                    result.pulled,
                    result.pushed,
                    result.conflicts.len(),
                    result.failed
                );
                Ok(result)
            }
            Err(error) => {
                self.session.set_phase(SyncPhase::Error);
                self.session
                    .with_stats(|stats| stats.last_error = Some(error.to_string()));
                Err(error)
            }
        }
    }

    fn run_collections(&self, result: &mut SyncCycleResult) -> SyncResult<()> {
        for collection in &self.config.collections {
            self.check_cancelled()?;
            self.session.set_phase(SyncPhase::Pulling);
            result.pulled += self.pull_collection(collection)?;

            self.check_cancelled()?;
            self.session.set_phase(SyncPhase::Pushing);
            self.push_collection(collection, result)?;
        }
        Ok(())
    }

    /// Pulls one collection incrementally and applies the results.
    ///
    /// The watermark advances to the time captured at the start of the pull,
    /// not the time of the last item, so a record modified during the pull
    /// window is re-pulled next cycle instead of being missed.
    fn pull_collection(&self, collection: &str) -> SyncResult<u64> {
        let cycle_start = (self.clock)();
        let since = self.session.watermark(collection);
        let limit = self.config.pull_batch_size;

        let mut offset = 0u64;
        let mut pulled = 0u64;
        loop {
            self.check_cancelled()?;
            let page =
                self.with_retry(|| self.remote.list(collection, since, limit, offset))?;
            let fetched = page.records.len() as u64;
            offset += fetched;
            let has_more = page.has_more;

            for remote in page.records {
                self.apply_pulled(collection, remote)?;
                pulled += 1;
            }

            if !has_more {
                break;
            }
            // A pager reporting more while returning nothing would never
            // advance the offset; stop instead of listing forever.
            if fetched == 0 {
                warn!(
                    "empty page with more flagged while pulling {}; stopping",
                    collection
                );
                break;
            }
        }

        self.session.advance_watermark(collection, cycle_start);
        debug!("pulled {} records from {}", pulled, collection);
        Ok(pulled)
    }

    /// Applies one pulled record to the local store.
    ///
    /// Records with unsynced local edits are skipped: local edits win until
    /// pushed, and the stale version precondition surfaces the divergence as
    /// a conflict on the push pass.
    fn apply_pulled(&self, collection: &str, remote: RemoteRecord) -> SyncResult<()> {
        let existing = self.store.get(collection, &remote.id)?;
        if let Some(local) = &existing {
            if local.sync_status.is_dirty() {
                debug!(
                    "pull skipped {}/{}: local edits pending",
                    collection, remote.id
                );
                return Ok(());
            }
        }

        let record = match existing {
            Some(mut local) => {
                local.payload = remote.fields;
                local.version = remote.version;
                local.updated_at = remote.updated_at;
                local.sync_status = SyncStatus::Synced;
                local.sync_error = None;
                local
            }
            None => {
                let mut record = Record::with_id(remote.id, remote.fields);
                record.version = remote.version;
                record.updated_at = remote.updated_at;
                record.sync_status = SyncStatus::Synced;
                record
            }
        };

        self.store.put(collection, record.clone())?;
        tracker::store_snapshot(self.store.as_ref(), collection, &record.id, &record)
    }

    /// Pushes all pending records of one collection, sequentially in the
    /// store's queue order.
    fn push_collection(&self, collection: &str, result: &mut SyncCycleResult) -> SyncResult<()> {
        let mut pending = self
            .store
            .scan(collection, &|record| {
                record.sync_status == SyncStatus::Pending
            })?;
        if self.config.push_batch_size > 0 {
            pending.truncate(self.config.push_batch_size as usize);
        }

        for record in pending {
            self.check_cancelled()?;
            self.store.update(collection, &record.id, &mut |stored| {
                stored.sync_status = SyncStatus::Syncing;
            })?;

            match self.push_record(collection, &record) {
                Ok(()) => result.pushed += 1,
                Err(SyncError::VersionConflict { .. }) => {
                    self.store.update(collection, &record.id, &mut |stored| {
                        stored.sync_status = SyncStatus::Conflict;
                    })?;
                    result.conflicts.push(ConflictedRecord {
                        collection: collection.to_string(),
                        id: record.id.clone(),
                    });
                    info!("version conflict on {}/{}", collection, record.id);

                    match self.resolve_conflict(collection, &record.id, None) {
                        Ok(_) => {}
                        Err(error @ SyncError::Store(_)) => return Err(error),
                        Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                        Err(error) => {
                            warn!(
                                "conflict resolution for {}/{} failed: {}",
                                collection, record.id, error
                            );
                        }
                    }
                }
                Err(SyncError::NotFound { .. }) => {
                    self.store.delete(collection, &record.id)?;
                    info!("removed {}/{}: deleted remotely", collection, record.id);
                }
                Err(SyncError::Validation { message, .. }) => {
                    self.mark_failed(collection, &record.id, &message)?;
                    result.failed += 1;
                }
                Err(error @ (SyncError::Store(_) | SyncError::Cancelled)) => {
                    // The cycle aborts here with the record still marked
                    // Syncing; restore Pending so the next cycle re-pushes it.
                    let _ = self.store.update(collection, &record.id, &mut |stored| {
                        if stored.sync_status == SyncStatus::Syncing {
                            stored.sync_status = SyncStatus::Pending;
                        }
                    });
                    return Err(error);
                }
                Err(error) => {
                    // Transient failure with the retry budget exhausted.
                    self.mark_failed(collection, &record.id, &error.to_string())?;
                    result.failed += 1;
                    warn!("push of {}/{} failed: {}", collection, record.id, error);
                }
            }
        }

        Ok(())
    }

    /// Pushes one record: a create for never-synced records, otherwise a
    /// conditional update with the current version as precondition.
    fn push_record(&self, collection: &str, record: &Record) -> SyncResult<()> {
        let changes = tracker::extract_changed_fields(record);

        let response = self.with_retry(|| {
            if record.version == 0 {
                self.remote.create(collection, &changes)
            } else {
                self.remote
                    .update(collection, &record.id, &changes, Some(record.version))
            }
        })?;

        self.apply_remote_response(collection, &record.id, &response)
    }

    /// Resolves a version conflict for one record.
    ///
    /// Fetches both contending versions, obtains a decision from the caller
    /// or the configured provider, and applies it. A deferred decision
    /// leaves the record in conflict state untouched.
    pub fn resolve_conflict(
        &self,
        collection: &str,
        id: &str,
        resolution: Option<ConflictDecision>,
    ) -> SyncResult<ConflictOutcome> {
        let Some(local) = self.store.get(collection, id)? else {
            warn!("cannot resolve {}/{}: no local record", collection, id);
            return Ok(ConflictOutcome::Deferred);
        };

        let server = match self.with_retry(|| self.remote.fetch(collection, id)) {
            Ok(server) => server,
            Err(SyncError::NotFound { .. }) => {
                self.store.delete(collection, id)?;
                info!("removed {}/{}: deleted remotely", collection, id);
                return Ok(ConflictOutcome::RemoteDeleted);
            }
            Err(error) => return Err(error),
        };

        let decision = resolution.or_else(|| {
            self.decisions.decide(&ConflictContext {
                collection: collection.to_string(),
                id: id.to_string(),
                local: local.clone(),
                server: server.clone(),
            })
        });
        let Some(decision) = decision else {
            debug!("conflict on {}/{} deferred", collection, id);
            return Ok(ConflictOutcome::Deferred);
        };

        match decision {
            ConflictDecision::Local => {
                // Force-overwrite: no version precondition, server's new
                // version is authoritative afterwards.
                let changes = tracker::extract_changed_fields(&local);
                let response =
                    self.with_retry(|| self.remote.update(collection, id, &changes, None))?;
                self.apply_remote_response(collection, id, &response)?;
            }
            ConflictDecision::Server => {
                let mut accepted = None;
                self.store.update(collection, id, &mut |stored| {
                    stored.payload = tracker::sanitize_fields(&server.fields);
                    stored.version = server.version;
                    stored.updated_at = server.updated_at;
                    stored.sync_status = SyncStatus::Synced;
                    stored.sync_error = None;
                    accepted = Some(stored.clone());
                })?;
                if let Some(record) = accepted {
                    tracker::store_snapshot(self.store.as_ref(), collection, id, &record)?;
                }
            }
            ConflictDecision::Merge => {
                let changes = tracker::extract_changed_fields(&local);
                let merged = merge_fields(&server.fields, &changes);
                let pushed = self
                    .with_retry(|| self.remote.update(collection, id, &merged, Some(server.version)));
                match pushed {
                    Ok(response) => self.apply_remote_response(collection, id, &response)?,
                    Err(SyncError::VersionConflict { .. }) => {
                        // The remote moved again between fetch and push; the
                        // record re-enters conflict state for an explicit
                        // resolver invocation rather than a silent retry.
                        self.store.update(collection, id, &mut |stored| {
                            stored.sync_status = SyncStatus::Conflict;
                        })?;
                        info!("merge push for {}/{} conflicted again", collection, id);
                        return Ok(ConflictOutcome::Conflicted);
                    }
                    Err(error) => return Err(error),
                }
            }
        }

        Ok(ConflictOutcome::Resolved(decision))
    }

    /// Applies an accepted server response to the local record and stores
    /// the fresh snapshot.
    fn apply_remote_response(
        &self,
        collection: &str,
        id: &str,
        response: &RemoteRecord,
    ) -> SyncResult<()> {
        let mut accepted = None;
        self.store.update(collection, id, &mut |stored| {
            for (name, value) in &response.fields {
                if is_control_field(name) {
                    continue;
                }
                if value.is_null() {
                    stored.payload.remove(name);
                } else {
                    stored.payload.insert(name.clone(), value.clone());
                }
            }
            stored.version = response.version;
            stored.sync_status = SyncStatus::Synced;
            stored.sync_error = None;
            accepted = Some(stored.clone());
        })?;

        match accepted {
            Some(record) => {
                tracker::store_snapshot(self.store.as_ref(), collection, id, &record)
            }
            None => {
                debug!("{}/{} vanished before response applied", collection, id);
                Ok(())
            }
        }
    }

    fn mark_failed(&self, collection: &str, id: &str, message: &str) -> SyncResult<()> {
        self.store.update(collection, id, &mut |stored| {
            stored.sync_status = SyncStatus::Failed;
            stored.sync_error = Some(message.to_string());
        })?;
        Ok(())
    }

    /// Runs a remote call under the transient-failure retry policy.
    fn with_retry<T>(&self, mut call: impl FnMut() -> SyncResult<T>) -> SyncResult<T> {
        let retry = &self.config.retry;
        let mut last_error = None;

        for attempt in 0..retry.max_attempts {
            if attempt > 0 {
                (self.sleeper)(retry.delay_for_attempt(attempt));
            }
            self.check_cancelled()?;

            match call() {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt + 1 < retry.max_attempts => {
                    debug!("transient failure, retrying: {}", error);
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        Err(last_error.unwrap_or_else(|| SyncError::network("retry budget exhausted")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::remote::{MockRemote, RemoteCall, RemotePage};
    use palate_core::{Fields, MemoryStore};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    fn fields(pairs: &[(&str, Value)]) -> Fields {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    fn engine_with(remote: MockRemote) -> SyncEngine<MockRemote, MemoryStore> {
        SyncEngine::new(SyncConfig::new(["entities"]), remote, MemoryStore::new())
    }

    fn remote_record(id: &str, version: u64, pairs: &[(&str, Value)]) -> RemoteRecord {
        RemoteRecord {
            id: id.into(),
            version,
            fields: fields(pairs),
            updated_at: 9_000,
        }
    }

    /// A pending local record that has already synced at `version`.
    fn synced_then_edited(id: &str, version: u64) -> Record {
        let mut record = Record::with_id(
            id,
            fields(&[("name", json!("New")), ("status", json!("draft"))]),
        );
        record.version = version;
        record.synced_snapshot = Some(fields(&[
            ("id", json!(id)),
            ("name", json!("Old")),
            ("status", json!("draft")),
        ]));
        record
    }

    #[test]
    fn initial_state() {
        let engine = engine_with(MockRemote::new());
        assert_eq!(engine.session().phase(), SyncPhase::Idle);
        assert_eq!(engine.stats().cycles_completed, 0);
    }

    #[test]
    fn reentrancy_gate_rejects_overlapping_cycles() {
        let engine = engine_with(MockRemote::new());
        engine.in_flight.store(true, Ordering::SeqCst);

        let result = engine.sync();
        assert!(matches!(result, Err(SyncError::Busy)));
    }

    #[test]
    fn offline_signal_blocks_cycle() {
        struct NeverOnline;
        impl OnlineSignal for NeverOnline {
            fn is_online(&self) -> bool {
                false
            }
        }

        let engine = engine_with(MockRemote::new()).with_online_signal(NeverOnline);
        let result = engine.sync();
        assert!(matches!(result, Err(SyncError::Offline)));
    }

    #[test]
    fn empty_cycle_succeeds() {
        let engine = engine_with(MockRemote::new());
        let result = engine.sync().unwrap();
        assert!(result.success);
        assert_eq!(result.pulled, 0);
        assert_eq!(result.pushed, 0);
        assert_eq!(engine.session().phase(), SyncPhase::Synced);
        assert_eq!(engine.stats().cycles_completed, 1);
    }

    #[test]
    fn first_push_creates_with_full_payload() {
        let remote = MockRemote::new();
        remote.queue_create(Ok(remote_record(
            "e1",
            1,
            &[("name", json!("X")), ("city", json!("SP"))],
        )));

        let engine = engine_with(remote);
        engine
            .store()
            .put(
                "entities",
                Record::with_id("e1", fields(&[("name", json!("X")), ("city", json!("SP"))])),
            )
            .unwrap();

        let result = engine.sync().unwrap();
        assert_eq!(result.pushed, 1);

        let stored = engine.store().get("entities", "e1").unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(stored.version, 1);
        assert!(stored.synced_snapshot.is_some());

        let create = engine
            .remote()
            .calls()
            .into_iter()
            .find(|call| matches!(call, RemoteCall::Create { .. }))
            .unwrap();
        assert_eq!(
            create,
            RemoteCall::Create {
                collection: "entities".into(),
                fields: fields(&[
                    ("id", json!("e1")),
                    ("name", json!("X")),
                    ("city", json!("SP")),
                ]),
            }
        );
    }

    #[test]
    fn push_sends_diff_with_version_precondition() {
        let remote = MockRemote::new();
        remote.queue_update(Ok(remote_record("e1", 3, &[("name", json!("New"))])));

        let engine = engine_with(remote);
        engine
            .store()
            .put("entities", synced_then_edited("e1", 2))
            .unwrap();

        let result = engine.sync().unwrap();
        assert_eq!(result.pushed, 1);

        let update = engine
            .remote()
            .calls()
            .into_iter()
            .find(|call| matches!(call, RemoteCall::Update { .. }))
            .unwrap();
        assert_eq!(
            update,
            RemoteCall::Update {
                collection: "entities".into(),
                id: "e1".into(),
                fields: fields(&[("id", json!("e1")), ("name", json!("New"))]),
                expected_version: Some(2),
            }
        );

        let stored = engine.store().get("entities", "e1").unwrap().unwrap();
        assert_eq!(stored.version, 3);
        assert_eq!(stored.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn stale_precondition_marks_conflict_not_overwrite() {
        let remote = MockRemote::new();
        remote.queue_update(Err(SyncError::version_conflict("entities", "e1")));
        remote.queue_fetch(Ok(remote_record("e1", 4, &[("name", json!("Server"))])));

        let engine = engine_with(remote);
        engine
            .store()
            .put("entities", synced_then_edited("e1", 2))
            .unwrap();

        let result = engine.sync().unwrap();
        assert_eq!(result.pushed, 0);
        assert_eq!(
            result.conflicts,
            vec![ConflictedRecord {
                collection: "entities".into(),
                id: "e1".into(),
            }]
        );

        // Default provider defers; local edits survive untouched.
        let stored = engine.store().get("entities", "e1").unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Conflict);
        assert_eq!(stored.field("name"), Some(&json!("New")));
        assert_eq!(stored.version, 2);
    }

    #[test]
    fn resolve_server_replaces_local_record() {
        let remote = MockRemote::new();
        remote.queue_fetch(Ok(remote_record(
            "e1",
            4,
            &[("name", json!("Server")), ("stars", json!(3))],
        )));

        let engine = engine_with(remote);
        let mut local = synced_then_edited("e1", 2);
        local.sync_status = SyncStatus::Conflict;
        engine.store().put("entities", local).unwrap();

        let outcome = engine
            .resolve_conflict("entities", "e1", Some(ConflictDecision::Server))
            .unwrap();
        assert_eq!(outcome, ConflictOutcome::Resolved(ConflictDecision::Server));

        let stored = engine.store().get("entities", "e1").unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(stored.version, 4);
        assert_eq!(
            stored.payload,
            fields(&[("name", json!("Server")), ("stars", json!(3))])
        );
        assert!(stored.synced_snapshot.is_some());
    }

    #[test]
    fn resolve_local_forces_update_without_precondition() {
        let remote = MockRemote::new();
        remote.queue_fetch(Ok(remote_record("e1", 4, &[("name", json!("Server"))])));
        remote.queue_update(Ok(remote_record("e1", 5, &[("name", json!("New"))])));

        let engine = engine_with(remote);
        let mut local = synced_then_edited("e1", 2);
        local.sync_status = SyncStatus::Conflict;
        engine.store().put("entities", local).unwrap();

        let outcome = engine
            .resolve_conflict("entities", "e1", Some(ConflictDecision::Local))
            .unwrap();
        assert_eq!(outcome, ConflictOutcome::Resolved(ConflictDecision::Local));

        let update = engine
            .remote()
            .calls()
            .into_iter()
            .find(|call| matches!(call, RemoteCall::Update { .. }))
            .unwrap();
        assert_eq!(
            update,
            RemoteCall::Update {
                collection: "entities".into(),
                id: "e1".into(),
                fields: fields(&[("id", json!("e1")), ("name", json!("New"))]),
                expected_version: None,
            }
        );

        let stored = engine.store().get("entities", "e1").unwrap().unwrap();
        assert_eq!(stored.version, 5);
        assert_eq!(stored.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn resolve_merge_pushes_overlay_against_server_version() {
        let remote = MockRemote::new();
        remote.queue_fetch(Ok(remote_record(
            "e1",
            4,
            &[
                ("name", json!("Server")),
                ("status", json!("draft")),
                ("stars", json!(3)),
            ],
        )));
        remote.queue_update(Ok(remote_record(
            "e1",
            5,
            &[
                ("name", json!("New")),
                ("status", json!("draft")),
                ("stars", json!(3)),
            ],
        )));

        let engine = engine_with(remote);
        let mut local = synced_then_edited("e1", 2);
        local.sync_status = SyncStatus::Conflict;
        engine.store().put("entities", local).unwrap();

        let outcome = engine
            .resolve_conflict("entities", "e1", Some(ConflictDecision::Merge))
            .unwrap();
        assert_eq!(outcome, ConflictOutcome::Resolved(ConflictDecision::Merge));

        let update = engine
            .remote()
            .calls()
            .into_iter()
            .find(|call| matches!(call, RemoteCall::Update { .. }))
            .unwrap();
        assert_eq!(
            update,
            RemoteCall::Update {
                collection: "entities".into(),
                id: "e1".into(),
                // Server fields overlaid with exactly the local changes.
                fields: fields(&[
                    ("id", json!("e1")),
                    ("name", json!("New")),
                    ("status", json!("draft")),
                    ("stars", json!(3)),
                ]),
                expected_version: Some(4),
            }
        );

        let stored = engine.store().get("entities", "e1").unwrap().unwrap();
        assert_eq!(stored.version, 5);
        assert_eq!(stored.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn merge_reconflict_re_enters_conflict_state() {
        let remote = MockRemote::new();
        remote.queue_fetch(Ok(remote_record("e1", 4, &[("name", json!("Server"))])));
        remote.queue_update(Err(SyncError::version_conflict("entities", "e1")));

        let engine = engine_with(remote);
        let mut local = synced_then_edited("e1", 2);
        local.sync_status = SyncStatus::Conflict;
        engine.store().put("entities", local).unwrap();

        let outcome = engine
            .resolve_conflict("entities", "e1", Some(ConflictDecision::Merge))
            .unwrap();
        assert_eq!(outcome, ConflictOutcome::Conflicted);

        let stored = engine.store().get("entities", "e1").unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Conflict);
    }

    #[test]
    fn resolver_handles_remote_deletion() {
        let remote = MockRemote::new();
        remote.queue_fetch(Err(SyncError::not_found("entities", "e1")));

        let engine = engine_with(remote);
        let mut local = synced_then_edited("e1", 2);
        local.sync_status = SyncStatus::Conflict;
        engine.store().put("entities", local).unwrap();

        let outcome = engine.resolve_conflict("entities", "e1", None).unwrap();
        assert_eq!(outcome, ConflictOutcome::RemoteDeleted);
        assert!(engine.store().get("entities", "e1").unwrap().is_none());
    }

    #[test]
    fn push_404_removes_local_record() {
        let remote = MockRemote::new();
        remote.queue_update(Err(SyncError::not_found("entities", "e1")));

        let engine = engine_with(remote);
        engine
            .store()
            .put("entities", synced_then_edited("e1", 2))
            .unwrap();

        let result = engine.sync().unwrap();
        assert_eq!(result.failed, 0);
        assert!(engine.store().get("entities", "e1").unwrap().is_none());
    }

    #[test]
    fn validation_failure_marks_record_failed() {
        let remote = MockRemote::new();
        remote.queue_update(Err(SyncError::Validation {
            status: 422,
            message: "name must not be empty".into(),
        }));

        let engine = engine_with(remote);
        engine
            .store()
            .put("entities", synced_then_edited("e1", 2))
            .unwrap();

        let result = engine.sync().unwrap();
        assert_eq!(result.failed, 1);
        assert!(result.success);

        let stored = engine.store().get("entities", "e1").unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Failed);
        assert!(stored
            .sync_error
            .as_deref()
            .unwrap()
            .contains("name must not be empty"));
    }

    #[test]
    fn transient_push_failure_retries_then_succeeds() {
        let remote = MockRemote::new();
        remote.queue_update(Err(SyncError::network("connection reset")));
        remote.queue_update(Ok(remote_record("e1", 3, &[("name", json!("New"))])));

        let delays = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&delays);

        let engine = SyncEngine::new(
            SyncConfig::new(["entities"]).with_retry(
                RetryConfig::new(3).with_initial_delay(Duration::from_millis(100)),
            ),
            remote,
            MemoryStore::new(),
        )
        .with_sleeper(move |delay| recorded.lock().push(delay));

        engine
            .store()
            .put("entities", synced_then_edited("e1", 2))
            .unwrap();

        let result = engine.sync().unwrap();
        assert_eq!(result.pushed, 1);
        assert_eq!(result.failed, 0);
        assert_eq!(*delays.lock(), vec![Duration::from_millis(100)]);
    }

    #[test]
    fn exhausted_retries_mark_record_failed() {
        let remote = MockRemote::new();
        for _ in 0..3 {
            remote.queue_update(Err(SyncError::network("connection reset")));
        }

        let engine = SyncEngine::new(
            SyncConfig::new(["entities"])
                .with_retry(RetryConfig::new(3).with_initial_delay(Duration::ZERO)),
            remote,
            MemoryStore::new(),
        )
        .with_sleeper(|_| {});

        engine
            .store()
            .put("entities", synced_then_edited("e1", 2))
            .unwrap();

        let result = engine.sync().unwrap();
        assert_eq!(result.failed, 1);
        assert!(result.success);

        let stored = engine.store().get("entities", "e1").unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Failed);
        assert_eq!(engine.stats().failures, 1);
    }

    #[test]
    fn cancelled_push_leaves_record_resumable() {
        let remote = MockRemote::new();
        remote.queue_update(Err(SyncError::Cancelled));
        remote.queue_update(Ok(remote_record("e1", 3, &[("name", json!("New"))])));

        let engine = engine_with(remote);
        engine
            .store()
            .put("entities", synced_then_edited("e1", 2))
            .unwrap();

        let result = engine.sync();
        assert!(matches!(result, Err(SyncError::Cancelled)));

        // Not stranded in Syncing: the next cycle picks the record up again.
        let stored = engine.store().get("entities", "e1").unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Pending);

        let result = engine.sync().unwrap();
        assert_eq!(result.pushed, 1);
        let stored = engine.store().get("entities", "e1").unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(stored.version, 3);
    }

    #[test]
    fn store_failure_mid_push_leaves_record_resumable() {
        let remote = MockRemote::new();
        remote.queue_update(Err(SyncError::Store(palate_core::StoreError::backend(
            "disk full",
        ))));

        let engine = engine_with(remote);
        engine
            .store()
            .put("entities", synced_then_edited("e1", 2))
            .unwrap();

        let result = engine.sync();
        assert!(matches!(result, Err(SyncError::Store(_))));

        let stored = engine.store().get("entities", "e1").unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn pull_applies_records_and_advances_watermark() {
        let remote = MockRemote::new();
        remote.queue_list(Ok(RemotePage {
            records: vec![
                remote_record("e1", 1, &[("name", json!("One"))]),
                remote_record("e2", 2, &[("name", json!("Two"))]),
            ],
            has_more: false,
        }));

        let engine = engine_with(remote).with_clock(|| 5_000);

        let result = engine.sync().unwrap();
        assert_eq!(result.pulled, 2);

        let stored = engine.store().get("entities", "e1").unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(stored.version, 1);
        assert!(stored.synced_snapshot.is_some());

        assert_eq!(engine.session().watermark("entities"), Some(5_000));

        // Next pull filters from the recorded watermark.
        engine.sync().unwrap();
        let lists: Vec<RemoteCall> = engine
            .remote()
            .calls()
            .into_iter()
            .filter(|call| matches!(call, RemoteCall::List { .. }))
            .collect();
        assert_eq!(
            lists[1],
            RemoteCall::List {
                collection: "entities".into(),
                since: Some(5_000),
                limit: 100,
                offset: 0,
            }
        );
    }

    #[test]
    fn pull_pages_until_exhausted() {
        let remote = MockRemote::new();
        remote.queue_list(Ok(RemotePage {
            records: vec![remote_record("e1", 1, &[("name", json!("One"))])],
            has_more: true,
        }));
        remote.queue_list(Ok(RemotePage {
            records: vec![remote_record("e2", 1, &[("name", json!("Two"))])],
            has_more: false,
        }));

        let engine = engine_with(remote);
        let result = engine.sync().unwrap();
        assert_eq!(result.pulled, 2);

        let lists: Vec<RemoteCall> = engine
            .remote()
            .calls()
            .into_iter()
            .filter(|call| matches!(call, RemoteCall::List { .. }))
            .collect();
        assert!(matches!(lists[0], RemoteCall::List { offset: 0, .. }));
        assert!(matches!(lists[1], RemoteCall::List { offset: 1, .. }));
    }

    #[test]
    fn pull_stops_on_empty_page_despite_more_flag() {
        let remote = MockRemote::new();
        remote.queue_list(Ok(RemotePage {
            records: vec![remote_record("e1", 1, &[("name", json!("One"))])],
            has_more: true,
        }));
        remote.queue_list(Ok(RemotePage {
            records: vec![],
            has_more: true,
        }));

        let engine = engine_with(remote);
        let result = engine.sync().unwrap();
        assert!(result.success);
        assert_eq!(result.pulled, 1);

        // The empty page ends the pull even with has_more set.
        let lists = engine
            .remote()
            .calls()
            .into_iter()
            .filter(|call| matches!(call, RemoteCall::List { .. }))
            .count();
        assert_eq!(lists, 2);
    }

    #[test]
    fn pull_never_clobbers_dirty_local_records() {
        let remote = MockRemote::new();
        remote.queue_list(Ok(RemotePage {
            records: vec![remote_record("e1", 4, &[("name", json!("Server"))])],
            has_more: false,
        }));

        let engine = engine_with(remote);
        engine
            .store()
            .put("entities", synced_then_edited("e1", 2))
            .unwrap();

        engine.sync().unwrap();

        let stored = engine.store().get("entities", "e1").unwrap().unwrap();
        assert_eq!(stored.field("name"), Some(&json!("New")));
        assert_eq!(stored.version, 2);
    }

    #[test]
    fn failed_pull_leaves_watermark_and_errors_cycle() {
        let remote = MockRemote::new();
        remote.queue_list(Err(SyncError::network("unreachable")));

        let engine = SyncEngine::new(
            SyncConfig::new(["entities"]).with_retry(RetryConfig::no_retry()),
            remote,
            MemoryStore::new(),
        );

        let result = engine.sync();
        assert!(matches!(result, Err(SyncError::Network { .. })));
        assert!(engine.session().watermark("entities").is_none());
        assert_eq!(engine.session().phase(), SyncPhase::Error);
        assert!(engine.stats().last_error.is_some());
    }

    #[test]
    fn sync_with_retry_recovers_from_transient_cycle_failure() {
        let remote = MockRemote::new();
        remote.queue_list(Err(SyncError::network("unreachable")));
        remote.queue_list(Err(SyncError::network("unreachable")));
        // Queue exhausted afterwards: list yields empty pages.

        let delays = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&delays);

        let engine = SyncEngine::new(
            SyncConfig::new(["entities"]).with_retry(
                RetryConfig::new(2).with_initial_delay(Duration::from_millis(50)),
            ),
            remote,
            MemoryStore::new(),
        )
        .with_sleeper(move |delay| recorded.lock().push(delay));

        let result = engine.sync_with_retry().unwrap();
        assert!(result.success);
        // One in-call retry, one cycle-level retry.
        assert_eq!(delays.lock().len(), 2);
    }

    #[test]
    fn cancel_stops_cycle_between_pages() {
        let engine = engine_with(MockRemote::new());
        engine.cancel();
        // sync() resets the flag at cycle start; cancellation targets an
        // in-flight cycle from another thread.
        assert!(engine.sync().is_ok());
    }
}
