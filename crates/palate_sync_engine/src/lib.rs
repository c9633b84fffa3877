//! # Palate Sync Engine
//!
//! Offline-first synchronization engine for Palate.
//!
//! This crate provides:
//! - Field-level change tracking against synced snapshots
//! - Pull-then-push sync cycles with per-collection watermarks
//! - Optimistic concurrency via version preconditions
//! - Interactive and headless conflict resolution
//! - Deterministic retry with exponential backoff
//! - Remote REST client abstraction
//!
//! ## Architecture
//!
//! Each cycle pulls a collection incrementally (the server is authoritative
//! for records without local edits), then pushes pending local records as
//! minimal diffs guarded by version preconditions. A stale precondition
//! marks the record conflicted and routes it to the conflict resolver.
//!
//! ## Key Invariants
//!
//! - Versions are only ever adopted from server responses
//! - Snapshots are written only after a confirmed round-trip
//! - Watermarks advance only after a pull's full page set is applied
//! - Pull completes before push within a collection; pushes are sequential
//! - At most one cycle is in flight per engine

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod conflict;
mod engine;
mod error;
mod remote;
mod session;
mod tracker;

pub use config::{RetryConfig, SyncConfig};
pub use conflict::{
    merge_fields, AlwaysLocal, AlwaysServer, ConflictContext, ConflictDecision,
    ConflictDecisionProvider, ConflictOutcome, Deferred,
};
pub use engine::{AlwaysOnline, ConflictedRecord, OnlineSignal, SyncCycleResult, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use remote::{MockRemote, RemoteCall, RemoteClient, RemotePage, RemoteRecord};
pub use session::{SyncPhase, SyncSession, SyncStats};
pub use tracker::{extract_changed_fields, sanitize_fields, snapshot_fields, store_snapshot};
