//! # Palate Core
//!
//! Record model and local document store for Palate.
//!
//! This crate provides:
//! - The [`Record`] document type shared by the domain layer and the sync
//!   engine, including its synchronization status and synced snapshot
//! - The [`LocalStore`] trait consumed by the sync engine, with single-record
//!   atomic get/put/update/delete/scan operations
//! - An in-memory store implementation for tests and small clients
//!
//! ## Key Invariants
//!
//! - A record's `version` is only ever overwritten with server-returned
//!   values, never guessed by the client
//! - `synced_snapshot` is written only by the sync engine after a confirmed
//!   round-trip
//! - Store operations are atomic per single record (no multi-record
//!   transactions)

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod record;
mod store;

pub use error::{StoreError, StoreResult};
pub use record::{
    is_control_field, now_millis, Fields, Record, SyncStatus, Timestamp, CONTROL_FIELDS, ID_FIELD,
    INTERNAL_PREFIX,
};
pub use store::{LocalStore, MemoryStore};
