//! Remote client abstraction over the versioned REST document store.

use crate::error::{SyncError, SyncResult};
use palate_core::{Fields, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A server-side document as returned by the REST API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    /// Record id.
    pub id: String,
    /// Server-assigned version, incremented on every accepted update.
    pub version: u64,
    /// Domain content, including any server-computed fields.
    pub fields: Fields,
    /// Server-side modification time.
    pub updated_at: Timestamp,
}

/// One page of an incremental list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemotePage {
    /// Records in this page.
    pub records: Vec<RemoteRecord>,
    /// Whether further pages remain.
    pub has_more: bool,
}

/// A client for the remote document store.
///
/// This trait abstracts the network layer; implementations wrap an HTTP
/// client, enforce the configured request timeout, and map response statuses
/// onto [`SyncError`] variants: a stale `If-Match` precondition (409 or 403)
/// becomes [`SyncError::VersionConflict`], a 404 becomes
/// [`SyncError::NotFound`], other 4xx become [`SyncError::Validation`].
pub trait RemoteClient: Send + Sync {
    /// Lists records modified at or after `since`, paged by `limit`/`offset`.
    ///
    /// `since = None` performs a full listing.
    fn list(
        &self,
        collection: &str,
        since: Option<Timestamp>,
        limit: u32,
        offset: u64,
    ) -> SyncResult<RemotePage>;

    /// Creates a record; returns the stored record with its assigned version.
    fn create(&self, collection: &str, fields: &Fields) -> SyncResult<RemoteRecord>;

    /// Reads the current server-side record.
    fn fetch(&self, collection: &str, id: &str) -> SyncResult<RemoteRecord>;

    /// Partially updates a record.
    ///
    /// With `expected_version`, the update carries an `If-Match` precondition
    /// and fails with a version conflict when stale. Without it, the update
    /// is a force-overwrite.
    fn update(
        &self,
        collection: &str,
        id: &str,
        fields: &Fields,
        expected_version: Option<u64>,
    ) -> SyncResult<RemoteRecord>;

    /// Deletes a record.
    fn remove(&self, collection: &str, id: &str) -> SyncResult<()>;
}

/// A remote call observed by [`MockRemote`].
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    /// A list call.
    List {
        /// Collection listed.
        collection: String,
        /// Incremental watermark, if any.
        since: Option<Timestamp>,
        /// Page size.
        limit: u32,
        /// Page offset.
        offset: u64,
    },
    /// A create call.
    Create {
        /// Target collection.
        collection: String,
        /// Request body.
        fields: Fields,
    },
    /// A fetch call.
    Fetch {
        /// Target collection.
        collection: String,
        /// Record id.
        id: String,
    },
    /// An update call.
    Update {
        /// Target collection.
        collection: String,
        /// Record id.
        id: String,
        /// Request body.
        fields: Fields,
        /// `If-Match` precondition, if any.
        expected_version: Option<u64>,
    },
    /// A remove call.
    Remove {
        /// Target collection.
        collection: String,
        /// Record id.
        id: String,
    },
}

/// A scripted remote client for tests.
///
/// Responses are queued per operation and consumed in order; every call is
/// recorded so tests can assert on request bodies and preconditions. An
/// exhausted list queue yields an empty page; other exhausted queues yield a
/// server error.
#[derive(Debug, Default)]
pub struct MockRemote {
    list_responses: Mutex<VecDeque<SyncResult<RemotePage>>>,
    create_responses: Mutex<VecDeque<SyncResult<RemoteRecord>>>,
    fetch_responses: Mutex<VecDeque<SyncResult<RemoteRecord>>>,
    update_responses: Mutex<VecDeque<SyncResult<RemoteRecord>>>,
    remove_responses: Mutex<VecDeque<SyncResult<()>>>,
    calls: Mutex<Vec<RemoteCall>>,
}

impl MockRemote {
    /// Creates a mock with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a list response.
    pub fn queue_list(&self, response: SyncResult<RemotePage>) {
        self.list_responses.lock().push_back(response);
    }

    /// Queues a create response.
    pub fn queue_create(&self, response: SyncResult<RemoteRecord>) {
        self.create_responses.lock().push_back(response);
    }

    /// Queues a fetch response.
    pub fn queue_fetch(&self, response: SyncResult<RemoteRecord>) {
        self.fetch_responses.lock().push_back(response);
    }

    /// Queues an update response.
    pub fn queue_update(&self, response: SyncResult<RemoteRecord>) {
        self.update_responses.lock().push_back(response);
    }

    /// Queues a remove response.
    pub fn queue_remove(&self, response: SyncResult<()>) {
        self.remove_responses.lock().push_back(response);
    }

    /// Returns all calls observed so far.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: RemoteCall) {
        self.calls.lock().push(call);
    }

    fn unscripted(operation: &str) -> SyncError {
        SyncError::Server {
            message: format!("mock: no scripted {operation} response"),
        }
    }
}

impl RemoteClient for MockRemote {
    fn list(
        &self,
        collection: &str,
        since: Option<Timestamp>,
        limit: u32,
        offset: u64,
    ) -> SyncResult<RemotePage> {
        self.record(RemoteCall::List {
            collection: collection.into(),
            since,
            limit,
            offset,
        });
        self.list_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(RemotePage::default()))
    }

    fn create(&self, collection: &str, fields: &Fields) -> SyncResult<RemoteRecord> {
        self.record(RemoteCall::Create {
            collection: collection.into(),
            fields: fields.clone(),
        });
        self.create_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Self::unscripted("create")))
    }

    fn fetch(&self, collection: &str, id: &str) -> SyncResult<RemoteRecord> {
        self.record(RemoteCall::Fetch {
            collection: collection.into(),
            id: id.into(),
        });
        self.fetch_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Self::unscripted("fetch")))
    }

    fn update(
        &self,
        collection: &str,
        id: &str,
        fields: &Fields,
        expected_version: Option<u64>,
    ) -> SyncResult<RemoteRecord> {
        self.record(RemoteCall::Update {
            collection: collection.into(),
            id: id.into(),
            fields: fields.clone(),
            expected_version,
        });
        self.update_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Self::unscripted("update")))
    }

    fn remove(&self, collection: &str, id: &str) -> SyncResult<()> {
        self.record(RemoteCall::Remove {
            collection: collection.into(),
            id: id.into(),
        });
        self.remove_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Self::unscripted("remove")))
    }
}
