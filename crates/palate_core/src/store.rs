//! Local document store interface.

use crate::error::StoreResult;
use crate::record::Record;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// A local document store, keyed by collection name and record id.
///
/// All operations are atomic per single record. The store is shared with the
/// domain layer; the sync engine performs single-record read-modify-write
/// operations and never takes multi-record transactions.
pub trait LocalStore: Send + Sync {
    /// Reads one record.
    fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Record>>;

    /// Writes one record, replacing any existing one with the same id.
    fn put(&self, collection: &str, record: Record) -> StoreResult<()>;

    /// Applies an in-place mutation to one record.
    ///
    /// Returns false if the record does not exist.
    fn update(
        &self,
        collection: &str,
        id: &str,
        apply: &mut dyn FnMut(&mut Record),
    ) -> StoreResult<bool>;

    /// Deletes one record. Returns false if it did not exist.
    fn delete(&self, collection: &str, id: &str) -> StoreResult<bool>;

    /// Returns all records in a collection matching the predicate, in the
    /// store's queue order (ascending id for the in-memory store).
    fn scan(
        &self,
        collection: &str,
        predicate: &dyn Fn(&Record) -> bool,
    ) -> StoreResult<Vec<Record>>;
}

/// An in-memory store for tests and small clients.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Record>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Returns true if a collection holds no records.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Record>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|records| records.get(id))
            .cloned())
    }

    fn put(&self, collection: &str, record: Record) -> StoreResult<()> {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(record.id.clone(), record);
        Ok(())
    }

    fn update(
        &self,
        collection: &str,
        id: &str,
        apply: &mut dyn FnMut(&mut Record),
    ) -> StoreResult<bool> {
        let mut collections = self.collections.write();
        match collections.get_mut(collection).and_then(|r| r.get_mut(id)) {
            Some(record) => {
                apply(record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete(&self, collection: &str, id: &str) -> StoreResult<bool> {
        Ok(self
            .collections
            .write()
            .get_mut(collection)
            .and_then(|records| records.remove(id))
            .is_some())
    }

    fn scan(
        &self,
        collection: &str,
        predicate: &dyn Fn(&Record) -> bool,
    ) -> StoreResult<Vec<Record>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|records| {
                records
                    .values()
                    .filter(|r| predicate(r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
