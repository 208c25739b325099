//! Storage engine interface shared by executor shards.

use std::sync::RwLock;

use hashbrown::HashMap;

use geode_core::txn::{Key, MasterMetadata, Value};

/// One stored record: the value plus the key's master metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Current value.
    pub value: Value,
    /// Master region and remaster counter for the key.
    pub metadata: MasterMetadata,
}

/// Key-value engine shared across worker threads.
///
/// Workers only touch keys they hold locks for, so the engine's own concurrency control merely
/// has to keep concurrent access to *different* keys safe.
pub trait Storage: Send + Sync {
    /// Reads one record.
    fn read(&self, key: &str) -> Option<Record>;

    /// Writes one record, creating the key when absent.
    fn write(&self, key: Key, record: Record);

    /// Deletes one key.
    fn delete(&self, key: &str);
}

/// In-memory engine backing tests and single-host deployments.
#[derive(Debug, Default)]
pub struct MemStorage {
    records: RwLock<HashMap<Key, Record>>,
}

impl MemStorage {
    /// Creates an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the engine holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Storage for MemStorage {
    fn read(&self, key: &str) -> Option<Record> {
        self.records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn write(&self, key: Key, record: Record) {
        let _ = self
            .records
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key, record);
    }

    fn delete(&self, key: &str) {
        let _ = self
            .records
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::{MemStorage, Record, Storage};
    use geode_core::txn::MasterMetadata;
    use googletest::prelude::*;
    use rstest::rstest;

    fn record(value: &str, master: u32, counter: u32) -> Record {
        Record {
            value: value.to_owned(),
            metadata: MasterMetadata { master, counter },
        }
    }

    #[rstest]
    fn write_then_read_returns_latest_record() {
        let storage = MemStorage::new();
        storage.write("a".to_owned(), record("1", 0, 0));
        storage.write("a".to_owned(), record("2", 0, 1));

        let read = storage.read("a").expect("key must exist");
        assert_that!(read.value.as_str(), eq("2"));
        assert_that!(read.metadata.counter, eq(1_u32));
    }

    #[rstest]
    fn delete_removes_the_key() {
        let storage = MemStorage::new();
        storage.write("a".to_owned(), record("1", 0, 0));
        storage.delete("a");

        assert_that!(storage.read("a").is_none(), eq(true));
        assert_that!(storage.is_empty(), eq(true));
    }
}
