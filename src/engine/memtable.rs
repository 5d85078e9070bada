//! STRATUM - Memtable (In-Memory Sorted Map)
//! The Memtable is the write-buffer of the LSM-Tree.
//! All writes go here first before being flushed to segments on disk.
//!
//! ## Locking
//! A single `RwLock` guards the map together with its WAL. Readers share the
//! lock; a writer holds it exclusively while it appends to the WAL and then
//! updates the map, so WAL order always matches map order.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::error::Result;
use crate::types::Entry;

use super::wal::WriteAheadLog;

struct Inner {
    /// Sorted map storing the latest entry per key, tombstones included.
    entries: BTreeMap<String, Entry>,
    /// Sum of the encoded sizes of all entries.
    size_bytes: usize,
    wal: WriteAheadLog,
}

impl Inner {
    fn insert(&mut self, entry: Entry) {
        self.size_bytes += entry.encoded_len();
        if let Some(old) = self.entries.insert(entry.key().to_string(), entry) {
            self.size_bytes = self.size_bytes.saturating_sub(old.encoded_len());
        }
    }
}

/// In-memory sorted key-value store backed by a BTreeMap.
/// Serves as the write buffer in the LSM-Tree architecture.
pub struct Memtable {
    inner: RwLock<Inner>,
}

impl Memtable {
    /// Create an empty Memtable logging to `wal`.
    pub fn create(wal: WriteAheadLog) -> Self {
        Self::create_from(BTreeMap::new(), wal)
    }

    /// Create a Memtable seeded with entries recovered from disk.
    pub fn create_from(initial: BTreeMap<String, Entry>, wal: WriteAheadLog) -> Self {
        let size_bytes = initial.values().map(Entry::encoded_len).sum();
        Self {
            inner: RwLock::new(Inner {
                entries: initial,
                size_bytes,
                wal,
            }),
        }
    }

    /// Current value for `key`. Tombstoned and missing keys both read as `None`.
    pub fn read(&self, key: &str) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .entries
            .get(key)
            .and_then(Entry::live_value)
            .map(str::to_string)
    }

    /// Latest entry for `key`, tombstones included. Used by the engine so a
    /// tombstone here can shadow older segments.
    pub fn get_entry(&self, key: &str) -> Option<Entry> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.get(key).cloned()
    }

    /// Stamp a new entry, append it to the WAL, then apply it to the map.
    pub fn write(&self, key: &str, value: &str) -> Result<()> {
        let entry = Entry::now(key, value)?;
        self.apply(entry)
    }

    /// Record a tombstone for `key`.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.write(key, "")
    }

    /// Append a prebuilt entry to the WAL and the map.
    pub fn apply(&self, entry: Entry) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        // Durability first: a failed append leaves the map untouched.
        inner.wal.append(&entry)?;
        inner.insert(entry);
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read(key).is_some()
    }

    /// Point-in-time copy of the whole map, tombstones included.
    /// The live memtable is not modified.
    pub fn flush(&self) -> BTreeMap<String, Entry> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.clone()
    }

    /// Approximate encoded size of the memtable in bytes.
    pub fn size(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).size_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the WAL once its contents are safely in a segment and hand its
    /// handle over for the next memtable. This memtable rejects writes
    /// afterwards; on error it keeps its WAL and stays writable.
    pub fn hand_off_wal(&self) -> Result<WriteAheadLog> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.wal.truncate_into_new()
    }

    /// Close the WAL backing this memtable. Further writes fail.
    pub fn retire(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.wal.close()
    }
}
