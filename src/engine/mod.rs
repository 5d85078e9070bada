//! STRATUM - Storage Engine Module
//! Top-level module for the LSM-Tree storage engine components.

pub mod catalog;
pub mod compaction;
pub mod dispatcher;
pub mod memtable;
pub mod metrics;
pub mod reader;
pub mod segment;
pub mod wal;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::command::{StorageCommand, StorageResponse};
use crate::config::Config;
use crate::error::{Result, StratumError};
use crate::types::Entry;

use self::catalog::SegmentCatalog;
use self::compaction::{CompactionOutcome, CompactorHandle, SegmentCompactor, TailCompaction};
use self::memtable::Memtable;
use self::metrics::EngineMetrics;
use self::segment::SegmentWriter;
use self::wal::{wal_path, WriteAheadLog};

/// The core Stratum storage engine.
/// Coordinates the Memtable, WAL, segments and background compactor
/// to provide a durable key-value store based on LSM-Tree architecture.
///
/// ## Read path
/// Memtable first, then segments newest first. The first entry found for a
/// key decides the answer; a tombstone means the key is absent.
///
/// ## Write path
/// WAL (disk) -> Memtable (memory) -> flush to a new segment once the
/// memtable reaches `memtable_flush_threshold_bytes`.
pub struct Stratum {
    config: Config,
    store_dir: PathBuf,
    /// Active memtable. Writers hold the read side of this lock for the
    /// whole write so a flush (write side) never retires a memtable that is
    /// still being written to.
    memtable: RwLock<Arc<Memtable>>,
    catalog: Arc<SegmentCatalog>,
    compactor: Arc<SegmentCompactor>,
    background: Mutex<Option<CompactorHandle>>,
    metrics: Arc<EngineMetrics>,
}

impl Stratum {
    /// Open or create a Stratum storage engine at the configured path.
    ///
    /// Recovery order: catalog (live segments, orphan cleanup), then the WAL
    /// of the memtable that had not been flushed yet.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let store_dir = config.resolved_store_dir()?;
        std::fs::create_dir_all(&store_dir)?;

        let metrics = Arc::new(EngineMetrics::new());
        let catalog = Arc::new(SegmentCatalog::open(&store_dir)?);
        let memtable = Self::recover_memtable(&store_dir, &metrics)?;

        let compactor = Arc::new(SegmentCompactor::new(
            Arc::clone(&catalog),
            Box::new(TailCompaction::new(config.max_compaction_inputs)),
            config.segment_flush_threshold_bytes as u64,
            Arc::clone(&metrics),
        ));
        let background = CompactorHandle::spawn(Arc::clone(&compactor), config.compactor_delay())?;

        log::info!(
            "Stratum engine opened at {:?} ({} segments, {} memtable entries recovered)",
            store_dir,
            catalog.len(),
            memtable.len()
        );

        Ok(Self {
            config,
            store_dir,
            memtable: RwLock::new(Arc::new(memtable)),
            catalog,
            compactor,
            background: Mutex::new(Some(background)),
            metrics,
        })
    }

    fn recover_memtable(store_dir: &std::path::Path, metrics: &EngineMetrics) -> Result<Memtable> {
        let path = wal_path(store_dir);
        if !path.exists() {
            return Ok(Memtable::create(WriteAheadLog::create(&path)?));
        }

        let replay = WriteAheadLog::replay(&path)?;
        metrics.record_recovery(replay.records);
        log::info!(
            "Replayed {} WAL records ({} keys) from {}",
            replay.records,
            replay.entries.len(),
            path.display()
        );
        let wal = WriteAheadLog::create_from_pre_existing(&path)?;
        Ok(Memtable::create_from(replay.entries, wal))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store_dir(&self) -> &std::path::Path {
        &self.store_dir
    }

    /// Current value for `key`, or `None` if absent or deleted.
    pub fn read(&self, key: &str) -> Result<Option<String>> {
        let value = self.lookup(key)?.and_then(|e| e.live_value().map(str::to_string));
        self.metrics.record_read(value.as_ref().map(String::len));
        Ok(value)
    }

    /// Newest entry for `key` across the memtable and all segments.
    fn lookup(&self, key: &str) -> Result<Option<Entry>> {
        // Memtable before the catalog snapshot: a flush publishes its segment
        // before swapping the memtable, so one of the two always has the data.
        let memtable = Arc::clone(&self.memtable.read().unwrap_or_else(PoisonError::into_inner));
        if let Some(entry) = memtable.get_entry(key) {
            return Ok(Some(entry));
        }

        for segment in self.catalog.snapshot() {
            if let Some(entry) = segment.get(key)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.lookup(key)?.is_some_and(|e| !e.is_tombstone()))
    }

    /// Insert a key-value pair. An empty value records a tombstone.
    pub fn write(&self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        if value.is_empty() {
            self.metrics.record_delete(key.len());
        } else {
            self.metrics.record_write(key.len(), value.len());
        }
        self.maybe_flush();
        Ok(())
    }

    /// Delete a key by writing a tombstone.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.write(key, "")
    }

    fn apply(&self, key: &str, value: &str) -> Result<()> {
        let memtable = self.memtable.read().unwrap_or_else(PoisonError::into_inner);
        memtable.write(key, value)
    }

    /// Flush when over the threshold. The write that triggered it is already
    /// durable in the WAL, so a failed flush is logged and retried on the
    /// next write instead of failing that write.
    fn maybe_flush(&self) {
        let size = self.memtable.read().unwrap_or_else(PoisonError::into_inner).size();
        if size < self.config.memtable_flush_threshold_bytes {
            return;
        }
        if let Err(e) = self.flush_if_full() {
            log::error!("Memtable flush failed, will retry on next write: {}", e);
        }
    }

    /// Flush only if the memtable is still over the threshold once the slot
    /// is held exclusively. Writers racing past the threshold together
    /// produce one flush, not a second one of the fresh memtable.
    fn flush_if_full(&self) -> Result<Option<u64>> {
        let mut active = self.memtable.write().unwrap_or_else(PoisonError::into_inner);
        if active.size() < self.config.memtable_flush_threshold_bytes {
            return Ok(None);
        }
        self.flush_locked(&mut active)
    }

    /// Write the active memtable to a new segment and start a fresh one.
    /// Returns the new segment id, or `None` if the memtable was empty.
    pub fn flush(&self) -> Result<Option<u64>> {
        let mut active = self.memtable.write().unwrap_or_else(PoisonError::into_inner);
        self.flush_locked(&mut active)
    }

    fn flush_locked(&self, active: &mut Arc<Memtable>) -> Result<Option<u64>> {
        if active.is_empty() {
            return Ok(None);
        }
        let result = self.flush_memtable(active);
        if result.is_err() {
            self.metrics.record_flush_failure();
        }
        result.map(Some)
    }

    fn flush_memtable(&self, active: &mut Arc<Memtable>) -> Result<u64> {
        let snapshot = active.flush();
        let id = self.catalog.allocate_id();
        let segment = SegmentWriter::write_all(id, self.catalog.segment_path(id), snapshot.values())?;
        let bytes = segment.file_size();
        self.catalog.push_newest(segment)?;

        // The segment is recorded; the WAL contents are now redundant. If the
        // hand-off fails the old memtable keeps its open WAL, and a retry
        // writes the same entries to a newer segment.
        let wal = active.hand_off_wal()?;
        *active = Arc::new(Memtable::create(wal));

        self.metrics.record_flush();
        log::info!(
            "Flushed memtable to segment {} ({} entries, {} bytes)",
            id,
            snapshot.len(),
            bytes
        );
        Ok(id)
    }

    /// Run one compaction pass now, outside the background schedule.
    pub fn compact_now(&self) -> Result<Option<CompactionOutcome>> {
        self.compactor.run_once()
    }

    /// Execute a validated command and describe the result.
    pub fn execute(&self, command: &StorageCommand) -> StorageResponse {
        let result = match command {
            StorageCommand::Read { key } => match self.read(key.as_str()) {
                Ok(Some(value)) => Ok(value),
                Ok(None) => Err(StratumError::KeyNotFound),
                Err(e) => Err(e),
            },
            StorageCommand::Write { key, value } => {
                self.write(key.as_str(), value.as_str()).map(|()| "OK".to_string())
            }
            StorageCommand::Delete { key } => self.delete(key.as_str()).map(|()| "OK".to_string()),
        };

        match result {
            Ok(response) => StorageResponse::ok(response),
            Err(e) => {
                if !matches!(e, StratumError::KeyNotFound) {
                    log::warn!("{} {:?} failed: {}", command.command_type(), command.key(), e);
                }
                StorageResponse::failed(e.to_string())
            }
        }
    }

    pub fn segment_count(&self) -> usize {
        self.catalog.len()
    }

    /// Encoded size of the active memtable in bytes.
    pub fn memtable_size(&self) -> usize {
        self.memtable.read().unwrap_or_else(PoisonError::into_inner).size()
    }

    /// Number of keys (tombstones included) in the active memtable.
    pub fn memtable_len(&self) -> usize {
        self.memtable.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Stop the background compactor and close the WAL. Idempotent.
    ///
    /// Unflushed writes stay in the WAL and are replayed on the next open.
    pub fn shutdown(&self) -> Result<()> {
        let handle = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut handle) = handle else {
            return Ok(());
        };
        handle.shutdown();

        let memtable = self.memtable.write().unwrap_or_else(PoisonError::into_inner);
        memtable.retire()?;
        log::info!("Stratum engine at {:?} shut down", self.store_dir);
        Ok(())
    }
}

impl Drop for Stratum {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Error while shutting down engine: {}", e);
        }
    }
}
