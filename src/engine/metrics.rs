//! STRATUM - Engine Metrics
//! Lock-free counters shared by the request path and the background
//! compactor. All counters use `Ordering::Relaxed`; they are read for
//! reporting only and never used for synchronization.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic operation counters for the Stratum engine.
#[derive(Debug)]
pub struct EngineMetrics {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    /// Memtable -> segment flushes.
    flushes: AtomicU64,
    flush_failures: AtomicU64,
    compactions: AtomicU64,
    compaction_failures: AtomicU64,
    /// Entries replayed from the WAL at open.
    wal_entries_recovered: AtomicU64,
    /// Key + value bytes accepted by writes and deletes.
    bytes_written: AtomicU64,
    /// Value bytes returned by reads.
    bytes_read: AtomicU64,
    engine_started: Instant,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            compaction_failures: AtomicU64::new(0),
            wal_entries_recovered: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            engine_started: Instant::now(),
        }
    }

    pub fn record_read(&self, value_size: Option<usize>) {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if let Some(size) = value_size {
            self.bytes_read.fetch_add(size as u64, Ordering::Relaxed);
        }
    }

    pub fn record_write(&self, key_size: usize, value_size: usize) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add((key_size + value_size) as u64, Ordering::Relaxed);
    }

    pub fn record_delete(&self, key_size: usize) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(key_size as u64, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compaction(&self) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compaction_failure(&self) {
        self.compaction_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery(&self, entries: usize) {
        self.wal_entries_recovered
            .fetch_add(entries as u64, Ordering::Relaxed);
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn flush_failures(&self) -> u64 {
        self.flush_failures.load(Ordering::Relaxed)
    }

    pub fn compactions(&self) -> u64 {
        self.compactions.load(Ordering::Relaxed)
    }

    pub fn compaction_failures(&self) -> u64 {
        self.compaction_failures.load(Ordering::Relaxed)
    }

    pub fn wal_entries_recovered(&self) -> u64 {
        self.wal_entries_recovered.load(Ordering::Relaxed)
    }

    /// Get engine uptime in seconds.
    pub fn uptime_secs(&self) -> f64 {
        self.engine_started.elapsed().as_secs_f64()
    }

    /// Client operations served (reads + writes + deletes).
    pub fn total_ops(&self) -> u64 {
        self.reads() + self.writes() + self.deletes()
    }

    /// Format metrics as a human-readable report.
    pub fn report(&self) -> String {
        format!(
            "\n═══ STRATUM Engine Metrics ═══\n\
             Operations:\n\
               reads:     {}\n\
               writes:    {}\n\
               deletes:   {}\n\
             Storage:\n\
               flushes:   {} ({} failed)\n\
               compactions: {} ({} failed)\n\
             I/O:\n\
               written:   {} bytes\n\
               read:      {} bytes\n\
             Recovery:\n\
               wal entries replayed: {}\n\
             Uptime: {:.2}s",
            self.reads(),
            self.writes(),
            self.deletes(),
            self.flushes(),
            self.flush_failures(),
            self.compactions(),
            self.compaction_failures(),
            self.bytes_written.load(Ordering::Relaxed),
            self.bytes_read.load(Ordering::Relaxed),
            self.wal_entries_recovered(),
            self.uptime_secs(),
        )
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_operations() {
        let m = EngineMetrics::new();

        m.record_write(5, 10);
        m.record_write(3, 7);
        m.record_read(Some(10));
        m.record_read(None); // miss
        m.record_delete(4);
        m.record_flush();
        m.record_compaction();
        m.record_compaction_failure();

        assert_eq!(m.writes(), 2);
        assert_eq!(m.reads(), 2);
        assert_eq!(m.deletes(), 1);
        assert_eq!(m.flushes(), 1);
        assert_eq!(m.compactions(), 1);
        assert_eq!(m.compaction_failures(), 1);
        assert_eq!(m.bytes_written.load(Ordering::Relaxed), 29);
        assert_eq!(m.bytes_read.load(Ordering::Relaxed), 10);
        assert_eq!(m.total_ops(), 5);
    }

    #[test]
    fn test_report_format() {
        let m = EngineMetrics::new();
        m.record_write(10, 20);
        m.record_recovery(3);
        let report = m.report();
        assert!(report.contains("writes:"));
        assert!(report.contains("compactions:"));
        assert!(report.contains("wal entries replayed: 3"));
    }

    #[test]
    fn test_default() {
        let m = EngineMetrics::default();
        assert_eq!(m.total_ops(), 0);
    }
}
