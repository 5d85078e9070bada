//! STRATUM - Engine Configuration
//! Defines tunable parameters for the LSM storage engine.
//!
//! The engine never loads configuration itself; callers build a `Config`
//! (or deserialize one) and hand it to [`Stratum::open`](crate::engine::Stratum::open).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StratumError};

/// Configuration for the Stratum storage engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for all data files (WAL, segments, catalog).
    pub store_dir: PathBuf,

    /// Encoded size of the memtable in bytes that triggers a flush.
    pub memtable_flush_threshold_bytes: usize,

    /// Maximum size of a segment produced by compaction.
    pub segment_flush_threshold_bytes: usize,

    /// Delay between background compaction runs, in milliseconds.
    pub compactor_delay_ms: u64,

    /// Number of commands the dispatcher queue can hold.
    pub dispatcher_capacity: usize,

    /// Upper bound on the number of segments merged in one compaction run.
    pub max_compaction_inputs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("./data"),
            memtable_flush_threshold_bytes: 4 * 1024 * 1024, // 4 MB
            segment_flush_threshold_bytes: 16 * 1024 * 1024, // 16 MB
            compactor_delay_ms: 30_000,
            dispatcher_capacity: 1024,
            max_compaction_inputs: 4,
        }
    }
}

impl Config {
    /// Create a new Config with a custom store directory.
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            ..Default::default()
        }
    }

    /// Set the memtable size that triggers a flush.
    pub fn with_memtable_flush_threshold(mut self, bytes: usize) -> Self {
        self.memtable_flush_threshold_bytes = bytes;
        self
    }

    /// Set the maximum size of compacted segments.
    pub fn with_segment_flush_threshold(mut self, bytes: usize) -> Self {
        self.segment_flush_threshold_bytes = bytes;
        self
    }

    /// Set the delay between background compaction runs.
    pub fn with_compactor_delay(mut self, delay: Duration) -> Self {
        self.compactor_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_dispatcher_capacity(mut self, capacity: usize) -> Self {
        self.dispatcher_capacity = capacity;
        self
    }

    pub fn with_max_compaction_inputs(mut self, inputs: usize) -> Self {
        self.max_compaction_inputs = inputs;
        self
    }

    /// Delay between background compaction runs.
    pub fn compactor_delay(&self) -> Duration {
        Duration::from_millis(self.compactor_delay_ms)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.store_dir.as_os_str().is_empty() {
            return Err(StratumError::Config("store_dir must not be empty".into()));
        }
        if self.memtable_flush_threshold_bytes == 0 {
            return Err(StratumError::Config(
                "memtable_flush_threshold_bytes must be greater than zero".into(),
            ));
        }
        if self.segment_flush_threshold_bytes == 0 {
            return Err(StratumError::Config(
                "segment_flush_threshold_bytes must be greater than zero".into(),
            ));
        }
        if self.compactor_delay_ms == 0 {
            return Err(StratumError::Config(
                "compactor_delay_ms must be greater than zero".into(),
            ));
        }
        if self.max_compaction_inputs < 2 {
            return Err(StratumError::Config(
                "max_compaction_inputs must be at least 2".into(),
            ));
        }
        Ok(())
    }

    /// Resolve a relative store directory against the working directory.
    pub fn resolved_store_dir(&self) -> std::io::Result<PathBuf> {
        if self.store_dir.is_absolute() {
            Ok(self.store_dir.clone())
        } else {
            Ok(std::env::current_dir()?.join(&self.store_dir))
        }
    }

    /// Ensure the store directory exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.store_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_builder_setters() {
        let config = Config::new("/tmp/stratum")
            .with_memtable_flush_threshold(128)
            .with_segment_flush_threshold(256)
            .with_compactor_delay(Duration::from_millis(50))
            .with_dispatcher_capacity(8)
            .with_max_compaction_inputs(3);

        assert_eq!(config.store_dir, PathBuf::from("/tmp/stratum"));
        assert_eq!(config.memtable_flush_threshold_bytes, 128);
        assert_eq!(config.segment_flush_threshold_bytes, 256);
        assert_eq!(config.compactor_delay(), Duration::from_millis(50));
        assert_eq!(config.dispatcher_capacity, 8);
        assert_eq!(config.max_compaction_inputs, 3);
    }

    #[test]
    fn test_validate_rejects_zero_thresholds() {
        let config = Config::default().with_memtable_flush_threshold(0);
        assert!(matches!(config.validate(), Err(StratumError::Config(_))));

        let config = Config::default().with_segment_flush_threshold(0);
        assert!(matches!(config.validate(), Err(StratumError::Config(_))));

        let config = Config::default().with_compactor_delay(Duration::ZERO);
        assert!(matches!(config.validate(), Err(StratumError::Config(_))));

        let config = Config::default().with_max_compaction_inputs(1);
        assert!(matches!(config.validate(), Err(StratumError::Config(_))));
    }

    #[test]
    fn test_serializes_for_external_loaders() {
        let full = Config::new("/var/lib/stratum").with_dispatcher_capacity(7);
        let bytes = bincode::serialize(&full).unwrap();
        let decoded: Config = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, full);
    }

    #[test]
    fn test_relative_dir_is_resolved() {
        let config = Config::new("relative/store");
        let resolved = config.resolved_store_dir().unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("relative/store"));
    }
}
