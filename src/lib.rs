//! STRATUM - LSM-Tree Key-Value Storage Engine
//!
//! A crash-recoverable string key-value store based on the Log-Structured Merge-Tree (LSM-Tree) architecture.
//!
//! ## Features
//! - **Write-Ahead Log (WAL)**: Every write is fsynced before it is acknowledged; torn tails are truncated on replay
//! - **Memtable**: In-memory BTreeMap, flushed to a segment once it reaches the size threshold
//! - **Segments**: Immutable sorted files with an in-memory key index, published through a checksummed catalog
//! - **Compaction**: Background merge of the oldest segment run, newest value wins, tombstones dropped at the tail
//! - **Dispatcher**: Bounded FIFO command queue with a single executor thread
//! - **Metrics**: Lock-free atomic counters for observability
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use stratum::{Config, Stratum, StorageCommand, StorageCommandDispatcher};
//!
//! let engine = Arc::new(Stratum::open(Config::default()).unwrap());
//! engine.write("key", "value").unwrap();
//! assert_eq!(engine.read("key").unwrap(), Some("value".to_string()));
//!
//! let dispatcher = StorageCommandDispatcher::start(Arc::clone(&engine), 1024).unwrap();
//! let response = dispatcher.submit(StorageCommand::read("key").unwrap()).unwrap();
//! assert_eq!(response.response(), Some("value"));
//! ```

pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod types;

pub use command::{CommandType, ResponseStatus, StorageCommand, StorageResponse};
pub use config::Config;
pub use engine::dispatcher::{PendingResponse, StorageCommandDispatcher};
pub use engine::Stratum;
pub use error::{Result, StratumError};
pub use types::Entry;
