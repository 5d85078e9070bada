//! STRATUM - Custom Error Types
//! Defines the error hierarchy for the LSM storage engine.

use thiserror::Error;

/// Custom Result type for the Stratum engine.
pub type Result<T> = std::result::Result<T, StratumError>;

/// Error types for the Stratum storage engine.
#[derive(Error, Debug)]
pub enum StratumError {
    /// I/O errors from file operations (WAL, segments, catalog).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected (truncated record, checksum mismatch).
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// An entry violates the key/value length rules.
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    /// A storage command failed validation.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// A storage response was constructed with an inconsistent payload.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Key not found in the storage engine.
    #[error("Key not found")]
    KeyNotFound,

    /// The dispatcher queue is full.
    #[error("Dispatcher queue is full (capacity {capacity})")]
    DispatcherFull { capacity: usize },

    /// The dispatcher has been shut down.
    #[error("Dispatcher is closed")]
    DispatcherClosed,

    /// WAL or catalog recovery failure.
    #[error("Recovery failed: {0}")]
    RecoveryFailed(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for StratumError {
    fn from(err: bincode::Error) -> Self {
        StratumError::Serialization(err.to_string())
    }
}

impl StratumError {
    /// True for errors caused by the caller's input rather than the engine.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StratumError::InvalidEntry(_)
                | StratumError::InvalidCommand(_)
                | StratumError::InvalidResponse(_)
                | StratumError::Config(_)
        )
    }
}
