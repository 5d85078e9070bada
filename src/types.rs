//! STRATUM - Core Type Definitions
//! The `Entry` record and its fixed-layout binary codec, shared by WAL
//! files and segment files.
//!
//! ## Binary Format (per entry)
//! ```text
//! [created_at: 8 bytes (BE)][key_len: 2 bytes (BE)][val_len: 2 bytes (BE)][key: N bytes][value: M bytes]
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, StratumError};

/// Size of the fixed entry header in bytes.
pub const HEADER_SIZE: usize = 12;

/// Longest key or value the 2-byte length fields can describe.
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

/// Current wall-clock time in whole seconds since the Unix epoch.
pub fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Fixed 12-byte header preceding every encoded entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMetadata {
    creation_epoch_seconds: u64,
    key_length: u16,
    value_length: u16,
}

impl EntryMetadata {
    /// Build a header. A zero key length is rejected.
    pub fn new(creation_epoch_seconds: u64, key_length: u16, value_length: u16) -> Result<Self> {
        if key_length == 0 {
            return Err(StratumError::InvalidEntry(
                "key length must be greater than zero".into(),
            ));
        }
        Ok(Self {
            creation_epoch_seconds,
            key_length,
            value_length,
        })
    }

    pub fn creation_epoch_seconds(&self) -> u64 {
        self.creation_epoch_seconds
    }

    pub fn key_length(&self) -> usize {
        self.key_length as usize
    }

    pub fn value_length(&self) -> usize {
        self.value_length as usize
    }

    /// Number of payload bytes (key + value) that follow the header.
    pub fn payload_len(&self) -> usize {
        self.key_length() + self.value_length()
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let mut cursor = &mut buf[..];
        cursor.put_u64(self.creation_epoch_seconds);
        cursor.put_u16(self.key_length);
        cursor.put_u16(self.value_length);
        buf
    }

    /// Decode a header from exactly `HEADER_SIZE` bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_SIZE {
            return Err(StratumError::InvalidEntry(format!(
                "entry header must be {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }
        let mut buf = bytes;
        let created = buf.get_u64();
        let key_length = buf.get_u16();
        let value_length = buf.get_u16();
        Self::new(created, key_length, value_length)
    }
}

/// A single key/value record plus its creation timestamp.
/// An empty value marks the entry as a tombstone (deletion marker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    creation_epoch_seconds: u64,
    key: String,
    value: String,
}

impl Entry {
    /// Create an entry with an explicit timestamp.
    pub fn new(creation_epoch_seconds: u64, key: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let key = key.into();
        let value = value.into();
        if key.is_empty() {
            return Err(StratumError::InvalidEntry("key must not be empty".into()));
        }
        if key.len() > MAX_FIELD_LEN {
            return Err(StratumError::InvalidEntry(format!(
                "key is {} bytes, maximum is {}",
                key.len(),
                MAX_FIELD_LEN
            )));
        }
        if value.len() > MAX_FIELD_LEN {
            return Err(StratumError::InvalidEntry(format!(
                "value is {} bytes, maximum is {}",
                value.len(),
                MAX_FIELD_LEN
            )));
        }
        Ok(Self {
            creation_epoch_seconds,
            key,
            value,
        })
    }

    /// Create an entry stamped with the current epoch second (PUT operation).
    pub fn now(key: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        Self::new(epoch_seconds(), key, value)
    }

    /// Create a tombstone entry (DELETE operation).
    pub fn tombstone(key: impl Into<String>) -> Result<Self> {
        Self::new(epoch_seconds(), key, String::new())
    }

    pub fn creation_epoch_seconds(&self) -> u64 {
        self.creation_epoch_seconds
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns true if this entry is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }

    /// Value of a live entry, `None` for tombstones.
    pub fn live_value(&self) -> Option<&str> {
        if self.is_tombstone() {
            None
        } else {
            Some(&self.value)
        }
    }

    pub fn metadata(&self) -> EntryMetadata {
        // Lengths were checked in `new`.
        EntryMetadata {
            creation_epoch_seconds: self.creation_epoch_seconds,
            key_length: self.key.len() as u16,
            value_length: self.value.len() as u16,
        }
    }

    /// Total encoded size: header plus key and value bytes.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.key.len() + self.value.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&self.metadata().encode());
        buf.put_slice(self.key.as_bytes());
        buf.put_slice(self.value.as_bytes());
        buf.freeze()
    }

    /// Decode one entry occupying the whole of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE + 1 {
            return Err(StratumError::InvalidEntry(format!(
                "encoded entry needs at least {} bytes, got {}",
                HEADER_SIZE + 1,
                bytes.len()
            )));
        }
        let metadata = EntryMetadata::decode(&bytes[..HEADER_SIZE])?;
        let payload = &bytes[HEADER_SIZE..];
        if payload.len() != metadata.payload_len() {
            return Err(StratumError::InvalidEntry(format!(
                "header declares {} payload bytes, found {}",
                metadata.payload_len(),
                payload.len()
            )));
        }
        let (key, value) = payload.split_at(metadata.key_length());
        Self::from_parts(&metadata, key.to_vec(), value.to_vec())
    }

    /// Rebuild an entry from a decoded header and its raw key/value bytes.
    pub fn from_parts(metadata: &EntryMetadata, key: Vec<u8>, value: Vec<u8>) -> Result<Self> {
        let key = String::from_utf8(key)
            .map_err(|e| StratumError::InvalidEntry(format!("key is not UTF-8: {}", e)))?;
        let value = String::from_utf8(value)
            .map_err(|e| StratumError::InvalidEntry(format!("value is not UTF-8: {}", e)))?;
        Self::new(metadata.creation_epoch_seconds(), key, value)
    }
}
