//! STRATUM - Write-Ahead Log (WAL)
//! Provides durability by logging all mutations to disk
//! before they are applied to the in-memory Memtable.
//!
//! The WAL holds the same encoded entry stream as a segment file, in
//! write order rather than key order. Exactly one WAL is active at a time,
//! mirroring the current memtable.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Buf;

use crate::error::{Result, StratumError};
use crate::types::{Entry, HEADER_SIZE};

use super::reader::read_entry;

/// Base name of the WAL file inside the store directory.
pub const WAL_FILE_NAME: &str = "stratum";
/// Extension of the WAL file.
pub const WAL_EXTENSION: &str = "wal";

/// Path of the WAL file for a store directory.
pub fn wal_path(store_dir: &Path) -> PathBuf {
    store_dir.join(format!("{}.{}", WAL_FILE_NAME, WAL_EXTENSION))
}

/// Write-Ahead Log for crash recovery and durability.
#[derive(Debug)]
pub struct WriteAheadLog {
    /// Path to the WAL file on disk.
    path: PathBuf,
    /// File handle opened for appending. `None` once closed.
    file: Option<File>,
}

/// Result of replaying a WAL file from disk.
#[derive(Debug, Default)]
pub struct WalReplay {
    /// Latest entry per key, in key order.
    pub entries: BTreeMap<String, Entry>,
    /// Number of complete records read.
    pub records: usize,
    /// Bytes cut from a torn tail, if any.
    pub truncated_bytes: u64,
}

impl WriteAheadLog {
    /// Create a fresh WAL, truncating any stale file at `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        file.sync_all()?;

        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Reopen a surviving WAL for appending, keeping its contents.
    pub fn create_from_pre_existing(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// Returns the path to the WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Append an entry and force it to stable storage before returning.
    /// The memtable must not apply the entry if this fails.
    pub fn append(&mut self, entry: &Entry) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| closed(&self.path))?;
        file.write_all(&entry.encode())?;
        file.sync_data()?; // fsync for durability
        Ok(())
    }

    /// Empty the log through the open handle and move that handle into a
    /// new `WriteAheadLog`, leaving this one closed.
    ///
    /// The path is never reopened. On error this log keeps its handle and
    /// still accepts appends.
    pub fn truncate_into_new(&mut self) -> Result<WriteAheadLog> {
        let file = self.file.as_mut().ok_or_else(|| closed(&self.path))?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.sync_all()?;

        Ok(WriteAheadLog {
            path: self.path.clone(),
            file: self.file.take(),
        })
    }

    /// Release the file handle. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Read every complete entry from the WAL at `path`.
    ///
    /// A torn tail (a last record that runs past the end of the file) is
    /// truncated away so that later appends start on a clean record
    /// boundary. A record that is fully present but does not decode is
    /// `RecoveryFailed` and the file is left as it is.
    pub fn replay(path: &Path) -> Result<WalReplay> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut replay = WalReplay::default();
        let mut offset = 0u64;

        loop {
            match read_entry(&mut reader, offset) {
                Ok(Some(entry)) => {
                    offset += entry.encoded_len() as u64;
                    replay.records += 1;
                    replay.entries.insert(entry.key().to_string(), entry);
                }
                Ok(None) => break,
                Err(StratumError::Corruption(reason)) => {
                    if !runs_past_eof(path, offset, file_len)? {
                        return Err(StratumError::RecoveryFailed(format!(
                            "WAL {} is corrupt at offset {}: {}",
                            path.display(),
                            offset,
                            reason
                        )));
                    }
                    log::warn!(
                        "WAL {} has a torn tail ({}); truncating {} bytes",
                        path.display(),
                        reason,
                        file_len - offset
                    );
                    replay.truncated_bytes = file_len - offset;
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(offset)?;
                    file.sync_all()?;
                    break;
                }
                Err(e) => {
                    return Err(StratumError::RecoveryFailed(format!(
                        "reading WAL {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }

        Ok(replay)
    }
}

fn closed(path: &Path) -> StratumError {
    StratumError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("WAL {} is closed", path.display()),
    ))
}

/// True when the record starting at `offset` ends beyond `file_len`, i.e.
/// an append that a crash cut short.
fn runs_past_eof(path: &Path, offset: u64, file_len: u64) -> Result<bool> {
    let remaining = file_len - offset;
    if remaining < HEADER_SIZE as u64 {
        return Ok(true);
    }

    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut header = [0u8; HEADER_SIZE];
    file.read_exact(&mut header)?;

    // Raw lengths: the header may not pass validation.
    let mut lengths = &header[8..];
    let declared = lengths.get_u16() as u64 + lengths.get_u16() as u64;
    Ok(HEADER_SIZE as u64 + declared > remaining)
}

impl Drop for WriteAheadLog {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Failed to close WAL {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::reader::EntryReader;

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(dir.path());

        let mut wal = WriteAheadLog::create(&path).unwrap();
        wal.append(&Entry::new(1, "a", "1").unwrap()).unwrap();
        wal.append(&Entry::new(2, "b", "2").unwrap()).unwrap();
        wal.append(&Entry::new(3, "a", "").unwrap()).unwrap();
        wal.close().unwrap();

        let replay = WriteAheadLog::replay(&path).unwrap();
        assert_eq!(replay.records, 3);
        assert_eq!(replay.truncated_bytes, 0);
        assert_eq!(replay.entries.len(), 2);
        assert!(replay.entries["a"].is_tombstone());
        assert_eq!(replay.entries["b"].value(), "2");
    }

    #[test]
    fn test_create_truncates_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(dir.path());

        let mut wal = WriteAheadLog::create(&path).unwrap();
        wal.append(&Entry::new(1, "old", "data").unwrap()).unwrap();
        wal.close().unwrap();

        let wal = WriteAheadLog::create(&path).unwrap();
        drop(wal);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_pre_existing_keeps_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(dir.path());

        let mut wal = WriteAheadLog::create(&path).unwrap();
        wal.append(&Entry::new(1, "first", "1").unwrap()).unwrap();
        wal.close().unwrap();

        let mut wal = WriteAheadLog::create_from_pre_existing(&path).unwrap();
        wal.append(&Entry::new(2, "second", "2").unwrap()).unwrap();
        wal.close().unwrap();

        let replay = WriteAheadLog::replay(&path).unwrap();
        assert_eq!(replay.records, 2);
        assert!(replay.entries.contains_key("first"));
        assert!(replay.entries.contains_key("second"));
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_appends() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = WriteAheadLog::create(wal_path(dir.path())).unwrap();

        wal.close().unwrap();
        wal.close().unwrap();
        assert!(wal.is_closed());
        assert!(matches!(
            wal.append(&Entry::new(1, "k", "v").unwrap()),
            Err(StratumError::Io(_))
        ));
    }

    #[test]
    fn test_replay_truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(dir.path());

        let mut wal = WriteAheadLog::create(&path).unwrap();
        wal.append(&Entry::new(1, "kept", "value").unwrap()).unwrap();
        wal.close().unwrap();
        let intact_len = std::fs::metadata(&path).unwrap().len();

        // Simulate a crash midway through the next record.
        let torn = Entry::new(2, "lost", "partial-value").unwrap().encode();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&torn[..torn.len() / 2]).unwrap();
        drop(file);

        let replay = WriteAheadLog::replay(&path).unwrap();
        assert_eq!(replay.records, 1);
        assert!(replay.entries.contains_key("kept"));
        assert!(!replay.entries.contains_key("lost"));
        assert_eq!(replay.truncated_bytes, (torn.len() / 2) as u64);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact_len);
    }

    fn record_offsets(path: &Path) -> Vec<u64> {
        EntryReader::new(path)
            .iter()
            .unwrap()
            .map(|item| item.unwrap().0)
            .collect()
    }

    #[test]
    fn test_replay_rejects_corruption_mid_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(dir.path());

        let mut wal = WriteAheadLog::create(&path).unwrap();
        for i in 0..7 {
            wal.append(&Entry::new(i, format!("key{}", i), "value").unwrap())
                .unwrap();
        }
        wal.close().unwrap();
        let second = record_offsets(&path)[1];
        let len_before = std::fs::metadata(&path).unwrap().len();

        // Invalid UTF-8 in the first key byte of a complete record.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[second as usize + HEADER_SIZE] = 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            WriteAheadLog::replay(&path),
            Err(StratumError::RecoveryFailed(_))
        ));
        // Acknowledged writes after the damage are still on disk.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), len_before);
    }

    #[test]
    fn test_replay_rejects_zero_key_length_mid_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(dir.path());

        let mut wal = WriteAheadLog::create(&path).unwrap();
        wal.append(&Entry::new(1, "a", "1").unwrap()).unwrap();
        wal.append(&Entry::new(2, "b", "2").unwrap()).unwrap();
        wal.close().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        // Key length field of the first record.
        bytes[8] = 0;
        bytes[9] = 0;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            WriteAheadLog::replay(&path),
            Err(StratumError::RecoveryFailed(_))
        ));
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn test_truncate_into_new_reuses_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = wal_path(dir.path());

        let mut old = WriteAheadLog::create(&path).unwrap();
        old.append(&Entry::new(1, "flushed", "value").unwrap()).unwrap();
        let mut fresh = old.truncate_into_new().unwrap();
        assert!(old.is_closed());
        assert!(old.append(&Entry::new(2, "late", "x").unwrap()).is_err());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);

        // Appends restart at offset zero rather than leaving a hole.
        let entry = Entry::new(3, "next", "value").unwrap();
        fresh.append(&entry).unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            entry.encoded_len() as u64
        );
        let replay = WriteAheadLog::replay(&path).unwrap();
        assert_eq!(replay.records, 1);
        assert!(replay.entries.contains_key("next"));
    }
}
