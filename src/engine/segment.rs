//! STRATUM - Segments
//! Immutable, key-sorted on-disk files holding flushed memtable or
//! compaction output. Each open segment keeps a key -> offset index in
//! memory so lookups for absent keys never touch the disk.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, StratumError};
use crate::types::Entry;

use super::reader::EntryReader;

/// Extension of segment files.
pub const SEGMENT_EXTENSION: &str = "seg";
/// Extension used while a segment is still being written.
pub const TEMP_EXTENSION: &str = "tmp";

/// File name of the segment with the given id.
pub fn segment_file_name(id: u64) -> String {
    format!("segment-{:010}.{}", id, SEGMENT_EXTENSION)
}

/// Parse a segment id back out of a file name.
pub fn parse_segment_id(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix("segment-")?
        .strip_suffix(&format!(".{}", SEGMENT_EXTENSION))?
        .parse()
        .ok()
}

/// An immutable sorted segment file.
///
/// Segments are shared as `Arc<Segment>`. Once compaction marks a segment
/// as compacted, its file is removed when the last reference drops, so a
/// reader holding a clone can always finish its lookup.
#[derive(Debug)]
pub struct Segment {
    id: u64,
    path: PathBuf,
    /// Key -> byte offset of its entry.
    index: BTreeMap<String, u64>,
    file_size: u64,
    compacted: AtomicBool,
}

impl Segment {
    /// Open a segment and rebuild its index with a single scan.
    pub fn open(id: u64, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file_size = fs::metadata(&path)?.len();
        let mut index = BTreeMap::new();
        let mut previous: Option<String> = None;

        for item in EntryReader::new(&path).iter()? {
            let (offset, entry) = item?;
            if let Some(prev) = &previous {
                if prev.as_str() >= entry.key() {
                    return Err(StratumError::Corruption(format!(
                        "segment {} is not sorted at offset {}",
                        path.display(),
                        offset
                    )));
                }
            }
            previous = Some(entry.key().to_string());
            index.insert(entry.key().to_string(), offset);
        }

        log::debug!(
            "Opened segment {} ({} keys, {} bytes)",
            path.display(),
            index.len(),
            file_size
        );

        Ok(Self {
            id,
            path,
            index,
            file_size,
            compacted: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// True if the in-memory index holds `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// Look up the entry for `key`, tombstones included.
    pub fn get(&self, key: &str) -> Result<Option<Entry>> {
        let Some(&offset) = self.index.get(key) else {
            return Ok(None);
        };
        match EntryReader::new(&self.path).find_entry_from_offset(key, offset)? {
            Some(entry) => Ok(Some(entry)),
            None => Err(StratumError::Corruption(format!(
                "segment {} lost indexed key at offset {}",
                self.path.display(),
                offset
            ))),
        }
    }

    /// Every entry in key order.
    pub fn entries(&self) -> Result<Vec<Entry>> {
        EntryReader::new(&self.path)
            .iter()?
            .map(|item| item.map(|(_, entry)| entry))
            .collect()
    }

    /// Mark as superseded; the file is deleted once the last reference drops.
    pub fn mark_compacted(&self) {
        self.compacted.store(true, Ordering::Release);
    }

    pub fn is_compacted(&self) -> bool {
        self.compacted.load(Ordering::Acquire)
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if !self.is_compacted() {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => log::debug!("Deleted compacted segment {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::error!(
                "Failed to delete compacted segment {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Writes a sorted stream of entries to a new segment file.
///
/// Data goes to `<name>.tmp` first; `finish` fsyncs and renames it into
/// place, so a crash never leaves a partial `.seg` file behind.
pub struct SegmentWriter {
    id: u64,
    path: PathBuf,
    temp_path: PathBuf,
    writer: BufWriter<File>,
    bytes_written: u64,
    entries: usize,
    last_key: Option<String>,
}

impl SegmentWriter {
    pub fn create(id: u64, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let temp_path = path.with_extension(format!("{}.{}", SEGMENT_EXTENSION, TEMP_EXTENSION));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;

        Ok(Self {
            id,
            path,
            temp_path,
            writer: BufWriter::new(file),
            bytes_written: 0,
            entries: 0,
            last_key: None,
        })
    }

    /// Append the next entry. Keys must arrive in strictly ascending order.
    pub fn append(&mut self, entry: &Entry) -> Result<()> {
        if let Some(last) = &self.last_key {
            if last.as_str() >= entry.key() {
                return Err(StratumError::InvalidEntry(format!(
                    "segment keys out of order: {:?} after {:?}",
                    entry.key(),
                    last
                )));
            }
        }
        self.writer.write_all(&entry.encode())?;
        self.bytes_written += entry.encoded_len() as u64;
        self.entries += 1;
        self.last_key = Some(entry.key().to_string());
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn entry_count(&self) -> usize {
        self.entries
    }

    /// Fsync, rename into place and open the finished segment.
    pub fn finish(self) -> Result<Segment> {
        let file = self
            .writer
            .into_inner()
            .map_err(|e| StratumError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.temp_path, &self.path)?;
        sync_dir(&self.path)?;
        Segment::open(self.id, &self.path)
    }

    /// Drop the partially written file.
    pub fn abandon(self) {
        let temp_path = self.temp_path.clone();
        drop(self.writer);
        if let Err(e) = fs::remove_file(&temp_path) {
            log::warn!("Failed to remove {}: {}", temp_path.display(), e);
        }
    }

    /// Write a complete sorted map as one segment.
    pub fn write_all<'a>(
        id: u64,
        path: impl Into<PathBuf>,
        entries: impl IntoIterator<Item = &'a Entry>,
    ) -> Result<Segment> {
        let mut writer = Self::create(id, path)?;
        for entry in entries {
            if let Err(e) = writer.append(entry) {
                writer.abandon();
                return Err(e);
            }
        }
        writer.finish()
    }
}

/// Persist a rename by syncing the parent directory.
#[cfg(unix)]
pub(crate) fn sync_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_path: &Path) -> Result<()> {
    Ok(())
}
