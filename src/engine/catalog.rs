//! STRATUM - Segment Catalog
//! Owns the ordered set of live segments and the sequence used to name
//! new segment files.
//!
//! ## Recency
//! Segments are ordered newest first. Recency is a property of the list
//! position, not of the id: compaction output takes the place of its inputs
//! and may carry a higher id than segments that are actually newer.
//!
//! ## Manifest
//! ```text
//! CATALOG = [payload: bincode(CatalogManifest)][crc32(payload): 4 bytes (LE)]
//! ```
//! Rewritten atomically (write `CATALOG.tmp`, fsync, rename) on every change.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StratumError};

use super::segment::{parse_segment_id, segment_file_name, sync_dir, Segment, TEMP_EXTENSION};

/// Name of the manifest file inside the store directory.
pub const CATALOG_FILE_NAME: &str = "CATALOG";

/// On-disk description of the live segment set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct CatalogManifest {
    next_segment_id: u64,
    /// Live segment ids, newest first.
    segments: Vec<u64>,
}

impl CatalogManifest {
    fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = bincode::serialize(self)?;
        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(StratumError::Corruption("catalog manifest too short".into()));
        }
        let (payload, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let actual = crc32fast::hash(payload);
        if stored != actual {
            return Err(StratumError::Corruption(format!(
                "catalog checksum mismatch: stored {:08x}, computed {:08x}",
                stored, actual
            )));
        }
        Ok(bincode::deserialize(payload)?)
    }
}

/// Lightweight description of a live segment, used by compaction strategies.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentInfo {
    pub id: u64,
    pub path: PathBuf,
    pub size: u64,
    pub keys: usize,
}

impl From<&Segment> for SegmentInfo {
    fn from(segment: &Segment) -> Self {
        Self {
            id: segment.id(),
            path: segment.path().to_path_buf(),
            size: segment.file_size(),
            keys: segment.len(),
        }
    }
}

struct CatalogState {
    next_segment_id: u64,
    /// Newest first.
    segments: Vec<Arc<Segment>>,
}

impl CatalogState {
    fn manifest(&self) -> CatalogManifest {
        CatalogManifest {
            next_segment_id: self.next_segment_id,
            segments: self.segments.iter().map(|s| s.id()).collect(),
        }
    }
}

/// The live segment set and the segment id sequence.
pub struct SegmentCatalog {
    dir: PathBuf,
    state: Mutex<CatalogState>,
}

impl SegmentCatalog {
    /// Load the catalog for `dir`, opening every listed segment.
    ///
    /// Segment files the manifest does not list (left behind by a crash
    /// between writing a segment and recording it) and unfinished `.tmp`
    /// files are deleted.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let manifest_path = dir.join(CATALOG_FILE_NAME);

        let manifest = if manifest_path.exists() {
            CatalogManifest::decode(&fs::read(&manifest_path)?)?
        } else {
            CatalogManifest::default()
        };

        let mut segments = Vec::with_capacity(manifest.segments.len());
        for &id in &manifest.segments {
            let path = dir.join(segment_file_name(id));
            let segment = Segment::open(id, &path).map_err(|e| {
                StratumError::RecoveryFailed(format!("opening segment {}: {}", path.display(), e))
            })?;
            segments.push(Arc::new(segment));
        }

        let mut next_segment_id = manifest.next_segment_id;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(&format!(".{}", TEMP_EXTENSION)) {
                log::warn!("Removing unfinished file {}", path.display());
                fs::remove_file(&path)?;
            } else if let Some(id) = parse_segment_id(name) {
                // Never reuse an id that has touched the disk.
                next_segment_id = next_segment_id.max(id + 1);
                if !manifest.segments.contains(&id) {
                    log::warn!("Removing orphan segment {}", path.display());
                    fs::remove_file(&path)?;
                }
            }
        }

        log::info!(
            "Segment catalog opened at {:?} ({} live segments, next id {})",
            dir,
            segments.len(),
            next_segment_id
        );

        Ok(Self {
            dir,
            state: Mutex::new(CatalogState {
                next_segment_id,
                segments,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserve the next segment id.
    pub fn allocate_id(&self) -> u64 {
        let mut state = self.lock();
        let id = state.next_segment_id;
        state.next_segment_id += 1;
        id
    }

    pub fn segment_path(&self, id: u64) -> PathBuf {
        self.dir.join(segment_file_name(id))
    }

    /// Live segments, newest first. Holding the returned `Arc`s keeps the
    /// files readable even if compaction retires them meanwhile.
    pub fn snapshot(&self) -> Vec<Arc<Segment>> {
        self.lock().segments.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record a freshly flushed segment as the newest one.
    pub fn push_newest(&self, segment: Segment) -> Result<Arc<Segment>> {
        let segment = Arc::new(segment);
        let mut state = self.lock();
        state.segments.insert(0, Arc::clone(&segment));
        if let Err(e) = self.persist(&state.manifest()) {
            state.segments.remove(0);
            return Err(e);
        }
        Ok(segment)
    }

    /// Swap a contiguous run of live segments for their compacted output.
    ///
    /// `inputs` must appear, in the same order, as a contiguous run of the
    /// live list; `outputs` take their position. On success the inputs are
    /// marked compacted and are deleted once no reader holds them.
    pub fn replace(&self, inputs: &[Arc<Segment>], outputs: &[Arc<Segment>]) -> Result<()> {
        let Some(first) = inputs.first() else {
            return Err(StratumError::InvalidEntry("no segments to replace".into()));
        };
        let mut state = self.lock();

        let start = state
            .segments
            .iter()
            .position(|s| Arc::ptr_eq(s, first))
            .ok_or_else(|| StratumError::Corruption(format!("segment {} is no longer live", first.id())))?;
        let run = state.segments.get(start..start + inputs.len());
        let contiguous = run.is_some_and(|run| run.iter().zip(inputs).all(|(a, b)| Arc::ptr_eq(a, b)));
        if !contiguous {
            return Err(StratumError::Corruption(
                "compaction inputs are no longer a contiguous run".into(),
            ));
        }

        let previous = state.segments.clone();
        state
            .segments
            .splice(start..start + inputs.len(), outputs.iter().cloned());

        if let Err(e) = self.persist(&state.manifest()) {
            state.segments = previous;
            return Err(e);
        }
        drop(state);

        for input in inputs {
            input.mark_compacted();
        }
        Ok(())
    }

    fn persist(&self, manifest: &CatalogManifest) -> Result<()> {
        let path = self.dir.join(CATALOG_FILE_NAME);
        let temp = self.dir.join(format!("{}.{}", CATALOG_FILE_NAME, TEMP_EXTENSION));
        let bytes = manifest.encode()?;

        let mut file = fs::File::create(&temp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp, &path)?;
        sync_dir(&path)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
