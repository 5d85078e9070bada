//! STRATUM - Segment Compaction
//! Merges runs of segments into fewer, non-overlapping segments and drops
//! superseded versions of each key.
//!
//! ## Compaction run
//! `Collecting` (key sets of every input) -> `Merging` (each key resolves to
//! the newest input holding it) -> `Writing` (resolved entries streamed into
//! new segments, rolling over at the size threshold) -> `Retiring` (catalog
//! swaps inputs for outputs, inputs marked compacted) -> `Done`.
//! Any error moves the run to `Failed`: partial outputs are deleted and the
//! inputs stay live and unmarked, to be retried on the next cycle.
//!
//! ## Tombstones
//! A tombstone is dropped only when the run includes the oldest live
//! segment; then no older segment remains that it could still be hiding.
//! Otherwise it is carried into the output.

use std::collections::BinaryHeap;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Result, StratumError};
use crate::types::Entry;

use super::catalog::{SegmentCatalog, SegmentInfo};
use super::metrics::EngineMetrics;
use super::reader::{EntryIter, EntryReader};
use super::segment::{Segment, SegmentWriter};

/// Trait defining a compaction strategy.
pub trait CompactionStrategy: Send + Sync {
    /// Select a contiguous run of segments to merge.
    /// `segments` is ordered newest first; the returned range indexes into it.
    fn select_compaction(&self, segments: &[SegmentInfo]) -> Option<Range<usize>>;

    /// Returns the human-readable name of this strategy.
    fn name(&self) -> &str;
}

/// Merges the oldest segments, at most `max_inputs` at a time.
///
/// Always including the oldest segment means every run may drop tombstones.
pub struct TailCompaction {
    max_inputs: usize,
}

impl TailCompaction {
    pub fn new(max_inputs: usize) -> Self {
        Self {
            max_inputs: max_inputs.max(2),
        }
    }
}

impl CompactionStrategy for TailCompaction {
    fn select_compaction(&self, segments: &[SegmentInfo]) -> Option<Range<usize>> {
        if segments.len() < 2 {
            return None;
        }
        let take = segments.len().min(self.max_inputs);
        Some(segments.len() - take..segments.len())
    }

    fn name(&self) -> &str {
        "TailCompaction"
    }
}

/// Phases of a single compaction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionPhase {
    Collecting,
    Merging,
    Writing,
    Retiring,
    Done,
    Failed,
}

impl fmt::Display for CompactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompactionPhase::Collecting => "collecting",
            CompactionPhase::Merging => "merging",
            CompactionPhase::Writing => "writing",
            CompactionPhase::Retiring => "retiring",
            CompactionPhase::Done => "done",
            CompactionPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Summary of a finished compaction run.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionOutcome {
    pub inputs: Vec<u64>,
    pub outputs: Vec<u64>,
    pub entries_written: usize,
    pub tombstones_dropped: usize,
}

/// Head entry of one merge source, ordered so that `BinaryHeap` (a max-heap)
/// pops the smallest key first and, on equal keys, the newest source.
struct HeapEntry {
    entry: Entry,
    /// Index into the input slice; lower is newer.
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.entry.key() == other.entry.key() && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .entry
            .key()
            .cmp(self.entry.key())
            .then_with(|| other.source.cmp(&self.source))
    }
}

struct MergeSource {
    segment: Arc<Segment>,
    entries: EntryIter,
    yielded: usize,
}

/// Yields, in key order, the newest entry for every key across `segments`.
///
/// `segments` must be ordered newest first; when a key appears in several
/// segments the earliest one in the slice wins. Each input file is read
/// once, front to back. A file holding fewer entries than its index is
/// reported as corruption.
pub struct MergeIterator {
    sources: Vec<MergeSource>,
    heap: BinaryHeap<HeapEntry>,
    failed: bool,
}

impl MergeIterator {
    pub fn new(segments: &[Arc<Segment>]) -> Result<Self> {
        let mut merge = Self {
            sources: Vec::with_capacity(segments.len()),
            heap: BinaryHeap::with_capacity(segments.len()),
            failed: false,
        };
        for (source, segment) in segments.iter().enumerate() {
            merge.sources.push(MergeSource {
                segment: Arc::clone(segment),
                entries: EntryReader::new(segment.path()).iter()?,
                yielded: 0,
            });
            merge.advance(source)?;
        }
        Ok(merge)
    }

    /// Move the next entry of `source` onto the heap.
    fn advance(&mut self, source: usize) -> Result<()> {
        let input = &mut self.sources[source];
        match input.entries.next() {
            Some(Ok((_, entry))) => {
                input.yielded += 1;
                self.heap.push(HeapEntry { entry, source });
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None if input.yielded != input.segment.len() => Err(StratumError::Corruption(format!(
                "segment {} ended after {} of {} indexed entries",
                input.segment.id(),
                input.yielded,
                input.segment.len()
            ))),
            None => Ok(()),
        }
    }

    fn next_entry(&mut self) -> Result<Option<Entry>> {
        let Some(newest) = self.heap.pop() else {
            return Ok(None);
        };
        self.advance(newest.source)?;

        // Older versions of the same key sit directly below on the heap.
        while let Some(older) = self.heap.peek() {
            if older.entry.key() != newest.entry.key() {
                break;
            }
            let source = older.source;
            self.heap.pop();
            self.advance(source)?;
        }
        Ok(Some(newest.entry))
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let next = self.next_entry().transpose();
        if matches!(next, Some(Err(_))) {
            self.failed = true;
        }
        next
    }
}

/// Merges segment runs chosen by a [`CompactionStrategy`].
pub struct SegmentCompactor {
    catalog: Arc<SegmentCatalog>,
    strategy: Box<dyn CompactionStrategy>,
    segment_threshold_bytes: u64,
    metrics: Arc<EngineMetrics>,
    /// Serializes runs; background and manual compaction never overlap.
    running: Mutex<()>,
}

impl SegmentCompactor {
    pub fn new(
        catalog: Arc<SegmentCatalog>,
        strategy: Box<dyn CompactionStrategy>,
        segment_threshold_bytes: u64,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            catalog,
            strategy,
            segment_threshold_bytes,
            metrics,
            running: Mutex::new(()),
        }
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Run one compaction if the strategy finds a candidate run.
    pub fn run_once(&self) -> Result<Option<CompactionOutcome>> {
        let _running = self.running.lock().unwrap_or_else(PoisonError::into_inner);

        let live = self.catalog.snapshot();
        let infos: Vec<SegmentInfo> = live.iter().map(|s| SegmentInfo::from(s.as_ref())).collect();
        let Some(range) = self.strategy.select_compaction(&infos) else {
            return Ok(None);
        };
        let drop_tombstones = range.end == live.len();
        let inputs = live[range].to_vec();
        drop(live);

        let input_ids: Vec<u64> = inputs.iter().map(|s| s.id()).collect();
        log::debug!(
            "Compaction [{}] {}: segments {:?}",
            self.strategy.name(),
            CompactionPhase::Collecting,
            input_ids
        );

        match self.compact(&inputs, drop_tombstones) {
            Ok(outcome) => {
                log::info!(
                    "Compaction {}: {:?} -> {:?} ({} entries, {} tombstones dropped)",
                    CompactionPhase::Done,
                    outcome.inputs,
                    outcome.outputs,
                    outcome.entries_written,
                    outcome.tombstones_dropped
                );
                self.metrics.record_compaction();
                Ok(Some(outcome))
            }
            Err(e) => {
                log::error!(
                    "Compaction {} for segments {:?}: {}",
                    CompactionPhase::Failed,
                    input_ids,
                    e
                );
                self.metrics.record_compaction_failure();
                Err(e)
            }
        }
    }

    /// Merge `inputs` (newest first) and swap them for the result.
    fn compact(&self, inputs: &[Arc<Segment>], drop_tombstones: bool) -> Result<CompactionOutcome> {
        let merge = MergeIterator::new(inputs)?;
        log::debug!(
            "Compaction {}: {} indexed keys across {} segments",
            CompactionPhase::Merging,
            inputs.iter().map(|s| s.len()).sum::<usize>(),
            inputs.len()
        );

        let mut outputs: Vec<Arc<Segment>> = Vec::new();
        let mut entries_written = 0;
        let mut tombstones_dropped = 0;

        let written = self.write_outputs(
            merge,
            drop_tombstones,
            &mut outputs,
            &mut entries_written,
            &mut tombstones_dropped,
        );
        let retired = written.and_then(|()| {
            log::debug!(
                "Compaction {}: {} inputs replaced by {} outputs",
                CompactionPhase::Retiring,
                inputs.len(),
                outputs.len()
            );
            self.catalog.replace(inputs, &outputs)
        });

        if let Err(e) = retired {
            // Finished outputs are not live; removing them on drop.
            for output in &outputs {
                output.mark_compacted();
            }
            return Err(e);
        }

        Ok(CompactionOutcome {
            inputs: inputs.iter().map(|s| s.id()).collect(),
            outputs: outputs.iter().map(|s| s.id()).collect(),
            entries_written,
            tombstones_dropped,
        })
    }

    fn write_outputs(
        &self,
        merge: MergeIterator,
        drop_tombstones: bool,
        outputs: &mut Vec<Arc<Segment>>,
        entries_written: &mut usize,
        tombstones_dropped: &mut usize,
    ) -> Result<()> {
        let mut writer: Option<SegmentWriter> = None;

        for entry in merge {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if let Some(w) = writer.take() {
                        w.abandon();
                    }
                    return Err(e);
                }
            };

            if entry.is_tombstone() && drop_tombstones {
                *tombstones_dropped += 1;
                continue;
            }

            let full = writer.as_ref().is_some_and(|w| {
                w.entry_count() > 0
                    && w.bytes_written() + entry.encoded_len() as u64 > self.segment_threshold_bytes
            });
            if full {
                if let Some(w) = writer.take() {
                    outputs.push(Arc::new(w.finish()?));
                }
            }

            if writer.is_none() {
                let id = self.catalog.allocate_id();
                log::debug!("Compaction {}: opening segment {}", CompactionPhase::Writing, id);
                writer = Some(SegmentWriter::create(id, self.catalog.segment_path(id))?);
            }

            if let Some(w) = writer.as_mut() {
                if let Err(e) = w.append(&entry) {
                    if let Some(w) = writer.take() {
                        w.abandon();
                    }
                    return Err(e);
                }
                *entries_written += 1;
            }
        }

        if let Some(w) = writer.take() {
            outputs.push(Arc::new(w.finish()?));
        }
        Ok(())
    }
}

/// Runs a [`SegmentCompactor`] on a fixed delay in a background thread.
pub struct CompactorHandle {
    handle: Option<JoinHandle<()>>,
    wakeup: Arc<(Mutex<()>, Condvar)>,
    shutdown: Arc<AtomicBool>,
}

impl CompactorHandle {
    pub fn spawn(compactor: Arc<SegmentCompactor>, delay: Duration) -> std::io::Result<Self> {
        let wakeup = Arc::new((Mutex::new(()), Condvar::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_wakeup = Arc::clone(&wakeup);
        let thread_shutdown = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("stratum-compactor".into())
            .spawn(move || compaction_loop(&compactor, delay, &thread_wakeup, &thread_shutdown))?;

        Ok(Self {
            handle: Some(handle),
            wakeup,
            shutdown,
        })
    }

    /// Stop the loop and wait for an in-flight run to finish.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        {
            let _guard = self.wakeup.0.lock().unwrap_or_else(PoisonError::into_inner);
            self.wakeup.1.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Compactor thread panicked");
            }
        }
    }
}

impl Drop for CompactorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn compaction_loop(
    compactor: &SegmentCompactor,
    delay: Duration,
    wakeup: &(Mutex<()>, Condvar),
    shutdown: &AtomicBool,
) {
    let (lock, cvar) = wakeup;
    log::info!(
        "Compactor started ({}, every {:?})",
        compactor.strategy_name(),
        delay
    );

    loop {
        {
            let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            let _ = cvar
                .wait_timeout(guard, delay)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if shutdown.load(Ordering::Acquire) {
            break;
        }

        // Failures are logged inside run_once and retried next cycle.
        let _ = compactor.run_once();
    }

    log::info!("Compactor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn info(id: u64) -> SegmentInfo {
        SegmentInfo {
            id,
            path: PathBuf::from(format!("{}.seg", id)),
            size: 1024,
            keys: 10,
        }
    }

    fn push(catalog: &SegmentCatalog, pairs: &[(&str, &str)]) -> Arc<Segment> {
        let id = catalog.allocate_id();
        let mut entries: Vec<Entry> = pairs
            .iter()
            .map(|(k, v)| Entry::new(id, *k, *v).unwrap())
            .collect();
        entries.sort_by(|a, b| a.key().cmp(b.key()));
        let segment = SegmentWriter::write_all(id, catalog.segment_path(id), &entries).unwrap();
        catalog.push_newest(segment).unwrap()
    }

    fn compactor(catalog: &Arc<SegmentCatalog>, threshold: u64) -> SegmentCompactor {
        SegmentCompactor::new(
            Arc::clone(catalog),
            Box::new(TailCompaction::new(4)),
            threshold,
            Arc::new(EngineMetrics::new()),
        )
    }

    fn live_pairs(catalog: &SegmentCatalog) -> Vec<(String, String)> {
        let live = catalog.snapshot();
        MergeIterator::new(&live)
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (e.key().to_string(), e.value().to_string())
            })
            .collect()
    }

    #[test]
    fn test_tail_selection() {
        let strategy = TailCompaction::new(2);
        assert_eq!(strategy.select_compaction(&[]), None);
        assert_eq!(strategy.select_compaction(&[info(0)]), None);
        assert_eq!(strategy.select_compaction(&[info(1), info(0)]), Some(0..2));
        assert_eq!(
            strategy.select_compaction(&[info(3), info(2), info(1), info(0)]),
            Some(2..4)
        );
        assert_eq!(strategy.name(), "TailCompaction");
    }

    #[test]
    fn test_merge_newer_segment_wins() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = SegmentCatalog::open(dir.path()).unwrap();
        push(&catalog, &[("k1", "v1"), ("dup", "old")]);
        push(&catalog, &[("k2", "v2"), ("dup", "new")]);

        assert_eq!(
            live_pairs(&catalog),
            vec![
                ("dup".to_string(), "new".to_string()),
                ("k1".to_string(), "v1".to_string()),
                ("k2".to_string(), "v2".to_string()),
            ]
        );
    }

    #[test]
    fn test_merge_streams_overlapping_runs() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = SegmentCatalog::open(dir.path()).unwrap();
        push(&catalog, &[("a", "0"), ("b", "0"), ("d", "0")]);
        push(&catalog, &[("b", "1"), ("c", "1"), ("d", "1")]);
        push(&catalog, &[("d", "2"), ("e", "2")]);

        let live = catalog.snapshot();
        let merged: Vec<(String, String)> = MergeIterator::new(&live)
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (e.key().to_string(), e.value().to_string())
            })
            .collect();
        let expected: Vec<(String, String)> = [("a", "0"), ("b", "1"), ("c", "1"), ("d", "2"), ("e", "2")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(merged, expected);
    }

    #[test]
    fn test_compaction_merges_two_segments() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(SegmentCatalog::open(dir.path()).unwrap());
        let older = push(&catalog, &[("k1", "v1"), ("dup", "old")]);
        let newer = push(&catalog, &[("k2", "v2"), ("dup", "new")]);
        let (older_path, newer_path) = (older.path().to_path_buf(), newer.path().to_path_buf());
        drop((older, newer));

        let outcome = compactor(&catalog, 1 << 20).run_once().unwrap().unwrap();
        assert_eq!(outcome.inputs, vec![1, 0]);
        assert_eq!(outcome.outputs, vec![2]);
        assert_eq!(outcome.entries_written, 3);
        assert_eq!(catalog.len(), 1);

        let merged = catalog.snapshot()[0].entries().unwrap();
        let pairs: Vec<(&str, &str)> = merged.iter().map(|e| (e.key(), e.value())).collect();
        assert_eq!(pairs, vec![("dup", "new"), ("k1", "v1"), ("k2", "v2")]);

        assert!(!older_path.exists());
        assert!(!newer_path.exists());
    }

    #[test]
    fn test_nothing_to_compact() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(SegmentCatalog::open(dir.path()).unwrap());
        assert_eq!(compactor(&catalog, 1024).run_once().unwrap(), None);
        push(&catalog, &[("a", "1")]);
        assert_eq!(compactor(&catalog, 1024).run_once().unwrap(), None);
    }

    #[test]
    fn test_tombstones_dropped_when_oldest_included() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(SegmentCatalog::open(dir.path()).unwrap());
        push(&catalog, &[("gone", "value"), ("kept", "value")]);
        push(&catalog, &[("gone", "")]);

        let outcome = compactor(&catalog, 1 << 20).run_once().unwrap().unwrap();
        assert_eq!(outcome.tombstones_dropped, 1);
        assert_eq!(
            live_pairs(&catalog),
            vec![("kept".to_string(), "value".to_string())]
        );
    }

    #[test]
    fn test_tombstones_kept_when_older_segment_survives() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(SegmentCatalog::open(dir.path()).unwrap());
        push(&catalog, &[("gone", "ancient")]);
        push(&catalog, &[("other", "x")]);
        push(&catalog, &[("gone", "")]);

        // Merge only the two newest segments, leaving the oldest behind.
        struct HeadPair;
        impl CompactionStrategy for HeadPair {
            fn select_compaction(&self, segments: &[SegmentInfo]) -> Option<Range<usize>> {
                (segments.len() >= 3).then_some(0..2)
            }
            fn name(&self) -> &str {
                "HeadPair"
            }
        }
        let compactor = SegmentCompactor::new(
            Arc::clone(&catalog),
            Box::new(HeadPair),
            1 << 20,
            Arc::new(EngineMetrics::new()),
        );

        let outcome = compactor.run_once().unwrap().unwrap();
        assert_eq!(outcome.tombstones_dropped, 0);
        assert_eq!(catalog.len(), 2);

        // The carried tombstone still hides the oldest segment's value.
        let newest = &catalog.snapshot()[0];
        assert!(newest.get("gone").unwrap().unwrap().is_tombstone());
        let resolved: Vec<(String, String)> = live_pairs(&catalog);
        assert!(resolved.contains(&("gone".to_string(), String::new())));
    }

    #[test]
    fn test_output_rolls_over_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(SegmentCatalog::open(dir.path()).unwrap());
        // Each entry encodes to 12 + 4 + 6 = 22 bytes.
        push(&catalog, &[("k000", "value0"), ("k001", "value1"), ("k002", "value2")]);
        push(&catalog, &[("k003", "value3"), ("k004", "value4")]);

        let outcome = compactor(&catalog, 50).run_once().unwrap().unwrap();
        assert_eq!(outcome.entries_written, 5);
        assert_eq!(outcome.outputs.len(), 3);

        let live = catalog.snapshot();
        assert!(live.iter().all(|s| s.file_size() <= 50));
        assert_eq!(live_pairs(&catalog).len(), 5);
    }

    #[test]
    fn test_failed_compaction_leaves_inputs_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(SegmentCatalog::open(dir.path()).unwrap());
        push(&catalog, &[("a", "1")]);
        let damaged = push(&catalog, &[("b", "2")]);

        // Truncate a live segment underneath its index.
        std::fs::write(damaged.path(), b"").unwrap();

        let metrics = Arc::new(EngineMetrics::new());
        let compactor = SegmentCompactor::new(
            Arc::clone(&catalog),
            Box::new(TailCompaction::new(4)),
            1 << 20,
            Arc::clone(&metrics),
        );
        assert!(compactor.run_once().is_err());
        assert_eq!(catalog.len(), 2);
        assert!(catalog.snapshot().iter().all(|s| !s.is_compacted()));
        assert_eq!(metrics.compaction_failures(), 1);

        // Only the two inputs remain on disk; no partial output survives.
        let segment_files = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.starts_with("segment-")
            })
            .count();
        assert_eq!(segment_files, 2);
    }

    #[test]
    fn test_background_compactor_runs_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(SegmentCatalog::open(dir.path()).unwrap());
        push(&catalog, &[("a", "1")]);
        push(&catalog, &[("b", "2")]);

        let compactor = Arc::new(compactor(&catalog, 1 << 20));
        let mut handle = CompactorHandle::spawn(compactor, Duration::from_millis(10)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while catalog.len() > 1 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        handle.shutdown();

        assert_eq!(catalog.len(), 1);
        assert_eq!(live_pairs(&catalog).len(), 2);
    }
}
