//! In-memory staging area with a sliding lateness window.
//!
//! Writes land in sorted runs; once the stream's head timestamp
//! crosses a checkpoint boundary the runs are sealed and handed to an
//! inline flusher over an even/odd generation counter:
//!
//! ```text
//! writer:  add ─► runs ─► make_checkpoint ─► ready   (generation odd)
//! flusher: merge_and_compress ─► Page::complete_chunk (generation even)
//! reader:  search over a generation-validated snapshot, BUSY on race
//! ```
//!
//! The generation counter is the entire hand-off protocol: even means
//! writers own the state, odd means a flusher owns the ready set.
//! Readers snapshot the counter before and after a scan and abort with
//! `Busy` when it moved.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::codec::{convert_from_time_order, UncompressedChunk};
use crate::config::StorageConfig;
use crate::error::{Result, TephraError};
use crate::page::Page;
use crate::query::{Query, SampleSink};
use crate::types::{Sample, ScanDirection, Timestamp, MAX_PARAM_ID};

/// A time-ordered append-only sequence of samples.
pub type SortedRun = Vec<Sample>;

/// Merges `runs` in the given direction, feeding `consumer` until it
/// returns `false` or every run is drained.
///
/// On interruption each surviving run keeps its unconsumed suffix
/// (forward) or prefix (backward) intact, so the remainder is still a
/// valid set of sorted runs. When the merge completes, `runs` is left
/// empty.
fn kway_merge(
    runs: &mut Vec<SortedRun>,
    direction: ScanDirection,
    consumer: &mut dyn FnMut(&Sample) -> bool,
) {
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;

    const NO_HEAD: usize = usize::MAX;

    match direction {
        ScanDirection::Forward => {
            // Min-heap over (time_key, run index).
            let mut heap: BinaryHeap<Reverse<((Timestamp, u64), usize)>> = BinaryHeap::new();
            let mut heads: Vec<usize> = vec![NO_HEAD; runs.len()];
            let mut cursors: Vec<usize> = vec![0; runs.len()];
            for (ix, run) in runs.iter().enumerate() {
                if !run.is_empty() {
                    heap.push(Reverse((run[0].time_key(), ix)));
                    heads[ix] = 0;
                    cursors[ix] = 1;
                }
            }
            while let Some(Reverse((_, ix))) = heap.pop() {
                let sample = runs[ix][heads[ix]];
                if !consumer(&sample) {
                    // Rebuild: every run keeps [head..] untouched.
                    let mut remaining = Vec::new();
                    for (jx, run) in runs.iter().enumerate() {
                        if heads[jx] != NO_HEAD && heads[jx] < run.len() {
                            remaining.push(run[heads[jx]..].to_vec());
                        }
                    }
                    *runs = remaining;
                    return;
                }
                heads[ix] = NO_HEAD;
                if cursors[ix] < runs[ix].len() {
                    heap.push(Reverse((runs[ix][cursors[ix]].time_key(), ix)));
                    heads[ix] = cursors[ix];
                    cursors[ix] += 1;
                }
            }
            runs.clear();
        }
        ScanDirection::Backward => {
            // Max-heap over (time_key, run index); runs are consumed
            // from their tails.
            let mut heap: BinaryHeap<((Timestamp, u64), usize)> = BinaryHeap::new();
            let mut heads: Vec<usize> = vec![NO_HEAD; runs.len()];
            for (ix, run) in runs.iter().enumerate() {
                if !run.is_empty() {
                    heap.push((run[run.len() - 1].time_key(), ix));
                    heads[ix] = run.len() - 1;
                }
            }
            while let Some((_, ix)) = heap.pop() {
                let sample = runs[ix][heads[ix]];
                if !consumer(&sample) {
                    // Rebuild: every run keeps [..=head] untouched.
                    let mut remaining = Vec::new();
                    for (jx, run) in runs.iter().enumerate() {
                        if heads[jx] != NO_HEAD {
                            remaining.push(run[..=heads[jx]].to_vec());
                        }
                    }
                    *runs = remaining;
                    return;
                }
                if heads[ix] > 0 {
                    heads[ix] -= 1;
                    heap.push((runs[ix][heads[ix]].time_key(), ix));
                } else {
                    heads[ix] = NO_HEAD;
                }
            }
            runs.clear();
        }
    }
}

/// Bounded-lateness staging buffer in front of one page.
pub struct Sequencer {
    /// Lateness window W in nanoseconds.
    window_size: u64,
    /// Compression threshold C in samples.
    compression_threshold: usize,
    /// Largest timestamp observed so far.
    top_timestamp: AtomicU64,
    /// ⌊top_timestamp / W⌋ at the last checkpoint.
    checkpoint: AtomicU64,
    /// Even: writers own the state. Odd: a flusher owns `ready`.
    generation: AtomicU32,
    /// Active runs, ordered by descending back element. The vector
    /// itself is guarded by this resize lock; appends take the run's
    /// own write lock.
    runs: Mutex<Vec<Arc<RwLock<SortedRun>>>>,
    /// Sealed runs awaiting the flusher.
    ready: Mutex<Vec<SortedRun>>,
}

impl Sequencer {
    /// Creates a sequencer with the window and threshold from `config`.
    pub fn new(config: &StorageConfig) -> Self {
        debug_assert!(config.window_size > 0, "window size must be positive");
        debug_assert!(
            config.compression_threshold > 0,
            "compression threshold must be positive"
        );
        Self {
            window_size: config.window_size,
            compression_threshold: config.compression_threshold,
            top_timestamp: AtomicU64::new(0),
            checkpoint: AtomicU64::new(0),
            generation: AtomicU32::new(0),
            runs: Mutex::new(Vec::new()),
            ready: Mutex::new(Vec::new()),
        }
    }

    /// Stages one sample.
    ///
    /// Returns the post-update generation as a flush token; an odd
    /// token obliges the caller to run
    /// [`merge_and_compress`](Sequencer::merge_and_compress).
    ///
    /// # Errors
    ///
    /// `LateWrite` when the sample is more than the window behind the
    /// stream head.
    pub fn add(&self, sample: Sample) -> Result<u32> {
        let ts = sample.timestamp;
        let top = self.top_timestamp.load(Ordering::Relaxed);
        let mut token = self.generation.load(Ordering::Acquire);
        if ts < top {
            if top - ts > self.window_size {
                return Err(TephraError::LateWrite {
                    timestamp: ts,
                    window: self.window_size,
                });
            }
        } else {
            let point = ts / self.window_size;
            if point > self.checkpoint.load(Ordering::Relaxed) {
                token = self.make_checkpoint(point);
            }
            self.top_timestamp.store(ts, Ordering::Relaxed);
        }

        // Locate the run whose back is the largest element not after
        // the sample; runs are kept ordered by descending back.
        let key = sample.time_key();
        let target = {
            let runs = self.runs.lock();
            let pos = runs.partition_point(|run| {
                run.read()
                    .last()
                    .map(|back| back.time_key() > key)
                    .unwrap_or(false)
            });
            runs.get(pos).cloned()
        };
        let mut appended = false;
        if let Some(run) = target {
            let mut guard = run.write();
            // Re-check under the run lock: appending may never break a
            // run's internal time order.
            let fits = guard.last().map(|back| back.time_key() <= key).unwrap_or(true);
            if fits {
                guard.push(sample);
                appended = true;
            }
        }
        if !appended {
            let mut runs = self.runs.lock();
            runs.push(Arc::new(RwLock::new(vec![sample])));
        }
        Ok(token)
    }

    /// Seals runs older than the previous checkpoint boundary.
    ///
    /// Called from the single writer thread only.
    ///
    /// # Panics
    ///
    /// Panics when entered while a flush already owns the state; that
    /// means two writers raced, which the storage never allows.
    fn make_checkpoint(&self, new_checkpoint: u64) -> u32 {
        let mut flag = self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        if flag % 2 == 0 {
            panic!("checkpoint entered while a flush owns the sequencer");
        }
        let old_top = self.checkpoint.load(Ordering::Relaxed) * self.window_size;
        self.checkpoint.store(new_checkpoint, Ordering::Relaxed);
        let boundary = (old_top, MAX_PARAM_ID);

        let mut runs = self.runs.lock();
        let mut ready = self.ready.lock();
        let mut survivors = Vec::with_capacity(runs.len());
        for run_arc in runs.iter() {
            // Write locks are taken in ascending run order.
            let mut run = run_arc.write();
            let split = run.partition_point(|s| s.time_key() < boundary);
            if split == 0 {
                drop(run);
                survivors.push(Arc::clone(run_arc));
            } else if split == run.len() {
                ready.push(std::mem::take(&mut *run));
            } else {
                ready.push(run[..split].to_vec());
                let rest = run[split..].to_vec();
                drop(run);
                survivors.push(Arc::new(RwLock::new(rest)));
            }
        }
        *runs = survivors;

        let ready_size: usize = ready.iter().map(|run| run.len()).sum();
        if ready_size < self.compression_threshold {
            // Not worth compressing yet; make the sealed data
            // searchable again and hand the state back to writers.
            for run in ready.drain(..) {
                runs.push(Arc::new(RwLock::new(run)));
            }
            flag = self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        } else {
            debug!(ready_size, checkpoint = new_checkpoint, "checkpoint sealed");
        }
        flag
    }

    /// Drains the ready set into compressed chunks on `page`.
    ///
    /// Precondition: the generation is odd (a checkpoint sealed data).
    /// With `force` set, undersized trailing chunks are flushed too.
    ///
    /// # Errors
    ///
    /// `Busy` when no flush is pending, `NoData` when the ready set is
    /// empty, `Overflow` when the page filled up — the unflushed
    /// residue is preserved in memory and follows the sequencer to the
    /// next page.
    pub fn merge_and_compress(&self, page: &mut Page, force: bool) -> Result<()> {
        if self.generation.load(Ordering::Acquire) % 2 == 0 {
            return Err(TephraError::Busy);
        }
        let mut ready = self.ready.lock();
        if ready.is_empty() {
            return Err(TephraError::NoData);
        }

        let threshold = self.compression_threshold;
        let mut status: Result<()> = Ok(());
        while !ready.is_empty() {
            let mut chunk = UncompressedChunk::with_capacity(threshold);
            let mut budget = threshold;
            kway_merge(&mut ready, ScanDirection::Forward, &mut |sample| {
                if budget > 0 {
                    budget -= 1;
                    chunk.push(sample);
                    true
                } else {
                    false
                }
            });

            let flushed = if force || chunk.len() >= threshold {
                let reordered = convert_from_time_order(&chunk);
                page.complete_chunk(&reordered)
            } else {
                // Wait for more data before compressing.
                Err(TephraError::NoData)
            };

            if let Err(err) = flushed {
                // Put the drained samples back; they form one
                // time-ordered run.
                let mut run = SortedRun::with_capacity(chunk.len());
                for ix in 0..chunk.len() {
                    run.push(chunk.sample_at(ix));
                }
                ready.push(run);
                status = match err {
                    TephraError::NoData => Ok(()),
                    other => Err(other),
                };
                break;
            }
        }

        if !ready.is_empty() {
            let mut runs = self.runs.lock();
            for run in ready.drain(..) {
                if !run.is_empty() {
                    runs.push(Arc::new(RwLock::new(run)));
                }
            }
        }
        self.generation.fetch_add(1, Ordering::Release);
        status
    }

    /// Searches the unflushed runs, pushing matches into `sink`.
    ///
    /// `expected_generation` is the value obtained from
    /// [`get_window`](Sequencer::get_window); the scan aborts with
    /// `Busy` when the generation is odd, differs from the expected
    /// value, or moves while the scan runs. The caller retries.
    pub fn search(
        &self,
        query: &Query,
        expected_generation: u32,
        sink: &mut dyn SampleSink,
    ) -> Result<()> {
        let seq = self.generation.load(Ordering::Acquire);
        if seq % 2 != 0 || seq != expected_generation {
            return Err(TephraError::Busy);
        }

        let snapshot: Vec<Arc<RwLock<SortedRun>>> = self.runs.lock().clone();
        let low_key = (query.range.lowerbound, 0u64);
        let high_key = (query.range.upperbound, u64::MAX);
        let mut filtered: Vec<SortedRun> = Vec::new();
        for run_arc in &snapshot {
            let run = run_arc.read();
            let begin = run.partition_point(|s| s.time_key() < low_key);
            let end = run.partition_point(|s| s.time_key() <= high_key);
            if begin < end {
                filtered.push(run[begin..end].to_vec());
            }
        }

        kway_merge(&mut filtered, query.range.direction, &mut |sample| {
            if query.filter.accept(sample.paramid) {
                sink.put(*sample)
            } else {
                true
            }
        });

        if self.generation.load(Ordering::Acquire) != seq {
            return Err(TephraError::Busy);
        }
        Ok(())
    }

    /// Seals everything and forces a final flush to `page`.
    pub fn close(&self, page: &mut Page) -> Result<()> {
        self.seal_all_runs();
        if self.ready.lock().is_empty() {
            // Nothing to flush; hand the state back to writers.
            self.generation.fetch_add(1, Ordering::Release);
            return Ok(());
        }
        self.merge_and_compress(page, true)
    }

    /// Seals everything without flushing; the next
    /// [`merge_and_compress`](Sequencer::merge_and_compress) drains it.
    pub fn reset(&self) -> u32 {
        self.seal_all_runs();
        1
    }

    fn seal_all_runs(&self) {
        let mut runs = self.runs.lock();
        let mut ready = self.ready.lock();
        for run_arc in runs.drain(..) {
            let mut run = run_arc.write();
            if !run.is_empty() {
                ready.push(std::mem::take(&mut *run));
            }
        }
        self.generation.store(1, Ordering::Release);
    }

    /// Returns the lateness horizon and the current generation.
    ///
    /// The generation is the snapshot token for
    /// [`search`](Sequencer::search).
    pub fn get_window(&self) -> (Timestamp, u32) {
        let top = self.top_timestamp.load(Ordering::Relaxed);
        let horizon = if top > self.window_size {
            top - self.window_size
        } else {
            top
        };
        (horizon, self.generation.load(Ordering::Acquire))
    }

    /// Number of samples staged in active runs (diagnostics).
    pub fn staged_samples(&self) -> usize {
        self.runs.lock().iter().map(|run| run.read().len()).sum()
    }
}
