//! Fixed-size append-only page over a memory mapping.
//!
//! A page stores compressed column chunks framed by sentinel entries
//! and answers time-range queries with an interpolation-seeded search.
//!
//! # Layout
//!
//! All fields are little-endian. The offset index grows up right after
//! the header; entry bodies grow down from the end of the mapping.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ PageHeader (1612 bytes)                                        │
//! │   version u32 │ count u32 │ last_offset u64 │ sync_count u32   │
//! │   open_count u32 │ close_count u32 │ page_id u32 │ length u64  │
//! │   bbox: min_id u64 max_id u64 min_ts u64 max_ts u64            │
//! │   histogram: size u32, 128 × { timestamp u64, index u32 }      │
//! ├────────────────────────────────────────────────────────────────┤
//! │ offset index: u32 × count  (grows forward)                     │
//! ├────────────────────────────────────────────────────────────────┤
//! │                        free space                              │
//! ├────────────────────────────────────────────────────────────────┤
//! │ entries (grow backward from `length`):                         │
//! │   { param_id u64, time u64, length u32, value [u8; length] }   │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Readers only trust the `[0, sync_count)` prefix of the index; the
//! writer publishes entries by advancing `sync_count` after the data
//! and index slot are in place.

use std::sync::Arc;

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, error, warn};

use crate::cache::{ChunkCache, ChunkKey};
use crate::codec::{
    convert_from_chunk_order, decode_chunk, encode_chunk, UncompressedChunk,
};
use crate::error::{Result, TephraError};
use crate::query::{Query, SampleSink};
use crate::search::{
    interpolation_search, SearchObserver, SearchRange, SearchWindow,
};
use crate::types::{ParamId, Sample, Timestamp, CHUNK_BWD_ID, CHUNK_FWD_ID};

/// On-disk format version.
pub const PAGE_VERSION: u32 = 3;

/// Capacity of the embedded timestamp histogram (H).
pub const HISTOGRAM_CAPACITY: u32 = 128;

/// Serialized size of one histogram entry: timestamp + index.
const HISTOGRAM_ENTRY_SIZE: usize = 12;

/// Serialized size of the page header.
pub const PAGE_HEADER_SIZE: usize =
    OFF_HISTOGRAM + HISTOGRAM_CAPACITY as usize * HISTOGRAM_ENTRY_SIZE;

/// Fixed part of an entry: param_id + time + length.
pub const ENTRY_HEADER_SIZE: usize = 20;

/// Serialized size of a chunk descriptor.
pub const CHUNK_DESC_SIZE: usize = 16;

const INDEX_SLOT_SIZE: usize = 4;

/// Granularity used to decide when interpolation stops paying off.
const OS_PAGE_SIZE: u64 = 4096;

// Header field offsets.
const OFF_VERSION: usize = 0;
const OFF_COUNT: usize = 4;
const OFF_LAST_OFFSET: usize = 8;
const OFF_SYNC_COUNT: usize = 16;
const OFF_OPEN_COUNT: usize = 20;
const OFF_CLOSE_COUNT: usize = 24;
const OFF_PAGE_ID: usize = 28;
const OFF_LENGTH: usize = 32;
const OFF_MIN_ID: usize = 40;
const OFF_MAX_ID: usize = 48;
const OFF_MIN_TS: usize = 56;
const OFF_MAX_TS: usize = 64;
const OFF_HIST_SIZE: usize = 72;
const OFF_HISTOGRAM: usize = 76;

/// Descriptor written into both sentinel entries of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDesc {
    /// Number of rows in the chunk.
    pub n_elements: u32,
    /// Offset of the first chunk byte inside the page.
    pub begin_offset: u32,
    /// Offset one past the last chunk byte.
    pub end_offset: u32,
    /// CRC-32 of the bytes `[begin_offset, end_offset)`.
    pub checksum: u32,
}

impl ChunkDesc {
    /// Serializes the descriptor.
    pub fn to_bytes(&self) -> [u8; CHUNK_DESC_SIZE] {
        let mut bytes = [0u8; CHUNK_DESC_SIZE];
        bytes[0..4].copy_from_slice(&self.n_elements.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.begin_offset.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.end_offset.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserializes a descriptor from a sentinel entry payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CHUNK_DESC_SIZE {
            return Err(TephraError::BadData(format!(
                "chunk descriptor is {} bytes, expected {}",
                bytes.len(),
                CHUNK_DESC_SIZE
            )));
        }
        Ok(Self {
            n_elements: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            begin_offset: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            end_offset: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            checksum: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
        })
    }
}

/// Outcome of probing one row or chunk against the query window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanOutcome {
    /// Before the window in scan direction; keep going.
    Undershoot,
    /// Past the window; the scan is done.
    Overshoot,
    /// Inside the window.
    InRange,
    /// The sink asked to stop.
    Interrupted,
}

/// Borrowed view of one entry.
struct EntryRef<'a> {
    param_id: ParamId,
    time: Timestamp,
    payload: &'a [u8],
}

/// A fixed-size page over a memory mapping.
pub struct Page {
    map: MmapMut,
}

impl Page {
    /// Formats a fresh page over `map`, claiming the whole mapping.
    pub fn format(map: MmapMut, page_id: u32) -> Self {
        let mut page = Self { map };
        let length = page.map.len() as u64;
        page.set_u32(OFF_VERSION, PAGE_VERSION);
        page.set_u32(OFF_COUNT, 0);
        page.set_u64(OFF_LAST_OFFSET, length);
        page.set_u32(OFF_SYNC_COUNT, 0);
        page.set_u32(OFF_OPEN_COUNT, 0);
        page.set_u32(OFF_CLOSE_COUNT, 0);
        page.set_u32(OFF_PAGE_ID, page_id);
        page.set_u64(OFF_LENGTH, length);
        page.reset_bounding_box();
        page.set_u32(OFF_HIST_SIZE, 0);
        page
    }

    /// Opens an already formatted page.
    ///
    /// # Errors
    ///
    /// Returns `BadData` on a version or length mismatch.
    ///
    /// # Panics
    ///
    /// Panics if `sync_count > count`; the durable prefix invariant is
    /// broken and continuing would serve corrupt data.
    pub fn open(map: MmapMut) -> Result<Self> {
        let page = Self { map };
        let version = page.get_u32(OFF_VERSION);
        if version != PAGE_VERSION {
            return Err(TephraError::BadData(format!(
                "unsupported page version {}",
                version
            )));
        }
        if page.get_u64(OFF_LENGTH) != page.map.len() as u64 {
            return Err(TephraError::BadData(format!(
                "page length field {} does not match file size {}",
                page.get_u64(OFF_LENGTH),
                page.map.len()
            )));
        }
        if page.sync_count() > page.count() {
            error!(
                sync_count = page.sync_count(),
                count = page.count(),
                "page sync_count overtook count"
            );
            panic!("page corrupt: sync_count > count");
        }
        Ok(page)
    }

    /// Creates an anonymous in-memory page of `len` bytes.
    ///
    /// Backed by an anonymous mapping; nothing survives drop. Used by
    /// tests and ephemeral staging.
    pub fn anonymous(len: usize, page_id: u32) -> Result<Self> {
        let map = MmapOptions::new().len(len).map_anon()?;
        Ok(Self::format(map, page_id))
    }

    fn get_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.map[offset..offset + 4].try_into().unwrap())
    }

    fn set_u32(&mut self, offset: usize, value: u32) {
        self.map[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn get_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.map[offset..offset + 8].try_into().unwrap())
    }

    fn set_u64(&mut self, offset: usize, value: u64) {
        self.map[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Number of entries written (including the unsynced tail).
    pub fn count(&self) -> u32 {
        self.get_u32(OFF_COUNT)
    }

    /// Number of entries visible to readers.
    pub fn sync_count(&self) -> u32 {
        self.get_u32(OFF_SYNC_COUNT)
    }

    /// Times the page was opened for writing.
    pub fn open_count(&self) -> u32 {
        self.get_u32(OFF_OPEN_COUNT)
    }

    /// Sets the open counter; used when a reallocated page inherits
    /// its predecessor's identity.
    pub fn set_open_count(&mut self, value: u32) {
        self.set_u32(OFF_OPEN_COUNT, value);
    }

    /// Times the page was closed for writing.
    pub fn close_count(&self) -> u32 {
        self.get_u32(OFF_CLOSE_COUNT)
    }

    /// Sets the close counter (see [`set_open_count`](Page::set_open_count)).
    pub fn set_close_count(&mut self, value: u32) {
        self.set_u32(OFF_CLOSE_COUNT, value);
    }

    /// Position of the page inside the volume ring.
    pub fn page_id(&self) -> u32 {
        self.get_u32(OFF_PAGE_ID)
    }

    /// Total page length in bytes.
    pub fn length(&self) -> u64 {
        self.get_u64(OFF_LENGTH)
    }

    fn last_offset(&self) -> u64 {
        self.get_u64(OFF_LAST_OFFSET)
    }

    /// Smallest series id stored (bounding box).
    pub fn min_id(&self) -> ParamId {
        self.get_u64(OFF_MIN_ID)
    }

    /// Largest series id stored (bounding box).
    pub fn max_id(&self) -> ParamId {
        self.get_u64(OFF_MAX_ID)
    }

    /// Smallest timestamp stored (bounding box).
    pub fn min_ts(&self) -> Timestamp {
        self.get_u64(OFF_MIN_TS)
    }

    /// Largest timestamp stored (bounding box).
    pub fn max_ts(&self) -> Timestamp {
        self.get_u64(OFF_MAX_TS)
    }

    fn reset_bounding_box(&mut self) {
        self.set_u64(OFF_MIN_ID, u64::MAX);
        self.set_u64(OFF_MAX_ID, 0);
        self.set_u64(OFF_MIN_TS, u64::MAX);
        self.set_u64(OFF_MAX_TS, 0);
    }

    fn update_time_bounds(&mut self, ts: Timestamp) {
        if ts < self.min_ts() {
            self.set_u64(OFF_MIN_TS, ts);
        }
        if ts > self.max_ts() {
            self.set_u64(OFF_MAX_TS, ts);
        }
    }

    fn update_id_bounds(&mut self, id: ParamId) {
        if id < self.min_id() {
            self.set_u64(OFF_MIN_ID, id);
        }
        if id > self.max_id() {
            self.set_u64(OFF_MAX_ID, id);
        }
    }

    /// Histogram fill level.
    fn histogram_size(&self) -> u32 {
        self.get_u32(OFF_HIST_SIZE)
    }

    fn histogram_entry(&self, slot: u32) -> (Timestamp, u32) {
        let base = OFF_HISTOGRAM + slot as usize * HISTOGRAM_ENTRY_SIZE;
        (self.get_u64(base), self.get_u32(base + 8))
    }

    fn set_histogram_entry(&mut self, slot: u32, ts: Timestamp, index: u32) {
        let base = OFF_HISTOGRAM + slot as usize * HISTOGRAM_ENTRY_SIZE;
        self.set_u64(base, ts);
        self.set_u32(base + 8, index);
    }

    fn index_offset(&self, ix: u32) -> u32 {
        let slot = PAGE_HEADER_SIZE + ix as usize * INDEX_SLOT_SIZE;
        self.get_u32(slot)
    }

    fn set_index_offset(&mut self, ix: u32, offset: u32) {
        let slot = PAGE_HEADER_SIZE + ix as usize * INDEX_SLOT_SIZE;
        self.set_u32(slot, offset);
    }

    fn read_entry(&self, offset: u32) -> EntryRef<'_> {
        let base = offset as usize;
        let param_id = self.get_u64(base);
        let time = self.get_u64(base + 8);
        let length = self.get_u32(base + 16) as usize;
        EntryRef {
            param_id,
            time,
            payload: &self.map[base + ENTRY_HEADER_SIZE..base + ENTRY_HEADER_SIZE + length],
        }
    }

    fn entry_time(&self, ix: u32) -> Timestamp {
        self.get_u64(self.index_offset(ix) as usize + 8)
    }

    /// Bytes left between the index tail and the entry region.
    pub fn get_free_space(&self) -> u64 {
        let index_tail = (PAGE_HEADER_SIZE + self.count() as usize * INDEX_SLOT_SIZE) as u64;
        self.last_offset().saturating_sub(index_tail)
    }

    /// Appends a raw entry without publishing it to readers.
    ///
    /// # Errors
    ///
    /// `BadData` on an empty payload, `BadArg` if `timestamp` regresses
    /// against the last entry, `Overflow` when the entry plus its index
    /// slot does not fit.
    pub fn add_entry(&mut self, id: ParamId, timestamp: Timestamp, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(TephraError::BadData("empty entry payload".to_string()));
        }
        let count = self.count();
        if count > 0 && timestamp < self.entry_time(count - 1) {
            return Err(TephraError::BadArg("entry timestamp regression"));
        }
        let entry_size = (ENTRY_HEADER_SIZE + payload.len()) as u64;
        if entry_size + INDEX_SLOT_SIZE as u64 > self.get_free_space() {
            return Err(TephraError::Overflow);
        }
        let new_last = self.last_offset() - entry_size;
        let base = new_last as usize;
        self.set_u64(base, id);
        self.set_u64(base + 8, timestamp);
        self.set_u32(base + 16, payload.len() as u32);
        self.map[base + ENTRY_HEADER_SIZE..base + ENTRY_HEADER_SIZE + payload.len()]
            .copy_from_slice(payload);
        self.set_index_offset(count, new_last as u32);
        self.set_u64(OFF_LAST_OFFSET, new_last);
        self.set_u32(OFF_COUNT, count + 1);
        self.update_time_bounds(timestamp);
        if id < CHUNK_FWD_ID {
            self.update_id_bounds(id);
        }
        Ok(())
    }

    /// Publishes the next unsynced entry to readers and maintains the
    /// histogram; with `sort` set, only re-sorts the histogram.
    fn sync_next_index(&mut self, rand: u32, sort: bool) {
        if sort {
            let size = self.histogram_size();
            let mut entries: Vec<(Timestamp, u32)> =
                (0..size).map(|i| self.histogram_entry(i)).collect();
            entries.sort_by_key(|&(ts, _)| ts);
            for (slot, (ts, index)) in entries.into_iter().enumerate() {
                self.set_histogram_entry(slot as u32, ts, index);
            }
            return;
        }

        let ix = self.sync_count();
        if ix >= self.count() {
            error!(sync_count = ix, count = self.count(), "sync past write head");
            panic!("page corrupt: publishing an entry that was never written");
        }
        let ts = self.entry_time(ix);
        let size = self.histogram_size();
        if size < HISTOGRAM_CAPACITY {
            self.set_histogram_entry(size, ts, ix);
            self.set_u32(OFF_HIST_SIZE, size + 1);
        } else {
            // Reservoir sampling over all published entries.
            let slot = rand % ix.max(1);
            if slot < HISTOGRAM_CAPACITY {
                self.set_histogram_entry(slot, ts, ix);
            }
        }
        self.set_u32(OFF_SYNC_COUNT, ix + 1);
    }

    /// Compresses a chunk (already in chunk order) into the page and
    /// frames it with BWD/FWD sentinel entries.
    ///
    /// # Errors
    ///
    /// Returns `Overflow` when the encoded chunk plus both sentinels
    /// does not fit; the page is left untouched in that case.
    pub fn complete_chunk(&mut self, chunk: &UncompressedChunk) -> Result<()> {
        let (bytes, meta) = encode_chunk(chunk);
        let sentinel_size = (ENTRY_HEADER_SIZE + CHUNK_DESC_SIZE + INDEX_SLOT_SIZE) as u64;
        let required = bytes.len() as u64 + 2 * sentinel_size;
        if required > self.get_free_space() {
            return Err(TephraError::Overflow);
        }

        let begin = self.last_offset() - bytes.len() as u64;
        self.map[begin as usize..begin as usize + bytes.len()].copy_from_slice(&bytes);
        self.set_u64(OFF_LAST_OFFSET, begin);

        let desc = ChunkDesc {
            n_elements: meta.n_elements,
            begin_offset: begin as u32,
            end_offset: (begin + bytes.len() as u64) as u32,
            checksum: crc32fast::hash(&bytes),
        };
        let desc_bytes = desc.to_bytes();

        self.add_entry(CHUNK_BWD_ID, meta.first_ts, &desc_bytes)?;
        self.sync_next_index(rand::random::<u32>(), false);
        self.add_entry(CHUNK_FWD_ID, meta.last_ts, &desc_bytes)?;
        self.sync_next_index(rand::random::<u32>(), false);
        self.sync_next_index(0, true);

        for &id in &chunk.paramids {
            self.update_id_bounds(id);
        }
        debug!(
            page_id = self.page_id(),
            rows = meta.n_elements,
            bytes = bytes.len(),
            "chunk completed"
        );
        Ok(())
    }

    /// Reopens the page for writing after rotation: bumps `open_count`
    /// and clears the data, index, bounding box and histogram.
    pub fn reuse(&mut self) {
        let length = self.length();
        self.set_u32(OFF_COUNT, 0);
        self.set_u32(OFF_SYNC_COUNT, 0);
        self.set_u64(OFF_LAST_OFFSET, length);
        self.reset_bounding_box();
        self.set_u32(OFF_HIST_SIZE, 0);
        self.set_u32(OFF_OPEN_COUNT, self.open_count() + 1);
    }

    /// Closes the page for writing.
    pub fn close(&mut self) {
        self.set_u32(OFF_CLOSE_COUNT, self.close_count() + 1);
    }

    /// Crash recovery: discards the unsynced tail and verifies the
    /// durable prefix.
    ///
    /// Returns true if anything was repaired.
    ///
    /// # Panics
    ///
    /// Panics if a published entry is unreadable; the durable prefix
    /// is the recovery contract and a hole in it means the file is
    /// damaged beyond self-repair.
    pub fn restore(&mut self) -> bool {
        let sync = self.sync_count();
        let count = self.count();
        let length = self.length();
        let mut min_offset = length;
        for ix in 0..sync {
            let offset = self.index_offset(ix) as u64;
            let header_end = offset + ENTRY_HEADER_SIZE as u64;
            if offset < PAGE_HEADER_SIZE as u64 || header_end > length {
                error!(index = ix, offset, "published entry out of bounds");
                panic!("page corrupt: published entry out of bounds");
            }
            let payload_len = self.get_u32(offset as usize + 16) as u64;
            if header_end + payload_len > length {
                error!(index = ix, offset, payload_len, "published entry truncated");
                panic!("page corrupt: published entry truncated");
            }
            min_offset = min_offset.min(offset);
        }

        let mut changed = false;
        if count != sync {
            warn!(
                page_id = self.page_id(),
                discarded = count - sync,
                "dropping unsynced entries after crash"
            );
            self.set_u32(OFF_COUNT, sync);
            changed = true;
        }
        if self.last_offset() != min_offset {
            self.set_u64(OFF_LAST_OFFSET, min_offset);
            changed = true;
        }
        changed
    }

    /// Flushes the whole mapping, then the header, to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        self.map.flush_range(0, PAGE_HEADER_SIZE)?;
        Ok(())
    }

    /// Searches the page, pushing matches into `sink`.
    ///
    /// Fast path → histogram seed → interpolation → binary search →
    /// directional scan. Only `[0, sync_count)` is visited.
    pub fn search(
        &self,
        query: &Query,
        cache: Option<&ChunkCache>,
        observer: &dyn SearchObserver,
        sink: &mut dyn SampleSink,
    ) -> Result<()> {
        if query.range.is_invalid() {
            return Err(TephraError::BadArg("query range inverted"));
        }
        let max_index = self.sync_count();
        if max_index == 0 {
            return Ok(());
        }

        let key = query.range.begin();
        let backward = query.range.is_backward();
        let first_ts = self.entry_time(0);
        let last_ts = self.entry_time(max_index - 1);

        let landing = if key > last_ts {
            if backward {
                max_index - 1
            } else {
                return Ok(());
            }
        } else if key < first_ts {
            if backward {
                return Ok(());
            } else {
                0
            }
        } else {
            if let crate::query::IdFilter::Single(id) = &query.filter {
                // Bounding-box rejection for single-series queries.
                if self.min_id() <= self.max_id() && (*id < self.min_id() || *id > self.max_id()) {
                    return Ok(());
                }
            }
            let mut range = SearchRange {
                begin: 0,
                end: max_index - 1,
            };
            self.seed_from_histogram(key, &mut range, max_index);
            let window = PageWindow {
                page: self,
                max_index,
            };
            if !interpolation_search(&window, key, &mut range, observer) {
                return Err(TephraError::NotFound);
            }
            self.binary_search(key, &mut range, max_index, observer);
            if range.begin >= max_index {
                return Err(TephraError::Overflow);
            }
            range.begin
        };

        self.scan(landing, query, cache, sink)
    }

    /// Narrows the bracket with the sorted histogram before
    /// interpolation runs.
    fn seed_from_histogram(&self, key: Timestamp, range: &mut SearchRange, max_index: u32) {
        let size = self.histogram_size();
        if size == 0 {
            return;
        }
        let entries: Vec<(Timestamp, u32)> = (0..size).map(|i| self.histogram_entry(i)).collect();
        let lower = entries.partition_point(|&(ts, _)| ts < key);
        if lower > 0 {
            range.begin = entries[lower - 1].1.min(max_index - 1);
        }
        let upper = entries.partition_point(|&(ts, _)| ts <= key);
        if upper < size as usize {
            range.end = entries[upper].1.min(max_index - 1);
        }
        if range.begin > range.end {
            range.begin = 0;
            range.end = max_index - 1;
        }
    }

    fn binary_search(
        &self,
        key: Timestamp,
        range: &mut SearchRange,
        max_index: u32,
        observer: &dyn SearchObserver,
    ) {
        if range.begin == range.end {
            return;
        }
        let mut steps: u32 = 0;
        let mut probe_index = range.begin;
        while range.end >= range.begin {
            steps += 1;
            probe_index = range.begin + (range.end - range.begin) / 2;
            if probe_index >= max_index {
                range.begin = max_index;
                range.end = max_index;
                observer.binary_search(steps);
                return;
            }
            let probe = self.entry_time(probe_index);
            if probe == key {
                break;
            } else if probe < key {
                range.begin = probe_index + 1;
                if range.begin >= max_index {
                    break;
                }
            } else {
                if probe_index == 0 {
                    break;
                }
                range.end = probe_index - 1;
            }
        }
        range.begin = probe_index;
        range.end = probe_index;
        observer.binary_search(steps);
    }

    fn check_timestamp(&self, query: &Query, ts: Timestamp) -> ScanOutcome {
        if query.range.is_backward() {
            if ts > query.range.upperbound {
                ScanOutcome::Undershoot
            } else if ts < query.range.lowerbound {
                ScanOutcome::Overshoot
            } else {
                ScanOutcome::InRange
            }
        } else if ts > query.range.upperbound {
            ScanOutcome::Overshoot
        } else if ts < query.range.lowerbound {
            ScanOutcome::Undershoot
        } else {
            ScanOutcome::InRange
        }
    }

    fn scan(
        &self,
        start: u32,
        query: &Query,
        cache: Option<&ChunkCache>,
        sink: &mut dyn SampleSink,
    ) -> Result<()> {
        let max_index = self.sync_count();
        if start >= max_index {
            return Err(TephraError::Overflow);
        }
        let backward = query.range.is_backward();
        let step: i64 = if backward { -1 } else { 1 };
        let mut ix = start as i64;
        loop {
            if ix < 0 || ix >= max_index as i64 {
                break;
            }
            let entry = self.read_entry(self.index_offset(ix as u32));
            let outcome = if entry.param_id == CHUNK_FWD_ID && !backward {
                self.scan_compressed_entries(ix as u32, &entry, query, cache, sink)?
            } else if entry.param_id == CHUNK_BWD_ID && backward {
                self.scan_compressed_entries(ix as u32, &entry, query, cache, sink)?
            } else if entry.param_id < CHUNK_FWD_ID {
                // Raw entry: emit directly when it matches.
                let outcome = self.check_timestamp(query, entry.time);
                if outcome == ScanOutcome::InRange
                    && query.filter.accept(entry.param_id)
                    && entry.payload.len() == 8
                {
                    let value = f64::from_le_bytes(entry.payload.try_into().unwrap());
                    if !sink.put(Sample::new(entry.param_id, entry.time, value)) {
                        ScanOutcome::Interrupted
                    } else {
                        outcome
                    }
                } else {
                    outcome
                }
            } else {
                // Sentinel facing away from the scan direction.
                self.check_timestamp(query, entry.time)
            };
            match outcome {
                ScanOutcome::Overshoot | ScanOutcome::Interrupted => break,
                ScanOutcome::Undershoot | ScanOutcome::InRange => {}
            }
            ix += step;
        }
        Ok(())
    }

    /// Decodes one chunk (or fetches it from the cache) and emits the
    /// rows inside the query window.
    fn scan_compressed_entries(
        &self,
        index: u32,
        entry: &EntryRef<'_>,
        query: &Query,
        cache: Option<&ChunkCache>,
        sink: &mut dyn SampleSink,
    ) -> Result<ScanOutcome> {
        let desc = ChunkDesc::from_bytes(entry.payload)?;
        let cache_key = ChunkKey::new(self.page_id(), self.open_count(), index);

        let header: Arc<UncompressedChunk> = match cache.and_then(|c| c.get(cache_key)) {
            Some(cached) => cached,
            None => {
                let begin = desc.begin_offset as usize;
                let end = desc.end_offset as usize;
                if begin > end || end > self.map.len() {
                    error!(begin, end, "chunk descriptor out of bounds");
                    panic!("page corrupt: chunk descriptor out of bounds");
                }
                let bytes = &self.map[begin..end];
                let checksum = crc32fast::hash(bytes);
                if checksum != desc.checksum {
                    error!(
                        expected = desc.checksum,
                        actual = checksum,
                        "chunk checksum mismatch"
                    );
                    panic!("page corrupt: chunk checksum mismatch");
                }
                let chunk = match decode_chunk(bytes, desc.n_elements) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        error!(%err, "chunk decode failed after checksum passed");
                        panic!("page corrupt: undecodable chunk");
                    }
                };
                let header = Arc::new(convert_from_chunk_order(&chunk));
                if let Some(cache) = cache {
                    cache.put(cache_key, Arc::clone(&header));
                }
                header
            }
        };

        let rows = header.len();
        let mut outcome = ScanOutcome::Undershoot;
        if query.range.is_backward() {
            // Skip rows above the window; timestamps are ascending.
            let start = header
                .timestamps
                .partition_point(|&ts| ts <= query.range.upperbound);
            for ix in (0..start).rev() {
                outcome = self.check_timestamp(query, header.timestamps[ix]);
                if outcome == ScanOutcome::Overshoot {
                    break;
                }
                if outcome == ScanOutcome::InRange
                    && query.filter.accept(header.paramids[ix])
                    && !sink.put(header.sample_at(ix))
                {
                    outcome = ScanOutcome::Interrupted;
                    break;
                }
            }
        } else {
            let start = header
                .timestamps
                .partition_point(|&ts| ts < query.range.lowerbound);
            for ix in start..rows {
                outcome = self.check_timestamp(query, header.timestamps[ix]);
                if outcome == ScanOutcome::Overshoot {
                    break;
                }
                if outcome == ScanOutcome::InRange
                    && query.filter.accept(header.paramids[ix])
                    && !sink.put(header.sample_at(ix))
                {
                    outcome = ScanOutcome::Interrupted;
                    break;
                }
            }
        }
        Ok(outcome)
    }
}

/// Adapter exposing the synced index to the interpolation search.
struct PageWindow<'a> {
    page: &'a Page,
    max_index: u32,
}

impl SearchWindow for PageWindow<'_> {
    fn read_at(&self, ix: u32) -> Option<Timestamp> {
        if ix < self.max_index {
            Some(self.page.entry_time(ix))
        } else {
            None
        }
    }

    fn is_small(&self, range: SearchRange) -> bool {
        // Once both bracket entries sit on the same OS page, binary
        // search finishes without extra faults.
        let begin = self.page.index_offset(range.begin) as u64;
        let end = self.page.index_offset(range.end) as u64;
        begin / OS_PAGE_SIZE == end / OS_PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::VecSink;
    use crate::search::NullSearchObserver;
    use crate::types::QueryRange;

    const TEST_PAGE_SIZE: usize = 256 * 1024;

    fn fresh_page() -> Page {
        let mut page = Page::anonymous(TEST_PAGE_SIZE, 0).unwrap();
        page.reuse();
        page
    }

    fn chunk_for(range: std::ops::Range<u64>, id: ParamId) -> UncompressedChunk {
        let mut chunk = UncompressedChunk::default();
        for ts in range {
            chunk.push(&Sample::new(id, ts, ts as f64 * 0.5));
        }
        chunk
    }

    fn search_page(page: &Page, query: &Query) -> Vec<Sample> {
        let mut sink = VecSink::default();
        page.search(query, None, &NullSearchObserver, &mut sink)
            .unwrap();
        sink.samples
    }

    #[test]
    fn test_format_and_open() {
        let page = fresh_page();
        assert_eq!(page.count(), 0);
        assert_eq!(page.sync_count(), 0);
        assert_eq!(page.open_count(), 1);
        assert_eq!(page.length(), TEST_PAGE_SIZE as u64);
        assert_eq!(page.get_free_space(), (TEST_PAGE_SIZE - PAGE_HEADER_SIZE) as u64);
    }

    #[test]
    fn test_add_entry_rejects_bad_input() {
        let mut page = fresh_page();
        assert!(matches!(
            page.add_entry(1, 10, &[]),
            Err(TephraError::BadData(_))
        ));
        page.add_entry(1, 10, &1.0f64.to_le_bytes()).unwrap();
        assert!(matches!(
            page.add_entry(1, 9, &2.0f64.to_le_bytes()),
            Err(TephraError::BadArg(_))
        ));
    }

    #[test]
    fn test_add_entry_overflow_boundary() {
        let mut page = fresh_page();
        // Fill the page with entries until one no longer fits.
        let payload = [0u8; 1000];
        let mut added = 0u64;
        loop {
            match page.add_entry(1, added, &payload) {
                Ok(()) => added += 1,
                Err(TephraError::Overflow) => break,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(added > 0);
        // The free space left is smaller than one more entry.
        assert!(page.get_free_space() < (ENTRY_HEADER_SIZE + payload.len() + 4) as u64);
        // Count reflects only successful appends.
        assert_eq!(page.count() as u64, added);
    }

    #[test]
    fn test_complete_chunk_publishes_sentinels() {
        let mut page = fresh_page();
        let chunk = chunk_for(100..200, 1);
        page.complete_chunk(&chunk).unwrap();

        assert_eq!(page.count(), 2);
        assert_eq!(page.sync_count(), 2);
        assert_eq!(page.histogram_size(), 2);
        assert_eq!(page.min_ts(), 100);
        assert_eq!(page.max_ts(), 199);
        assert_eq!(page.min_id(), 1);
        assert_eq!(page.max_id(), 1);

        // BWD sentinel first (keyed at first_ts), FWD second.
        let bwd = page.read_entry(page.index_offset(0));
        let fwd = page.read_entry(page.index_offset(1));
        assert_eq!(bwd.param_id, CHUNK_BWD_ID);
        assert_eq!(bwd.time, 100);
        assert_eq!(fwd.param_id, CHUNK_FWD_ID);
        assert_eq!(fwd.time, 199);
        assert_eq!(
            ChunkDesc::from_bytes(bwd.payload).unwrap(),
            ChunkDesc::from_bytes(fwd.payload).unwrap()
        );
    }

    #[test]
    fn test_chunk_search_roundtrip() {
        let mut page = fresh_page();
        page.complete_chunk(&chunk_for(100..200, 1)).unwrap();
        page.complete_chunk(&chunk_for(200..300, 1)).unwrap();

        let samples = search_page(&page, &Query::new(QueryRange::forward(0, 1000)));
        assert_eq!(samples.len(), 200);
        assert!(samples.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(samples[0].timestamp, 100);
        assert_eq!(samples[199].timestamp, 299);
    }

    #[test]
    fn test_search_window_bounds() {
        let mut page = fresh_page();
        page.complete_chunk(&chunk_for(100..200, 1)).unwrap();

        let samples = search_page(&page, &Query::new(QueryRange::forward(120, 130)));
        assert_eq!(samples.len(), 11);
        assert_eq!(samples[0].timestamp, 120);
        assert_eq!(samples[10].timestamp, 130);
    }

    #[test]
    fn test_backward_search_descends() {
        let mut page = fresh_page();
        page.complete_chunk(&chunk_for(100..200, 1)).unwrap();

        let samples = search_page(&page, &Query::new(QueryRange::backward(150, 160)));
        assert_eq!(samples.len(), 11);
        assert_eq!(samples[0].timestamp, 160);
        assert_eq!(samples[10].timestamp, 150);
        assert!(samples.windows(2).all(|w| w[0].timestamp > w[1].timestamp));
    }

    #[test]
    fn test_search_outside_bbox_is_empty() {
        let mut page = fresh_page();
        page.complete_chunk(&chunk_for(100..200, 1)).unwrap();

        assert!(search_page(&page, &Query::new(QueryRange::forward(500, 900))).is_empty());
        assert!(search_page(&page, &Query::new(QueryRange::backward(0, 50))).is_empty());
        // Single-series rejection via the id bounding box.
        let query = Query::new(QueryRange::forward(100, 200)).with_series(42);
        assert!(search_page(&page, &query).is_empty());
    }

    #[test]
    fn test_search_ignores_unsynced_entries() {
        let mut page = fresh_page();
        page.complete_chunk(&chunk_for(100..150, 1)).unwrap();
        // A raw entry appended but never published.
        page.add_entry(1, 500, &1.5f64.to_le_bytes()).unwrap();

        let samples = search_page(&page, &Query::new(QueryRange::forward(0, 1000)));
        assert_eq!(samples.len(), 50);
        assert!(samples.iter().all(|s| s.timestamp < 500));
    }

    #[test]
    fn test_sink_interrupt_stops_scan() {
        let mut page = fresh_page();
        page.complete_chunk(&chunk_for(100..200, 1)).unwrap();

        let mut taken = 0usize;
        let mut sink = |_sample: Sample| {
            taken += 1;
            taken < 10
        };
        page.search(
            &Query::new(QueryRange::forward(0, 1000)),
            None,
            &NullSearchObserver,
            &mut sink,
        )
        .unwrap();
        assert_eq!(taken, 10);
    }

    #[test]
    fn test_cache_is_reused() {
        let mut page = fresh_page();
        page.complete_chunk(&chunk_for(100..200, 1)).unwrap();
        let cache = ChunkCache::new(1 << 20);

        let query = Query::new(QueryRange::forward(0, 1000));
        let mut sink = VecSink::default();
        page.search(&query, Some(&cache), &NullSearchObserver, &mut sink)
            .unwrap();
        assert_eq!(sink.samples.len(), 100);
        // The FWD sentinel sits at index 1.
        assert!(cache.contains(ChunkKey::new(page.page_id(), page.open_count(), 1)));

        let mut sink = VecSink::default();
        page.search(&query, Some(&cache), &NullSearchObserver, &mut sink)
            .unwrap();
        assert_eq!(sink.samples.len(), 100);
    }

    #[test]
    fn test_reuse_resets_but_close_only_counts() {
        let mut page = fresh_page();
        page.complete_chunk(&chunk_for(100..200, 1)).unwrap();
        let open_before = page.open_count();

        page.close();
        assert_eq!(page.close_count(), 1);
        assert_eq!(page.count(), 2);

        page.reuse();
        assert_eq!(page.open_count(), open_before + 1);
        assert_eq!(page.count(), 0);
        assert_eq!(page.sync_count(), 0);
        assert_eq!(page.histogram_size(), 0);
        assert_eq!(page.last_offset(), page.length());
        assert_eq!(page.min_ts(), u64::MAX);
        assert_eq!(page.max_ts(), 0);
    }

    #[test]
    fn test_restore_truncates_unsynced_tail() {
        let mut page = fresh_page();
        page.complete_chunk(&chunk_for(100..150, 1)).unwrap();
        let last_synced_offset = page.last_offset();
        page.add_entry(1, 400, &2.0f64.to_le_bytes()).unwrap();
        assert_eq!(page.count(), 3);

        assert!(page.restore());
        assert_eq!(page.count(), 2);
        assert_eq!(page.sync_count(), 2);
        assert_eq!(page.last_offset(), last_synced_offset);

        // Idempotent once clean.
        assert!(!page.restore());
    }

    #[test]
    fn test_histogram_sorted_and_bounded() {
        let mut page = fresh_page();
        for start in 0..HISTOGRAM_CAPACITY as u64 + 40 {
            let chunk = chunk_for(start * 10..start * 10 + 2, 1);
            page.complete_chunk(&chunk).unwrap();
        }
        let size = page.histogram_size();
        assert!(size <= HISTOGRAM_CAPACITY);
        let entries: Vec<(Timestamp, u32)> = (0..size).map(|i| page.histogram_entry(i)).collect();
        assert!(entries.windows(2).all(|w| w[0].0 <= w[1].0));
        let sync = page.sync_count();
        assert!(entries.iter().all(|&(_, ix)| ix < sync));
    }

    #[test]
    fn test_complete_chunk_overflow_leaves_page_intact() {
        let mut page = Page::anonymous(PAGE_HEADER_SIZE + 512, 0).unwrap();
        page.reuse();
        let count_before = page.count();
        let free_before = page.get_free_space();
        let big = chunk_for(0..1000, 1);
        assert!(matches!(
            page.complete_chunk(&big),
            Err(TephraError::Overflow)
        ));
        assert_eq!(page.count(), count_before);
        assert_eq!(page.get_free_space(), free_before);
    }
}
