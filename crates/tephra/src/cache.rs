//! Byte-budgeted FIFO cache of decoded chunks.
//!
//! Decoding a chunk costs a CRC pass plus four column decoders, so
//! point queries that revisit the same chunks keep the decoded form
//! around. Eviction is FIFO by insertion order; there are no hit
//! statistics and no LRU bookkeeping.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::UncompressedChunk;

/// Identity of a decoded chunk.
///
/// `page_key` folds the page's `open_count` into the high half so
/// entries of a reallocated page never collide with its former life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    /// `open_count << 32 | page_id` of the owning page.
    pub page_key: u64,
    /// Index of the chunk's sentinel entry inside the page.
    pub index: u32,
}

impl ChunkKey {
    /// Builds a key from the owning page's identity.
    pub fn new(page_id: u32, open_count: u32, index: u32) -> Self {
        Self {
            page_key: (u64::from(open_count) << 32) | u64::from(page_id),
            index,
        }
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    map: HashMap<ChunkKey, Arc<UncompressedChunk>>,
    fifo: VecDeque<(ChunkKey, usize)>,
    total_size: usize,
}

/// Process-wide cache of decoded chunks, bounded by a byte budget.
///
/// All operations serialize on a single mutex; `get` and `put` are
/// O(1) expected.
#[derive(Debug)]
pub struct ChunkCache {
    inner: Mutex<CacheInner>,
    size_limit: usize,
}

impl ChunkCache {
    /// Creates a cache holding at most `size_limit` bytes of decoded
    /// columns.
    pub fn new(size_limit: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            size_limit,
        }
    }

    /// Returns true if `key` is currently cached.
    pub fn contains(&self, key: ChunkKey) -> bool {
        self.inner.lock().map.contains_key(&key)
    }

    /// Returns the cached chunk for `key`, if any.
    pub fn get(&self, key: ChunkKey) -> Option<Arc<UncompressedChunk>> {
        self.inner.lock().map.get(&key).cloned()
    }

    /// Inserts a decoded chunk, evicting oldest entries until it fits.
    ///
    /// A chunk larger than the whole budget is not admitted, so the
    /// budget bound holds unconditionally after every call.
    pub fn put(&self, key: ChunkKey, chunk: Arc<UncompressedChunk>) {
        let size = chunk.memory_size();
        if size > self.size_limit {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.map.contains_key(&key) {
            return;
        }
        while inner.total_size + size > self.size_limit {
            let (evicted_key, evicted_size) = match inner.fifo.pop_front() {
                Some(oldest) => oldest,
                None => break,
            };
            if inner.map.remove(&evicted_key).is_none() {
                panic!("chunk cache inconsistent: fifo entry missing from map");
            }
            inner.total_size -= evicted_size;
        }
        inner.fifo.push_back((key, size));
        inner.map.insert(key, chunk);
        inner.total_size += size;
    }

    /// Current total size of cached columns in bytes.
    pub fn total_size(&self) -> usize {
        self.inner.lock().total_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Sample;

    fn chunk_of(rows: usize) -> Arc<UncompressedChunk> {
        let mut chunk = UncompressedChunk::default();
        for i in 0..rows {
            chunk.push(&Sample::new(1, i as u64, i as f64));
        }
        Arc::new(chunk)
    }

    #[test]
    fn test_get_put_contains() {
        let cache = ChunkCache::new(1024);
        let key = ChunkKey::new(0, 1, 7);
        assert!(!cache.contains(key));
        assert!(cache.get(key).is_none());

        cache.put(key, chunk_of(4));
        assert!(cache.contains(key));
        assert_eq!(cache.get(key).unwrap().len(), 4);
    }

    #[test]
    fn test_budget_never_exceeded() {
        // Each 4-row chunk holds 96 bytes of columns.
        let cache = ChunkCache::new(200);
        for i in 0..10 {
            cache.put(ChunkKey::new(0, 1, i), chunk_of(4));
            assert!(cache.total_size() <= 200);
        }
    }

    #[test]
    fn test_fifo_evicts_oldest_first() {
        let cache = ChunkCache::new(200);
        let first = ChunkKey::new(0, 1, 0);
        let second = ChunkKey::new(0, 1, 1);
        let third = ChunkKey::new(0, 1, 2);
        cache.put(first, chunk_of(4));
        cache.put(second, chunk_of(4));
        // 96 + 96 = 192; the third chunk forces one eviction.
        cache.put(third, chunk_of(4));
        assert!(!cache.contains(first));
        assert!(cache.contains(second));
        assert!(cache.contains(third));
    }

    #[test]
    fn test_oversized_chunk_not_admitted() {
        let cache = ChunkCache::new(100);
        let key = ChunkKey::new(0, 1, 0);
        cache.put(key, chunk_of(1000));
        assert!(!cache.contains(key));
        assert_eq!(cache.total_size(), 0);
    }

    #[test]
    fn test_realloc_changes_key() {
        let before = ChunkKey::new(3, 1, 5);
        let after = ChunkKey::new(3, 2, 5);
        assert_ne!(before, after);
    }
}
