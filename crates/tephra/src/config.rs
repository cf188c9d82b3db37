//! Storage configuration and tuning knobs.

/// Default lateness window: one second in nanoseconds.
pub const DEFAULT_WINDOW_SIZE: u64 = 1_000_000_000;

/// Default compression threshold in samples.
///
/// A checkpoint only seals data for flushing once at least this many
/// samples are ready; smaller batches compress poorly.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1000;

/// Default chunk-cache budget: 128 MiB.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 128 * 1024 * 1024;

/// Largest supported page file size: 4 GiB.
///
/// Entry offsets inside a page are 32 bits wide.
pub const MAX_PAGE_SIZE: u64 = 0x1_0000_0000;

/// Fsync policy for the write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Flush the page mapping after every completed chunk.
    #[default]
    Max,
    /// Flush every 8th odd generation; bounded data loss on crash.
    Tradeoff,
    /// Flush only on volume rotation and close.
    Speed,
}

/// Tuning knobs for a [`Storage`](crate::volume::Storage) instance.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Lateness window `W` in nanoseconds.
    ///
    /// Writes more than `W` behind the largest observed timestamp are
    /// rejected with `LateWrite`. Default: 1 second.
    pub window_size: u64,

    /// Compression threshold `C` in samples.
    ///
    /// Minimum ready-set size before a checkpoint produces a chunk
    /// (unless the flush is forced). Default: 1000.
    pub compression_threshold: usize,

    /// Chunk-cache budget in bytes. Default: 128 MiB.
    pub max_cache_size: usize,

    /// Fsync policy. Default: [`Durability::Max`].
    pub durability: Durability,

    /// Request huge-TLB pages for the volume mappings (Linux only).
    pub enable_huge_tlb: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            durability: Durability::default(),
            enable_huge_tlb: false,
        }
    }
}

impl StorageConfig {
    /// Sets the lateness window in nanoseconds.
    pub fn with_window_size(mut self, window_size: u64) -> Self {
        self.window_size = window_size;
        self
    }

    /// Sets the compression threshold in samples.
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Sets the chunk-cache budget in bytes.
    pub fn with_max_cache_size(mut self, bytes: usize) -> Self {
        self.max_cache_size = bytes;
        self
    }

    /// Sets the fsync policy.
    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Enables huge-TLB mappings where the platform supports them.
    pub fn with_huge_tlb(mut self, enable: bool) -> Self {
        self.enable_huge_tlb = enable;
        self
    }
}
