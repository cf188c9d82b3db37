//! Volume ring: memory-mapped page files rotated round-robin.
//!
//! A [`Volume`] owns one page file, its mapping and the sequencer
//! staging writes for it. [`Storage`] owns the ordered ring of
//! volumes; exactly one volume is active for writing. When the active
//! page overflows, the ring advances: the successor page file is
//! reallocated in place (`safe_realloc`), the sequencers are swapped
//! so pending data follows the write cursor, and the fresh page is
//! reused.
//!
//! # On-disk layout
//!
//! ```text
//! <metadata_dir>/<name>.tephra       key=value metadata, volume rows
//! <volumes_dir>/<name>_<i>.volume    page files, exactly page_size bytes
//! ```

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cache::ChunkCache;
use crate::config::{Durability, StorageConfig, MAX_PAGE_SIZE};
use crate::error::{Result, TephraError};
use crate::page::{Page, PAGE_HEADER_SIZE};
use crate::query::{Query, SampleSink};
use crate::search::{NullSearchObserver, SearchObserver};
use crate::sequencer::Sequencer;
use crate::types::Sample;

/// Extension of page files.
const VOLUME_EXTENSION: &str = "volume";

/// Extension of the metadata file.
const METADATA_EXTENSION: &str = "tephra";

/// Metadata format version.
const METADATA_VERSION: u32 = 1;

/// One page file plus its mapping and staging sequencer.
pub struct Volume {
    /// Current backing file path; moves to `<path>.tmp` after a
    /// safe-realloc.
    path: Mutex<PathBuf>,
    /// The mapped page.
    page: RwLock<Page>,
    /// Staging sequencer; swapped between volumes during rotation.
    sequencer: Mutex<Arc<Sequencer>>,
    /// Set once the volume only exists for in-flight readers; the
    /// backing file is unlinked when the last handle drops.
    is_temporary: AtomicBool,
}

impl Volume {
    /// Creates a page file of exactly `page_size` bytes and formats it.
    pub fn create(
        path: &Path,
        page_id: u32,
        page_size: u64,
        config: &StorageConfig,
    ) -> Result<Arc<Self>> {
        if page_size > MAX_PAGE_SIZE {
            return Err(TephraError::BadArg("page size above the 4 GiB limit"));
        }
        if page_size < PAGE_HEADER_SIZE as u64 + 64 {
            return Err(TephraError::BadArg("page size below the header size"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(page_size)?;
        let map = Self::map(&file, config)?;
        let page = Page::format(map, page_id);
        page.flush()?;
        debug!(path = %path.display(), page_id, page_size, "volume created");
        Ok(Arc::new(Self {
            path: Mutex::new(path.to_path_buf()),
            page: RwLock::new(page),
            sequencer: Mutex::new(Arc::new(Sequencer::new(config))),
            is_temporary: AtomicBool::new(false),
        }))
    }

    /// Maps an existing page file and validates its header.
    pub fn open(path: &Path, config: &StorageConfig) -> Result<Arc<Self>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let map = Self::map(&file, config)?;
        let page = Page::open(map)?;
        Ok(Arc::new(Self {
            path: Mutex::new(path.to_path_buf()),
            page: RwLock::new(page),
            sequencer: Mutex::new(Arc::new(Sequencer::new(config))),
            is_temporary: AtomicBool::new(false),
        }))
    }

    fn map(file: &File, config: &StorageConfig) -> Result<MmapMut> {
        let mut options = MmapOptions::new();
        #[cfg(target_os = "linux")]
        if config.enable_huge_tlb {
            options.huge(None);
        }
        #[cfg(not(target_os = "linux"))]
        let _ = config.enable_huge_tlb;
        // Safety contract of file-backed maps: the file is owned by
        // this process and never truncated while mapped.
        let map = unsafe { options.map_mut(file)? };
        Ok(map)
    }

    /// Shared read access to the page.
    pub fn page(&self) -> &RwLock<Page> {
        &self.page
    }

    /// The sequencer currently attached to this volume.
    pub fn sequencer(&self) -> Arc<Sequencer> {
        Arc::clone(&self.sequencer.lock())
    }

    /// Exchanges the sequencers of two volumes, so pending staged data
    /// follows the write cursor during rotation.
    fn swap_sequencer(&self, other: &Volume) {
        let mut mine = self.sequencer.lock();
        let mut theirs = other.sequencer.lock();
        std::mem::swap(&mut *mine, &mut *theirs);
    }

    /// Renames this volume's file to `<path>.tmp` and creates a fresh
    /// page file at the original path inheriting the page identity.
    ///
    /// The old volume keeps serving readers from the renamed file and
    /// unlinks it when the last handle drops.
    pub fn safe_realloc(self: &Arc<Self>, config: &StorageConfig) -> Result<Arc<Volume>> {
        let (page_id, open_count, close_count, length) = {
            let page = self.page.read();
            (
                page.page_id(),
                page.open_count(),
                page.close_count(),
                page.length(),
            )
        };
        let old_path = self.path.lock().clone();
        let mut tmp_name = old_path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        fs::rename(&old_path, &tmp_path)?;
        *self.path.lock() = tmp_path;
        self.is_temporary.store(true, Ordering::Release);

        let replacement = Volume::create(&old_path, page_id, length, config)?;
        {
            let mut page = replacement.page.write();
            page.set_open_count(open_count);
            page.set_close_count(close_count);
            page.flush()?;
        }
        info!(page_id, open_count, close_count, "volume reallocated");
        Ok(replacement)
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        if self.is_temporary.load(Ordering::Acquire) {
            let path = self.path.lock().clone();
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), %err, "failed to unlink temporary volume");
            }
        }
    }
}

/// Aggregate statistics over the ring.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageStats {
    /// Bytes occupied by entries and the index across all pages.
    pub used_space: u64,
    /// Free bytes across all pages.
    pub free_space: u64,
    /// Published entries across all pages.
    pub n_entries: u64,
    /// Number of volumes in the ring.
    pub n_volumes: u32,
}

/// The storage facade: a ring of volumes, one writer, many readers.
pub struct Storage {
    config: StorageConfig,
    metadata_path: PathBuf,
    volumes: RwLock<Vec<Arc<Volume>>>,
    active_index: AtomicUsize,
    cache: Arc<ChunkCache>,
    observer: Arc<dyn SearchObserver>,
}

impl Storage {
    /// Creates a new storage: `num_pages` page files under
    /// `volumes_dir` plus the metadata file under `metadata_dir`.
    ///
    /// Returns the metadata file path, which [`Storage::open`] takes.
    pub fn create(
        name: &str,
        metadata_dir: &Path,
        volumes_dir: &Path,
        num_pages: u32,
        page_size: u64,
        config: &StorageConfig,
    ) -> Result<PathBuf> {
        if num_pages == 0 {
            return Err(TephraError::BadArg("storage needs at least one page"));
        }
        fs::create_dir_all(metadata_dir)?;
        fs::create_dir_all(volumes_dir)?;
        let volumes_dir = volumes_dir.canonicalize()?;
        let metadata_dir = metadata_dir.canonicalize()?;

        let mut volume_paths = Vec::with_capacity(num_pages as usize);
        for ix in 0..num_pages {
            let path = volumes_dir.join(format!("{}_{}.{}", name, ix, VOLUME_EXTENSION));
            let volume = Volume::create(&path, ix, page_size, config)?;
            if ix == 0 {
                // The first page starts the ring open for writing.
                let mut page = volume.page.write();
                page.reuse();
                page.flush()?;
            }
            volume_paths.push(path);
        }

        let metadata_path = metadata_dir.join(format!("{}.{}", name, METADATA_EXTENSION));
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut contents = String::new();
        contents.push_str(&format!("version={}\n", METADATA_VERSION));
        contents.push_str(&format!("created={}\n", created));
        contents.push_str(&format!("volumes={}\n", num_pages));
        for (ix, path) in volume_paths.iter().enumerate() {
            contents.push_str(&format!("volume={},{}\n", ix, path.display()));
        }
        fs::write(&metadata_path, contents)?;
        info!(name, num_pages, page_size, "storage created");
        Ok(metadata_path)
    }

    /// Opens an existing storage from its metadata file.
    ///
    /// Selects the active volume, completes an interrupted rotation if
    /// one is detected, and discards the active page's unsynced tail.
    pub fn open(metadata_path: &Path, config: StorageConfig) -> Result<Self> {
        let volume_paths = Self::read_metadata(metadata_path)?;
        let mut volumes = Vec::with_capacity(volume_paths.len());
        for path in &volume_paths {
            volumes.push(Volume::open(path, &config)?);
        }

        // The volume with the largest open count is active; ties go to
        // the largest index.
        let mut active_index = 0usize;
        let mut max_open = -1i64;
        for (ix, volume) in volumes.iter().enumerate() {
            let open_count = i64::from(volume.page.read().open_count());
            if open_count >= max_open {
                max_open = open_count;
                active_index = ix;
            }
        }

        let cache = Arc::new(ChunkCache::new(config.max_cache_size));
        let storage = Self {
            config,
            metadata_path: metadata_path.to_path_buf(),
            volumes: RwLock::new(volumes),
            active_index: AtomicUsize::new(active_index),
            cache,
            observer: Arc::new(NullSearchObserver),
        };

        let interrupted = {
            let volumes = storage.volumes.read();
            let page = volumes[active_index].page.read();
            page.open_count() == page.close_count()
        };
        if interrupted {
            // The process died between close() and reuse(); finish the
            // rotation now.
            warn!(active_index, "interrupted rotation detected, completing it");
            storage.advance(active_index)?;
        }

        {
            let volumes = storage.volumes.read();
            let active = &volumes[storage.active_index.load(Ordering::Acquire)];
            let mut page = active.page.write();
            if page.restore() {
                page.flush()?;
            }
        }
        info!(path = %metadata_path.display(), "storage opened");
        Ok(storage)
    }

    fn read_metadata(metadata_path: &Path) -> Result<Vec<PathBuf>> {
        let contents = fs::read_to_string(metadata_path)?;
        let mut declared: Option<usize> = None;
        let mut rows: Vec<(usize, PathBuf)> = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| TephraError::BadData(format!("metadata row `{}`", line)))?;
            match key {
                "version" => {
                    let version: u32 = value
                        .parse()
                        .map_err(|_| TephraError::BadData("metadata version".to_string()))?;
                    if version != METADATA_VERSION {
                        return Err(TephraError::BadData(format!(
                            "unsupported metadata version {}",
                            version
                        )));
                    }
                }
                "created" => {}
                "volumes" => {
                    declared = value.parse().ok();
                }
                "volume" => {
                    let (ix, path) = value.split_once(',').ok_or_else(|| {
                        TephraError::BadData(format!("volume row `{}`", value))
                    })?;
                    let ix: usize = ix
                        .parse()
                        .map_err(|_| TephraError::BadData("volume index".to_string()))?;
                    rows.push((ix, PathBuf::from(path)));
                }
                other => {
                    warn!(key = other, "ignoring unknown metadata key");
                }
            }
        }
        let count = declared.ok_or_else(|| TephraError::BadData("missing volume count".to_string()))?;
        if count == 0 || rows.len() != count {
            return Err(TephraError::BadData("volume rows do not match count".to_string()));
        }
        let mut paths: Vec<Option<PathBuf>> = vec![None; count];
        for (ix, path) in rows {
            if ix >= count || paths[ix].is_some() {
                return Err(TephraError::BadData(format!("bad volume index {}", ix)));
            }
            paths[ix] = Some(path);
        }
        Ok(paths.into_iter().map(|p| p.unwrap()).collect())
    }

    /// Installs a search-statistics observer.
    pub fn set_search_observer(&mut self, observer: Arc<dyn SearchObserver>) {
        self.observer = observer;
    }

    /// Path of the metadata file this storage was opened from.
    pub fn metadata_path(&self) -> &Path {
        &self.metadata_path
    }

    /// Index of the volume currently open for writing.
    pub fn active_volume_index(&self) -> usize {
        self.active_index.load(Ordering::Acquire)
    }

    /// `(open_count, close_count)` of the volume at `index`.
    pub fn volume_counters(&self, index: usize) -> (u32, u32) {
        let volumes = self.volumes.read();
        let page = volumes[index].page().read();
        (page.open_count(), page.close_count())
    }

    fn active_volume(&self) -> (usize, Arc<Volume>) {
        let volumes = self.volumes.read();
        let ix = self.active_index.load(Ordering::Acquire);
        (ix, Arc::clone(&volumes[ix]))
    }

    /// Appends one sample. This is the single-writer entry point.
    ///
    /// Odd flush tokens trigger the inline flusher; a full page
    /// rotates the ring and the staged data follows the new cursor.
    ///
    /// # Errors
    ///
    /// `LateWrite` surfaces to the caller; `Overflow` is recovered by
    /// rotation and never escapes.
    pub fn write(&self, sample: Sample) -> Result<()> {
        let (local_rev, active) = self.active_volume();
        let sequencer = active.sequencer();
        let token = sequencer.add(sample)?;
        if token % 2 == 1 {
            let flushed = {
                let mut page = active.page.write();
                sequencer.merge_and_compress(&mut page, false)
            };
            match flushed {
                Ok(()) => match self.config.durability {
                    Durability::Max => active.page.read().flush()?,
                    Durability::Tradeoff => {
                        if token % 8 == 1 {
                            active.page.read().flush()?;
                        }
                    }
                    Durability::Speed => {}
                },
                Err(TephraError::Overflow) => {
                    // The staged data is retained in memory and flushes
                    // into the fresh page at the next checkpoint.
                    self.advance(local_rev)?;
                }
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// Rotates the ring if `current_rev` is still the active index.
    ///
    /// The revision guard makes concurrent callers rotate exactly
    /// once; losers observe the new index and return.
    pub fn advance(&self, current_rev: usize) -> Result<()> {
        let mut volumes = self.volumes.write();
        if current_rev != self.active_index.load(Ordering::Acquire) {
            // Another caller already rotated.
            return Ok(());
        }
        let ring_size = volumes.len();
        let outgoing = Arc::clone(&volumes[current_rev]);
        {
            let mut page = outgoing.page.write();
            page.close();
            page.flush()?;
            info!(
                page_id = page.page_id(),
                open_count = page.open_count(),
                close_count = page.close_count(),
                "closing active volume"
            );
        }

        let next_index = (current_rev + 1) % ring_size;
        let successor = Arc::clone(&volumes[next_index]);
        let replacement = successor.safe_realloc(&self.config)?;

        // Pending staged data follows the write cursor.
        replacement.swap_sequencer(&outgoing);

        {
            let mut page = replacement.page.write();
            page.reuse();
            page.flush()?;
            info!(
                page_id = page.page_id(),
                open_count = page.open_count(),
                "next volume opened"
            );
        }
        volumes[next_index] = replacement;
        self.active_index.store(next_index, Ordering::Release);
        Ok(())
    }

    /// Runs a range query over the whole storage.
    ///
    /// Volumes are visited in age order: forward scans go oldest
    /// first, backward scans newest first. Each volume contributes its
    /// on-disk chunks and its unflushed staged runs; the staged scan
    /// is validated against the generation observed beforehand and a
    /// racing flush surfaces as `Busy` (the caller retries).
    pub fn search(&self, query: &Query, sink: &mut dyn SampleSink) -> Result<()> {
        if query.range.is_invalid() {
            return Err(TephraError::BadArg("query range inverted"));
        }
        let volumes: Vec<Arc<Volume>> = self.volumes.read().clone();
        let ring_size = volumes.len();
        let active = self.active_index.load(Ordering::Acquire);

        if !query.range.is_backward() {
            for step in 1..=ring_size {
                let volume = &volumes[(active + step) % ring_size];
                {
                    let page = volume.page.read();
                    page.search(query, Some(self.cache.as_ref()), self.observer.as_ref(), sink)?;
                }
                let sequencer = volume.sequencer();
                let (_, generation) = sequencer.get_window();
                sequencer.search(query, generation, sink)?;
            }
        } else {
            for step in 0..ring_size {
                let volume = &volumes[(active + ring_size - step) % ring_size];
                let sequencer = volume.sequencer();
                let (_, generation) = sequencer.get_window();
                sequencer.search(query, generation, sink)?;
                {
                    let page = volume.page.read();
                    page.search(query, Some(self.cache.as_ref()), self.observer.as_ref(), sink)?;
                }
            }
        }
        Ok(())
    }

    /// Flushes all staged data and closes the storage.
    pub fn close(&self) -> Result<()> {
        let (_, active) = self.active_volume();
        let sequencer = active.sequencer();
        {
            let mut page = active.page.write();
            sequencer.close(&mut page)?;
        }
        active.page.read().flush()?;
        info!("storage closed");
        Ok(())
    }

    /// Aggregate usage statistics over all volumes.
    pub fn stats(&self) -> StorageStats {
        let volumes = self.volumes.read();
        let mut stats = StorageStats {
            n_volumes: volumes.len() as u32,
            ..Default::default()
        };
        for volume in volumes.iter() {
            let page = volume.page.read();
            let free = page.get_free_space();
            let payload = page.length() - PAGE_HEADER_SIZE as u64;
            stats.free_space += free;
            stats.used_space += payload - free;
            stats.n_entries += u64::from(page.sync_count());
        }
        stats
    }
}
