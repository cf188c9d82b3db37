//! Tephra - embedded time-series storage core.
//!
//! This crate provides the storage primitives behind the Tephra time
//! series database: a bounded-lateness in-memory sequencer, a column
//! chunk codec, fixed-size memory-mapped pages with an embedded chunk
//! index, and a round-robin ring of volumes.
//!
//! # Components
//!
//! - [`Sequencer`]: in-memory staging with a sliding lateness window
//!   and k-way merge
//! - [`Page`]: append-only chunk store with interpolation search
//! - [`Storage`]: the volume ring and single-writer facade
//! - [`codec`]: delta/zig-zag/RLE/Base-128 column codec
//! - [`ChunkCache`]: byte-budgeted FIFO cache of decoded chunks
//!
//! # Example
//!
//! ```rust,ignore
//! use tephra::{Query, QueryRange, Sample, Storage, StorageConfig, VecSink};
//!
//! // Create a storage with two 64 MiB pages.
//! let config = StorageConfig::default();
//! let meta = Storage::create("metrics", meta_dir, vol_dir, 2, 64 << 20, &config)?;
//! let storage = Storage::open(&meta, config)?;
//!
//! // One writer thread appends samples.
//! storage.write(Sample::new(series_id, now_ns, 0.75))?;
//!
//! // Readers issue range queries; BUSY means a flush raced the scan
//! // and the query should be retried.
//! let mut sink = VecSink::default();
//! storage.search(&Query::new(QueryRange::forward(t0, t1)), &mut sink)?;
//! ```

#![deny(missing_docs)]

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod page;
pub mod query;
pub mod search;
pub mod sequencer;
pub mod types;
pub mod volume;

pub use cache::{ChunkCache, ChunkKey};
pub use config::{Durability, StorageConfig};
pub use error::{ErrorCode, Result, TephraError};
pub use page::Page;
pub use query::{IdFilter, Query, SampleSink, VecSink};
pub use search::{NullSearchObserver, SearchObserver};
pub use sequencer::Sequencer;
pub use types::{ParamId, QueryRange, Sample, ScanDirection, Timestamp};
pub use volume::{Storage, StorageStats, Volume};
