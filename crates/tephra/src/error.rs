//! Error and Result types for Tephra storage operations.

use std::io;
use thiserror::Error;

use crate::types::Timestamp;

/// A convenience `Result` type for Tephra operations.
pub type Result<T> = std::result::Result<T, TephraError>;

/// The error type for storage operations.
#[derive(Debug, Error)]
pub enum TephraError {
    /// Write rejected because its timestamp fell behind the lateness window.
    #[error("late write: timestamp {timestamp} is more than {window} behind the stream head")]
    LateWrite {
        /// Timestamp of the rejected sample.
        timestamp: Timestamp,
        /// Configured lateness window in nanoseconds.
        window: u64,
    },

    /// A concurrent flush raced the operation; the caller may retry.
    #[error("storage busy, a flush is in progress")]
    Busy,

    /// The target page has no room for the data.
    #[error("page overflow")]
    Overflow,

    /// Nothing to merge or read.
    #[error("no data")]
    NoData,

    /// Requested item was not found.
    #[error("not found")]
    NotFound,

    /// Invalid argument supplied by the caller.
    #[error("bad argument: {0}")]
    BadArg(&'static str),

    /// Malformed or truncated on-disk data.
    #[error("bad data: {0}")]
    BadData(String),

    /// Query could not be parsed or validated.
    #[error("query parsing error: {0}")]
    QueryParsing(String),

    /// Feature is not implemented.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// Operation requires a merge to run first.
    #[error("merge required")]
    MergeRequired,

    /// Memory allocation or mapping failed.
    #[error("out of memory")]
    NoMem,

    /// Unclassified internal failure.
    #[error("internal error: {0}")]
    General(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Stable integer status codes for embedding APIs and diagnostics.
///
/// The numbering is part of the external interface and must not change
/// between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// Operation completed.
    Success = 0,
    /// Nothing to merge or read.
    NoData = 1,
    /// Memory allocation or mapping failed.
    NoMem = 2,
    /// A concurrent flush raced the operation.
    Busy = 3,
    /// Requested item was not found.
    NotFound = 4,
    /// Invalid argument supplied by the caller.
    BadArg = 5,
    /// The target page has no room for the data.
    Overflow = 6,
    /// Malformed or truncated on-disk data.
    BadData = 7,
    /// Unclassified internal failure.
    General = 8,
    /// Write rejected as too late.
    LateWrite = 9,
    /// Feature is not implemented.
    NotImplemented = 10,
    /// Query could not be parsed.
    QueryParsingError = 11,
    /// Operation requires a merge to run first.
    MergeRequired = 12,
}

impl TephraError {
    /// Returns the stable status code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            TephraError::LateWrite { .. } => ErrorCode::LateWrite,
            TephraError::Busy => ErrorCode::Busy,
            TephraError::Overflow => ErrorCode::Overflow,
            TephraError::NoData => ErrorCode::NoData,
            TephraError::NotFound => ErrorCode::NotFound,
            TephraError::BadArg(_) => ErrorCode::BadArg,
            TephraError::BadData(_) => ErrorCode::BadData,
            TephraError::QueryParsing(_) => ErrorCode::QueryParsingError,
            TephraError::NotImplemented(_) => ErrorCode::NotImplemented,
            TephraError::MergeRequired => ErrorCode::MergeRequired,
            TephraError::NoMem => ErrorCode::NoMem,
            TephraError::General(_) => ErrorCode::General,
            TephraError::Io(_) => ErrorCode::General,
        }
    }
}
