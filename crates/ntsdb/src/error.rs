//! Error and Result types for store operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for store operations.
pub type Result<T> = std::result::Result<T, NtsError>;

/// The error type for store operations.
#[derive(Debug, Error)]
pub enum NtsError {
    /// The catalog database could not be opened.
    #[error("Unable to open catalog database: {0}")]
    CantOpen(String),

    /// The catalog schema could not be created or versioned.
    #[error("Catalog schema error: {0}")]
    Schema(String),

    /// The data file header carries a block size outside [4096, 2^30].
    #[error("Invalid block size in file header: {0}")]
    InvalidBlockSize(u32),

    /// No free block is available and reclamation was disabled or exhausted.
    #[error("Unable to get free block")]
    NoFreeBlocks,

    /// A write context is already active for this stream tag.
    #[error("Only one active write context per stream tag: {0:?}")]
    DuplicateStreamTag(String),

    /// The catalog insert into `segments` failed.
    #[error("Unable to create segment")]
    UnableToCreateSegment(#[source] rusqlite::Error),

    /// The catalog insert into `segment_blocks` failed.
    #[error("Unable to create segment block")]
    UnableToCreateSegmentBlock(#[source] rusqlite::Error),

    /// Write with a timestamp at or below the previous one on the stream.
    #[error("Non-monotonic timestamp: {timestamp} is not after {last}")]
    NonMonotonicTimestamp {
        /// Timestamp passed to the rejected write.
        timestamp: i64,
        /// Last timestamp accepted on the stream.
        last: i64,
    },

    /// The frame would not fit even in a fresh block.
    #[error("Frame of {size} bytes does not fit in a block (max {max}); use a larger block size")]
    RowSizeTooBig {
        /// Payload size of the rejected frame.
        size: usize,
        /// Largest payload a fresh block can hold.
        max: usize,
    },

    /// Preallocation of the data file failed.
    #[error("Unable to allocate data file")]
    UnableToAllocateFile(#[source] io::Error),

    /// Null or empty required argument at the API boundary.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error surfaced by the catalog engine.
    #[error("Catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),
}
