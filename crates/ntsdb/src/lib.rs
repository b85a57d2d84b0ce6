//! ntsdb - Single-file, append-only, per-stream time series block store
//!
//! A store is one preallocated data file holding a fixed population of
//! fixed-size blocks, shared by any number of logical streams, plus a
//! SQLite side-car catalog that maps streams to the blocks they occupy.
//! Each record (a "frame") is an opaque byte payload tagged with a strictly
//! monotonic `i64` timestamp and a `u8` flag byte.
//!
//! # Components
//!
//! - [`NtsWriter`] / [`WriteContext`]: per-stream appends with block
//!   rollover and oldest-first reclamation
//! - [`NtsReader`]: callback range scans and catalog queries
//! - [`NtsIterator`]: bidirectional, seekable cursor over one stream
//!
//! # Example
//!
//! ```rust,ignore
//! use ntsdb::{NtsWriter, NtsIterator};
//!
//! NtsWriter::allocate("metrics.nts", 1024 * 1024, 64)?;
//!
//! let writer = NtsWriter::open("metrics.nts", true)?;
//! let mut ctx = writer.create_write_context("cpu", "host=server1")?;
//! writer.write(&mut ctx, b"sample", 1000, 0)?;
//! drop(ctx);
//!
//! let mut iter = NtsIterator::new("metrics.nts", "cpu")?;
//! while iter.valid() {
//!     let frame = iter.current().unwrap();
//!     println!("{} {:?}", frame.timestamp, frame.data);
//!     iter.next()?;
//! }
//! ```
//!
//! Readers and the writer synchronize through a single atomic publish
//! counter per block; a partially written block is always readable, and a
//! crashed writer's last block is repaired by a recovery scan at the next
//! writer open.

#![deny(missing_docs)]

pub mod block;
pub mod catalog;
pub mod error;
pub mod iter;
pub mod reader;
pub mod writer;

pub use catalog::ContiguousSegment;
pub use error::{NtsError, Result};
pub use iter::NtsIterator;
pub use reader::{Frame, NtsReader};
pub use writer::{NtsWriter, WriteContext};
