//! Callback reader over a stream's frames.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::Ordering;

use crate::block::mmap::{MapAdvice, Region};
use crate::block::{
    block_offset, catalog_path, lower_bound_index, validate_frame, FileHeader, IndexEntry,
    FILE_HEADER_SIZE, FRAME_HEADER_SIZE, VALID_COUNTER_OFFSET,
};
use crate::catalog::{Catalog, ContiguousSegment};
use crate::error::Result;

/// One frame as seen by a reader or iterator. Borrows the mapped block.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    /// Opaque payload bytes.
    pub data: &'a [u8],
    /// User flag byte from the frame header.
    pub flags: u8,
    /// Frame timestamp.
    pub timestamp: i64,
    /// Sequence of the owning block within its segment.
    pub block_sequence: i64,
    /// Metadata of the owning segment.
    pub metadata: &'a str,
}

/// A read-only view of a store.
pub struct NtsReader {
    file: File,
    block_size: u32,
    catalog: Catalog,
}

impl NtsReader {
    /// Opens a store for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let header = Region::map_ro(&file, 0, FILE_HEADER_SIZE)?;
        let header = FileHeader::decode(header.bytes())?;
        let catalog = Catalog::open_ro(&catalog_path(path))?;
        Ok(Self {
            file,
            block_size: header.block_size,
            catalog,
        })
    }

    /// Streams every frame of `stream_tag` in
    /// `[start_timestamp, end_timestamp]` to `callback`, in order.
    ///
    /// The first overlapping block with published entries is entered at
    /// the lower bound of `start_timestamp`; subsequent blocks are read
    /// from their first entry. Index entries whose frame does not carry
    /// the block's current incarnation uuid are skipped.
    pub fn read(
        &self,
        stream_tag: &str,
        start_timestamp: i64,
        end_timestamp: i64,
        mut callback: impl FnMut(Frame<'_>),
    ) -> Result<()> {
        let blocks =
            self.catalog
                .overlapping_blocks(stream_tag, start_timestamp, end_timestamp)?;

        let mut need_lower_bound = true;
        for block in blocks {
            let region = Region::map_ro(
                &self.file,
                block_offset(block.block_idx, self.block_size),
                self.block_size as usize,
            )?;
            region.advise(MapAdvice::Sequential)?;
            let n_valid = region
                .atomic_u32(VALID_COUNTER_OFFSET)
                .load(Ordering::Acquire) as usize;
            let bytes = region.bytes();

            // The lower bound is spent only on a block that actually has
            // published entries; an empty unfinalized block must not eat it.
            let start = if need_lower_bound {
                if n_valid > 0 {
                    need_lower_bound = false;
                }
                lower_bound_index(bytes, n_valid, start_timestamp)
            } else {
                0
            };

            for i in start..n_valid {
                let entry = IndexEntry::read(bytes, i);
                if entry.timestamp > end_timestamp {
                    return Ok(());
                }
                let Some(header) = validate_frame(bytes, entry.offset, block.uuid.as_bytes())
                else {
                    // Stale bytes from a previous incarnation.
                    continue;
                };
                let payload = entry.offset as usize + FRAME_HEADER_SIZE;
                callback(Frame {
                    data: &bytes[payload..payload + header.size as usize],
                    flags: header.flags,
                    timestamp: entry.timestamp,
                    block_sequence: block.sequence,
                    metadata: &block.metadata,
                });
            }
        }
        Ok(())
    }

    /// Distinct stream tags with data overlapping the range.
    pub fn query_stream_tags(
        &self,
        start_timestamp: i64,
        end_timestamp: i64,
    ) -> Result<Vec<String>> {
        self.catalog
            .stream_tags_in_range(start_timestamp, end_timestamp)
    }

    /// Gap-free sequence runs of `stream_tag` overlapping the range, one
    /// `(segment_id, start, end)` triple per run.
    pub fn query_contiguous_segments(
        &self,
        stream_tag: &str,
        start_timestamp: i64,
        end_timestamp: i64,
    ) -> Result<Vec<ContiguousSegment>> {
        self.catalog
            .contiguous_segments(stream_tag, start_timestamp, end_timestamp)
    }
}
