//! Bidirectional iterator over one stream's frames.
//!
//! The cursor is a `(segment_id, sequence, frame_idx)` triple. Navigation
//! walks blocks in `(segments.id, sequence)` order through the catalog and
//! keeps every visited block's metadata and mapping in an in-process cache,
//! so stepping within a block touches no catalog state at all.
//!
//! A boundary overrun in either direction invalidates the iterator; only
//! [`NtsIterator::reset`] and [`NtsIterator::find`] make it valid again.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::Ordering;

use crate::block::mmap::{MapAdvice, Region};
use crate::block::{
    block_offset, catalog_path, lower_bound_index, validate_frame, FileHeader, IndexEntry,
    FILE_HEADER_SIZE, FRAME_HEADER_SIZE, VALID_COUNTER_OFFSET,
};
use crate::catalog::{BlockRef, Catalog};
use crate::error::Result;
use crate::reader::Frame;

/// Cursor position within the stream.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    segment_id: i64,
    sequence: i64,
    frame_idx: usize,
}

/// A visited block: catalog metadata plus its lazily created mapping and
/// the frame count published at load time.
struct CachedBlock {
    info: BlockRef,
    region: Option<Region>,
    n_valid: usize,
}

/// Location of the frame under the cursor within its block.
#[derive(Debug, Clone, Copy)]
struct CurrentFrame {
    timestamp: i64,
    flags: u8,
    offset: u64,
    size: u32,
}

/// A seekable, bidirectional cursor over one stream.
pub struct NtsIterator {
    stream_tag: String,
    file: File,
    block_size: u32,
    catalog: Catalog,
    cache: HashMap<(i64, i64), CachedBlock>,
    cursor: Option<Cursor>,
    current: Option<CurrentFrame>,
}

impl NtsIterator {
    /// Opens an iterator positioned on the first frame of `stream_tag`.
    ///
    /// The iterator starts invalid if the stream has no frames.
    pub fn new(path: impl AsRef<Path>, stream_tag: &str) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let header = Region::map_ro(&file, 0, FILE_HEADER_SIZE)?;
        let header = FileHeader::decode(header.bytes())?;
        let catalog = Catalog::open_ro(&catalog_path(path))?;

        let mut iter = Self {
            stream_tag: stream_tag.to_string(),
            file,
            block_size: header.block_size,
            catalog,
            cache: HashMap::new(),
            cursor: None,
            current: None,
        };
        iter.reset()?;
        Ok(iter)
    }

    /// Returns true when the cursor rests on a frame.
    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// The frame under the cursor.
    pub fn current(&self) -> Option<Frame<'_>> {
        let cursor = self.cursor?;
        let frame = self.current?;
        let block = self.cache.get(&(cursor.segment_id, cursor.sequence))?;
        let region = block.region.as_ref()?;
        let bytes = region.bytes();
        let payload = frame.offset as usize + FRAME_HEADER_SIZE;
        Some(Frame {
            data: &bytes[payload..payload + frame.size as usize],
            flags: frame.flags,
            timestamp: frame.timestamp,
            block_sequence: cursor.sequence,
            metadata: &block.info.metadata,
        })
    }

    /// Metadata of the segment owning the cursor's block.
    pub fn current_metadata(&self) -> Option<&str> {
        let cursor = self.cursor?;
        self.cache
            .get(&(cursor.segment_id, cursor.sequence))
            .map(|block| block.info.metadata.as_str())
    }

    /// Sequence of the cursor's block within its segment.
    pub fn current_block_sequence(&self) -> Option<i64> {
        self.cursor.map(|cursor| cursor.sequence)
    }

    /// Moves to the first frame of the stream.
    pub fn reset(&mut self) -> Result<bool> {
        let Some((segment_id, sequence)) = self.catalog.first_block(&self.stream_tag)? else {
            return Ok(self.invalidate());
        };
        self.cursor = Some(Cursor {
            segment_id,
            sequence,
            frame_idx: 0,
        });
        self.load_current_frame()
    }

    /// Advances to the next frame, crossing into the next block or segment
    /// as needed. Past the last frame the iterator becomes invalid.
    pub fn next(&mut self) -> Result<bool> {
        if self.current.is_none() {
            return Ok(false);
        }
        let Some(mut cursor) = self.cursor else {
            return Ok(false);
        };
        let Some(n_valid) = self.loaded_len(cursor.segment_id, cursor.sequence) else {
            return Ok(self.invalidate());
        };

        cursor.frame_idx += 1;
        if cursor.frame_idx >= n_valid {
            match self
                .catalog
                .next_block(&self.stream_tag, cursor.segment_id, cursor.sequence)?
            {
                Some((segment_id, sequence)) => {
                    cursor = Cursor {
                        segment_id,
                        sequence,
                        frame_idx: 0,
                    };
                }
                None => return Ok(self.invalidate()),
            }
        }
        self.cursor = Some(cursor);
        self.load_current_frame()
    }

    /// Steps back to the previous frame, crossing into the previous block
    /// or segment as needed. Before the first frame the iterator becomes
    /// invalid.
    pub fn prev(&mut self) -> Result<bool> {
        if self.current.is_none() {
            return Ok(false);
        }
        let Some(mut cursor) = self.cursor else {
            return Ok(false);
        };

        if cursor.frame_idx > 0 {
            cursor.frame_idx -= 1;
        } else {
            match self
                .catalog
                .prev_block(&self.stream_tag, cursor.segment_id, cursor.sequence)?
            {
                Some((segment_id, sequence)) => {
                    let Some(n_valid) = self.load_block(segment_id, sequence)? else {
                        return Ok(self.invalidate());
                    };
                    cursor = Cursor {
                        segment_id,
                        sequence,
                        frame_idx: n_valid.saturating_sub(1),
                    };
                }
                None => return Ok(self.invalidate()),
            }
        }
        self.cursor = Some(cursor);
        self.load_current_frame()
    }

    /// Seeks to the first frame with `timestamp >= timestamp`.
    ///
    /// Prefers a block whose range contains the timestamp (unfinalized
    /// blocks are open-ended), else the first block starting after it; a
    /// seek past the end of the stream invalidates the iterator.
    pub fn find(&mut self, timestamp: i64) -> Result<bool> {
        let Some((segment_id, sequence)) = self
            .catalog
            .block_for_timestamp(&self.stream_tag, timestamp)?
        else {
            return Ok(self.invalidate());
        };
        let Some(n_valid) = self.load_block(segment_id, sequence)? else {
            return Ok(self.invalidate());
        };

        let frame_idx = match self.lower_bound(segment_id, sequence, timestamp) {
            Some(position) => position,
            None => return Ok(self.invalidate()),
        };

        let mut cursor = Cursor {
            segment_id,
            sequence,
            frame_idx,
        };
        if frame_idx >= n_valid {
            // The timestamp falls past this block's last entry.
            match self.catalog.next_block(&self.stream_tag, segment_id, sequence)? {
                Some((segment_id, sequence)) => {
                    cursor = Cursor {
                        segment_id,
                        sequence,
                        frame_idx: 0,
                    };
                }
                None => return Ok(self.invalidate()),
            }
        }
        self.cursor = Some(cursor);
        self.load_current_frame()
    }

    fn invalidate(&mut self) -> bool {
        self.current = None;
        false
    }

    /// Ensures the block is cached and mapped, returning its published
    /// frame count. `None` when the block vanished from the catalog.
    fn load_block(&mut self, segment_id: i64, sequence: i64) -> Result<Option<usize>> {
        let key = (segment_id, sequence);
        if !self.cache.contains_key(&key) {
            match self.catalog.block_by_key(segment_id, sequence)? {
                Some(info) => {
                    self.cache.insert(
                        key,
                        CachedBlock {
                            info,
                            region: None,
                            n_valid: 0,
                        },
                    );
                }
                None => return Ok(None),
            }
        }
        let Some(block) = self.cache.get_mut(&key) else {
            return Ok(None);
        };
        if block.region.is_none() {
            let region = Region::map_ro(
                &self.file,
                block_offset(block.info.block_idx, self.block_size),
                self.block_size as usize,
            )?;
            region.advise(MapAdvice::Random)?;
            block.n_valid = region
                .atomic_u32(VALID_COUNTER_OFFSET)
                .load(Ordering::Acquire) as usize;
            block.region = Some(region);
        }
        Ok(Some(block.n_valid))
    }

    fn loaded_len(&self, segment_id: i64, sequence: i64) -> Option<usize> {
        self.cache
            .get(&(segment_id, sequence))
            .filter(|block| block.region.is_some())
            .map(|block| block.n_valid)
    }

    fn lower_bound(&self, segment_id: i64, sequence: i64, timestamp: i64) -> Option<usize> {
        let block = self.cache.get(&(segment_id, sequence))?;
        let region = block.region.as_ref()?;
        Some(lower_bound_index(region.bytes(), block.n_valid, timestamp))
    }

    /// Reads the frame under the cursor, validating it against the block's
    /// incarnation uuid. Any failure invalidates the iterator.
    fn load_current_frame(&mut self) -> Result<bool> {
        let Some(cursor) = self.cursor else {
            return Ok(self.invalidate());
        };
        let Some(n_valid) = self.load_block(cursor.segment_id, cursor.sequence)? else {
            return Ok(self.invalidate());
        };
        if cursor.frame_idx >= n_valid {
            return Ok(self.invalidate());
        }
        let Some(block) = self.cache.get(&(cursor.segment_id, cursor.sequence)) else {
            return Ok(self.invalidate());
        };
        let Some(region) = block.region.as_ref() else {
            return Ok(self.invalidate());
        };
        let bytes = region.bytes();
        let entry = IndexEntry::read(bytes, cursor.frame_idx);
        let Some(header) = validate_frame(bytes, entry.offset, block.info.uuid.as_bytes()) else {
            return Ok(self.invalidate());
        };
        self.current = Some(CurrentFrame {
            timestamp: entry.timestamp,
            flags: header.flags,
            offset: entry.offset,
            size: header.size,
        });
        Ok(true)
    }
}
