//! Writer, write contexts, and the block append state machine.
//!
//! A [`NtsWriter`] opens an allocated store for appending. Each stream is
//! written through a [`WriteContext`], which owns at most one active block
//! at a time and fills it back to front:
//!
//! ```text
//! Write → (acquire block? recycle) → place frame → index entry → publish
//!                                        │
//!                                        └─ no room: finalize block, loop
//! ```
//!
//! Publishing is the single release increment of the block's
//! `n_valid_indexes` counter; everything written before it (frame bytes,
//! index entry) becomes visible to readers that acquire-load the same
//! counter. Recycling a block stores 0 to the counter, zeroes the stale
//! index region, and synchronously flushes both so a crash can never
//! resurface old index entries.
//!
//! At most one write context per stream tag may exist in the process at any
//! time; a process-wide registry and a per-writer set both enforce this.

pub(crate) mod recovery;

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, error};
use uuid::Uuid;

use crate::block::mmap::Region;
use crate::block::{
    self, align_frame, block_offset, catalog_path, round_to_map_boundary, FileHeader, FrameHeader,
    IndexEntry, BLOCK_HEADER_SIZE, FILE_HEADER_SIZE, FRAME_HEADER_SIZE, INDEX_ENTRY_SIZE,
    VALID_COUNTER_OFFSET,
};
use crate::catalog::{Catalog, SegmentBlockRow, SegmentRow};
use crate::error::{NtsError, Result};

/// Stream tags with a live write context anywhere in the process.
static ACTIVE_STREAM_TAGS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

fn process_stream_tags() -> &'static Mutex<HashSet<String>> {
    ACTIVE_STREAM_TAGS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// An open store accepting appends.
#[derive(Debug)]
pub struct NtsWriter {
    file_name: PathBuf,
    _file: File,
    block_size: u32,
    n_blocks: u32,
    auto_reclaim: bool,
    active_tags: Arc<Mutex<HashSet<String>>>,
}

/// The block a write context is currently filling.
#[derive(Debug)]
struct ActiveBlock {
    row: SegmentBlockRow,
    region: Region,
    _file: File,
}

/// Per-stream append state. Dropping the context finalizes any half-filled
/// block and releases the stream tag.
#[derive(Debug)]
pub struct WriteContext {
    stream_tag: String,
    metadata: String,
    file_name: PathBuf,
    last_timestamp: Option<i64>,
    current_segment: SegmentRow,
    current: Option<ActiveBlock>,
    writer_tags: Arc<Mutex<HashSet<String>>>,
}

enum Placement {
    Written,
    /// The frame does not fit; `fresh` is set when even an empty block
    /// cannot hold it.
    Full {
        fresh: bool,
    },
}

impl NtsWriter {
    /// Creates and preallocates a store: the data file, its header, and a
    /// fresh catalog seeded with `n_blocks` free blocks.
    ///
    /// `block_size` is rounded up to a multiple of 65536. Any previous
    /// catalog at the derived path is dropped.
    pub fn allocate(path: impl AsRef<Path>, block_size: u32, n_blocks: u32) -> Result<()> {
        let path = path.as_ref();
        if n_blocks == 0 {
            return Err(NtsError::InvalidArgument("n_blocks must be positive"));
        }
        let block_size = round_to_map_boundary(block_size);
        block::allocate_data_file(path, block_size, n_blocks)?;

        let db_path = catalog_path(path);
        remove_if_exists(&db_path)?;
        remove_if_exists(&sibling(&db_path, "-wal"))?;
        remove_if_exists(&sibling(&db_path, "-shm"))?;

        let mut catalog = Catalog::open_rw(&db_path)?;
        catalog.create_schema(n_blocks)?;
        catalog.migrate()?;
        Ok(())
    }

    /// Opens an allocated store for writing and runs crash recovery on any
    /// block left unfinalized by a previous writer.
    pub fn open(path: impl AsRef<Path>, auto_reclaim: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let header = Region::map_ro(&file, 0, FILE_HEADER_SIZE)?;
        let header = FileHeader::decode(header.bytes())?;
        if !header.block_size_valid() {
            return Err(NtsError::InvalidBlockSize(header.block_size));
        }

        let mut catalog = Catalog::open_rw(&catalog_path(path))?;
        catalog.migrate()?;
        recovery::recover_unfinalized_blocks(path, header.block_size, &mut catalog)?;

        Ok(Self {
            file_name: path.to_path_buf(),
            _file: file,
            block_size: header.block_size,
            n_blocks: header.n_blocks,
            auto_reclaim,
            active_tags: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Size of every data block in bytes.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Number of data blocks in the store.
    pub fn n_blocks(&self) -> u32 {
        self.n_blocks
    }

    /// Opens a write context for one stream.
    ///
    /// Fails with [`NtsError::DuplicateStreamTag`] if any context for
    /// `stream_tag` is already live in this process. `metadata` is opaque
    /// text attached to the session's segment.
    pub fn create_write_context(&self, stream_tag: &str, metadata: &str) -> Result<WriteContext> {
        if stream_tag.is_empty() {
            return Err(NtsError::InvalidArgument("stream_tag must not be empty"));
        }

        let mut process_tags = process_stream_tags()
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        if process_tags.contains(stream_tag) {
            return Err(NtsError::DuplicateStreamTag(stream_tag.to_string()));
        }
        {
            let writer_tags = self
                .active_tags
                .lock()
                .unwrap_or_else(|err| err.into_inner());
            if writer_tags.contains(stream_tag) {
                return Err(NtsError::DuplicateStreamTag(stream_tag.to_string()));
            }
        }

        let mut catalog = Catalog::open_rw(&catalog_path(&self.file_name))?;
        let segment = catalog.create_segment(stream_tag, metadata)?;

        process_tags.insert(stream_tag.to_string());
        self.active_tags
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .insert(stream_tag.to_string());

        Ok(WriteContext {
            stream_tag: stream_tag.to_string(),
            metadata: metadata.to_string(),
            file_name: self.file_name.clone(),
            last_timestamp: None,
            current_segment: segment,
            current: None,
            writer_tags: Arc::clone(&self.active_tags),
        })
    }

    /// Appends one frame to the context's stream.
    ///
    /// `timestamp` must be strictly greater than the previous one on this
    /// context. The frame is visible to readers as soon as the block's
    /// publish counter is incremented.
    pub fn write(
        &self,
        ctx: &mut WriteContext,
        data: &[u8],
        timestamp: i64,
        flags: u8,
    ) -> Result<()> {
        if let Some(last) = ctx.last_timestamp {
            if timestamp <= last {
                return Err(NtsError::NonMonotonicTimestamp { timestamp, last });
            }
        }
        let max = self.block_size as usize - (FRAME_HEADER_SIZE + INDEX_ENTRY_SIZE + BLOCK_HEADER_SIZE);
        if data.len() > max {
            return Err(NtsError::RowSizeTooBig {
                size: data.len(),
                max,
            });
        }

        loop {
            if ctx.current.is_none() {
                let active = self.acquire_block(&mut ctx.current_segment, timestamp)?;
                ctx.current = Some(active);
            }
            let Some(active) = ctx.current.as_mut() else {
                continue;
            };
            match append_frame(active, self.block_size, data, timestamp, flags) {
                Placement::Written => {
                    ctx.last_timestamp = Some(timestamp);
                    return Ok(());
                }
                Placement::Full { fresh: true } => {
                    // Even an empty block cannot place this frame. Close
                    // out the just-acquired block so it does not linger
                    // unfinalized with a rejected start timestamp.
                    self.rollover(ctx)?;
                    return Err(NtsError::RowSizeTooBig {
                        size: data.len(),
                        max,
                    });
                }
                Placement::Full { fresh: false } => self.rollover(ctx)?,
            }
        }
    }

    /// Frees every finalized block of `stream_tag` whose time range lies
    /// entirely inside `[start_timestamp, end_timestamp]`.
    pub fn free_blocks(
        &self,
        stream_tag: &str,
        start_timestamp: i64,
        end_timestamp: i64,
    ) -> Result<()> {
        let mut catalog = Catalog::open_rw(&catalog_path(&self.file_name))?;
        catalog.free_range(stream_tag, start_timestamp, end_timestamp)
    }

    /// Claims a block for the segment and prepares it for appends.
    fn acquire_block(&self, segment: &mut SegmentRow, timestamp: i64) -> Result<ActiveBlock> {
        let uuid = Uuid::new_v4();
        let mut catalog = Catalog::open_rw(&catalog_path(&self.file_name))?;
        let row = catalog.acquire_block(
            self.auto_reclaim,
            segment.id,
            segment.sequence,
            timestamp,
            uuid,
        )?;
        segment.sequence += 1;
        debug!(
            stream_tag = %segment.stream_tag,
            block_idx = row.block_idx,
            sequence = row.sequence,
            "acquired block"
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.file_name)?;
        let mut region = Region::map_rw(
            &file,
            block_offset(row.block_idx, self.block_size),
            self.block_size as usize,
        )?;
        recycle_block(&mut region, timestamp)?;

        Ok(ActiveBlock {
            row,
            region,
            _file: file,
        })
    }

    /// Closes out the current block: flush, finalize with the last written
    /// timestamp (falling back to the block's start timestamp when nothing
    /// was written to it), and release the mapping.
    fn rollover(&self, ctx: &mut WriteContext) -> Result<()> {
        if let Some(active) = ctx.current.take() {
            active.region.flush()?;
            let last = ctx.last_timestamp.unwrap_or(active.row.start_timestamp);
            let mut catalog = Catalog::open_rw(&catalog_path(&self.file_name))?;
            catalog.finalize_block(active.row.id, last)?;
            debug!(
                stream_tag = %ctx.stream_tag,
                block_idx = active.row.block_idx,
                end_timestamp = last,
                "finalized block"
            );
        }
        Ok(())
    }
}

impl WriteContext {
    /// Stream this context appends to.
    pub fn stream_tag(&self) -> &str {
        &self.stream_tag
    }

    /// Metadata attached to the session's segment.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Timestamp of the last accepted write, if any.
    pub fn last_timestamp(&self) -> Option<i64> {
        self.last_timestamp
    }
}

impl Drop for WriteContext {
    fn drop(&mut self) {
        process_stream_tags()
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .remove(&self.stream_tag);
        self.writer_tags
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .remove(&self.stream_tag);

        let (Some(active), Some(last)) = (self.current.take(), self.last_timestamp) else {
            return;
        };
        if let Err(err) = finalize_on_drop(&self.file_name, &active, last) {
            error!(
                stream_tag = %self.stream_tag,
                %err,
                "failed to finalize block at context drop"
            );
        }
    }
}

fn finalize_on_drop(file_name: &Path, active: &ActiveBlock, last_timestamp: i64) -> Result<()> {
    active.region.flush()?;
    let mut catalog = Catalog::open_rw(&catalog_path(file_name))?;
    catalog.finalize_block_and_sweep(active.row.id, last_timestamp)
}

/// Prepares a freshly acquired block for its new incarnation.
///
/// The counter reset is published with release semantics and the cleared
/// header plus index region is flushed synchronously before any frame is
/// written; a crash after this point can expose only the zeroed index.
fn recycle_block(region: &mut Region, start_timestamp: i64) -> Result<()> {
    let old_valid = region
        .atomic_u32(VALID_COUNTER_OFFSET)
        .load(Ordering::Acquire) as usize;

    region.write_bytes(0, &start_timestamp.to_le_bytes());
    region
        .atomic_u32(VALID_COUNTER_OFFSET)
        .store(0, Ordering::Release);
    region.write_bytes(12, &0u32.to_le_bytes());
    region.fill_zero(BLOCK_HEADER_SIZE, INDEX_ENTRY_SIZE * old_valid);
    region.flush_range(0, BLOCK_HEADER_SIZE + INDEX_ENTRY_SIZE * old_valid)?;
    Ok(())
}

/// Places one frame in the block, or reports that the block is full.
///
/// Frames are packed from the block end toward the growing index; the frame
/// bytes and the index entry are stored before the release increment that
/// publishes them.
fn append_frame(
    active: &mut ActiveBlock,
    block_size: u32,
    data: &[u8],
    timestamp: i64,
    flags: u8,
) -> Placement {
    let region = &mut active.region;
    let n_valid = region
        .atomic_u32(VALID_COUNTER_OFFSET)
        .load(Ordering::Relaxed) as usize;
    let index_end = (BLOCK_HEADER_SIZE + (n_valid + 1) * INDEX_ENTRY_SIZE) as u64;
    let padded = align_frame(FRAME_HEADER_SIZE + data.len()) as u64;

    let target = if n_valid == 0 {
        block_size as u64 - padded
    } else {
        let prev = IndexEntry::read(region.bytes(), n_valid - 1).offset;
        if prev < padded {
            return Placement::Full { fresh: false };
        }
        (prev - padded).max(index_end)
    };
    if index_end >= target {
        return Placement::Full { fresh: n_valid == 0 };
    }

    let header = FrameHeader {
        uuid: *active.row.uuid.as_bytes(),
        size: data.len() as u32,
        flags,
    };
    region.write_bytes(target as usize, &header.encode());
    region.write_bytes(target as usize + FRAME_HEADER_SIZE, data);

    let entry = IndexEntry {
        timestamp,
        offset: target,
    };
    region.write_bytes(
        BLOCK_HEADER_SIZE + n_valid * INDEX_ENTRY_SIZE,
        &entry.encode(),
    );
    region
        .atomic_u32(VALID_COUNTER_OFFSET)
        .fetch_add(1, Ordering::Release);
    Placement::Written
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    PathBuf::from(format!("{}{suffix}", path.display()))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
