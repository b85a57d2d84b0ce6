//! Crash-recovery scan run at writer open.
//!
//! A crash can leave a block's published index count ahead of its durable
//! frames: the counter increment reached disk but some frame bytes or index
//! entries did not. For every `segment_blocks` row still carrying
//! `end_timestamp = 0`, the scan walks the block's index backward to the
//! last entry whose frame is structurally intact (in-bounds offset,
//! matching incarnation uuid, in-bounds size), records that entry's
//! timestamp as the block's end, and truncates the on-disk counter to drop
//! everything after it.
//!
//! Frame-level validation failures here are not errors; they mark the crash
//! boundary and are logged at most.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use crate::block::mmap::Region;
use crate::block::{
    block_offset, validate_frame, IndexEntry, BLOCK_HEADER_SIZE, INDEX_ENTRY_SIZE,
    VALID_COUNTER_OFFSET,
};
use crate::catalog::{Catalog, UnfinalizedBlock};
use crate::error::Result;

/// Rebuilds the boundary of every unfinalized block in the store.
pub(crate) fn recover_unfinalized_blocks(
    file_name: &Path,
    block_size: u32,
    catalog: &mut Catalog,
) -> Result<()> {
    let pending = catalog.unfinalized_blocks()?;
    if pending.is_empty() {
        return Ok(());
    }
    debug!(blocks = pending.len(), "scanning unfinalized blocks");

    let file = OpenOptions::new().read(true).write(true).open(file_name)?;
    for block in &pending {
        recover_block(&file, block_size, catalog, block)?;
    }
    Ok(())
}

fn recover_block(
    file: &File,
    block_size: u32,
    catalog: &mut Catalog,
    pending: &UnfinalizedBlock,
) -> Result<()> {
    let region = Region::map_rw(
        file,
        block_offset(pending.block_idx, block_size),
        block_size as usize,
    )?;
    let n_valid = region
        .atomic_u32(VALID_COUNTER_OFFSET)
        .load(Ordering::Acquire);
    let bytes = region.bytes();

    // Frames live above every slot the published count could reference.
    let index_region_end = (BLOCK_HEADER_SIZE + (n_valid as usize + 1) * INDEX_ENTRY_SIZE) as u64;

    let mut last_valid = None;
    for i in (0..n_valid as usize).rev() {
        let entry = IndexEntry::read(bytes, i);
        if entry.timestamp == 0 || entry.offset == 0 {
            continue;
        }
        if entry.offset < index_region_end {
            continue;
        }
        if validate_frame(bytes, entry.offset, pending.uuid.as_bytes()).is_some() {
            last_valid = Some(i);
            break;
        }
    }

    if let Some(i) = last_valid {
        let end_timestamp = IndexEntry::read(bytes, i).timestamp;
        catalog.finalize_block(pending.id, end_timestamp)?;
    }

    let truncated = last_valid.map_or(0, |i| i as u32 + 1);
    if truncated != n_valid {
        warn!(
            block_idx = pending.block_idx,
            published = n_valid,
            durable = truncated,
            "truncating block index after crash"
        );
        region
            .atomic_u32(VALID_COUNTER_OFFSET)
            .store(truncated, Ordering::Release);
        region.flush()?;
    }
    Ok(())
}
