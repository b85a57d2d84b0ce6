//! Integration tests for block rollover, reclamation, and range freeing.

use ntsdb::{ContiguousSegment, NtsError, NtsReader, NtsWriter};
use std::path::PathBuf;
use tempfile::TempDir;

fn store_path(dir: &TempDir) -> PathBuf {
    dir.path().join("store.nts")
}

fn read_timestamps(path: &PathBuf, tag: &str) -> Vec<i64> {
    let reader = NtsReader::open(path).unwrap();
    let mut timestamps = Vec::new();
    reader
        .read(tag, i64::MIN, i64::MAX, |frame| {
            timestamps.push(frame.timestamp)
        })
        .unwrap();
    timestamps
}

// ============================================================================
// Rollover
// ============================================================================

/// Filling a small block spills into the next one without losing order:
/// every frame survives, globally ordered, across block boundaries.
#[test]
fn test_rollover_preserves_order() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir);
    NtsWriter::allocate(&path, 4096, 2048).unwrap(); // 64 KiB blocks

    let writer = NtsWriter::open(&path, false).unwrap();
    let mut ctx = writer.create_write_context("roll_stream", "").unwrap();
    let payload = vec![0xabu8; 1024];
    for t in 1..=1023i64 {
        writer.write(&mut ctx, &payload, t, 0).unwrap();
    }
    drop(ctx);

    let timestamps = read_timestamps(&path, "roll_stream");
    assert_eq!(timestamps, (1..=1023).collect::<Vec<_>>());

    // 1 KiB frames cannot all sit in one 64 KiB block.
    let reader = NtsReader::open(&path).unwrap();
    let runs = reader
        .query_contiguous_segments("roll_stream", i64::MIN, i64::MAX)
        .unwrap();
    assert_eq!(runs.len(), 1, "one session, no gaps yet");
}

// ============================================================================
// free_blocks
// ============================================================================

/// Freeing a time range removes exactly the wholly covered blocks: the
/// survivors show a gap wider than a block, and nothing outside the range
/// is touched.
#[test]
fn test_free_blocks_range() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir);
    NtsWriter::allocate(&path, 4096, 2048).unwrap();

    let writer = NtsWriter::open(&path, false).unwrap();
    let mut ctx = writer.create_write_context("test_stream", "").unwrap();
    let payload = vec![0xcdu8; 1024];
    for t in 1..=1023i64 {
        writer.write(&mut ctx, &payload, t, 0).unwrap();
    }
    drop(ctx);

    writer.free_blocks("test_stream", 250, 500).unwrap();

    let remaining = read_timestamps(&path, "test_stream");
    assert!(!remaining.is_empty());

    // Every removed frame sat in a block wholly inside [250, 500].
    let removed: Vec<i64> = (1..=1023)
        .filter(|t| !remaining.contains(t))
        .collect();
    assert!(!removed.is_empty(), "free_blocks removed nothing");
    assert!(removed.iter().all(|t| (250..=500).contains(t)));

    // The survivors contain an adjacent pair spanning the freed blocks.
    let max_gap = remaining
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .max()
        .unwrap();
    assert!(max_gap > 100, "expected a gap over the freed range, got {max_gap}");
}

/// Freed sequence numbers split the stream into separate contiguous runs.
#[test]
fn test_contiguous_segments_split_after_free() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir);
    NtsWriter::allocate(&path, 4096, 64).unwrap();

    let writer = NtsWriter::open(&path, false).unwrap();
    let mut ctx = writer.create_write_context("split_stream", "").unwrap();
    let payload = vec![0u8; 1024];
    for t in 1..=240i64 {
        writer.write(&mut ctx, &payload, t, 0).unwrap();
    }
    drop(ctx);

    let reader = NtsReader::open(&path).unwrap();
    let before = reader
        .query_contiguous_segments("split_stream", i64::MIN, i64::MAX)
        .unwrap();
    assert_eq!(before.len(), 1);

    // Carve out the second block (61 frames per 64 KiB block of 1 KiB
    // frames), leaving runs on both sides.
    writer.free_blocks("split_stream", 62, 122).unwrap();
    let after = reader
        .query_contiguous_segments("split_stream", i64::MIN, i64::MAX)
        .unwrap();
    assert_eq!(after.len(), 2, "expected a split, got {after:?}");

    let ContiguousSegment {
        start_timestamp,
        end_timestamp,
        ..
    } = after[0];
    assert_eq!(start_timestamp, 1);
    assert!(end_timestamp < 122);
    assert!(after[1].start_timestamp > end_timestamp);
    assert_eq!(after[1].end_timestamp, 240);
}

// ============================================================================
// Allocation and reclamation
// ============================================================================

/// Without auto-reclaim, exhausting the block pool surfaces NoFreeBlocks.
#[test]
fn test_no_free_blocks_without_reclaim() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir);
    NtsWriter::allocate(&path, 4096, 1).unwrap();

    let writer = NtsWriter::open(&path, false).unwrap();
    let mut ctx = writer.create_write_context("exhaust_stream", "").unwrap();
    let payload = vec![0u8; 30_000];
    writer.write(&mut ctx, &payload, 1, 0).unwrap();
    writer.write(&mut ctx, &payload, 2, 0).unwrap();

    // The third frame forces a rollover with nothing left to allocate.
    let err = writer.write(&mut ctx, &payload, 3, 0).unwrap_err();
    assert!(matches!(err, NtsError::NoFreeBlocks));
}

/// With auto-reclaim, writing far past the pool size keeps succeeding and
/// drops the oldest finalized blocks first.
#[test]
fn test_auto_reclaim_never_exhausts() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir);
    NtsWriter::allocate(&path, 4096, 4).unwrap();

    let writer = NtsWriter::open(&path, true).unwrap();
    let mut ctx = writer.create_write_context("reclaim_stream", "").unwrap();
    let payload = vec![0u8; 1024];
    for t in 1..=1000i64 {
        writer.write(&mut ctx, &payload, t, 0).unwrap();
    }
    drop(ctx);

    let remaining = read_timestamps(&path, "reclaim_stream");
    assert!(!remaining.is_empty());
    // The pool holds 4 blocks of ~61 frames; early frames must be gone.
    assert!(remaining[0] > 1, "oldest block was never reclaimed");
    assert_eq!(*remaining.last().unwrap(), 1000);
    assert!(remaining.windows(2).all(|pair| pair[0] < pair[1]));
}

/// Reclamation reuses the physical blocks of freed ranges too.
#[test]
fn test_freed_blocks_are_reused() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir);
    NtsWriter::allocate(&path, 4096, 4).unwrap();

    let writer = NtsWriter::open(&path, false).unwrap();
    let mut ctx = writer.create_write_context("reuse_stream", "").unwrap();
    let payload = vec![0u8; 1024];
    // Fill three blocks, keep the fourth in flight.
    for t in 1..=200i64 {
        writer.write(&mut ctx, &payload, t, 0).unwrap();
    }
    drop(ctx);

    writer.free_blocks("reuse_stream", 1, 150).unwrap();

    // The freed blocks satisfy the next session without reclamation.
    let mut ctx = writer.create_write_context("reuse_stream", "").unwrap();
    for t in 201..=300i64 {
        writer.write(&mut ctx, &payload, t, 0).unwrap();
    }
    drop(ctx);

    let remaining = read_timestamps(&path, "reuse_stream");
    assert!(remaining.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(*remaining.last().unwrap(), 300);
}
