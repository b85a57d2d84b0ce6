//! Integration tests for iterator navigation: seeks, bidirectional
//! stepping, and invalidation at the stream boundaries.

use ntsdb::{NtsIterator, NtsWriter};
use std::path::PathBuf;
use tempfile::TempDir;

fn seeded_store(dir: &TempDir, tag: &str) -> PathBuf {
    let path = dir.path().join("store.nts");
    NtsWriter::allocate(&path, 1024 * 1024, 4).unwrap();

    let writer = NtsWriter::open(&path, false).unwrap();
    let mut ctx = writer.create_write_context(tag, "seek-meta").unwrap();
    for i in 0..10i64 {
        writer
            .write(
                &mut ctx,
                format!("frame_{i}").as_bytes(),
                1000 + 500 * i,
                i as u8,
            )
            .unwrap();
    }
    path
}

// ============================================================================
// find()
// ============================================================================

/// Seeks land on the lower bound: exact hits, between-frame timestamps,
/// before the first frame, and past the last frame.
#[test]
fn test_find_lower_bound_semantics() {
    let dir = TempDir::new().unwrap();
    let path = seeded_store(&dir, "seek_stream");
    let mut iter = NtsIterator::new(&path, "seek_stream").unwrap();

    assert!(iter.find(2000).unwrap());
    let frame = iter.current().unwrap();
    assert_eq!((frame.timestamp, frame.flags), (2000, 2));

    assert!(iter.find(2250).unwrap());
    let frame = iter.current().unwrap();
    assert_eq!((frame.timestamp, frame.flags), (2500, 3));

    assert!(iter.find(500).unwrap());
    let frame = iter.current().unwrap();
    assert_eq!((frame.timestamp, frame.flags), (1000, 0));

    assert!(!iter.find(10_000).unwrap());
    assert!(!iter.valid());
}

/// find() revalidates an iterator that ran off the end.
#[test]
fn test_find_revalidates_after_overrun() {
    let dir = TempDir::new().unwrap();
    let path = seeded_store(&dir, "revalidate_stream");
    let mut iter = NtsIterator::new(&path, "revalidate_stream").unwrap();

    while iter.valid() {
        iter.next().unwrap();
    }
    assert!(!iter.valid());

    assert!(iter.find(3000).unwrap());
    assert_eq!(iter.current().unwrap().timestamp, 3000);
}

// ============================================================================
// next() / prev()
// ============================================================================

/// Forward iteration yields every frame in order, then invalidates.
#[test]
fn test_forward_iteration() {
    let dir = TempDir::new().unwrap();
    let path = seeded_store(&dir, "forward_stream");
    let mut iter = NtsIterator::new(&path, "forward_stream").unwrap();

    let mut timestamps = Vec::new();
    while iter.valid() {
        timestamps.push(iter.current().unwrap().timestamp);
        iter.next().unwrap();
    }
    let expected: Vec<i64> = (0..10).map(|i| 1000 + 500 * i).collect();
    assert_eq!(timestamps, expected);

    // Invalid iterators stay invalid through next().
    assert!(!iter.next().unwrap());
}

/// Backward iteration from the last frame yields the reverse order and
/// invalidates before the first frame.
#[test]
fn test_backward_iteration() {
    let dir = TempDir::new().unwrap();
    let path = seeded_store(&dir, "backward_stream");
    let mut iter = NtsIterator::new(&path, "backward_stream").unwrap();

    assert!(iter.find(5500).unwrap());
    let mut timestamps = Vec::new();
    while iter.valid() {
        timestamps.push(iter.current().unwrap().timestamp);
        iter.prev().unwrap();
    }
    let expected: Vec<i64> = (0..10).rev().map(|i| 1000 + 500 * i).collect();
    assert_eq!(timestamps, expected);
}

/// Mixed stepping: next then prev returns to the same frame.
#[test]
fn test_next_then_prev_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = seeded_store(&dir, "mixed_stream");
    let mut iter = NtsIterator::new(&path, "mixed_stream").unwrap();

    assert!(iter.find(2500).unwrap());
    assert!(iter.next().unwrap());
    assert_eq!(iter.current().unwrap().timestamp, 3000);
    assert!(iter.prev().unwrap());
    assert_eq!(iter.current().unwrap().timestamp, 2500);
}

// ============================================================================
// reset() and metadata
// ============================================================================

/// reset() returns to the first frame from anywhere, including from the
/// invalid state.
#[test]
fn test_reset_returns_to_first_frame() {
    let dir = TempDir::new().unwrap();
    let path = seeded_store(&dir, "reset_stream");
    let mut iter = NtsIterator::new(&path, "reset_stream").unwrap();

    assert!(iter.find(4000).unwrap());
    assert!(iter.reset().unwrap());
    assert_eq!(iter.current().unwrap().timestamp, 1000);

    assert!(!iter.find(10_000).unwrap());
    assert!(iter.reset().unwrap());
    assert_eq!(iter.current().unwrap().timestamp, 1000);
}

/// Segment metadata rides along with the cursor.
#[test]
fn test_current_metadata() {
    let dir = TempDir::new().unwrap();
    let path = seeded_store(&dir, "meta_stream");
    let iter = NtsIterator::new(&path, "meta_stream").unwrap();

    assert!(iter.valid());
    assert_eq!(iter.current_metadata(), Some("seek-meta"));
    assert_eq!(iter.current().unwrap().metadata, "seek-meta");
}

/// An iterator over an unknown stream starts invalid.
#[test]
fn test_unknown_stream_is_invalid() {
    let dir = TempDir::new().unwrap();
    let path = seeded_store(&dir, "known_stream");
    let iter = NtsIterator::new(&path, "no_such_stream").unwrap();
    assert!(!iter.valid());
    assert!(iter.current().is_none());
}

/// A stream written across two writer sessions is walked segment to
/// segment in both directions.
#[test]
fn test_iteration_across_segments() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.nts");
    NtsWriter::allocate(&path, 1024 * 1024, 8).unwrap();

    let writer = NtsWriter::open(&path, false).unwrap();
    let mut ctx = writer.create_write_context("session_stream", "first").unwrap();
    for t in [100i64, 200, 300] {
        writer.write(&mut ctx, b"early", t, 0).unwrap();
    }
    drop(ctx);
    let mut ctx = writer.create_write_context("session_stream", "second").unwrap();
    for t in [400i64, 500, 600] {
        writer.write(&mut ctx, b"late", t, 0).unwrap();
    }
    drop(ctx);

    let mut iter = NtsIterator::new(&path, "session_stream").unwrap();
    let mut seen = Vec::new();
    while iter.valid() {
        let frame = iter.current().unwrap();
        seen.push((frame.timestamp, frame.metadata.to_string()));
        iter.next().unwrap();
    }
    assert_eq!(
        seen,
        vec![
            (100, "first".to_string()),
            (200, "first".to_string()),
            (300, "first".to_string()),
            (400, "second".to_string()),
            (500, "second".to_string()),
            (600, "second".to_string()),
        ]
    );

    // Walk back across the segment boundary.
    assert!(iter.find(400).unwrap());
    assert!(iter.prev().unwrap());
    let frame = iter.current().unwrap();
    assert_eq!((frame.timestamp, frame.metadata), (300, "first"));
}
