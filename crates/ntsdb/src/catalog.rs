//! Catalog access layer.
//!
//! The catalog is a SQLite side-car database (same path as the data file
//! with the `.nts` suffix swapped for `.db`) holding the relational index
//! that ties streams to the physical blocks they occupy:
//!
//! - `blocks`: one row per physical block, `status` in
//!   {`free`, `reserved`, `used`}
//! - `segments`: one row per writer session on a stream
//! - `segment_blocks`: one row per block a segment owns, ordered by
//!   `sequence`
//!
//! A trigger removes segments whose last `segment_block` was deleted, so a
//! segment without blocks never exists. All mutating operations run inside
//! a transaction; a transaction that is dropped without commit rolls back,
//! so any error inside an operation body aborts the whole operation.

use std::path::Path;
use std::thread;
use std::time::Duration;

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::error::{NtsError, Result};

/// Current catalog schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

/// Attempts made to open the catalog before giving up with `CantOpen`.
const OPEN_RETRIES: u32 = 5;

/// Base sleep between open attempts; scaled linearly per attempt.
const OPEN_RETRY_BASE: Duration = Duration::from_millis(500);

/// How long a statement waits on a busy catalog before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// Age after which a `reserved` block is considered orphaned and promoted
/// to `used` by the maintenance sweep.
pub const RESERVED_SWEEP_AGE: Duration = Duration::from_secs(10);

/// A `blocks` row: catalog id and physical block index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRow {
    /// Catalog row id.
    pub id: i64,
    /// Physical block index within the data file.
    pub idx: u32,
}

/// A `segments` row plus the writer-side sequence counter.
#[derive(Debug, Clone)]
pub struct SegmentRow {
    /// Catalog row id.
    pub id: i64,
    /// Stream this session writes to.
    pub stream_tag: String,
    /// Opaque metadata attached at session open.
    pub metadata: String,
    /// Next block sequence number to assign within the segment.
    pub sequence: i64,
}

/// A `segment_blocks` row.
#[derive(Debug, Clone)]
pub struct SegmentBlockRow {
    /// Catalog row id.
    pub id: i64,
    /// Owning segment.
    pub segment_id: i64,
    /// Position of the block within the segment.
    pub sequence: i64,
    /// Backing `blocks` row id.
    pub block_id: i64,
    /// Physical block index within the data file.
    pub block_idx: u32,
    /// Timestamp of the first frame written to this incarnation.
    pub start_timestamp: i64,
    /// Timestamp of the last frame, or 0 while unfinalized.
    pub end_timestamp: i64,
    /// Incarnation tag embedded in every frame header of the block.
    pub uuid: Uuid,
}

/// Block metadata needed by readers and the iterator.
#[derive(Debug, Clone)]
pub struct BlockRef {
    /// Owning segment.
    pub segment_id: i64,
    /// Position of the block within the segment.
    pub sequence: i64,
    /// Physical block index within the data file.
    pub block_idx: u32,
    /// Timestamp of the first frame in the block.
    pub start_timestamp: i64,
    /// Timestamp of the last frame, or 0 while unfinalized.
    pub end_timestamp: i64,
    /// Incarnation tag of the block.
    pub uuid: Uuid,
    /// Metadata of the owning segment.
    pub metadata: String,
}

/// A `segment_blocks` row awaiting crash recovery (`end_timestamp = 0`).
#[derive(Debug, Clone)]
pub struct UnfinalizedBlock {
    /// Catalog row id of the `segment_blocks` row.
    pub id: i64,
    /// Physical block index within the data file.
    pub block_idx: u32,
    /// Incarnation tag recorded for the block.
    pub uuid: Uuid,
}

/// A gap-free run of block sequences within one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContiguousSegment {
    /// Segment the run belongs to.
    pub segment_id: i64,
    /// Start timestamp of the first block in the run.
    pub start_timestamp: i64,
    /// End timestamp of the last block in the run.
    pub end_timestamp: i64,
}

/// An open catalog connection.
pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Opens the catalog read-write, creating the database file if needed.
    pub fn open_rw(path: &Path) -> Result<Self> {
        Self::open(path, true)
    }

    /// Opens the catalog read-only.
    pub fn open_ro(path: &Path) -> Result<Self> {
        Self::open(path, false)
    }

    fn open(path: &Path, rw: bool) -> Result<Self> {
        let flags = if rw {
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
        };

        let mut attempt = 0;
        loop {
            match Connection::open_with_flags(path, flags) {
                Ok(conn) => {
                    conn.busy_timeout(BUSY_TIMEOUT)?;
                    if rw {
                        let _mode: String =
                            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
                    }
                    return Ok(Self { conn });
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= OPEN_RETRIES {
                        return Err(NtsError::CantOpen(format!("{}: {err}", path.display())));
                    }
                    debug!(attempt, %err, "retrying catalog open");
                    thread::sleep(OPEN_RETRY_BASE * attempt);
                }
            }
        }
    }

    /// Creates the catalog schema and seeds `n_blocks` free block rows.
    pub fn create_schema(&mut self, n_blocks: u32) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE blocks (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 idx INTEGER,
                 status TEXT,
                 reserved_at DATETIME DEFAULT CURRENT_TIMESTAMP
             );
             CREATE TABLE segments (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 stream_tag TEXT,
                 metadata TEXT
             );
             CREATE TABLE segment_blocks (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 segment_id INTEGER,
                 sequence INTEGER,
                 block_id INTEGER,
                 block_idx INTEGER,
                 start_timestamp INTEGER,
                 end_timestamp INTEGER,
                 uuid TEXT,
                 FOREIGN KEY (segment_id) REFERENCES segments(id)
             );
             CREATE TRIGGER delete_empty_segments
             AFTER DELETE ON segment_blocks
             BEGIN
                 DELETE FROM segments
                 WHERE id = OLD.segment_id
                 AND NOT EXISTS (
                     SELECT 1 FROM segment_blocks
                     WHERE segment_id = OLD.segment_id
                 );
             END;
             CREATE INDEX idx_segment_blocks_segment_id ON segment_blocks(segment_id);
             CREATE INDEX idx_segment_blocks_time_range ON segment_blocks(start_timestamp);
             CREATE INDEX idx_segments_stream_tag ON segments(stream_tag);
             CREATE INDEX idx_blocks_status ON blocks(status);",
        )?;

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT INTO blocks (idx, status) VALUES (?, 'free')")?;
            for idx in 0..n_blocks {
                stmt.execute([idx])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Reads `PRAGMA user_version` and migrates the schema to the current
    /// version, rejecting catalogs from a newer release.
    pub fn migrate(&mut self) -> Result<()> {
        let version: i32 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(|err| NtsError::Schema(format!("unable to query version: {err}")))?;

        match version {
            0 => {
                let tx = self.conn.transaction()?;
                tx.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
                tx.commit()?;
                Ok(())
            }
            SCHEMA_VERSION => Ok(()),
            other => Err(NtsError::Schema(format!(
                "unsupported catalog version {other}"
            ))),
        }
    }

    /// Claims a block for a segment: allocates (or reclaims) a block, then
    /// records the new `segment_blocks` row with `end_timestamp = 0`.
    pub fn acquire_block(
        &mut self,
        auto_reclaim: bool,
        segment_id: i64,
        sequence: i64,
        start_timestamp: i64,
        uuid: Uuid,
    ) -> Result<SegmentBlockRow> {
        let tx = self.conn.transaction()?;
        let block = get_block(&tx, auto_reclaim)?;
        let row = create_segment_block(
            &tx,
            segment_id,
            sequence,
            block.id,
            block.idx,
            start_timestamp,
            0,
            uuid,
        )?;
        tx.commit()?;
        Ok(row)
    }

    /// Creates a new segment for a writer session.
    pub fn create_segment(&mut self, stream_tag: &str, metadata: &str) -> Result<SegmentRow> {
        let tx = self.conn.transaction()?;
        let row = create_segment(&tx, stream_tag, metadata)?;
        tx.commit()?;
        Ok(row)
    }

    /// Writes the final `end_timestamp` of a segment block.
    pub fn finalize_block(&mut self, segment_block_id: i64, end_timestamp: i64) -> Result<()> {
        let tx = self.conn.transaction()?;
        finalize_block(&tx, segment_block_id, end_timestamp)?;
        tx.commit()?;
        Ok(())
    }

    /// Finalizes a segment block and sweeps stale reservations in one
    /// transaction. Run at write-context drop.
    pub fn finalize_block_and_sweep(
        &mut self,
        segment_block_id: i64,
        end_timestamp: i64,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        finalize_block(&tx, segment_block_id, end_timestamp)?;
        finalize_stale_reserved_blocks(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// Frees every finalized segment block of `stream_tag` whose
    /// `[start, end]` range lies entirely inside `[start_timestamp,
    /// end_timestamp]`.
    pub fn free_range(
        &mut self,
        stream_tag: &str,
        start_timestamp: i64,
        end_timestamp: i64,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;
        let doomed: Vec<(i64, i64)> = {
            let mut stmt = tx.prepare(
                "SELECT sb.id, sb.block_id
                 FROM segment_blocks sb
                 JOIN segments s ON sb.segment_id = s.id
                 WHERE s.stream_tag = ?
                 AND sb.start_timestamp >= ?
                 AND sb.end_timestamp <= ?
                 AND sb.end_timestamp != 0",
            )?;
            let rows = stmt.query_map(
                params![stream_tag, start_timestamp, end_timestamp],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for (segment_block_id, block_id) in doomed {
            tx.execute(
                "DELETE FROM segment_blocks WHERE id = ?",
                [segment_block_id],
            )?;
            tx.execute("UPDATE blocks SET status = 'free' WHERE id = ?", [block_id])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Every `segment_blocks` row whose `end_timestamp` is still 0.
    pub fn unfinalized_blocks(&self) -> Result<Vec<UnfinalizedBlock>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, block_idx, uuid FROM segment_blocks WHERE end_timestamp = 0")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, block_idx, uuid) = row?;
            out.push(UnfinalizedBlock {
                id,
                block_idx: block_idx as u32,
                uuid: parse_uuid(&uuid)?,
            });
        }
        Ok(out)
    }

    /// Blocks of `stream_tag` overlapping `[start_timestamp, end_timestamp]`
    /// in sequence order. Unfinalized blocks count as open-ended.
    pub fn overlapping_blocks(
        &self,
        stream_tag: &str,
        start_timestamp: i64,
        end_timestamp: i64,
    ) -> Result<Vec<BlockRef>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.metadata, sb.segment_id, sb.sequence, sb.block_idx,
                    sb.start_timestamp, sb.end_timestamp, sb.uuid
             FROM segments s
             JOIN segment_blocks sb ON sb.segment_id = s.id
             WHERE s.stream_tag = ?
             AND sb.start_timestamp <= ?
             AND (sb.end_timestamp >= ? OR sb.end_timestamp = 0)
             ORDER BY sb.segment_id ASC, sb.sequence ASC",
        )?;
        let rows = stmt.query_map(
            params![stream_tag, end_timestamp, start_timestamp],
            block_ref_columns,
        )?;
        collect_block_refs(rows)
    }

    /// Block metadata for one `(segment_id, sequence)` key.
    pub fn block_by_key(&self, segment_id: i64, sequence: i64) -> Result<Option<BlockRef>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.metadata, sb.segment_id, sb.sequence, sb.block_idx,
                    sb.start_timestamp, sb.end_timestamp, sb.uuid
             FROM segments s
             JOIN segment_blocks sb ON sb.segment_id = s.id
             WHERE sb.segment_id = ? AND sb.sequence = ?",
        )?;
        let rows = stmt.query_map(params![segment_id, sequence], block_ref_columns)?;
        Ok(collect_block_refs(rows)?.into_iter().next())
    }

    /// First block of the stream: smallest segment id, then smallest
    /// sequence.
    pub fn first_block(&self, stream_tag: &str) -> Result<Option<(i64, i64)>> {
        self.block_key_query(
            "SELECT sb.segment_id, sb.sequence
             FROM segments s
             JOIN segment_blocks sb ON sb.segment_id = s.id
             WHERE s.stream_tag = ?
             ORDER BY s.id ASC, sb.sequence ASC
             LIMIT 1",
            params![stream_tag],
        )
    }

    /// Block after `(segment_id, sequence)` within the stream: the next
    /// sequence in the same segment, else the first block of the next
    /// segment.
    pub fn next_block(
        &self,
        stream_tag: &str,
        segment_id: i64,
        sequence: i64,
    ) -> Result<Option<(i64, i64)>> {
        let same_segment = self.block_key_query(
            "SELECT sb.segment_id, sb.sequence
             FROM segment_blocks sb
             WHERE sb.segment_id = ? AND sb.sequence > ?
             ORDER BY sb.sequence ASC
             LIMIT 1",
            params![segment_id, sequence],
        )?;
        if same_segment.is_some() {
            return Ok(same_segment);
        }
        self.block_key_query(
            "SELECT sb.segment_id, sb.sequence
             FROM segments s
             JOIN segment_blocks sb ON sb.segment_id = s.id
             WHERE s.stream_tag = ? AND s.id > ?
             ORDER BY s.id ASC, sb.sequence ASC
             LIMIT 1",
            params![stream_tag, segment_id],
        )
    }

    /// Block before `(segment_id, sequence)` within the stream: the previous
    /// sequence in the same segment, else the last block of the previous
    /// segment.
    pub fn prev_block(
        &self,
        stream_tag: &str,
        segment_id: i64,
        sequence: i64,
    ) -> Result<Option<(i64, i64)>> {
        let same_segment = self.block_key_query(
            "SELECT sb.segment_id, sb.sequence
             FROM segment_blocks sb
             WHERE sb.segment_id = ? AND sb.sequence < ?
             ORDER BY sb.sequence DESC
             LIMIT 1",
            params![segment_id, sequence],
        )?;
        if same_segment.is_some() {
            return Ok(same_segment);
        }
        self.block_key_query(
            "SELECT sb.segment_id, sb.sequence
             FROM segments s
             JOIN segment_blocks sb ON sb.segment_id = s.id
             WHERE s.stream_tag = ? AND s.id < ?
             ORDER BY s.id DESC, sb.sequence DESC
             LIMIT 1",
            params![stream_tag, segment_id],
        )
    }

    /// Block positioning for a seek: the first block whose range contains
    /// `timestamp` (unfinalized blocks are open-ended), else the first block
    /// starting at or after it.
    pub fn block_for_timestamp(
        &self,
        stream_tag: &str,
        timestamp: i64,
    ) -> Result<Option<(i64, i64)>> {
        let containing = self.block_key_query(
            "SELECT sb.segment_id, sb.sequence
             FROM segments s
             JOIN segment_blocks sb ON sb.segment_id = s.id
             WHERE s.stream_tag = ?
             AND sb.start_timestamp <= ?
             AND (sb.end_timestamp >= ? OR sb.end_timestamp = 0)
             ORDER BY s.id ASC, sb.sequence ASC
             LIMIT 1",
            params![stream_tag, timestamp, timestamp],
        )?;
        if containing.is_some() {
            return Ok(containing);
        }
        self.block_key_query(
            "SELECT sb.segment_id, sb.sequence
             FROM segments s
             JOIN segment_blocks sb ON sb.segment_id = s.id
             WHERE s.stream_tag = ? AND sb.start_timestamp >= ?
             ORDER BY s.id ASC, sb.sequence ASC
             LIMIT 1",
            params![stream_tag, timestamp],
        )
    }

    /// Distinct stream tags with at least one block overlapping the range.
    pub fn stream_tags_in_range(
        &self,
        start_timestamp: i64,
        end_timestamp: i64,
    ) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT s.stream_tag
             FROM segments s
             JOIN segment_blocks sb ON s.id = sb.segment_id
             WHERE sb.start_timestamp <= ?
             AND (sb.end_timestamp >= ? OR sb.end_timestamp = 0)",
        )?;
        let rows = stmt.query_map(params![end_timestamp, start_timestamp], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Collapses gap-free sequence runs of each overlapping segment into
    /// `(segment_id, min start, max end)` ranges.
    ///
    /// `ROW_NUMBER() OVER (ORDER BY sequence) - sequence` is constant across
    /// a run of consecutive sequence values, so grouping by it splits a
    /// segment exactly at its sequence gaps.
    pub fn contiguous_segments(
        &self,
        stream_tag: &str,
        start_timestamp: i64,
        end_timestamp: i64,
    ) -> Result<Vec<ContiguousSegment>> {
        let mut stmt = self.conn.prepare(
            "WITH contiguous_groups AS (
                 SELECT
                     sb.segment_id,
                     sb.sequence,
                     sb.start_timestamp,
                     sb.end_timestamp,
                     ROW_NUMBER() OVER (
                         PARTITION BY sb.segment_id ORDER BY sb.sequence
                     ) - sb.sequence AS group_key
                 FROM segment_blocks sb
                 JOIN segments s ON sb.segment_id = s.id
                 WHERE sb.start_timestamp <= ?
                 AND (sb.end_timestamp >= ? OR sb.end_timestamp = 0)
                 AND s.stream_tag = ?
             )
             SELECT
                 segment_id,
                 MIN(start_timestamp) AS region_start,
                 MAX(end_timestamp) AS region_end
             FROM contiguous_groups
             GROUP BY segment_id, group_key
             ORDER BY segment_id, region_start",
        )?;
        let rows = stmt.query_map(
            params![end_timestamp, start_timestamp, stream_tag],
            |row| {
                Ok(ContiguousSegment {
                    segment_id: row.get(0)?,
                    start_timestamp: row.get(1)?,
                    end_timestamp: row.get(2)?,
                })
            },
        )?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    fn block_key_query(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<(i64, i64)>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query_map(params, |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.next().transpose()?)
    }
}

/// Selects one free block and marks it reserved.
fn get_free_block(tx: &Transaction<'_>) -> Result<Option<BlockRow>> {
    let found: Option<(i64, i64)> = tx
        .query_row(
            "SELECT id, idx FROM blocks WHERE status = 'free' LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((id, idx)) = found else {
        return Ok(None);
    };
    tx.execute("UPDATE blocks SET status = 'reserved' WHERE id = ?", [id])?;
    Ok(Some(BlockRow {
        id,
        idx: idx as u32,
    }))
}

/// Reclaims the oldest finalized block: deletes its `segment_blocks` row
/// (the trigger removes an emptied segment) and re-reserves the backing
/// block with a fresh `reserved_at`.
fn reclaim_oldest_used_block(tx: &Transaction<'_>) -> Result<Option<BlockRow>> {
    let found: Option<(i64, i64, i64)> = tx
        .query_row(
            "SELECT sb.id, sb.block_id, b.idx
             FROM segment_blocks sb
             JOIN blocks b ON sb.block_id = b.id
             WHERE sb.end_timestamp != 0
             AND (b.status = 'used' OR b.status = 'reserved')
             ORDER BY sb.end_timestamp ASC, b.reserved_at ASC
             LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((segment_block_id, block_id, idx)) = found else {
        return Ok(None);
    };
    tx.execute(
        "DELETE FROM segment_blocks WHERE id = ?",
        [segment_block_id],
    )?;
    tx.execute(
        "UPDATE blocks SET status = 'reserved', reserved_at = CURRENT_TIMESTAMP WHERE id = ?",
        [block_id],
    )?;
    Ok(Some(BlockRow {
        id: block_id,
        idx: idx as u32,
    }))
}

/// A free block, else a reclaimed one when `auto_reclaim` is set, else
/// [`NtsError::NoFreeBlocks`].
fn get_block(tx: &Transaction<'_>, auto_reclaim: bool) -> Result<BlockRow> {
    if let Some(block) = get_free_block(tx)? {
        return Ok(block);
    }
    if auto_reclaim {
        if let Some(block) = reclaim_oldest_used_block(tx)? {
            return Ok(block);
        }
    }
    Err(NtsError::NoFreeBlocks)
}

fn create_segment(tx: &Transaction<'_>, stream_tag: &str, metadata: &str) -> Result<SegmentRow> {
    tx.execute(
        "INSERT INTO segments (stream_tag, metadata) VALUES (?, ?)",
        params![stream_tag, metadata],
    )
    .map_err(NtsError::UnableToCreateSegment)?;
    Ok(SegmentRow {
        id: tx.last_insert_rowid(),
        stream_tag: stream_tag.to_string(),
        metadata: metadata.to_string(),
        sequence: 0,
    })
}

#[allow(clippy::too_many_arguments)]
fn create_segment_block(
    tx: &Transaction<'_>,
    segment_id: i64,
    sequence: i64,
    block_id: i64,
    block_idx: u32,
    start_timestamp: i64,
    end_timestamp: i64,
    uuid: Uuid,
) -> Result<SegmentBlockRow> {
    tx.execute(
        "INSERT INTO segment_blocks (
             segment_id, sequence, block_id, block_idx,
             start_timestamp, end_timestamp, uuid
         ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
            segment_id,
            sequence,
            block_id,
            block_idx,
            start_timestamp,
            end_timestamp,
            uuid.hyphenated().to_string(),
        ],
    )
    .map_err(NtsError::UnableToCreateSegmentBlock)?;
    Ok(SegmentBlockRow {
        id: tx.last_insert_rowid(),
        segment_id,
        sequence,
        block_id,
        block_idx,
        start_timestamp,
        end_timestamp,
        uuid,
    })
}

fn finalize_block(tx: &Transaction<'_>, segment_block_id: i64, end_timestamp: i64) -> Result<()> {
    tx.execute(
        "UPDATE segment_blocks SET end_timestamp = ? WHERE id = ?",
        params![end_timestamp, segment_block_id],
    )?;
    Ok(())
}

/// Promotes reservations older than [`RESERVED_SWEEP_AGE`] to `used`.
/// Reclaims blocks orphaned by abrupt writer death.
fn finalize_stale_reserved_blocks(tx: &Transaction<'_>) -> Result<()> {
    tx.execute(
        "UPDATE blocks SET status = 'used'
         WHERE status = 'reserved' AND reserved_at < datetime('now', ?)",
        [format!("-{} seconds", RESERVED_SWEEP_AGE.as_secs())],
    )?;
    Ok(())
}

type BlockRefColumns = (String, i64, i64, i64, i64, i64, String);

fn block_ref_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlockRefColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn collect_block_refs(
    rows: impl Iterator<Item = rusqlite::Result<BlockRefColumns>>,
) -> Result<Vec<BlockRef>> {
    let mut out = Vec::new();
    for row in rows {
        let (metadata, segment_id, sequence, block_idx, start_timestamp, end_timestamp, uuid) =
            row?;
        out.push(BlockRef {
            segment_id,
            sequence,
            block_idx: block_idx as u32,
            start_timestamp,
            end_timestamp,
            uuid: parse_uuid(&uuid)?,
            metadata,
        });
    }
    Ok(out)
}

fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text).map_err(|err| NtsError::Schema(format!("invalid uuid in catalog: {err}")))
}
