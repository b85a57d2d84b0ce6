//! On-disk layout primitives for the data file.
//!
//! A store is a single preallocated file: a fixed 64 KiB header followed by
//! `n_blocks` equally sized data blocks. Block sizes are multiples of 64 KiB
//! so that every block window starts and ends on a mapping boundary.
//!
//! ## File structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  File Header (65536 bytes, first 8 used)                    │
//! │  - block_size: u32 LE                                       │
//! │  - n_blocks:   u32 LE                                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Block 0 (block_size bytes)                                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ...                                                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Block n_blocks - 1                                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Block structure
//!
//! ```text
//! Offset  Size   Field
//! ------  ----   -----
//! 0x00    8      block_start_timestamp (i64 LE, written at recycle)
//! 0x08    4      n_valid_indexes (u32, atomic publish word)
//! 0x0C    4      reserved (zero)
//! 0x10    16*K   index entries, growing from low addresses
//! ...            free arena
//! ...            frames, packed from the block end downward
//! ```
//!
//! Index entries are `[timestamp: i64 LE][offset: u64 LE]` where `offset`
//! locates the frame header within the block. A frame is
//! `[uuid: 16][size: u32 LE][flags: u8]` followed by `size` payload bytes;
//! frame header plus payload is padded to the next multiple of 8 for
//! aligned loads on ARM.

pub mod mmap;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{NtsError, Result};
use mmap::Region;

/// Size of the file header region, and the mapping alignment boundary.
pub const FILE_HEADER_SIZE: usize = 65536;

/// Size of the per-block header (start timestamp, publish counter, reserved).
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Size of one index entry: `i64` timestamp plus `u64` frame offset.
pub const INDEX_ENTRY_SIZE: usize = 16;

/// Size of one frame header: 16-byte uuid, `u32` size, `u8` flags.
pub const FRAME_HEADER_SIZE: usize = 21;

/// Byte offset of the publish counter within a block.
pub const VALID_COUNTER_OFFSET: usize = 8;

/// Smallest block size accepted from a file header.
pub const MIN_BLOCK_SIZE: u32 = 4096;

/// Largest block size accepted from a file header: 1 GiB.
pub const MAX_BLOCK_SIZE: u32 = 1 << 30;

/// Rounds a requested block size up to the next mapping boundary.
///
/// Windows file mappings must start and end on 64 KiB boundaries; the file
/// header occupies exactly one boundary, so any multiple of 65536 keeps
/// every block aligned.
pub fn round_to_map_boundary(requested: u32) -> u32 {
    const BOUNDARY: u32 = FILE_HEADER_SIZE as u32;
    if requested == 0 {
        return BOUNDARY;
    }
    requested.div_ceil(BOUNDARY) * BOUNDARY
}

/// Pads a frame length (header plus payload) to the next multiple of 8.
pub fn align_frame(len: usize) -> usize {
    (len + 7) & !7
}

/// Byte offset of block `idx` within the data file.
pub fn block_offset(idx: u32, block_size: u32) -> u64 {
    FILE_HEADER_SIZE as u64 + idx as u64 * block_size as u64
}

/// Derives the catalog path: the trailing `.nts` suffix stripped, `.db`
/// appended. Both files must live on the same filesystem.
pub fn catalog_path(data_path: &Path) -> PathBuf {
    let name = data_path.to_string_lossy();
    let stem = name.strip_suffix(".nts").unwrap_or(&name);
    PathBuf::from(format!("{stem}.db"))
}

/// The decoded data file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Size of every data block in bytes.
    pub block_size: u32,
    /// Number of data blocks in the file.
    pub n_blocks: u32,
}

impl FileHeader {
    /// Reads the header from the first bytes of the file header region.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(NtsError::Schema("data file header too short".to_string()));
        }
        let block_size = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let n_blocks = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        Ok(Self {
            block_size,
            n_blocks,
        })
    }

    /// Encodes the used prefix of the header region.
    pub fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.block_size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.n_blocks.to_le_bytes());
        buf
    }

    /// Returns true if the block size lies inside the accepted range.
    pub fn block_size_valid(&self) -> bool {
        (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
    }
}

/// One index entry: frame timestamp and the block-relative offset of its
/// header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Frame timestamp.
    pub timestamp: i64,
    /// Byte offset of the frame header within the block.
    pub offset: u64,
}

impl IndexEntry {
    /// Decodes the entry at position `i` of a block's index array.
    pub fn read(block: &[u8], i: usize) -> Self {
        let at = BLOCK_HEADER_SIZE + i * INDEX_ENTRY_SIZE;
        let timestamp = i64::from_le_bytes(block[at..at + 8].try_into().unwrap());
        let offset =
            u64::from_le_bytes(block[at + 8..at + 16].try_into().unwrap());
        Self { timestamp, offset }
    }

    /// Encodes the entry for storage in the index array.
    pub fn encode(&self) -> [u8; INDEX_ENTRY_SIZE] {
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        buf[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }
}

/// Position of the first index entry with `timestamp >= target` among the
/// first `k` entries of a block, or `k` if there is none.
pub fn lower_bound_index(block: &[u8], k: usize, target: i64) -> usize {
    let (mut lo, mut hi) = (0, k);
    while lo < hi {
        let mid = (lo + hi) / 2;
        if IndexEntry::read(block, mid).timestamp < target {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// One frame header, bound to its block incarnation by the uuid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Incarnation tag of the owning block.
    pub uuid: [u8; 16],
    /// Payload size in bytes.
    pub size: u32,
    /// Opaque user flag byte.
    pub flags: u8,
}

impl FrameHeader {
    /// Encodes the header for storage ahead of the payload.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..16].copy_from_slice(&self.uuid);
        buf[16..20].copy_from_slice(&self.size.to_le_bytes());
        buf[20] = self.flags;
        buf
    }

    /// Decodes a header from the first [`FRAME_HEADER_SIZE`] bytes of `bytes`.
    pub fn decode(bytes: &[u8]) -> Self {
        let uuid: [u8; 16] = bytes[0..16].try_into().unwrap();
        let size = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        let flags = bytes[20];
        Self { uuid, size, flags }
    }
}

/// Validates the frame an index entry points at and returns its header.
///
/// Checks, in order: the offset leaves room for a frame header, the header
/// carries the expected incarnation uuid, and the recorded payload fits in
/// the remainder of the block. Stale bytes from a recycled incarnation fail
/// the uuid check and are skipped by callers.
pub fn validate_frame(block: &[u8], offset: u64, expected_uuid: &[u8; 16]) -> Option<FrameHeader> {
    let block_size = block.len() as u64;
    if offset < BLOCK_HEADER_SIZE as u64 || offset > block_size - FRAME_HEADER_SIZE as u64 {
        return None;
    }
    let header = FrameHeader::decode(&block[offset as usize..]);
    if &header.uuid != expected_uuid {
        return None;
    }
    if header.size as u64 > block_size - offset - FRAME_HEADER_SIZE as u64 {
        return None;
    }
    Some(header)
}

/// Creates and preallocates the data file, then writes its header.
///
/// `block_size` must already be rounded to a mapping boundary. Preallocation
/// asks the filesystem for a contiguous extent first and falls back to
/// fill-allocation; failure of both surfaces as
/// [`NtsError::UnableToAllocateFile`].
pub fn allocate_data_file(path: &Path, block_size: u32, n_blocks: u32) -> Result<()> {
    let file_size = FILE_HEADER_SIZE as u64 + n_blocks as u64 * block_size as u64;

    let file = File::create(path)?;
    preallocate(&file, file_size).map_err(NtsError::UnableToAllocateFile)?;
    file.sync_all()?;
    drop(file);

    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut header = Region::map_rw(&file, 0, FILE_HEADER_SIZE)?;
    let encoded = FileHeader {
        block_size,
        n_blocks,
    }
    .encode();
    header.write_bytes(0, &encoded);
    header.flush_range(0, encoded.len())?;
    Ok(())
}

fn preallocate(file: &File, size: u64) -> std::io::Result<()> {
    if file.allocate(size).is_ok() {
        return Ok(());
    }
    // Fill-allocate so every page is backed even without fallocate support.
    file.set_len(size)?;
    let mut remaining = size;
    let zeros = vec![0u8; 1 << 20];
    let mut out = file;
    while remaining > 0 {
        let n = remaining.min(zeros.len() as u64) as usize;
        out.write_all(&zeros[..n])?;
        remaining -= n as u64;
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_map_boundary() {
        assert_eq!(round_to_map_boundary(0), 65536);
        assert_eq!(round_to_map_boundary(1), 65536);
        assert_eq!(round_to_map_boundary(4096), 65536);
        assert_eq!(round_to_map_boundary(65536), 65536);
        assert_eq!(round_to_map_boundary(65537), 131072);
        assert_eq!(round_to_map_boundary(1024 * 1024), 1024 * 1024);
    }

    #[test]
    fn test_align_frame() {
        assert_eq!(align_frame(21), 24);
        assert_eq!(align_frame(24), 24);
        assert_eq!(align_frame(21 + 3), 24);
        assert_eq!(align_frame(21 + 1024), 1048);
    }

    #[test]
    fn test_catalog_path() {
        assert_eq!(
            catalog_path(Path::new("/tmp/store.nts")),
            PathBuf::from("/tmp/store.db")
        );
        assert_eq!(
            catalog_path(Path::new("relative.nts")),
            PathBuf::from("relative.db")
        );
        assert_eq!(catalog_path(Path::new("bare")), PathBuf::from("bare.db"));
    }

    #[test]
    fn test_file_header_roundtrip() {
        let header = FileHeader {
            block_size: 1024 * 1024,
            n_blocks: 4,
        };
        let decoded = FileHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.block_size_valid());
        assert!(!FileHeader {
            block_size: 1024,
            n_blocks: 4
        }
        .block_size_valid());
    }

    #[test]
    fn test_index_entry_layout() {
        let mut block = vec![0u8; 1024];
        let entry = IndexEntry {
            timestamp: -42,
            offset: 768,
        };
        block[BLOCK_HEADER_SIZE + INDEX_ENTRY_SIZE..BLOCK_HEADER_SIZE + 2 * INDEX_ENTRY_SIZE]
            .copy_from_slice(&entry.encode());
        assert_eq!(IndexEntry::read(&block, 1), entry);
    }

    #[test]
    fn test_lower_bound_index() {
        let mut block = vec![0u8; 4096];
        for (i, ts) in [10i64, 20, 30, 40, 50].iter().enumerate() {
            let at = BLOCK_HEADER_SIZE + i * INDEX_ENTRY_SIZE;
            block[at..at + INDEX_ENTRY_SIZE].copy_from_slice(
                &IndexEntry {
                    timestamp: *ts,
                    offset: 100,
                }
                .encode(),
            );
        }
        assert_eq!(lower_bound_index(&block, 5, 5), 0);
        assert_eq!(lower_bound_index(&block, 5, 10), 0);
        assert_eq!(lower_bound_index(&block, 5, 25), 2);
        assert_eq!(lower_bound_index(&block, 5, 30), 2);
        assert_eq!(lower_bound_index(&block, 5, 51), 5);
    }

    #[test]
    fn test_validate_frame_rejects_stale_uuid() {
        let uuid = [7u8; 16];
        let stale = [9u8; 16];
        let mut block = vec![0u8; 4096];
        let offset = 2048usize;
        let header = FrameHeader {
            uuid,
            size: 5,
            flags: 1,
        };
        block[offset..offset + FRAME_HEADER_SIZE].copy_from_slice(&header.encode());

        assert_eq!(validate_frame(&block, offset as u64, &uuid), Some(header));
        assert_eq!(validate_frame(&block, offset as u64, &stale), None);
        // Offset past the point where a header still fits.
        assert_eq!(validate_frame(&block, 4090, &uuid), None);
        // Recorded size overruns the block.
        let big = FrameHeader {
            uuid,
            size: 4096,
            flags: 0,
        };
        block[offset..offset + FRAME_HEADER_SIZE].copy_from_slice(&big.encode());
        assert_eq!(validate_frame(&block, offset as u64, &uuid), None);
    }
}
