//! Scoped memory-mapped windows over the data file.
//!
//! All block data access goes through [`Region`]: a shared mapping of an
//! exact `[offset, offset + len)` window of the data file. Offsets are
//! always multiples of 65536 so block windows are page-aligned on every
//! supported operating system.
//!
//! The only synchronization word inside a mapped block is the `u32` publish
//! counter at offset 8, exposed as an [`AtomicU32`] reference carved out of
//! the mapping. Everything else is plain memory: the writer stores frame
//! bytes and index entries first, then publishes them with a release
//! increment of the counter; readers observe the counter with an acquire
//! load.

use std::fs::File;
use std::ptr;
use std::slice;
use std::sync::atomic::AtomicU32;

use memmap2::{Mmap, MmapOptions, MmapRaw};

use crate::error::Result;

/// Access-pattern hint forwarded to the kernel via `madvise`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapAdvice {
    /// No special access pattern.
    Normal,
    /// Expect page references in random order.
    Random,
    /// Expect page references in sequential order.
    Sequential,
    /// Expect access in the near future.
    WillNeed,
    /// Do not expect access in the near future.
    DontNeed,
}

#[derive(Debug)]
enum MapInner {
    Rw(MmapRaw),
    Ro(Mmap),
}

/// A shared mapping of one window of the data file.
///
/// The mapping is released when the `Region` is dropped. Read-write regions
/// additionally support synchronous range flushes.
#[derive(Debug)]
pub struct Region {
    inner: MapInner,
    len: usize,
}

impl Region {
    /// Maps `[offset, offset + len)` of `file` read-write shared.
    pub fn map_rw(file: &File, offset: u64, len: usize) -> Result<Self> {
        let raw = MmapOptions::new().offset(offset).len(len).map_raw(file)?;
        Ok(Self {
            inner: MapInner::Rw(raw),
            len,
        })
    }

    /// Maps `[offset, offset + len)` of `file` read-only shared.
    pub fn map_ro(file: &File, offset: u64, len: usize) -> Result<Self> {
        let map = unsafe { MmapOptions::new().offset(offset).len(len).map(file)? };
        Ok(Self {
            inner: MapInner::Ro(map),
            len,
        })
    }

    /// Length of the mapped window in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the window is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn base_ptr(&self) -> *mut u8 {
        match &self.inner {
            MapInner::Rw(raw) => raw.as_mut_ptr(),
            MapInner::Ro(map) => map.as_ptr() as *mut u8,
        }
    }

    /// The full mapped window as a byte slice.
    ///
    /// Bytes below the published index count are stable; bytes above it may
    /// be concurrently written and must only be interpreted after an acquire
    /// load of the publish counter.
    pub fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.base_ptr(), self.len) }
    }

    /// A `u32` publish counter embedded in the mapping at `offset`.
    ///
    /// `offset` must be 4-byte aligned and inside the window.
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        assert!(offset + 4 <= self.len && offset % 4 == 0);
        unsafe { &*(self.base_ptr().add(offset) as *const AtomicU32) }
    }

    /// Copies `src` into the window at `offset`. Read-write regions only.
    pub fn write_bytes(&mut self, offset: usize, src: &[u8]) {
        assert!(matches!(self.inner, MapInner::Rw(_)));
        assert!(offset + src.len() <= self.len);
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.base_ptr().add(offset), src.len());
        }
    }

    /// Zero-fills `len` bytes of the window at `offset`. Read-write regions only.
    pub fn fill_zero(&mut self, offset: usize, len: usize) {
        assert!(matches!(self.inner, MapInner::Rw(_)));
        assert!(offset + len <= self.len);
        unsafe {
            ptr::write_bytes(self.base_ptr().add(offset), 0, len);
        }
    }

    /// Synchronously flushes `[offset, offset + len)` to the backing file.
    ///
    /// A no-op for read-only regions.
    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        if let MapInner::Rw(raw) = &self.inner {
            raw.flush_range(offset, len)?;
        }
        Ok(())
    }

    /// Synchronously flushes the whole window to the backing file.
    pub fn flush(&self) -> Result<()> {
        self.flush_range(0, self.len)
    }

    /// Forwards an access-pattern hint to the kernel where supported.
    #[cfg(unix)]
    pub fn advise(&self, advice: MapAdvice) -> Result<()> {
        use memmap2::{Advice, UncheckedAdvice};

        let mapped = match advice {
            MapAdvice::Normal => Advice::Normal,
            MapAdvice::Random => Advice::Random,
            MapAdvice::Sequential => Advice::Sequential,
            MapAdvice::WillNeed => Advice::WillNeed,
            MapAdvice::DontNeed => {
                match &self.inner {
                    MapInner::Rw(raw) => unsafe {
                        raw.unchecked_advise(UncheckedAdvice::DontNeed)?
                    },
                    MapInner::Ro(map) => unsafe {
                        map.unchecked_advise(UncheckedAdvice::DontNeed)?
                    },
                }
                return Ok(());
            }
        };
        match &self.inner {
            MapInner::Rw(raw) => raw.advise(mapped)?,
            MapInner::Ro(map) => map.advise(mapped)?,
        }
        Ok(())
    }

    /// Access-pattern hints are not available on this platform.
    #[cfg(not(unix))]
    pub fn advise(&self, _advice: MapAdvice) -> Result<()> {
        Ok(())
    }
}
