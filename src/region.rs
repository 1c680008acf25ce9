use std::fs::{File, OpenOptions};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use super::config::round_up;
use super::error::{TraceResult, TraceStoreError};

/// Typed offset into a mapped region.
///
/// Handles store offsets rather than raw addresses; the live pointer is
/// recomputed from the region base on every access, so a handle never goes
/// stale across sessions mapped at different bases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegionOffset(pub u64);

impl RegionOffset {
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

enum RegionMap {
    /// Shared writable mapping backing a read-write store.
    Write(MmapMut),
    /// Private copy-on-write mapping used for readonly sessions, so the
    /// relocation pass can patch pointers without touching the file.
    Cow(MmapMut),
}

/// Creates a file of exactly `size` bytes, truncating any existing content.
pub(crate) fn create_fixed_size_file(path: &Path, size: u64) -> TraceResult<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(size)?;
    Ok(file)
}

/// A reserve-then-commit memory-mapped region.
///
/// The full reservation is mapped up front over a fixed-size file; the
/// committed size only grows, in extension-granularity steps, so addresses
/// handed out earlier stay valid for the region's lifetime.
pub struct MappedRegion {
    path: PathBuf,
    mmap: Mutex<RegionMap>,
    base: AtomicPtr<u8>,
    committed: AtomicU64,
    reserved: u64,
    writable: bool,
}

unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Creates a new region file of `reserved` bytes with `initial_commit`
    /// bytes immediately usable.
    pub(crate) fn create(path: &Path, reserved: u64, initial_commit: u64) -> TraceResult<Self> {
        if reserved == 0 || initial_commit > reserved {
            return Err(TraceStoreError::invalid_config(format!(
                "bad region sizing for {}: reserved={reserved} initial_commit={initial_commit}",
                path.display()
            )));
        }
        let file = create_fixed_size_file(path, reserved)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        if mmap.len() as u64 != reserved {
            return Err(TraceStoreError::invalid_state(format!(
                "mapped {} of {} reserved bytes for {}",
                mmap.len(),
                reserved,
                path.display()
            )));
        }
        let base = mmap.as_mut_ptr();
        Ok(Self {
            path: path.to_path_buf(),
            mmap: Mutex::new(RegionMap::Write(mmap)),
            base: AtomicPtr::new(base),
            committed: AtomicU64::new(initial_commit),
            reserved,
            writable: true,
        })
    }

    /// Maps an existing region file copy-on-write.
    ///
    /// The mapping is writable so the relocation pass can patch embedded
    /// pointers, but writes stay private to this process.  The committed
    /// size starts at zero; the caller restores it from the recorded
    /// address-range metadata.
    pub(crate) fn open_cow(path: &Path) -> TraceResult<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let reserved = file.metadata()?.len();
        if reserved == 0 {
            return Err(TraceStoreError::corruption(format!(
                "region file {} is empty",
                path.display()
            )));
        }
        let mut mmap = unsafe { MmapOptions::new().map_copy(&file)? };
        let base = mmap.as_mut_ptr();
        Ok(Self {
            path: path.to_path_buf(),
            mmap: Mutex::new(RegionMap::Cow(mmap)),
            base: AtomicPtr::new(base),
            committed: AtomicU64::new(0),
            reserved,
            writable: true,
        })
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    #[inline]
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    pub(crate) fn set_committed(&self, bytes: u64) {
        self.committed.store(bytes.min(self.reserved), Ordering::Release);
    }

    /// Base address of the mapping, for address metadata records.
    #[inline]
    pub fn base_addr(&self) -> u64 {
        self.base.load(Ordering::Acquire) as u64
    }

    /// Commits enough of the reservation to cover `needed` bytes, rounded
    /// up to `granularity`.  Returns the newly committed range.  Callers
    /// serialize extensions externally.
    pub(crate) fn extend_to(&self, needed: u64, granularity: u64) -> TraceResult<Range<u64>> {
        let old = self.committed.load(Ordering::Acquire);
        if needed > self.reserved {
            return Err(TraceStoreError::OutOfSpace {
                requested: needed,
                reserved: self.reserved,
            });
        }
        if needed <= old {
            return Ok(old..old);
        }
        let new = round_up(needed, granularity).min(self.reserved);
        self.committed.store(new, Ordering::Release);
        Ok(old..new)
    }

    pub(crate) fn write_bytes(&self, offset: usize, bytes: &[u8]) -> TraceResult<()> {
        if offset + bytes.len() > self.reserved as usize {
            return Err(TraceStoreError::OutOfSpace {
                requested: (offset + bytes.len()) as u64,
                reserved: self.reserved,
            });
        }
        if !self.writable {
            return Err(TraceStoreError::invalid_state(
                "attempted to write to read-only region",
            ));
        }
        let ptr = self.base.load(Ordering::Acquire);
        if ptr.is_null() {
            return Err(TraceStoreError::invalid_state("region memory unmapped"));
        }
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset), bytes.len());
        }
        Ok(())
    }

    pub(crate) fn read_slice(&self, range: Range<usize>) -> TraceResult<&[u8]> {
        if range.end > self.reserved as usize || range.start > range.end {
            return Err(TraceStoreError::invalid_state(format!(
                "slice {}..{} out of bounds for region of {} bytes",
                range.start, range.end, self.reserved
            )));
        }
        let ptr = self.base.load(Ordering::Acquire);
        if ptr.is_null() {
            return Err(TraceStoreError::invalid_state("region memory unmapped"));
        }
        unsafe { Ok(slice::from_raw_parts(ptr.add(range.start), range.len())) }
    }

    pub(crate) fn slice_mut(&self, range: Range<usize>) -> TraceResult<&mut [u8]> {
        if range.end > self.reserved as usize || range.start > range.end {
            return Err(TraceStoreError::invalid_state(format!(
                "slice {}..{} out of bounds for region of {} bytes",
                range.start, range.end, self.reserved
            )));
        }
        if !self.writable {
            return Err(TraceStoreError::invalid_state(
                "attempted to write to read-only region",
            ));
        }
        let ptr = self.base.load(Ordering::Acquire);
        if ptr.is_null() {
            return Err(TraceStoreError::invalid_state("region memory unmapped"));
        }
        unsafe { Ok(slice::from_raw_parts_mut(ptr.add(range.start), range.len())) }
    }

    pub(crate) fn flush(&self) -> TraceResult<()> {
        let guard = self.mmap.lock();
        match &*guard {
            RegionMap::Write(map) => {
                map.flush()?;
                Ok(())
            }
            // Copy-on-write pages are private; nothing to persist.
            RegionMap::Cow(_) => Ok(()),
        }
    }
}
