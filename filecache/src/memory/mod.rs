//! This module provides the shared memory features of the cache.
//!
//! A [`SharedBuffer`] is a fixed-capacity byte region mapped by every worker:
//!
//! ```text
//!     0                     STATE_STORAGE_LENGTH                          len
//!     | state register      | file contents, at the offsets recorded      |
//!     |                     | by the writer's AddressMap                  |
//! ```
//!
//! The region carries no lock. Writers and readers coordinate through the [`WorkerStateRegister`] at its head, which
//! only reports state: honoring it is up to every participant.

use std::fs::OpenOptions;
use std::ops::Range;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::AtomicU8;

use bytes::Bytes;
use memmap2::MmapMut;

use crate::config::STATE_STORAGE_LENGTH;
use crate::error::{Error, Result};

mod map;
pub use map::*;

mod state;
pub use state::*;

/// A memory mapped region shareable across threads, tasks and, when file-backed, processes.
#[derive(Debug)]
pub struct SharedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    _mmap: MmapMut,
}

// SAFETY: the mapping lives as long as `_mmap`. Concurrent accesses go through raw pointer copies on disjoint ranges
// by protocol, and through atomics for the state register.
unsafe impl Send for SharedBuffer {}
unsafe impl Sync for SharedBuffer {}

impl SharedBuffer {
    /// Map an anonymous region of `len` bytes, shared by every handle of this process.
    pub fn anonymous(len: usize) -> Result<Self> {
        Self::from_mmap(MmapMut::map_anon(Self::checked_len(len)?)?)
    }

    /// Create (or truncate) the file at `path` and map `len` bytes of it, so that other processes can [`open`] it.
    ///
    /// [`open`]: SharedBuffer::open
    pub fn create(path: impl AsRef<Path>, len: usize) -> Result<Self> {
        let len = Self::checked_len(len)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len as u64)?;

        tracing::debug!("Created shared buffer of {len} bytes: `{}`", path.as_ref().display());

        // SAFETY: the file is only meant to be accessed through mappings of this type.
        Self::from_mmap(unsafe { MmapMut::map_mut(&file)? })
    }

    /// Map an existing shared buffer file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;

        Self::checked_len(file.metadata()?.len() as usize)?;

        // SAFETY: see `create`.
        Self::from_mmap(unsafe { MmapMut::map_mut(&file)? })
    }

    fn checked_len(len: usize) -> Result<usize> {
        if len < STATE_STORAGE_LENGTH {
            return Err(Error::InvalidConfiguration(format!(
                "shared buffer of {len} bytes cannot hold the {STATE_STORAGE_LENGTH} bytes state register"
            )));
        }

        Ok(len)
    }

    fn from_mmap(mut mmap: MmapMut) -> Result<Self> {
        let len = mmap.len();
        let ptr = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| Error::InvalidConfiguration("null mapping".into()))?;

        Ok(Self { ptr, len, _mmap: mmap })
    }

    /// Total length, state register included.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Length of the file content area.
    #[inline]
    pub fn content_capacity(&self) -> usize {
        self.len - STATE_STORAGE_LENGTH
    }

    /// Atomic view of the byte at `offset`.
    ///
    /// # Panics
    /// Panics if `offset` is out of bounds.
    pub(crate) fn atomic(&self, offset: usize) -> &AtomicU8 {
        assert!(offset < self.len, "offset {offset} out of bounds");

        // SAFETY: in bounds, `u8` has no alignment requirement and the mapping outlives `&self`.
        unsafe { AtomicU8::from_ptr(self.ptr.as_ptr().add(offset)) }
    }

    fn checked_range(&self, range: &Range<usize>) -> Result<()> {
        if range.start > range.end || range.end > self.len {
            return Err(Error::CapacityExceeded {
                requested: range.end,
                available: self.len,
            });
        }

        Ok(())
    }

    /// Copy the bytes at `range` of the whole region.
    pub fn read(&self, range: Range<usize>) -> Result<Bytes> {
        self.checked_range(&range)?;

        let mut output = vec![0; range.len()];

        // SAFETY: in bounds, and `output` is a fresh allocation.
        unsafe { ptr::copy_nonoverlapping(self.ptr.as_ptr().add(range.start), output.as_mut_ptr(), range.len()) };

        Ok(Bytes::from(output))
    }

    /// Copy `data` at `offset` of the whole region.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let range = offset..offset.saturating_add(data.len());
        self.checked_range(&range)?;

        // SAFETY: in bounds, and `data` cannot alias the mapping mutably.
        unsafe { ptr::copy(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len()) };

        Ok(())
    }

    /// Copy the bytes at `range` of the content area.
    #[inline]
    pub fn read_content(&self, range: Range<usize>) -> Result<Bytes> {
        self.read(range.start + STATE_STORAGE_LENGTH..range.end + STATE_STORAGE_LENGTH)
    }

    /// Copy `data` at `offset` of the content area.
    #[inline]
    pub fn write_content(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.write(offset + STATE_STORAGE_LENGTH, data)
    }

    /// Zero the whole content area, leaving the state register untouched.
    pub fn clear_content(&self) {
        // SAFETY: the content area spans from the end of the register to the end of the mapping.
        unsafe { ptr::write_bytes(self.ptr.as_ptr().add(STATE_STORAGE_LENGTH), 0, self.content_capacity()) };
    }
}
