//! Named shared-memory segments
//!
//! A segment is a file under a shared-memory root (`/dev/shm` by default)
//! mapped with `memmap2`. Each process maps it independently, so the base
//! address differs between the traced process and the drain. Nothing stored
//! inside a segment is ever an address: every structure is located by a byte
//! offset from the segment base, resolved here with bounds and alignment
//! checks at the point of use.

#![allow(unsafe_code)]

use crate::domain::SetupError;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{self, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Alignment of every structure placed in a segment
///
/// Covers the widest cache-line padding used by the shared layouts.
pub const LAYOUT_ALIGN: u64 = 256;

/// Longest POSIX-style segment name, including the leading `/`
pub const MAX_SEGMENT_NAME: usize = 63;

/// Default directory backing POSIX shared memory on Linux
pub const DEFAULT_SHM_ROOT: &str = "/dev/shm";

/// Round `value` up to a multiple of `align` (a power of two)
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Structures that may be viewed in place inside a mapped segment.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, made only of atomics (so shared access
/// through `&T` is sound from any process) and valid when all bytes are zero.
pub unsafe trait SharedLayout: Sync {}

/// A mapped segment
pub struct ShmSegment {
    mmap: MmapMut,
    base: NonNull<u8>,
    len: u64,
    name: String,
    path: Option<PathBuf>,
    owner: bool,
}

// SAFETY: the mapping is only mutated through atomics in SharedLayout types or
// through ring slots whose ownership is handed over by acquire/release indices.
unsafe impl Send for ShmSegment {}
// SAFETY: see above
unsafe impl Sync for ShmSegment {}

impl std::fmt::Debug for ShmSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmSegment")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("owner", &self.owner)
            .field("base", &format!("{:p}", self.base))
            .finish()
    }
}

fn validate_name(name: &str) -> Result<&str, SetupError> {
    let Some(stem) = name.strip_prefix('/') else {
        return Err(SetupError::InvalidConfig(format!("segment name must start with '/': {name}")));
    };
    if name.len() > MAX_SEGMENT_NAME {
        return Err(SetupError::NameTooLong(name.to_string()));
    }
    if stem.is_empty() || stem.contains('/') {
        return Err(SetupError::InvalidConfig(format!("invalid segment name: {name}")));
    }
    Ok(stem)
}

impl ShmSegment {
    /// Create (or replace) a zero-filled segment of `size` bytes.
    ///
    /// The creator owns the segment and unlinks it when dropped.
    pub fn create(root: &Path, name: &str, size: u64) -> Result<Self, SetupError> {
        let stem = validate_name(name)?;
        if size == 0 {
            return Err(SetupError::RegionTooSmall { needed: 1, available: 0 });
        }
        let path = root.join(stem);
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path)?;
        // Fresh length is zero-filled, which is a valid initial state for
        // every SharedLayout type
        file.set_len(size)?;

        // SAFETY: file was just sized; segments are only touched through
        // atomics and handed-over ring slots
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or(SetupError::RegionTooSmall { needed: size, available: 0 })?;

        Ok(Self { mmap, base, len: size, name: name.to_string(), path: Some(path), owner: true })
    }

    /// Map an existing segment created by another process (or this one).
    pub fn open(root: &Path, name: &str) -> Result<Self, SetupError> {
        let stem = validate_name(name)?;
        let path = root.join(stem);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len();
        if size == 0 {
            return Err(SetupError::RegionTooSmall { needed: 1, available: 0 });
        }

        // SAFETY: see create(); contents are validated by the attaching layer
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or(SetupError::RegionTooSmall { needed: size, available: 0 })?;

        Ok(Self { mmap, base, len: size, name: name.to_string(), path: Some(path), owner: false })
    }

    /// Anonymous, process-private segment (used by in-process sessions and tests)
    pub fn anonymous(name: &str, size: u64) -> Result<Self, SetupError> {
        let len = usize::try_from(size)
            .map_err(|_| SetupError::InvalidConfig(format!("segment size {size} too large")))?;
        if len == 0 {
            return Err(SetupError::RegionTooSmall { needed: 1, available: 0 });
        }
        let mut mmap = MmapMut::map_anon(len)?;
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or(SetupError::RegionTooSmall { needed: size, available: 0 })?;
        Ok(Self { mmap, base, len: size, name: name.to_string(), path: None, owner: true })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Base address of this process's mapping, for diagnostics only
    #[must_use]
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Flush dirty pages of a file-backed segment
    pub fn flush(&self) -> Result<(), SetupError> {
        self.mmap.flush()?;
        Ok(())
    }

    /// Fail unless `[offset, offset + len)` lies inside the segment
    pub fn check_range(&self, offset: u64, len: u64) -> Result<(), SetupError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(SetupError::OffsetOutOfBounds { offset, len, segment_size: self.len }),
        }
    }

    /// Resolve `base + offset` as a shared structure
    pub fn view<T: SharedLayout>(&self, offset: u64) -> Result<&T, SetupError> {
        self.check_range(offset, std::mem::size_of::<T>() as u64)?;
        let align = std::mem::align_of::<T>();
        let addr = self.base_addr() as u64 + offset;
        if addr % align as u64 != 0 {
            return Err(SetupError::Misaligned { offset, align });
        }
        // SAFETY: in bounds and aligned (checked above); T is valid for any
        // bytes a peer may have written because it is made only of atomics
        let value = unsafe { &*self.base.as_ptr().add(offset as usize).cast::<T>() };
        Ok(value)
    }

    /// Resolve a byte range of the segment
    pub fn region(&self, offset: u64, len: u64) -> Result<ShmRegion<'_>, SetupError> {
        self.check_range(offset, len)?;
        // SAFETY: offset is in bounds of the mapping
        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset as usize)) };
        Ok(ShmRegion { ptr, len, offset, _segment: PhantomData })
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        if self.owner {
            if let Some(path) = &self.path {
                let _ = fs::remove_file(path);
            }
        }
    }
}

/// A segment whose first bytes hold a validated root structure `T`
pub struct RootedSegment<T> {
    segment: ShmSegment,
    _root: PhantomData<fn() -> T>,
}

impl<T: SharedLayout> RootedSegment<T> {
    /// Fails unless a `T` fits at offset 0
    pub fn new(segment: ShmSegment) -> Result<Self, SetupError> {
        segment.view::<T>(0)?;
        Ok(Self { segment, _root: PhantomData })
    }

    #[must_use]
    pub fn root(&self) -> &T {
        // SAFETY: size and alignment of T at offset 0 were checked in new(),
        // and the mapping lives as long as self
        unsafe { &*self.segment.base.as_ptr().cast::<T>() }
    }

    #[must_use]
    pub fn segment(&self) -> &ShmSegment {
        &self.segment
    }
}

/// A bounds-checked byte range inside a mapped segment
#[derive(Clone, Copy)]
pub struct ShmRegion<'a> {
    ptr: NonNull<u8>,
    len: u64,
    offset: u64,
    _segment: PhantomData<&'a ShmSegment>,
}

impl<'a> ShmRegion<'a> {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of this region from its segment base
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// View a shared structure at `rel` bytes into the region
    pub fn view<T: SharedLayout>(&self, rel: u64) -> Result<&'a T, SetupError> {
        let size = std::mem::size_of::<T>() as u64;
        match rel.checked_add(size) {
            Some(end) if end <= self.len => {}
            _ => return Err(SetupError::RegionTooSmall { needed: rel.saturating_add(size), available: self.len }),
        }
        let align = std::mem::align_of::<T>();
        let addr = self.ptr.as_ptr() as u64 + rel;
        if addr % align as u64 != 0 {
            return Err(SetupError::Misaligned { offset: self.offset + rel, align });
        }
        // SAFETY: in bounds and aligned; T is SharedLayout
        let value = unsafe { &*self.ptr.as_ptr().add(rel as usize).cast::<T>() };
        Ok(value)
    }

    /// Sub-range starting `rel` bytes into the region
    pub fn slice(&self, rel: u64, len: u64) -> Result<ShmRegion<'a>, SetupError> {
        match rel.checked_add(len) {
            Some(end) if end <= self.len => {}
            _ => return Err(SetupError::RegionTooSmall { needed: rel.saturating_add(len), available: self.len }),
        }
        // SAFETY: rel is in bounds of this region
        let ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(rel as usize)) };
        Ok(ShmRegion { ptr, len, offset: self.offset + rel, _segment: PhantomData })
    }
}
