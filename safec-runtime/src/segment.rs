//! # Segments
//!
//! A segment is a size-aligned reservation of `segment_size` bytes. The
//! allocator reserves twice that and rounds the base up, so the owning
//! segment of any address is `addr & !(segment_size - 1)`.
//!
//! ```text
//! base                data_ptr        alloc_ptr     commit_ptr      reserve_ptr
//!  │ page counters (u16) │ objects ...     │  committed  │   reserved    │
//!  └─────────────────────┴─────────────────┴─────────────┴───────────────┘
//! ```
//!
//! The prefix holds one `u16` free-byte counter per page of the segment.
//! A counter reaching [`PAGE_SIZE`] means the page is fully free and
//! decommitted. In big-object segments the first page of each object holds
//! [`BIG_FIRST_PAGE`] so interior addresses can walk back to the header.

use tracing::debug;

use crate::config::MemoryConfig;
use crate::os::{self, VmError, COMMIT_SIZE, PAGE_SIZE};

/// Counter value marking the first page of a big object.
pub const BIG_FIRST_PAGE: u16 = 1;

/// One segment and its cursors.
///
/// Invariant: `data_ptr <= alloc_ptr <= commit_ptr <= reserve_ptr`.
#[derive(Debug)]
pub struct Segment {
    base: usize,
    data_ptr: usize,
    alloc_ptr: usize,
    commit_ptr: usize,
    reserve_ptr: usize,
    big: bool,
}

impl Segment {
    /// Reserve a new segment and commit its metadata prefix.
    pub fn open(config: &MemoryConfig, big: bool) -> Result<Self, VmError> {
        let size = config.segment_size;
        let raw = os::reserve(2 * size)?;
        let base = os::align_up(raw, size);
        let metadata = config.metadata_size();
        // SAFETY: [base, base + metadata) lies inside the fresh reservation.
        unsafe { os::commit(base, metadata)? };

        let data_ptr = base + metadata;
        debug!(base, size, big, "opened segment");
        Ok(Self {
            base,
            data_ptr,
            alloc_ptr: data_ptr,
            commit_ptr: data_ptr,
            reserve_ptr: base + size,
            big,
        })
    }

    /// Aligned base address.
    pub fn base(&self) -> usize {
        self.base
    }

    /// First allocatable address.
    pub fn data_ptr(&self) -> usize {
        self.data_ptr
    }

    /// Bump cursor.
    pub fn alloc_ptr(&self) -> usize {
        self.alloc_ptr
    }

    /// End of the committed region.
    pub fn commit_ptr(&self) -> usize {
        self.commit_ptr
    }

    /// End of the reservation.
    pub fn reserve_ptr(&self) -> usize {
        self.reserve_ptr
    }

    /// Is this a big-object segment?
    pub fn is_big(&self) -> bool {
        self.big
    }

    /// Does `addr` fall inside the allocated part of the data region?
    pub fn holds(&self, addr: usize) -> bool {
        self.data_ptr <= addr && addr < self.alloc_ptr
    }

    fn counter(&self, page: usize) -> *mut u16 {
        debug_assert!(page >= self.data_ptr && page < self.reserve_ptr);
        debug_assert_eq!(page % PAGE_SIZE, 0);
        let index = (page - self.base) / PAGE_SIZE;
        (self.base as *mut u16).wrapping_add(index)
    }

    /// Free bytes recorded for the page starting at `page`.
    pub fn free_bytes(&self, page: usize) -> u16 {
        // SAFETY: the counter array lives in the committed metadata prefix.
        unsafe { self.counter(page).read() }
    }

    /// Overwrite the counter of `page`.
    pub fn set_free_bytes(&mut self, page: usize, value: u16) {
        // SAFETY: as above.
        unsafe { self.counter(page).write(value) }
    }

    /// Add `bytes` to the counter of `page`, returning the new value.
    pub fn add_free_bytes(&mut self, page: usize, bytes: usize) -> usize {
        let value = self.free_bytes(page) as usize + bytes;
        debug_assert!(value <= PAGE_SIZE, "page {page:#x} over-freed");
        self.set_free_bytes(page, value as u16);
        value
    }

    /// Is the page starting at `page` fully free (and decommitted)?
    pub fn page_is_free(&self, page: usize) -> bool {
        self.free_bytes(page) as usize >= PAGE_SIZE
    }

    /// Bump-allocate `footprint` bytes inside the committed region.
    pub fn try_bump(&mut self, footprint: usize) -> Option<usize> {
        let next = self.alloc_ptr.checked_add(footprint)?;
        if next > self.commit_ptr {
            return None;
        }
        let start = self.alloc_ptr;
        self.alloc_ptr = next;
        Some(start)
    }

    /// Claim the committed-but-unallocated tail, returning its start and
    /// length. The caller turns it into a free hole.
    pub fn take_tail(&mut self) -> Option<(usize, usize)> {
        let len = self.commit_ptr - self.alloc_ptr;
        if len == 0 {
            return None;
        }
        let start = self.alloc_ptr;
        self.alloc_ptr = self.commit_ptr;
        Some((start, len))
    }

    /// Extend the committed region by one granule.
    ///
    /// Returns `Ok(false)` when the reservation is exhausted.
    pub fn extend_commit(&mut self) -> Result<bool, VmError> {
        if self.commit_ptr + COMMIT_SIZE > self.reserve_ptr {
            return Ok(false);
        }
        // SAFETY: the granule lies inside this segment's reservation.
        unsafe { os::commit(self.commit_ptr, COMMIT_SIZE)? };
        self.commit_ptr += COMMIT_SIZE;
        Ok(true)
    }

    /// Commit and claim a page-aligned span for a big object.
    ///
    /// Returns `Ok(None)` when the span does not fit in the reservation.
    pub fn take_span(&mut self, footprint: usize) -> Result<Option<usize>, VmError> {
        debug_assert!(self.big);
        debug_assert_eq!(footprint % PAGE_SIZE, 0);
        if self.alloc_ptr + footprint > self.reserve_ptr {
            return Ok(None);
        }
        let start = self.alloc_ptr;
        // SAFETY: the span lies inside this segment's reservation.
        unsafe { os::commit(start, footprint)? };
        self.alloc_ptr += footprint;
        self.commit_ptr = self.alloc_ptr;
        self.set_free_bytes(start, BIG_FIRST_PAGE);
        Ok(Some(start))
    }
}
