//! # Managed Heap
//!
//! The allocator context. A [`Heap`] owns every segment, the bump cursors,
//! the collection trigger and the statistics; nothing here is global, so
//! tests build as many isolated heaps as they like. The process-wide heap
//! used by instrumented programs lives behind the C ABI in
//! [`ffi`](crate::ffi).
//!
//! ## Allocation paths
//!
//! | Padded request | Path | Footprint |
//! |----------------|------|-----------|
//! | `<= COMMIT_SIZE` | bump in the current small segment | `align8(n) + 16` |
//! | `> COMMIT_SIZE` | page span in a big-object segment | `align_page(n + 16)` |
//!
//! When a bump would cross the committed boundary, the committed tail is
//! turned into a free hole first and the boundary then grows by one
//! granule; an exhausted reservation opens a new segment.
//!
//! ## Freeing
//!
//! Released bytes are added to the owning page's counter. A page whose
//! counter reaches [`PAGE_SIZE`] is decommitted. Big objects are always
//! decommitted whole.

use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::{ConfigError, MemoryConfig};
use crate::header::{HeaderRef, ObjHeader, ObjStatus, HEADER_SIZE};
use crate::os::{self, align_down, align_up, VmError, COMMIT_SIZE, PAGE_SIZE};
use crate::roots::{ProcessRoots, RootProvider};
use crate::segment::{Segment, BIG_FIRST_PAGE};

/// Alignment of every payload.
pub const OBJECT_ALIGN: usize = 8;

/// Errors from heap operations.
#[derive(Debug, Error)]
pub enum HeapError {
    /// An OS memory call failed.
    #[error(transparent)]
    Vm(#[from] VmError),

    /// The request cannot fit in a single segment.
    #[error("allocation of {size} bytes exceeds the segment capacity of {capacity} bytes")]
    TooLarge {
        /// Requested payload size.
        size: usize,
        /// Largest footprint a segment can hold.
        capacity: usize,
    },

    /// Free of something that is not the start of a live object.
    #[error("free of {addr:#x}, which is not the start of a live managed object")]
    InvalidFree {
        /// The freed address.
        addr: usize,
    },

    /// Metadata operation on an address outside any live object.
    #[error("{addr:#x} does not point into a live managed object")]
    NotAnObject {
        /// The offending address.
        addr: usize,
    },

    /// A zero-sized block was found while walking a segment.
    #[error("heap corrupted: zero-sized block at {addr:#x}")]
    Corrupted {
        /// Address of the block.
        addr: usize,
    },
}

/// Cumulative heap statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Footprint bytes handed out.
    pub bytes_allocated: u64,
    /// Footprint bytes released by frees and sweeps.
    pub bytes_freed: u64,
    /// Completed collections.
    pub collections: u64,
    /// Data bytes currently backed by physical memory.
    pub committed_bytes: u64,
    /// Segments reserved so far.
    pub segments: u64,
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Num Bytes Allocated: {}", self.bytes_allocated)?;
        writeln!(f, "Num Bytes Freed: {}", self.bytes_freed)?;
        writeln!(f, "Num GC Triggered: {}", self.collections)?;
        writeln!(f, "Committed Bytes: {}", self.committed_bytes)?;
        write!(f, "Segments: {}", self.segments)
    }
}

/// Segmented, demand-paged heap with conservative collection.
pub struct Heap {
    pub(crate) config: MemoryConfig,
    pub(crate) segments: Vec<Segment>,
    by_base: HashMap<usize, usize>,
    small: Option<usize>,
    big: Option<usize>,
    since_collection: usize,
    pub(crate) stats: HeapStats,
    pub(crate) roots: Box<dyn RootProvider>,
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("config", &self.config)
            .field("segments", &self.segments)
            .field("since_collection", &self.since_collection)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Heap {
    /// A heap rooted in the running process.
    pub fn new(config: MemoryConfig) -> Result<Self, ConfigError> {
        Self::with_roots(config, Box::new(ProcessRoots))
    }

    /// A heap with an explicit root provider. Fails if `config` does not
    /// validate.
    pub fn with_roots(config: MemoryConfig, roots: Box<dyn RootProvider>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            segments: Vec::new(),
            by_base: HashMap::new(),
            small: None,
            big: None,
            since_collection: 0,
            stats: HeapStats::default(),
            roots,
        })
    }

    /// Configuration this heap was built with.
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Snapshot of the statistics.
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Allocate `size` bytes, collecting first if the threshold is crossed.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.account(size)?;

        let padded = align_up(size.max(1), OBJECT_ALIGN)
            .checked_add(HEADER_SIZE)
            .ok_or(HeapError::TooLarge {
                size,
                capacity: self.config.segment_capacity(),
            })?;
        let header = if padded > COMMIT_SIZE {
            self.allocate_big(size)?
        } else {
            self.allocate_small(padded, size)?
        };
        NonNull::new(header.payload() as *mut u8).ok_or(HeapError::Corrupted {
            addr: header.addr(),
        })
    }

    fn account(&mut self, size: usize) -> Result<(), HeapError> {
        self.since_collection = self.since_collection.saturating_add(size);
        if self.since_collection < self.config.gc_threshold {
            return Ok(());
        }
        self.since_collection = 0;
        if self.config.gc_enabled {
            self.collect()?;
        }
        Ok(())
    }

    fn allocate_small(&mut self, footprint: usize, requested: usize) -> Result<HeaderRef, HeapError> {
        loop {
            let idx = match self.small {
                Some(idx) => idx,
                None => {
                    let idx = self.open_segment(false)?;
                    self.small = Some(idx);
                    idx
                }
            };

            if let Some(start) = self.segments[idx].try_bump(footprint) {
                // SAFETY: freshly bumped bytes below the commit boundary.
                let header = unsafe { HeaderRef::at(start) };
                header.store(ObjHeader::new(footprint, requested));
                self.stats.bytes_allocated += footprint as u64;
                return Ok(header);
            }

            self.create_hole(idx)?;
            if self.segments[idx].extend_commit()? {
                self.stats.committed_bytes += COMMIT_SIZE as u64;
                trace!(commit_ptr = self.segments[idx].commit_ptr(), "extended commit");
            } else {
                self.small = None;
            }
        }
    }

    fn allocate_big(&mut self, requested: usize) -> Result<HeaderRef, HeapError> {
        let capacity = self.config.segment_capacity();
        let footprint = requested
            .checked_add(HEADER_SIZE + PAGE_SIZE - 1)
            .map(|n| align_down(n, PAGE_SIZE))
            .filter(|&n| n <= capacity && n <= u32::MAX as usize)
            .ok_or(HeapError::TooLarge {
                size: requested,
                capacity,
            })?;

        loop {
            let idx = match self.big {
                Some(idx) => idx,
                None => {
                    let idx = self.open_segment(true)?;
                    self.big = Some(idx);
                    idx
                }
            };

            match self.segments[idx].take_span(footprint)? {
                Some(start) => {
                    // SAFETY: the whole span was just committed.
                    let header = unsafe { HeaderRef::at(start) };
                    header.store(ObjHeader::new(footprint, requested));
                    self.stats.bytes_allocated += footprint as u64;
                    self.stats.committed_bytes += footprint as u64;
                    debug!(start, footprint, "big allocation");
                    return Ok(header);
                }
                None => self.big = None,
            }
        }
    }

    fn open_segment(&mut self, big: bool) -> Result<usize, HeapError> {
        let segment = Segment::open(&self.config, big)?;
        let idx = self.segments.len();
        self.by_base.insert(segment.base(), idx);
        self.segments.push(segment);
        self.stats.segments += 1;
        Ok(idx)
    }

    /// Turn the committed tail of segment `idx` into a freed pseudo-object.
    fn create_hole(&mut self, idx: usize) -> Result<(), HeapError> {
        let Some((start, len)) = self.segments[idx].take_tail() else {
            return Ok(());
        };
        debug_assert!(len >= 8 && len % OBJECT_ALIGN == 0);
        // SAFETY: the tail is committed; only its first word is written.
        let hole = unsafe { HeaderRef::at(start) };
        hole.init_hole(len);
        self.release_small(idx, hole)?;
        // Holes are not user frees.
        self.stats.bytes_freed -= len as u64;
        Ok(())
    }

    /// Free the object whose payload starts at `ptr`. Null is ignored.
    pub fn free(&mut self, ptr: usize) -> Result<(), HeapError> {
        if ptr == 0 {
            return Ok(());
        }
        let (idx, header) = self
            .lookup(ptr)
            .filter(|(_, header)| header.payload() == ptr)
            .ok_or(HeapError::InvalidFree { addr: ptr })?;
        self.release(idx, header)
    }

    pub(crate) fn release(&mut self, idx: usize, header: HeaderRef) -> Result<(), HeapError> {
        if self.segments[idx].is_big() {
            self.release_big(idx, header)
        } else {
            self.release_small(idx, header)
        }
    }

    fn release_small(&mut self, idx: usize, header: HeaderRef) -> Result<(), HeapError> {
        let size = header.size();
        header.set_status(ObjStatus::FREE);
        self.stats.bytes_freed += size as u64;

        let page = align_down(header.addr(), PAGE_SIZE);
        if self.segments[idx].add_free_bytes(page, size) >= PAGE_SIZE {
            // SAFETY: every object on the page is free.
            unsafe { os::decommit(page, PAGE_SIZE)? };
            self.stats.committed_bytes -= PAGE_SIZE as u64;
            trace!(page, "reclaimed page");
        }
        Ok(())
    }

    fn release_big(&mut self, idx: usize, header: HeaderRef) -> Result<(), HeapError> {
        let start = header.addr();
        let size = header.size();
        header.set_status(ObjStatus::FREE);

        let segment = &mut self.segments[idx];
        for page in (start..start + size).step_by(PAGE_SIZE) {
            segment.set_free_bytes(page, PAGE_SIZE as u16);
        }
        // SAFETY: the span belonged to this object alone.
        unsafe { os::decommit(start, size)? };
        self.stats.bytes_freed += size as u64;
        self.stats.committed_bytes -= size as u64;
        debug!(start, size, "reclaimed big object");
        Ok(())
    }

    /// Find the live object whose payload contains `addr`.
    ///
    /// Returns the owning segment index alongside the header.
    pub(crate) fn lookup(&self, addr: usize) -> Option<(usize, HeaderRef)> {
        let base = align_down(addr, self.config.segment_size);
        let idx = *self.by_base.get(&base)?;
        let segment = &self.segments[idx];
        if !segment.holds(addr) {
            return None;
        }
        let page = align_down(addr, PAGE_SIZE);
        if segment.page_is_free(page) {
            return None;
        }

        let header = if segment.is_big() {
            walk_back(segment, addr, page)?
        } else {
            walk_forward(segment, addr, page)?
        };
        if header.status().contains(ObjStatus::FREE) {
            return None;
        }
        Some((idx, header))
    }

    /// Does `addr` point into a live object's payload?
    pub fn contains(&self, addr: usize) -> bool {
        self.lookup(addr).is_some()
    }

    /// Copy of the header of the live object containing `addr`.
    pub fn header(&self, addr: usize) -> Option<ObjHeader> {
        self.lookup(addr).map(|(_, header)| header.load())
    }

    /// Payload start and caller-visible size of the object containing `addr`.
    pub fn object_bounds(&self, addr: usize) -> Option<(usize, usize)> {
        self.lookup(addr)
            .map(|(_, header)| (header.payload(), header.load().payload_size()))
    }

    /// Free-byte counter of the page holding `addr`, if it belongs to a
    /// segment's data region.
    pub fn page_free_bytes(&self, addr: usize) -> Option<usize> {
        let base = align_down(addr, self.config.segment_size);
        let segment = &self.segments[*self.by_base.get(&base)?];
        let page = align_down(addr, PAGE_SIZE);
        (page >= segment.data_ptr() && page < segment.reserve_ptr())
            .then(|| segment.free_bytes(page) as usize)
    }

    fn object(&self, addr: usize) -> Result<HeaderRef, HeapError> {
        self.lookup(addr)
            .map(|(_, header)| header)
            .ok_or(HeapError::NotAnObject { addr })
    }

    /// Caller-visible size of the object containing `obj`.
    pub fn size_of(&self, obj: usize) -> Result<usize, HeapError> {
        Ok(self.object(obj)?.load().payload_size())
    }

    /// Interior-pointer bitmap of the object containing `obj`.
    pub fn type_of(&self, obj: usize) -> Result<u64, HeapError> {
        Ok(self.object(obj)?.load().ty)
    }

    /// Assign the interior-pointer bitmap of the object containing `obj`.
    pub fn set_type(&mut self, obj: usize, bitmap: u64) -> Result<(), HeapError> {
        self.object(obj)?.update(|header| header.ty = bitmap);
        Ok(())
    }

    /// Record `alignment` for the object at `obj` and return `obj` rounded
    /// up to it.
    pub fn aligned_addr(&mut self, obj: usize, alignment: usize) -> Result<usize, HeapError> {
        let header = self.object(obj)?;
        if alignment <= 1 {
            return Ok(obj);
        }
        let alignment = alignment.next_power_of_two();
        header.update(|header| header.set_alignment(alignment));
        Ok(align_up(obj, alignment))
    }

    /// Type-assigning cast: give the object at `ptr` the bitmap of its new
    /// static type, returning `ptr` unchanged.
    pub fn cast(&mut self, ptr: usize, bitmap: u64, size: usize) -> Result<usize, HeapError> {
        let header = self.object(ptr)?;
        let end = header.payload() + header.load().payload_size();
        if ptr + size > end {
            warn!(ptr, size, end, "cast to a type larger than its object");
        }
        header.update(|header| header.ty = bitmap);
        Ok(ptr)
    }
}

/// Big-object lookup: walk back to the page marked as a first page.
fn walk_back(segment: &Segment, addr: usize, page: usize) -> Option<HeaderRef> {
    let mut first = page;
    while segment.free_bytes(first) != BIG_FIRST_PAGE {
        if first <= segment.data_ptr() {
            return None;
        }
        first -= PAGE_SIZE;
    }
    // SAFETY: the first page of a live big object is committed.
    let header = unsafe { HeaderRef::at(first) };
    (addr >= header.payload() && addr < first + header.size()).then_some(header)
}

/// Small-object lookup: walk the headers of the page in order.
fn walk_forward(segment: &Segment, addr: usize, page: usize) -> Option<HeaderRef> {
    let limit = (page + PAGE_SIZE).min(segment.alloc_ptr());
    let mut cursor = page;
    while cursor < limit {
        // SAFETY: the page is committed and begins with a header; headers
        // chain by size up to the bump cursor.
        let header = unsafe { HeaderRef::at(cursor) };
        let size = header.size();
        if size == 0 || addr < header.payload() {
            return None;
        }
        if addr < cursor + size {
            return Some(header);
        }
        cursor += size;
    }
    None
}
