//! # Conservative Mark-Sweep Collection
//!
//! A full, synchronous, non-moving collection:
//!
//! 1. **Roots.** Every aligned word of the provider's global ranges and of
//!    the calling thread's stack (from just above the collector's own
//!    frame up to the stack base) is a candidate pointer.
//! 2. **Mark.** A candidate that resolves to a live, unmarked header is
//!    marked and queued. The queue is drained FIFO, each object's payload
//!    being scanned exactly like a root range, until it is empty.
//! 3. **Sweep.** Every segment is walked from `data_ptr` to `alloc_ptr`.
//!    Fully free pages are skipped in one step; unmarked objects are
//!    released and marked ones are reset for the next cycle.
//!
//! A stale word that happens to alias an object only keeps that object
//! alive longer; nothing reachable is ever freed.

use std::collections::VecDeque;
use std::hint::black_box;
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
use std::arch::asm;

use tracing::{debug, info};

use crate::header::{HeaderRef, ObjStatus};
use crate::heap::{Heap, HeapError};
use crate::os::{align_down, PAGE_SIZE};
use crate::roots::{MemoryRange, WordScan, WORD};

/// Value planted in the collector's frame to find where its stack starts.
pub const STACK_SENTINEL: usize = 0xcafe_dead;

/// Outcome of one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionStats {
    /// Objects found reachable.
    pub marked: usize,
    /// Objects released by the sweep.
    pub freed_objects: usize,
    /// Footprint bytes released by the sweep.
    pub freed_bytes: usize,
}

/// Mark-phase state: the heap being traced and the unscanned worklist.
struct Marker<'h> {
    heap: &'h Heap,
    unscanned: VecDeque<HeaderRef>,
    marked: usize,
}

impl<'h> Marker<'h> {
    fn new(heap: &'h Heap) -> Self {
        Self {
            heap,
            unscanned: VecDeque::new(),
            marked: 0,
        }
    }

    /// # Safety
    /// `range` must be readable for the duration of the call.
    unsafe fn scan(&mut self, range: MemoryRange) {
        for (_, value) in WordScan::new(range) {
            self.visit(value);
        }
    }

    fn visit(&mut self, candidate: usize) {
        let Some((_, header)) = self.heap.lookup(candidate) else {
            return;
        };
        if header.status().contains(ObjStatus::MARK) {
            return;
        }
        header.set_status(ObjStatus::MARK);
        self.unscanned.push_back(header);
        self.marked += 1;
    }

    fn drain(&mut self) {
        while let Some(header) = self.unscanned.pop_front() {
            let payload = MemoryRange::new(header.payload(), header.addr() + header.size());
            // SAFETY: marked objects are live, so their pages are committed.
            unsafe { self.scan(payload) };
        }
    }
}

/// Address of a local in a frame below the caller's.
#[inline(never)]
fn deeper_frame_addr() -> usize {
    let marker = 0usize;
    black_box(&marker) as *const usize as usize
}

/// First stack address above the collector's frame.
///
/// Scans upward from a deeper frame for [`STACK_SENTINEL`]. If the
/// sentinel is missing that frame's address is used, which scans more.
fn stack_scan_start(base: usize) -> usize {
    let low = align_down(deeper_frame_addr(), WORD);
    // SAFETY: [low, base) is the live part of the current thread's stack.
    unsafe { WordScan::new(MemoryRange::new(low, base)) }
        .find(|&(_, value)| value == STACK_SENTINEL)
        .map_or(low, |(slot, _)| slot + WORD)
}

/// Copy the callee-saved registers into `regs` so pointers held only in
/// registers are seen by the stack scan.
#[inline(always)]
fn spill_registers(regs: &mut [usize; 12]) {
    let out = regs.as_mut_ptr();
    #[cfg(target_arch = "x86_64")]
    // SAFETY: writes six words into `regs`.
    unsafe {
        asm!(
            "mov [{out}], rbx",
            "mov [{out} + 8], rbp",
            "mov [{out} + 16], r12",
            "mov [{out} + 24], r13",
            "mov [{out} + 32], r14",
            "mov [{out} + 40], r15",
            out = in(reg) out,
            options(nostack, preserves_flags),
        );
    }
    #[cfg(target_arch = "aarch64")]
    // SAFETY: writes twelve words into `regs`.
    unsafe {
        asm!(
            "stp x19, x20, [{out}]",
            "stp x21, x22, [{out}, #16]",
            "stp x23, x24, [{out}, #32]",
            "stp x25, x26, [{out}, #48]",
            "stp x27, x28, [{out}, #64]",
            "stp x29, x30, [{out}, #80]",
            out = in(reg) out,
            options(nostack, preserves_flags),
        );
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    let _ = out;
}

impl Heap {
    /// Run a full collection now.
    pub fn collect(&mut self) -> Result<CollectionStats, HeapError> {
        // The spilled registers sit in this frame, above the scanned start.
        let mut regs = [0usize; 12];
        spill_registers(&mut regs);
        black_box(&mut regs);
        let stats = self.collect_from_here();
        black_box(&regs);
        stats
    }

    #[inline(never)]
    fn collect_from_here(&mut self) -> Result<CollectionStats, HeapError> {
        let frame_marker = STACK_SENTINEL;
        black_box(&frame_marker);
        self.stats.collections += 1;
        debug!(cycle = self.stats.collections, "collection started");

        let mut marker = Marker::new(self);
        for range in self.roots.global_ranges() {
            // SAFETY: the root provider vouches for its ranges.
            unsafe { marker.scan(range) };
        }
        if let Some(base) = self.roots.stack_base() {
            let top = stack_scan_start(base);
            // SAFETY: [top, base) lies inside the calling thread's stack.
            unsafe { marker.scan(MemoryRange::new(top, base)) };
        }
        marker.drain();
        let marked = marker.marked;

        let (freed_objects, freed_bytes) = self.sweep()?;
        black_box(&frame_marker);

        info!(
            cycle = self.stats.collections,
            marked,
            freed_objects,
            freed_bytes,
            "collection finished"
        );
        Ok(CollectionStats {
            marked,
            freed_objects,
            freed_bytes,
        })
    }

    fn sweep(&mut self) -> Result<(usize, usize), HeapError> {
        let mut freed_objects = 0;
        let mut freed_bytes = 0;

        for idx in 0..self.segments.len() {
            let mut cursor = self.segments[idx].data_ptr();
            let end = self.segments[idx].alloc_ptr();
            while cursor < end {
                let page = align_down(cursor, PAGE_SIZE);
                if self.segments[idx].page_is_free(page) {
                    cursor = page + PAGE_SIZE;
                    continue;
                }

                // SAFETY: the page is committed and `cursor` is on the header
                // chain starting at `data_ptr`.
                let header = unsafe { HeaderRef::at(cursor) };
                // Read before releasing: the page may be decommitted.
                let size = header.size();
                if size == 0 {
                    return Err(HeapError::Corrupted { addr: cursor });
                }
                let status = header.status();
                if status.contains(ObjStatus::FREE) {
                    // hole or already released
                } else if status.contains(ObjStatus::MARK) {
                    header.set_status(ObjStatus::NONE);
                } else {
                    self.release(idx, header)?;
                    freed_objects += 1;
                    freed_bytes += size;
                }
                cursor += size;
            }
        }
        Ok((freed_objects, freed_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::roots::ExplicitRoots;

    fn config() -> MemoryConfig {
        MemoryConfig {
            segment_size: 1 << 20,
            gc_threshold: usize::MAX,
            gc_enabled: false,
        }
    }

    fn heap_rooted_at(roots: &[usize]) -> Heap {
        // SAFETY: every caller keeps `roots` alive longer than the heap.
        let provider = unsafe { ExplicitRoots::new().with_range(MemoryRange::of(roots)) };
        Heap::with_roots(config(), Box::new(provider)).unwrap()
    }

    #[test]
    fn test_unrooted_objects_are_freed() {
        let mut heap = Heap::with_roots(config(), Box::new(ExplicitRoots::new())).unwrap();
        let a = heap.allocate(32).unwrap().as_ptr() as usize;
        let stats = heap.collect().unwrap();
        assert_eq!(stats.marked, 0);
        assert_eq!(stats.freed_objects, 1);
        assert_eq!(stats.freed_bytes, 48);
        assert!(!heap.contains(a));
        assert_eq!(heap.stats().collections, 1);
    }

    #[test]
    fn test_transitive_marking() {
        let mut roots = vec![0usize; 1];
        let mut heap = heap_rooted_at(&roots);
        let a = heap.allocate(16).unwrap().as_ptr() as usize;
        let b = heap.allocate(16).unwrap().as_ptr() as usize;
        let c = heap.allocate(16).unwrap().as_ptr() as usize;
        // root -> a -> (interior of) b
        roots[0] = a;
        unsafe { *(a as *mut usize) = b + 8 };

        let stats = heap.collect().unwrap();
        assert_eq!(stats.marked, 2);
        assert!(heap.contains(a));
        assert!(heap.contains(b));
        assert!(!heap.contains(c));
        // Marks are cleared by the sweep.
        assert_eq!(heap.header(a).unwrap().status, ObjStatus::NONE);
        assert_eq!(heap.header(b).unwrap().status, ObjStatus::NONE);
        drop(heap);
        drop(roots);
    }

    #[test]
    fn test_cycles_terminate() {
        let mut roots = vec![0usize; 1];
        let mut heap = heap_rooted_at(&roots);
        let a = heap.allocate(8).unwrap().as_ptr() as usize;
        let b = heap.allocate(8).unwrap().as_ptr() as usize;
        unsafe {
            *(a as *mut usize) = b;
            *(b as *mut usize) = a;
        }
        roots[0] = b;
        assert_eq!(heap.collect().unwrap().marked, 2);

        roots[0] = 0;
        let stats = heap.collect().unwrap();
        assert_eq!(stats.freed_objects, 2);
        drop(heap);
        drop(roots);
    }

    #[test]
    fn test_big_objects_collected_whole() {
        let mut roots = vec![0usize; 1];
        let mut heap = heap_rooted_at(&roots);
        let big = heap.allocate(5 * PAGE_SIZE).unwrap().as_ptr() as usize;
        let small = heap.allocate(24).unwrap().as_ptr() as usize;
        // The big object keeps the small one alive through its last word.
        roots[0] = big + 100;
        unsafe { *((big + 5 * PAGE_SIZE - WORD) as *mut usize) = small };

        heap.collect().unwrap();
        assert!(heap.contains(big));
        assert!(heap.contains(small));

        roots[0] = 0;
        let stats = heap.collect().unwrap();
        assert_eq!(stats.freed_objects, 2);
        assert_eq!(heap.page_free_bytes(big), Some(PAGE_SIZE));
        drop(heap);
        drop(roots);
    }

    #[test]
    fn test_sweep_skips_reclaimed_pages() {
        let mut roots = vec![0usize; 1];
        let mut heap = heap_rooted_at(&roots);
        let first: Vec<usize> = (0..4)
            .map(|_| heap.allocate(1008).unwrap().as_ptr() as usize)
            .collect();
        let survivor = heap.allocate(1008).unwrap().as_ptr() as usize;
        roots[0] = survivor;

        let stats = heap.collect().unwrap();
        assert_eq!(stats.freed_objects, 4);
        assert_eq!(heap.page_free_bytes(first[0]), Some(PAGE_SIZE));
        // A second pass walks over the decommitted page without touching it.
        let stats = heap.collect().unwrap();
        assert_eq!(stats.freed_objects, 0);
        assert!(heap.contains(survivor));
        drop(heap);
        drop(roots);
    }

    #[test]
    fn test_threshold_triggers_collection() {
        let mut config = config();
        config.gc_threshold = 1024;
        config.gc_enabled = true;
        let mut heap = Heap::with_roots(config, Box::new(ExplicitRoots::new())).unwrap();
        for _ in 0..8 {
            heap.allocate(256).unwrap();
        }
        assert_eq!(heap.stats().collections, 2);
    }

    #[test]
    fn test_stack_scan_start_above_deeper_frame() {
        let frame_marker = STACK_SENTINEL;
        black_box(&frame_marker);
        if let Some(base) = crate::os::current_stack_base() {
            let start = stack_scan_start(base);
            assert!(start <= base);
            assert!(start > deeper_frame_addr() - 4096);
        }
        black_box(&frame_marker);
    }
}
