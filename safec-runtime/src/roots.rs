//! # Root Sets and Raw Word Scanning
//!
//! The collector treats every aligned machine word in a root region as a
//! possible pointer. This module owns the only raw reads of arbitrary
//! program memory: [`WordScan`] iterates the words of a range the caller
//! has vouched for, and [`RootProvider`] is the (unsafe) promise that the
//! ranges it hands out stay readable for the duration of a collection.
//!
//! Two providers ship with the runtime:
//!
//! - [`ProcessRoots`]: the executable's initialized and uninitialized
//!   global data plus the calling thread's stack. Used by the process-wide
//!   heap behind the C ABI.
//! - [`ExplicitRoots`]: an explicit list of ranges, optionally without the
//!   stack. Used to build isolated heaps.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::mem;
use std::sync::OnceLock;

use tracing::debug;

/// Size of a scanned slot.
pub const WORD: usize = mem::size_of::<usize>();

/// A half-open address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    /// First address.
    pub start: usize,
    /// One past the last address.
    pub end: usize,
}

impl MemoryRange {
    /// Create a range; an inverted range is treated as empty.
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// The bytes covered by a slice.
    pub fn of<T>(slice: &[T]) -> Self {
        let start = slice.as_ptr() as usize;
        Self::new(start, start + mem::size_of_val(slice))
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Is the range empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Iterator over the aligned words of a readable range.
///
/// Yields `(slot address, value)` pairs.
#[derive(Debug)]
pub struct WordScan {
    cursor: usize,
    end: usize,
}

impl WordScan {
    /// Scan the aligned words inside `range`.
    ///
    /// # Safety
    /// Every byte of `range` must be mapped and readable until the iterator
    /// is dropped.
    pub unsafe fn new(range: MemoryRange) -> Self {
        let cursor = (range.start + WORD - 1) & !(WORD - 1);
        let end = range.end & !(WORD - 1);
        Self {
            cursor,
            end: end.max(cursor),
        }
    }
}

impl Iterator for WordScan {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<(usize, usize)> {
        if self.cursor + WORD > self.end {
            return None;
        }
        let slot = self.cursor;
        self.cursor += WORD;
        // SAFETY: the constructor's contract covers [cursor, end).
        Some((slot, unsafe { read_word(slot) }))
    }
}

/// Read one aligned word.
///
/// # Safety
/// `addr` must be word-aligned and readable.
#[inline]
pub unsafe fn read_word(addr: usize) -> usize {
    std::ptr::read_volatile(addr as *const usize)
}

/// Source of conservative roots for a collection.
///
/// # Safety
/// Every range returned by [`global_ranges`](Self::global_ranges) must be
/// readable whenever the heap collects, and [`stack_base`](Self::stack_base)
/// must be the true upper bound of the calling thread's stack (or `None`).
pub unsafe trait RootProvider: Send {
    /// Global-data ranges to scan.
    fn global_ranges(&self) -> Vec<MemoryRange>;

    /// Upper end of the calling thread's stack, if the stack is scanned.
    fn stack_base(&self) -> Option<usize>;
}

/// Roots of the running process: `.data`, `.bss`, and the current stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRoots;

#[cfg(target_os = "linux")]
fn linker_bounds() -> (usize, usize, usize) {
    extern "C" {
        #[link_name = "etext"]
        static TEXT_END: u8;
        #[link_name = "edata"]
        static DATA_END: u8;
        #[link_name = "end"]
        static BSS_END: u8;
    }
    // SAFETY: only the addresses of the linker-provided symbols are taken.
    unsafe {
        (
            std::ptr::addr_of!(TEXT_END) as usize,
            std::ptr::addr_of!(DATA_END) as usize,
            std::ptr::addr_of!(BSS_END) as usize,
        )
    }
}

// SAFETY: the linker symbols delimit mapped segments of the executable, and
// the stack base comes from the thread's own attributes.
unsafe impl RootProvider for ProcessRoots {
    #[cfg(target_os = "linux")]
    fn global_ranges(&self) -> Vec<MemoryRange> {
        let (text_end, data_end, bss_end) = linker_bounds();
        let data_start = match data_section_size() {
            Some(size) if size <= data_end => data_end - size,
            _ => text_end,
        };
        vec![
            MemoryRange::new(data_start, data_end),
            MemoryRange::new(data_end, bss_end),
        ]
    }

    #[cfg(not(target_os = "linux"))]
    fn global_ranges(&self) -> Vec<MemoryRange> {
        Vec::new()
    }

    fn stack_base(&self) -> Option<usize> {
        crate::os::current_stack_base()
    }
}

/// Size of the running executable's `.data` section, looked up once.
pub fn data_section_size() -> Option<usize> {
    static SIZE: OnceLock<Option<usize>> = OnceLock::new();
    *SIZE.get_or_init(|| {
        let size = File::open("/proc/self/exe")
            .ok()
            .and_then(|mut exe| elf_section_size(&mut exe, ".data"));
        debug!(?size, "resolved .data section size");
        size
    })
}

/// Read `len` bytes at `offset`, refusing spans past the end of the image.
fn read_span<R: Read + Seek>(image: &mut R, image_len: u64, offset: u64, len: usize) -> Option<Vec<u8>> {
    let span_end = offset.checked_add(u64::try_from(len).ok()?)?;
    if span_end > image_len {
        return None;
    }
    let mut buf = vec![0u8; len];
    image.seek(SeekFrom::Start(offset)).ok()?;
    image.read_exact(&mut buf).ok()?;
    Some(buf)
}

/// Find the size of a named section in a little-endian ELF64 image.
///
/// Table and string offsets are checked against the image length before
/// anything is read, so a corrupt header yields `None`.
pub fn elf_section_size<R: Read + Seek>(image: &mut R, name: &str) -> Option<usize> {
    let image_len = image.seek(SeekFrom::End(0)).ok()?;
    let ehdr = read_span(image, image_len, 0, 64)?;
    if &ehdr[..4] != b"\x7fELF" || ehdr[4] != 2 || ehdr[5] != 1 {
        return None;
    }
    let shoff = u64::from_le_bytes(ehdr[0x28..0x30].try_into().ok()?);
    let shentsize = u16::from_le_bytes([ehdr[0x3a], ehdr[0x3b]]) as usize;
    let shnum = u16::from_le_bytes([ehdr[0x3c], ehdr[0x3d]]) as usize;
    let shstrndx = u16::from_le_bytes([ehdr[0x3e], ehdr[0x3f]]) as usize;
    if shentsize < 0x28 || shstrndx >= shnum {
        return None;
    }

    let table = read_span(image, image_len, shoff, shentsize * shnum)?;
    let field_u64 = |index: usize, offset: usize| -> Option<u64> {
        let at = index * shentsize + offset;
        Some(u64::from_le_bytes(table.get(at..at + 8)?.try_into().ok()?))
    };
    let name_offset = |index: usize| -> Option<u32> {
        let at = index * shentsize;
        Some(u32::from_le_bytes(table.get(at..at + 4)?.try_into().ok()?))
    };

    let strtab_offset = field_u64(shstrndx, 0x18)?;
    let strtab_size = usize::try_from(field_u64(shstrndx, 0x20)?).ok()?;
    let strtab = read_span(image, image_len, strtab_offset, strtab_size)?;

    let wanted = name.as_bytes();
    (0..shnum).find_map(|index| {
        let start = name_offset(index)? as usize;
        let rest = strtab.get(start..)?;
        let len = rest.iter().position(|&b| b == 0)?;
        (&rest[..len] == wanted)
            .then(|| field_u64(index, 0x20).map(|size| size as usize))
            .flatten()
    })
}

/// An explicit, caller-managed root set.
#[derive(Debug, Default, Clone)]
pub struct ExplicitRoots {
    ranges: Vec<MemoryRange>,
    scan_stack: bool,
}

impl ExplicitRoots {
    /// An empty root set that does not scan the stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a range to scan.
    ///
    /// # Safety
    /// The range must stay readable for as long as the heap owning this
    /// root set may collect.
    pub unsafe fn with_range(mut self, range: MemoryRange) -> Self {
        self.ranges.push(range);
        self
    }

    /// Also scan the calling thread's stack.
    pub fn with_stack(mut self) -> Self {
        self.scan_stack = true;
        self
    }
}

// SAFETY: ranges are only added through the unsafe `with_range` contract.
unsafe impl RootProvider for ExplicitRoots {
    fn global_ranges(&self) -> Vec<MemoryRange> {
        self.ranges.clone()
    }

    fn stack_base(&self) -> Option<usize> {
        if self.scan_stack {
            crate::os::current_stack_base()
        } else {
            None
        }
    }
}
