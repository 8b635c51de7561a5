//! # Object Headers
//!
//! Every managed payload is immediately preceded by a 16-byte [`ObjHeader`].
//!
//! ```text
//! ┌──────────┬────────┬────────────┬────────┬──────────────────┐
//! │ size u32 │ status │ align_log2 │ slack  │ ty (bitmap) u64  │
//! │          │   u8   │     u8     │  u16   │                  │
//! └──────────┴────────┴────────────┴────────┴──────────────────┘
//!  0          4        5            6        8                16
//! ```
//!
//! `size` is the full footprint including the header. `slack` is the number
//! of footprint bytes past the requested payload, so the caller-visible
//! size is `size - HEADER_SIZE - slack`. A free hole only ever has its first
//! eight bytes written.

use std::fmt;

/// Size of an object header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Status flags stored in each header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ObjStatus(u8);

impl ObjStatus {
    /// Allocated, not marked.
    pub const NONE: Self = Self(0);
    /// Reached during the current collection.
    pub const MARK: Self = Self(1 << 0);
    /// Released; the bytes are accounted in the page counter.
    pub const FREE: Self = Self(1 << 1);

    /// Create from raw bits.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Get raw bits.
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Check if a flag is set.
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl fmt::Debug for ObjStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => write!(f, "NONE"),
            Self::MARK => write!(f, "MARK"),
            Self::FREE => write!(f, "FREE"),
            other => write!(f, "ObjStatus({:#x})", other.0),
        }
    }
}

/// Per-object metadata record.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ObjHeader {
    /// Full footprint in bytes, header included.
    pub size: u32,
    /// Status flags.
    pub status: ObjStatus,
    /// log2 of the requested alignment, 0 when none was requested.
    pub align_log2: u8,
    /// Footprint bytes beyond header plus requested payload.
    pub slack: u16,
    /// Interior-pointer bitmap.
    pub ty: u64,
}

const _: () = assert!(std::mem::size_of::<ObjHeader>() == HEADER_SIZE);

impl ObjHeader {
    /// A fresh, unmarked header for a payload of `requested` bytes in a
    /// `footprint`-byte block.
    pub fn new(footprint: usize, requested: usize) -> Self {
        debug_assert!(footprint >= HEADER_SIZE + requested);
        Self {
            size: footprint as u32,
            status: ObjStatus::NONE,
            align_log2: 0,
            slack: (footprint - HEADER_SIZE - requested) as u16,
            ty: 0,
        }
    }

    /// Bytes usable by the caller.
    pub fn payload_size(&self) -> usize {
        (self.size as usize)
            .saturating_sub(HEADER_SIZE)
            .saturating_sub(self.slack as usize)
    }

    /// Bytes between the payload start and the next header.
    pub fn payload_span(&self) -> usize {
        (self.size as usize).saturating_sub(HEADER_SIZE)
    }

    /// Requested alignment, or 0.
    pub fn alignment(&self) -> usize {
        if self.align_log2 == 0 {
            0
        } else {
            1usize << self.align_log2
        }
    }

    /// Record a requested alignment (a power of two).
    pub fn set_alignment(&mut self, alignment: usize) {
        self.align_log2 = if alignment <= 1 {
            0
        } else {
            alignment.trailing_zeros() as u8
        };
    }

    /// Is this block released?
    pub fn is_free(&self) -> bool {
        self.status.contains(ObjStatus::FREE)
    }

    /// Is this block marked by the collector?
    pub fn is_marked(&self) -> bool {
        self.status.contains(ObjStatus::MARK)
    }
}

/// Handle to a header in committed segment memory.
///
/// Only the heap creates these, and only for addresses it has validated.
/// A handle is valid until the page holding it is decommitted; the heap
/// never keeps one across a free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HeaderRef(usize);

impl HeaderRef {
    /// # Safety
    /// At least the first eight bytes at `addr` must be committed and hold
    /// (or be about to receive) a header.
    pub(crate) unsafe fn at(addr: usize) -> Self {
        debug_assert_eq!(addr % 8, 0);
        Self(addr)
    }

    fn raw(self) -> *mut ObjHeader {
        self.0 as *mut ObjHeader
    }

    pub(crate) fn addr(self) -> usize {
        self.0
    }

    pub(crate) fn payload(self) -> usize {
        payload_of(self.0)
    }

    /// Footprint, read from the first word only.
    pub(crate) fn size(self) -> usize {
        // SAFETY: the first word is committed per the constructor contract.
        unsafe { std::ptr::addr_of!((*self.raw()).size).read() as usize }
    }

    pub(crate) fn status(self) -> ObjStatus {
        // SAFETY: as above.
        unsafe { std::ptr::addr_of!((*self.raw()).status).read() }
    }

    pub(crate) fn set_status(self, status: ObjStatus) {
        // SAFETY: as above.
        unsafe { std::ptr::addr_of_mut!((*self.raw()).status).write(status) }
    }

    /// Write the first word of a free-hole pseudo-object.
    pub(crate) fn init_hole(self, size: usize) {
        // SAFETY: as above; the second word is never touched.
        unsafe {
            std::ptr::addr_of_mut!((*self.raw()).size).write(size as u32);
            std::ptr::addr_of_mut!((*self.raw()).status).write(ObjStatus::NONE);
        }
    }

    /// Full copy of an object header (never a hole).
    pub(crate) fn load(self) -> ObjHeader {
        // SAFETY: object headers are fully committed.
        unsafe { self.raw().read() }
    }

    pub(crate) fn store(self, header: ObjHeader) {
        // SAFETY: as above.
        unsafe { self.raw().write(header) }
    }

    pub(crate) fn update(self, f: impl FnOnce(&mut ObjHeader)) {
        let mut header = self.load();
        f(&mut header);
        self.store(header);
    }
}

/// Header address for a payload address.
#[inline]
pub const fn header_of(payload: usize) -> usize {
    payload - HEADER_SIZE
}

/// Payload address for a header address.
#[inline]
pub const fn payload_of(header: usize) -> usize {
    header + HEADER_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_size_hides_header_and_slack() {
        let hdr = ObjHeader::new(48, 27);
        assert_eq!(hdr.payload_size(), 27);
        assert_eq!(hdr.payload_span(), 32);
        assert_eq!(hdr.status, ObjStatus::NONE);
    }

    #[test]
    fn test_alignment_roundtrip() {
        let mut hdr = ObjHeader::new(32, 16);
        assert_eq!(hdr.alignment(), 0);
        hdr.set_alignment(64);
        assert_eq!(hdr.alignment(), 64);
        hdr.set_alignment(1);
        assert_eq!(hdr.alignment(), 0);
    }

    #[test]
    fn test_status_flags() {
        let marked = ObjStatus::MARK;
        assert!(marked.contains(ObjStatus::MARK));
        assert!(!marked.contains(ObjStatus::FREE));
        assert_eq!(format!("{:?}", ObjStatus::FREE), "FREE");
        assert_eq!(ObjStatus::from_bits(3).bits(), 3);
    }
}
