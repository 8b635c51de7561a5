//! # Runtime Checks
//!
//! Validation entry points called from instrumented code. Each check
//! returns a [`SafetyViolation`] instead of aborting; the C ABI layer turns
//! any violation into a fatal abort.
//!
//! | Check | Fails when |
//! |-------|------------|
//! | escape | `ptr` left the object `base` belongs to |
//! | bounds | `[ptr, ptr + access)` is not inside the object |
//! | write barrier | a bitmap-marked slot overlapping the store holds a non-zero non-object value |
//!
//! The `*_with_size` forms take the object extent from the caller (static
//! sizes known at compile time); the plain forms resolve it through the
//! heap's header lookup.

use thiserror::Error;

use crate::heap::Heap;
use crate::roots::{read_word, WORD};

/// A detected memory-safety violation.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SafetyViolation {
    /// The base pointer does not belong to any live managed object.
    #[error("{addr:#x} does not point into a live managed object")]
    UnknownObject {
        /// The unresolved base.
        addr: usize,
    },

    /// A derived pointer escaped outside its object.
    #[error("pointer {ptr:#x} escapes its object [{start:#x}, {end:#x})")]
    Escape {
        /// The escaping pointer.
        ptr: usize,
        /// Object start.
        start: usize,
        /// Object end (exclusive).
        end: usize,
    },

    /// An access is not fully inside its object.
    #[error("{access}-byte access at {ptr:#x} is outside [{start:#x}, {end:#x})")]
    OutOfBounds {
        /// First accessed byte.
        ptr: usize,
        /// Access width.
        access: usize,
        /// Object start.
        start: usize,
        /// Object end (exclusive).
        end: usize,
    },

    /// A pointer field received a value that is not a live object.
    #[error("store into pointer slot {slot:#x} published {value:#x}, which is not a live object")]
    InvalidPointer {
        /// Slot that was written.
        slot: usize,
        /// The value found there.
        value: usize,
    },
}

/// Number of fields a barrier bitmap describes, and the bitmap without
/// its sentinel bit.
///
/// The sentinel is the highest set bit; the fields are the bits below it.
pub fn split_bitmap(bitmap: u64) -> Option<(u32, u64)> {
    if bitmap == 0 {
        return None;
    }
    let fields = 63 - bitmap.leading_zeros();
    if fields == 0 {
        return None;
    }
    Some((fields, bitmap & !(1u64 << fields)))
}

impl Heap {
    fn extent(&self, base: usize) -> Result<(usize, usize), SafetyViolation> {
        self.object_bounds(base)
            .map(|(start, size)| (start, start + size))
            .ok_or(SafetyViolation::UnknownObject { addr: base })
    }

    /// `EscapeCheck(base, ptr)`.
    ///
    /// A null pointer derived from a null base points into nothing and
    /// passes.
    pub fn escape_check(&self, base: usize, ptr: usize) -> Result<(), SafetyViolation> {
        if base == 0 && ptr == 0 {
            return Ok(());
        }
        let (start, end) = self.extent(base)?;
        if ptr < start || ptr >= end {
            return Err(SafetyViolation::Escape { ptr, start, end });
        }
        Ok(())
    }

    /// `BoundsCheck(base, ptr, access)`: extent from the header.
    pub fn bounds_check(&self, base: usize, ptr: usize, access: usize) -> Result<(), SafetyViolation> {
        let (start, end) = self.extent(base)?;
        check_span(start, end, ptr, access)
    }

    /// `WriteBarrier(base, ptr, access)`: extent and bitmap from the header.
    pub fn write_barrier(&self, base: usize, ptr: usize, access: usize) -> Result<(), SafetyViolation> {
        let (start, end) = self.extent(base)?;
        let bitmap = self.type_of(start).unwrap_or(0);
        // SAFETY: the slots read are inside a live object's payload.
        unsafe { self.write_barrier_with_size(start, ptr, end - start, access, bitmap) }
    }

    /// `WriteBarrierWithSize(base, ptr, size, access, bitmap)`.
    ///
    /// Only slots that overlap `[ptr, ptr + access)` are inspected, with the
    /// bitmap repeating every `fields` slots (arrays of the same element).
    ///
    /// # Safety
    /// Every slot of `[base, base + size)` overlapping the written span
    /// must be readable.
    pub unsafe fn write_barrier_with_size(
        &self,
        base: usize,
        ptr: usize,
        size: usize,
        access: usize,
        bitmap: u64,
    ) -> Result<(), SafetyViolation> {
        let Some((fields, pointers)) = split_bitmap(bitmap) else {
            return Ok(());
        };
        let (Some(end), Some(span_end)) = (base.checked_add(size), ptr.checked_add(access)) else {
            return Err(SafetyViolation::OutOfBounds {
                ptr,
                access,
                start: base,
                end: base.saturating_add(size),
            });
        };
        if access == 0 || span_end <= base {
            return Ok(());
        }

        let first = ptr.saturating_sub(base) / WORD;
        let last = (span_end - 1 - base) / WORD;
        for index in first..=last {
            let slot = base + index * WORD;
            if slot >= end || end - slot < WORD {
                break;
            }
            let field = (index % fields as usize) as u32;
            if pointers & (1u64 << field) == 0 {
                continue;
            }
            let value = read_word(slot);
            if value != 0 && !self.contains(value) {
                return Err(SafetyViolation::InvalidPointer { slot, value });
            }
        }
        Ok(())
    }
}

/// `BoundsCheckWithSize(base, ptr, size, access)`.
pub fn bounds_check_with_size(
    base: usize,
    ptr: usize,
    size: usize,
    access: usize,
) -> Result<(), SafetyViolation> {
    let Some(end) = base.checked_add(size) else {
        return Err(SafetyViolation::OutOfBounds {
            ptr,
            access,
            start: base,
            end: usize::MAX,
        });
    };
    check_span(base, end, ptr, access)
}

fn check_span(start: usize, end: usize, ptr: usize, access: usize) -> Result<(), SafetyViolation> {
    let fits = ptr >= start && ptr.checked_add(access).is_some_and(|last| last <= end);
    if !fits {
        return Err(SafetyViolation::OutOfBounds {
            ptr,
            access,
            start,
            end,
        });
    }
    Ok(())
}
