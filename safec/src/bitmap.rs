//! # Type Bitmaps
//!
//! The runtime's write barrier needs to know which 8-byte slots of an
//! object hold pointers. We encode that as a `u64`:
//!
//! ```text
//! struct node { long key; struct node *next; struct node *prev; }
//!
//! slot:    3 2 1 0
//! bits:    1 1 1 0   = 0b1110
//!          ^ sentinel: the type spans 3 slots
//! ```
//!
//! Bit `i` is set when the leaf at byte offset `8 * i` is a pointer. When
//! any bit is set, one more bit is set one slot past the last leaf so the
//! barrier can tell how many slots the type spans. A type without pointers
//! maps to `0`.
//!
//! Only 63 slots fit next to the sentinel; larger pointer-bearing types are
//! rejected, as are pointer fields that are not 8-byte aligned.

use std::collections::HashMap;

use crate::error::InstrumentError;
use crate::ir::{DataLayout, Type};

/// Highest slot index the sentinel may occupy.
pub const MAX_BITMAP_SLOTS: u64 = 63;

const SLOT_SIZE: u64 = 8;

/// Compute the bitmap of `ty` without caching.
pub fn compute_bitmap(layout: &DataLayout, ty: &Type) -> Result<u64, InstrumentError> {
    let leaves = layout.leaves(ty);
    if !leaves.iter().any(|leaf| leaf.ty.is_pointer()) {
        return Ok(0);
    }

    let size = layout.alloc_size(ty);
    let misaligned = leaves
        .iter()
        .find(|leaf| leaf.ty.is_pointer() && leaf.offset % SLOT_SIZE != 0)
        .map(|leaf| leaf.offset)
        .or((size % SLOT_SIZE != 0).then_some(size));
    if let Some(offset) = misaligned {
        return Err(InstrumentError::MisalignedPointerField {
            ty: ty.clone(),
            offset,
            size,
        });
    }

    // Leaves come in offset order, so the last one sits in the highest slot.
    let last_slot = leaves.last().map(|leaf| leaf.offset / SLOT_SIZE).unwrap_or(0);
    let sentinel = last_slot + 1;
    if sentinel > MAX_BITMAP_SLOTS {
        return Err(InstrumentError::BitmapOverflow {
            ty: ty.clone(),
            slot: sentinel,
        });
    }

    let bits = leaves
        .iter()
        .filter(|leaf| leaf.ty.is_pointer())
        .fold(0u64, |bits, leaf| bits | 1u64 << (leaf.offset / SLOT_SIZE));
    Ok(bits | 1u64 << sentinel)
}

/// Bitmap computation with a per-type cache.
#[derive(Debug, Clone, Default)]
pub struct TypeBitmapComputer {
    layout: DataLayout,
    cache: HashMap<Type, u64>,
}

impl TypeBitmapComputer {
    /// Create a computer for `layout`.
    pub fn new(layout: DataLayout) -> Self {
        Self {
            layout,
            cache: HashMap::new(),
        }
    }

    /// The layout bitmaps are computed for.
    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    /// Bitmap of `ty`, computed once per distinct type.
    pub fn compute(&mut self, ty: &Type) -> Result<u64, InstrumentError> {
        if let Some(&bits) = self.cache.get(ty) {
            return Ok(bits);
        }
        let bits = compute_bitmap(&self.layout, ty)?;
        self.cache.insert(ty.clone(), bits);
        Ok(bits)
    }

    /// Number of distinct types computed so far.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap(ty: &Type) -> Result<u64, InstrumentError> {
        compute_bitmap(&DataLayout::lp64(), ty)
    }

    #[test]
    fn test_no_pointers_is_zero() {
        assert_eq!(bitmap(&Type::i32()), Ok(0));
        assert_eq!(bitmap(&Type::array(Type::f64(), 100)), Ok(0));
        // Oversized but pointer-free types are fine.
        assert_eq!(bitmap(&Type::array(Type::i64(), 1000)), Ok(0));
    }

    #[test]
    fn test_linked_node() {
        let node = Type::structure(vec![Type::i64(), Type::i8_ptr(), Type::i8_ptr()]);
        assert_eq!(bitmap(&node), Ok(0b1110));
    }

    #[test]
    fn test_lone_pointer() {
        assert_eq!(bitmap(&Type::i8_ptr()), Ok(0b11));
    }

    #[test]
    fn test_sentinel_follows_last_leaf() {
        // { i8*, i32, i32 }: last leaf at offset 12 -> slot 1, sentinel at 2.
        let ty = Type::structure(vec![Type::i8_ptr(), Type::i32(), Type::i32()]);
        assert_eq!(bitmap(&ty), Ok(0b101));
    }

    #[test]
    fn test_capacity_limit() {
        let fits = Type::array(Type::i8_ptr(), 63);
        assert_eq!(bitmap(&fits), Ok(u64::MAX));
        let too_big = Type::array(Type::i8_ptr(), 64);
        assert_eq!(
            bitmap(&too_big),
            Err(InstrumentError::BitmapOverflow { ty: too_big.clone(), slot: 64 })
        );
    }

    #[test]
    fn test_misaligned_pointer() {
        let ty = Type::packed(vec![Type::i8(), Type::i8_ptr()]);
        assert!(matches!(
            bitmap(&ty),
            Err(InstrumentError::MisalignedPointerField { offset: 1, size: 9, .. })
        ));
    }

    #[test]
    fn test_cache() {
        let mut computer = TypeBitmapComputer::new(DataLayout::lp64());
        let node = Type::structure(vec![Type::i8_ptr(), Type::i64()]);
        assert_eq!(computer.compute(&node), Ok(0b101));
        assert_eq!(computer.compute(&node), Ok(0b101));
        assert_eq!(computer.compute(&Type::i64()), Ok(0));
        assert_eq!(computer.cached(), 2);
    }
}
