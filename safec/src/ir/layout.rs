//! # Data Layout
//!
//! Sizes, alignments and field offsets of IR types on an LP64 target.
//!
//! | Type | Size | Alignment |
//! |------|------|-----------|
//! | `iN`, `fN` | `ceil(N / 8)` rounded to a power of two | size, at most 16 |
//! | pointer | `pointer_size` | `pointer_size` |
//! | `[n x T]` | `n * alloc_size(T)` | `align(T)` |
//! | struct | fields at aligned offsets, tail padded | max field alignment |
//! | packed struct | fields back to back | 1 |
//!
//! Every size reported here is an allocation size: it already includes
//! the tail padding that separates consecutive array elements.

use serde::{Deserialize, Serialize};

use super::types::Type;

/// A scalar leaf of a flattened aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf<'t> {
    /// Byte offset from the start of the aggregate.
    pub offset: u64,
    /// The scalar type at that offset.
    pub ty: &'t Type,
}

/// Target layout parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataLayout {
    /// Size and alignment of a pointer in bytes.
    pub pointer_size: u64,
}

impl Default for DataLayout {
    fn default() -> Self {
        Self::lp64()
    }
}

fn align_to(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

impl DataLayout {
    /// 64-bit pointers, `long` is 64 bits.
    pub const fn lp64() -> Self {
        Self { pointer_size: 8 }
    }

    fn scalar_size(bits: u32) -> u64 {
        (u64::from(bits).div_ceil(8)).next_power_of_two()
    }

    /// Allocation size of `ty` in bytes.
    pub fn alloc_size(&self, ty: &Type) -> u64 {
        match ty {
            Type::Void | Type::Function { .. } => 0,
            Type::Int(bits) | Type::Float(bits) => Self::scalar_size(*bits),
            Type::Ptr(_) => self.pointer_size,
            Type::Array(elem, len) => self.alloc_size(elem) * len,
            Type::Struct { fields, packed } => self.struct_layout(fields, *packed).1,
        }
    }

    /// Byte size of `count` elements of `elem`, or `None` when the count is
    /// negative or the product does not fit in an `i64`.
    pub fn array_size(&self, elem: &Type, count: i64) -> Option<u64> {
        let count = u64::try_from(count).ok()?;
        self.alloc_size(elem)
            .checked_mul(count)
            .filter(|&size| i64::try_from(size).is_ok())
    }

    /// ABI alignment of `ty` in bytes.
    pub fn align_of(&self, ty: &Type) -> u64 {
        match ty {
            Type::Void | Type::Function { .. } => 1,
            Type::Int(bits) | Type::Float(bits) => Self::scalar_size(*bits).min(16),
            Type::Ptr(_) => self.pointer_size,
            Type::Array(elem, _) => self.align_of(elem),
            Type::Struct { packed: true, .. } => 1,
            Type::Struct { fields, .. } => fields.iter().map(|f| self.align_of(f)).max().unwrap_or(1),
        }
    }

    /// Field offsets and total size of a struct.
    pub fn struct_layout(&self, fields: &[Type], packed: bool) -> (Vec<u64>, u64) {
        let mut offsets = Vec::with_capacity(fields.len());
        let mut end = 0;
        let mut max_align = 1;
        for field in fields {
            let align = if packed { 1 } else { self.align_of(field) };
            max_align = max_align.max(align);
            let offset = align_to(end, align);
            offsets.push(offset);
            end = offset + self.alloc_size(field);
        }
        (offsets, align_to(end, max_align))
    }

    /// Flatten `ty` into its scalar leaves, in offset order.
    pub fn leaves<'t>(&self, ty: &'t Type) -> Vec<Leaf<'t>> {
        let mut leaves = Vec::new();
        self.collect_leaves(ty, 0, &mut leaves);
        leaves
    }

    fn collect_leaves<'t>(&self, ty: &'t Type, base: u64, out: &mut Vec<Leaf<'t>>) {
        match ty {
            Type::Void | Type::Function { .. } => {}
            Type::Int(_) | Type::Float(_) | Type::Ptr(_) => out.push(Leaf { offset: base, ty }),
            Type::Array(elem, len) => {
                let stride = self.alloc_size(elem);
                for i in 0..*len {
                    self.collect_leaves(elem, base + i * stride, out);
                }
            }
            Type::Struct { fields, packed } => {
                let (offsets, _) = self.struct_layout(fields, *packed);
                for (field, offset) in fields.iter().zip(offsets) {
                    self.collect_leaves(field, base + offset, out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_sizes() {
        let dl = DataLayout::lp64();
        assert_eq!(dl.alloc_size(&Type::int(1)), 1);
        assert_eq!(dl.alloc_size(&Type::i8()), 1);
        assert_eq!(dl.alloc_size(&Type::i32()), 4);
        assert_eq!(dl.alloc_size(&Type::int(24)), 4);
        assert_eq!(dl.alloc_size(&Type::i64()), 8);
        assert_eq!(dl.alloc_size(&Type::i8_ptr()), 8);
        assert_eq!(dl.alloc_size(&Type::Void), 0);
    }

    #[test]
    fn test_struct_padding() {
        let dl = DataLayout::lp64();
        // { i8, i64, i32 } -> offsets 0, 8, 16; size 24
        let fields = vec![Type::i8(), Type::i64(), Type::i32()];
        assert_eq!(dl.struct_layout(&fields, false), (vec![0, 8, 16], 24));
        assert_eq!(dl.align_of(&Type::structure(fields.clone())), 8);
        // packed: 0, 1, 9; size 13
        assert_eq!(dl.struct_layout(&fields, true), (vec![0, 1, 9], 13));
        assert_eq!(dl.alloc_size(&Type::packed(fields)), 13);
    }

    #[test]
    fn test_array_size() {
        let dl = DataLayout::lp64();
        let node = Type::structure(vec![Type::i32(), Type::i8_ptr()]);
        assert_eq!(dl.alloc_size(&node), 16);
        assert_eq!(dl.alloc_size(&Type::array(node, 10)), 160);
    }

    #[test]
    fn test_array_size_is_checked() {
        let dl = DataLayout::lp64();
        assert_eq!(dl.array_size(&Type::i32(), 10), Some(40));
        assert_eq!(dl.array_size(&Type::i32(), 0), Some(0));
        assert_eq!(dl.array_size(&Type::i32(), -1), None);
        assert_eq!(dl.array_size(&Type::i64(), i64::MAX), None);
        assert_eq!(dl.array_size(&Type::i8(), i64::MAX), Some(i64::MAX as u64));
    }

    #[test]
    fn test_leaves_flatten_nested() {
        let dl = DataLayout::lp64();
        let inner = Type::structure(vec![Type::i32(), Type::i8_ptr()]);
        let outer = Type::structure(vec![Type::array(inner, 2), Type::i64()]);
        let offsets: Vec<u64> = dl.leaves(&outer).iter().map(|leaf| leaf.offset).collect();
        assert_eq!(offsets, vec![0, 8, 16, 24, 32]);
        let pointers: Vec<u64> = dl
            .leaves(&outer)
            .iter()
            .filter(|leaf| leaf.ty.is_pointer())
            .map(|leaf| leaf.offset)
            .collect();
        assert_eq!(pointers, vec![8, 24]);
    }
}
