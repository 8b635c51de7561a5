//! Runtime entry points the instrumentation calls.
//!
//! The names and signatures here mirror the C ABI exported by the
//! `safec-runtime` crate; instrumented modules get a declaration for every
//! entry point they use.

use std::fmt;

use crate::ir::Type;

/// A runtime ABI entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RuntimeFn {
    /// `safec_alloc(size) -> ptr`
    Alloc,
    /// `safec_free(ptr)`
    Free,
    /// `safec_escape_check(base, ptr)`
    EscapeCheck,
    /// `safec_bounds_check(base, ptr, access)`
    BoundsCheck,
    /// `safec_bounds_check_with_size(base, ptr, size, access)`
    BoundsCheckWithSize,
    /// `safec_write_barrier(base, ptr, access)`
    WriteBarrier,
    /// `safec_write_barrier_with_size(base, ptr, size, access, bitmap)`
    WriteBarrierWithSize,
    /// `safec_get_size(obj) -> size`
    GetSize,
    /// `safec_get_type(obj) -> bitmap`
    GetType,
    /// `safec_set_type(obj, bitmap)`
    SetType,
    /// `safec_get_aligned_addr(obj, alignment) -> ptr`
    GetAlignedAddr,
    /// `safec_cast(ptr, bitmap, size) -> ptr`
    Cast,
    /// `safec_print_stats()`
    PrintStats,
    /// `safec_collect() -> freed`
    Collect,
}

impl RuntimeFn {
    /// Every entry point, in ABI table order.
    pub const ALL: [RuntimeFn; 14] = [
        RuntimeFn::Alloc,
        RuntimeFn::Free,
        RuntimeFn::EscapeCheck,
        RuntimeFn::BoundsCheck,
        RuntimeFn::BoundsCheckWithSize,
        RuntimeFn::WriteBarrier,
        RuntimeFn::WriteBarrierWithSize,
        RuntimeFn::GetSize,
        RuntimeFn::GetType,
        RuntimeFn::SetType,
        RuntimeFn::GetAlignedAddr,
        RuntimeFn::Cast,
        RuntimeFn::PrintStats,
        RuntimeFn::Collect,
    ];

    /// Exported symbol name.
    pub fn symbol(self) -> &'static str {
        match self {
            RuntimeFn::Alloc => "safec_alloc",
            RuntimeFn::Free => "safec_free",
            RuntimeFn::EscapeCheck => "safec_escape_check",
            RuntimeFn::BoundsCheck => "safec_bounds_check",
            RuntimeFn::BoundsCheckWithSize => "safec_bounds_check_with_size",
            RuntimeFn::WriteBarrier => "safec_write_barrier",
            RuntimeFn::WriteBarrierWithSize => "safec_write_barrier_with_size",
            RuntimeFn::GetSize => "safec_get_size",
            RuntimeFn::GetType => "safec_get_type",
            RuntimeFn::SetType => "safec_set_type",
            RuntimeFn::GetAlignedAddr => "safec_get_aligned_addr",
            RuntimeFn::Cast => "safec_cast",
            RuntimeFn::PrintStats => "safec_print_stats",
            RuntimeFn::Collect => "safec_collect",
        }
    }

    /// Entry point with the given symbol name.
    pub fn from_symbol(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.symbol() == name)
    }

    /// Parameter types. `size_t` and bitmaps are `i64`, addresses `i8*`.
    pub fn params(self) -> Vec<Type> {
        let ptr = Type::i8_ptr;
        let word = Type::i64;
        match self {
            RuntimeFn::Alloc => vec![word()],
            RuntimeFn::Free | RuntimeFn::GetSize | RuntimeFn::GetType => vec![ptr()],
            RuntimeFn::EscapeCheck => vec![ptr(), ptr()],
            RuntimeFn::BoundsCheck | RuntimeFn::WriteBarrier => vec![ptr(), ptr(), word()],
            RuntimeFn::BoundsCheckWithSize => vec![ptr(), ptr(), word(), word()],
            RuntimeFn::WriteBarrierWithSize => vec![ptr(), ptr(), word(), word(), word()],
            RuntimeFn::SetType | RuntimeFn::GetAlignedAddr => vec![ptr(), word()],
            RuntimeFn::Cast => vec![ptr(), word(), word()],
            RuntimeFn::PrintStats | RuntimeFn::Collect => Vec::new(),
        }
    }

    /// Return type.
    pub fn ret(self) -> Type {
        match self {
            RuntimeFn::Alloc | RuntimeFn::GetAlignedAddr | RuntimeFn::Cast => Type::i8_ptr(),
            RuntimeFn::GetSize | RuntimeFn::GetType | RuntimeFn::Collect => Type::i64(),
            _ => Type::Void,
        }
    }
}

impl fmt::Display for RuntimeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}
