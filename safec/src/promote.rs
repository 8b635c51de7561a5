//! # Heap Promotion
//!
//! Rewrites escaping stack allocations into managed-heap allocations.
//!
//! ```text
//! %1 = alloca [16 x i8]             %9  = call i8* @safec_alloc(i64 16)
//!                           ==>     %10 = cast i8* %9 to [16 x i8]*
//! ...                               ...
//! ret void                          call void @safec_free(i8* %9)
//!                                   ret void
//! ```
//!
//! Fixed-size allocations are freed before every `ret`. A variable-length
//! allocation lives until the `stackrestore` that pops the stack frame
//! region it was made in: the frees go right before every restore of the
//! nearest preceding `stacksave` in the same block. Without such a save
//! the allocation is freed before every `ret`, like a fixed one.

use tracing::debug;

use crate::error::InstrumentError;
use crate::ir::{BinaryOp, Callee, DataLayout, Function, InstKind, Type, ValueId};
use crate::runtime::RuntimeFn;

/// Counts of what a promotion run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromotionStats {
    /// Fixed-size allocations promoted.
    pub fixed: usize,
    /// Variable-length allocations promoted.
    pub vla: usize,
    /// Deallocation calls inserted.
    pub frees: usize,
}

enum Footprint {
    Fixed(u64),
    Variable { count: ValueId, elem_size: u64 },
}

/// Rewrites allocations into runtime allocator calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapPromoter {
    layout: DataLayout,
}

impl HeapPromoter {
    /// Create a promoter for `layout`.
    pub fn new(layout: DataLayout) -> Self {
        Self { layout }
    }

    /// Promote every allocation in `escaping`.
    ///
    /// Ids that are not (or no longer) allocations are skipped. Fails when
    /// a constant-count allocation's size does not fit in an `i64`.
    pub fn promote(&self, func: &mut Function, escaping: &[ValueId]) -> Result<PromotionStats, InstrumentError> {
        let mut stats = PromotionStats::default();
        for &alloca in escaping {
            let Some(footprint) = self.footprint(func, alloca)? else {
                continue;
            };
            if func.locate(alloca).is_none() {
                continue;
            }
            // Exit points are found before the rewrite so a VLA's scope is
            // judged against the original block contents.
            let release_points = match footprint {
                Footprint::Fixed(_) => func.exits(),
                Footprint::Variable { .. } => vla_release_points(func, alloca),
            };

            let raw = self.emit_allocation(func, alloca, &footprint);
            for point in release_points {
                func.insert_before(
                    point,
                    Type::Void,
                    InstKind::Call {
                        callee: Callee::Direct(RuntimeFn::Free.symbol().to_string()),
                        args: vec![raw],
                    },
                );
                stats.frees += 1;
            }

            match footprint {
                Footprint::Fixed(size) => {
                    debug!(function = %func.name, alloca = %alloca, size, "promoted allocation");
                    stats.fixed += 1;
                }
                Footprint::Variable { elem_size, .. } => {
                    debug!(function = %func.name, alloca = %alloca, elem_size, "promoted variable-length allocation");
                    stats.vla += 1;
                }
            }
        }
        Ok(stats)
    }

    fn footprint(&self, func: &Function, alloca: ValueId) -> Result<Option<Footprint>, InstrumentError> {
        let Some(InstKind::Alloca { allocated, count }) = func.inst(alloca) else {
            return Ok(None);
        };
        let elem_size = self.layout.alloc_size(allocated);
        Ok(Some(match count {
            None => Footprint::Fixed(elem_size),
            Some(count) => match func.as_const_int(*count) {
                Some(n) => Footprint::Fixed(self.layout.array_size(allocated, n).ok_or_else(|| {
                    InstrumentError::AllocationTooLarge {
                        function: func.name.clone(),
                        elem: allocated.clone(),
                        count: n,
                    }
                })?),
                None => Footprint::Variable {
                    count: *count,
                    elem_size,
                },
            },
        }))
    }

    /// Replace `alloca` with `safec_alloc` plus a cast; returns the raw
    /// `i8*` the matching free must receive.
    fn emit_allocation(&self, func: &mut Function, alloca: ValueId, footprint: &Footprint) -> ValueId {
        let size = match *footprint {
            Footprint::Fixed(size) => func.const_int(Type::i64(), size as i64),
            Footprint::Variable { count, elem_size } => {
                let count = if func.ty(count) == &Type::i64() {
                    count
                } else {
                    func.insert_before(alloca, Type::i64(), InstKind::Cast { value: count })
                };
                let elem = func.const_int(Type::i64(), elem_size as i64);
                func.insert_before(
                    alloca,
                    Type::i64(),
                    InstKind::Binary {
                        op: BinaryOp::Mul,
                        lhs: count,
                        rhs: elem,
                    },
                )
            }
        };

        let raw = func.insert_before(
            alloca,
            RuntimeFn::Alloc.ret(),
            InstKind::Call {
                callee: Callee::Direct(RuntimeFn::Alloc.symbol().to_string()),
                args: vec![size],
            },
        );
        let typed_ptr = func.ty(alloca).clone();
        let typed = func.insert_before(alloca, typed_ptr, InstKind::Cast { value: raw });
        let name = func.value(alloca).name.clone();
        func.values[typed.index()].name = name;

        func.replace_all_uses(alloca, typed);
        func.remove(alloca);
        raw
    }
}

/// Where a variable-length allocation's frees go.
fn vla_release_points(func: &Function, alloca: ValueId) -> Vec<ValueId> {
    let Some((block, pos)) = func.locate(alloca) else {
        return Vec::new();
    };
    let save = func.block(block).insts[..pos]
        .iter()
        .rev()
        .copied()
        .find(|&i| matches!(func.inst(i), Some(InstKind::StackSave)));

    let Some(save) = save else {
        return func.exits();
    };
    let restores: Vec<ValueId> = func
        .instructions()
        .into_iter()
        .map(|(_, i)| i)
        .filter(|&i| matches!(func.inst(i), Some(InstKind::StackRestore { saved }) if *saved == save))
        .collect();
    if restores.is_empty() {
        func.exits()
    } else {
        restores
    }
}
