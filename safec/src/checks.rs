//! # Check Insertion
//!
//! Inserts runtime escape checks, bounds checks and write barriers.
//!
//! ## Candidate Sites
//!
//! | Site | Check | Placement |
//! |------|-------|-----------|
//! | pointer argument of a non-library call | escape | before the call |
//! | pointer returned by `ret` | escape | before the `ret` |
//! | pointer value written by a `store` | escape | before the store |
//! | address of a `load` or `store` | bounds | before the access |
//! | address of a `store` | write barrier | after the store |
//!
//! Every candidate pointer is traced back to the object it was derived
//! from by stripping pointer casts and indexing. What the root is decides
//! how much the runtime has to look up:
//!
//! | Root | Bounds check | Write barrier |
//! |------|--------------|---------------|
//! | fixed `alloca` | `safec_bounds_check_with_size`, static size | `safec_write_barrier_with_size` |
//! | variable-length `alloca` | `..._with_size`, `count * elem_size` | `..._with_size` |
//! | global (direct or indexed) | `..._with_size`, size of the global | `..._with_size` |
//! | anything else | `safec_bounds_check`, header lookup | `safec_write_barrier`, header lookup |
//!
//! Escape checks are skipped for pointers rooted in globals or constants,
//! which never live on the managed heap.

use std::collections::HashSet;

use tracing::trace;

use crate::bitmap::TypeBitmapComputer;
use crate::error::InstrumentError;
use crate::ir::{
    BinaryOp, Callee, DataLayout, Function, Global, InstKind, Type, Value, ValueDef, ValueId,
};
use crate::libcall::LibraryCallOracle;
use crate::pass::PassConfig;
use crate::runtime::RuntimeFn;

/// Counts of inserted checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckStats {
    /// Escape checks.
    pub escape_checks: usize,
    /// Bounds checks against a fixed-size stack object.
    pub bounds_static_stack: usize,
    /// Bounds checks against a variable-length stack object.
    pub bounds_dynamic_stack: usize,
    /// Bounds checks against a global.
    pub bounds_global: usize,
    /// Bounds checks resolved through the object header at run time.
    pub bounds_runtime: usize,
    /// Write barriers.
    pub write_barriers: usize,
}

/// How the extent of a root object is known.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Extent {
    StaticStack { size: u64, elem: Type },
    DynamicStack { count: ValueId, elem_size: u64, elem: Type },
    Global { name: String, size: u64, ty: Type },
    Runtime,
}

/// Where emitted instructions go.
struct Cursor {
    anchor: ValueId,
    after: bool,
}

impl Cursor {
    fn before(anchor: ValueId) -> Self {
        Self { anchor, after: false }
    }

    fn after(anchor: ValueId) -> Self {
        Self { anchor, after: true }
    }

    fn emit(&mut self, func: &mut Function, ty: Type, kind: InstKind) -> ValueId {
        if self.after {
            let id = func.insert_after(self.anchor, ty, kind);
            self.anchor = id;
            id
        } else {
            func.insert_before(self.anchor, ty, kind)
        }
    }

    fn call(&mut self, func: &mut Function, f: RuntimeFn, args: Vec<ValueId>) -> ValueId {
        self.emit(
            func,
            f.ret(),
            InstKind::Call {
                callee: Callee::Direct(f.symbol().to_string()),
                args,
            },
        )
    }

    fn as_i8_ptr(&mut self, func: &mut Function, value: ValueId) -> ValueId {
        if func.ty(value) == &Type::i8_ptr() {
            value
        } else {
            self.emit(func, Type::i8_ptr(), InstKind::Cast { value })
        }
    }
}

/// Innermost element of nested arrays. The runtime repeats a bitmap over
/// consecutive elements, so an array shares its element's bitmap.
fn strip_arrays(ty: &Type) -> &Type {
    match ty {
        Type::Array(elem, _) => strip_arrays(elem),
        other => other,
    }
}

/// The object a pointer was derived from.
pub fn resolve_base(func: &Function, mut ptr: ValueId) -> ValueId {
    loop {
        match func.inst(ptr) {
            Some(InstKind::Cast { value }) if func.ty(*value).is_pointer() => ptr = *value,
            Some(InstKind::Index { base, .. }) => ptr = *base,
            _ => return ptr,
        }
    }
}

/// Inserts runtime checks into one function.
pub struct CheckInserter<'a> {
    oracle: &'a dyn LibraryCallOracle,
    globals: &'a [Global],
    bitmaps: &'a mut TypeBitmapComputer,
    config: &'a PassConfig,
}

impl<'a> CheckInserter<'a> {
    /// Create an inserter.
    pub fn new(
        oracle: &'a dyn LibraryCallOracle,
        globals: &'a [Global],
        bitmaps: &'a mut TypeBitmapComputer,
        config: &'a PassConfig,
    ) -> Self {
        Self {
            oracle,
            globals,
            bitmaps,
            config,
        }
    }

    fn layout(&self) -> DataLayout {
        *self.bitmaps.layout()
    }

    /// Insert every enabled kind of check into `func`.
    pub fn run(&mut self, func: &mut Function) -> Result<CheckStats, InstrumentError> {
        let mut stats = CheckStats::default();
        let escapes = self.escape_candidates(func);
        let accesses = self.access_candidates(func);

        if self.config.escape_checks {
            for &(ptr, site) in &escapes {
                if self.insert_escape_check(func, ptr, site) {
                    stats.escape_checks += 1;
                }
            }
        }
        if self.config.bounds_checks {
            for &(addr, site) in &accesses {
                self.insert_bounds_check(func, addr, site, &mut stats)?;
            }
        }
        if self.config.write_barriers {
            for &(addr, site) in &accesses {
                if matches!(func.inst(site), Some(InstKind::Store { .. })) {
                    self.insert_write_barrier(func, addr, site)?;
                    stats.write_barriers += 1;
                }
            }
        }

        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Candidates
    // ------------------------------------------------------------------

    /// `(pointer, site)` pairs needing an escape check, deduplicated.
    fn escape_candidates(&self, func: &Function) -> Vec<(ValueId, ValueId)> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut push = |pair: (ValueId, ValueId)| {
            if seen.insert(pair) {
                out.push(pair);
            }
        };

        for (_, inst) in func.instructions() {
            match func.inst(inst) {
                Some(InstKind::Call { callee, args }) if !self.oracle.is_library_call(callee) => {
                    for &arg in args {
                        if func.ty(arg).is_pointer() {
                            push((arg, inst));
                        }
                    }
                }
                Some(InstKind::Ret { value: Some(value) }) if func.ty(*value).is_pointer() => {
                    push((*value, inst));
                }
                Some(InstKind::Store { value, .. }) if func.ty(*value).is_pointer() => {
                    push((*value, inst));
                }
                _ => {}
            }
        }
        out
    }

    /// `(address, site)` pairs of every load and store.
    fn access_candidates(&self, func: &Function) -> Vec<(ValueId, ValueId)> {
        func.instructions()
            .into_iter()
            .filter_map(|(_, inst)| match func.inst(inst) {
                Some(InstKind::Load { ptr }) | Some(InstKind::Store { ptr, .. }) => Some((*ptr, inst)),
                _ => None,
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Root classification
    // ------------------------------------------------------------------

    fn global_type(&self, func: &Function, name: &str, fallback: ValueId) -> Type {
        self.globals
            .iter()
            .find(|g| g.name == name)
            .map(|g| g.ty.clone())
            .or_else(|| func.ty(fallback).pointee().cloned())
            .unwrap_or(Type::i8())
    }

    fn extent(&self, func: &Function, root: ValueId) -> Result<Extent, InstrumentError> {
        let layout = self.layout();
        Ok(match &func.value(root).def {
            ValueDef::Inst(InstKind::Alloca { allocated, count }) => {
                let elem_size = layout.alloc_size(allocated);
                match count.map(|c| (c, func.as_const_int(c))) {
                    None => Extent::StaticStack {
                        size: elem_size,
                        elem: allocated.clone(),
                    },
                    Some((_, Some(n))) => Extent::StaticStack {
                        size: layout.array_size(allocated, n).ok_or_else(|| InstrumentError::AllocationTooLarge {
                            function: func.name.clone(),
                            elem: allocated.clone(),
                            count: n,
                        })?,
                        elem: allocated.clone(),
                    },
                    Some((count, None)) => Extent::DynamicStack {
                        count,
                        elem_size,
                        elem: allocated.clone(),
                    },
                }
            }
            ValueDef::Global(name) | ValueDef::GlobalIndex { global: name, .. } => {
                let ty = self.global_type(func, name, root);
                Extent::Global {
                    name: name.clone(),
                    size: layout.alloc_size(&ty),
                    ty,
                }
            }
            _ => Extent::Runtime,
        })
    }

    /// Address operand of the object behind `root`.
    fn base_address(&self, func: &mut Function, root: ValueId, extent: &Extent) -> ValueId {
        let indexed = matches!(func.value(root).def, ValueDef::GlobalIndex { .. });
        match extent {
            Extent::Global { name, ty, .. } if indexed => func.add_value(Value::new(
                Type::ptr(ty.clone()),
                ValueDef::Global(name.clone()),
            )),
            _ => root,
        }
    }

    fn object_size(&self, func: &mut Function, cursor: &mut Cursor, extent: &Extent) -> Option<ValueId> {
        match extent {
            Extent::StaticStack { size, .. } | Extent::Global { size, .. } => {
                Some(func.const_int(Type::i64(), *size as i64))
            }
            Extent::DynamicStack { count, elem_size, .. } => {
                let count = if func.ty(*count) == &Type::i64() {
                    *count
                } else {
                    cursor.emit(func, Type::i64(), InstKind::Cast { value: *count })
                };
                let elem = func.const_int(Type::i64(), *elem_size as i64);
                Some(cursor.emit(
                    func,
                    Type::i64(),
                    InstKind::Binary {
                        op: BinaryOp::Mul,
                        lhs: count,
                        rhs: elem,
                    },
                ))
            }
            Extent::Runtime => None,
        }
    }

    fn access_size(&self, func: &Function, site: ValueId) -> u64 {
        let accessed = match func.inst(site) {
            Some(InstKind::Store { value, .. }) => func.ty(*value),
            _ => func.ty(site),
        };
        self.layout().alloc_size(accessed)
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    fn insert_escape_check(&mut self, func: &mut Function, ptr: ValueId, site: ValueId) -> bool {
        let root = resolve_base(func, ptr);
        if matches!(
            func.value(root).def,
            ValueDef::Global(_) | ValueDef::GlobalIndex { .. } | ValueDef::Null | ValueDef::ConstInt(_)
        ) {
            return false;
        }
        let mut cursor = Cursor::before(site);
        let base = cursor.as_i8_ptr(func, root);
        let derived = cursor.as_i8_ptr(func, ptr);
        cursor.call(func, RuntimeFn::EscapeCheck, vec![base, derived]);
        trace!(function = %func.name, %ptr, %site, "escape check");
        true
    }

    fn insert_bounds_check(
        &mut self,
        func: &mut Function,
        addr: ValueId,
        site: ValueId,
        stats: &mut CheckStats,
    ) -> Result<(), InstrumentError> {
        let root = resolve_base(func, addr);
        let extent = self.extent(func, root)?;
        let access = self.access_size(func, site);
        let mut cursor = Cursor::before(site);

        let base = self.base_address(func, root, &extent);
        let size = self.object_size(func, &mut cursor, &extent);
        let base = cursor.as_i8_ptr(func, base);
        let ptr = cursor.as_i8_ptr(func, addr);
        let access = func.const_int(Type::i64(), access as i64);

        match size {
            Some(size) => {
                cursor.call(func, RuntimeFn::BoundsCheckWithSize, vec![base, ptr, size, access]);
            }
            None => {
                cursor.call(func, RuntimeFn::BoundsCheck, vec![base, ptr, access]);
            }
        }
        match extent {
            Extent::StaticStack { .. } => stats.bounds_static_stack += 1,
            Extent::DynamicStack { .. } => stats.bounds_dynamic_stack += 1,
            Extent::Global { .. } => stats.bounds_global += 1,
            Extent::Runtime => stats.bounds_runtime += 1,
        }
        trace!(function = %func.name, %addr, %site, "bounds check");
        Ok(())
    }

    fn insert_write_barrier(&mut self, func: &mut Function, addr: ValueId, site: ValueId) -> Result<(), InstrumentError> {
        let root = resolve_base(func, addr);
        let extent = self.extent(func, root)?;
        let bitmap = match &extent {
            Extent::StaticStack { elem, .. } | Extent::DynamicStack { elem, .. } => {
                Some(self.bitmaps.compute(strip_arrays(elem))?)
            }
            Extent::Global { ty, .. } => Some(self.bitmaps.compute(strip_arrays(ty))?),
            Extent::Runtime => None,
        };
        let access = self.access_size(func, site);
        let mut cursor = Cursor::after(site);

        let base = self.base_address(func, root, &extent);
        let size = self.object_size(func, &mut cursor, &extent);
        let base = cursor.as_i8_ptr(func, base);
        let ptr = cursor.as_i8_ptr(func, addr);
        let access = func.const_int(Type::i64(), access as i64);

        match (size, bitmap) {
            (Some(size), Some(bitmap)) => {
                let bitmap = func.const_int(Type::i64(), bitmap as i64);
                cursor.call(
                    func,
                    RuntimeFn::WriteBarrierWithSize,
                    vec![base, ptr, size, access, bitmap],
                );
            }
            _ => {
                cursor.call(func, RuntimeFn::WriteBarrier, vec![base, ptr, access]);
            }
        }
        trace!(function = %func.name, %addr, %site, "write barrier");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Module};
    use crate::libcall::KnownLibraryCalls;

    fn run(func: &mut Function, globals: &[Global]) -> CheckStats {
        let oracle = KnownLibraryCalls::new();
        let mut bitmaps = TypeBitmapComputer::new(DataLayout::lp64());
        let config = PassConfig::default();
        CheckInserter::new(&oracle, globals, &mut bitmaps, &config)
            .run(func)
            .unwrap()
    }

    /// Runtime calls in block order, with their arguments.
    fn runtime_calls(func: &Function) -> Vec<(RuntimeFn, Vec<ValueId>)> {
        func.instructions()
            .into_iter()
            .filter_map(|(_, i)| match func.inst(i) {
                Some(InstKind::Call { callee: Callee::Direct(name), args }) => {
                    RuntimeFn::from_symbol(name).map(|f| (f, args.clone()))
                }
                _ => None,
            })
            .collect()
    }

    fn called(func: &Function) -> Vec<RuntimeFn> {
        runtime_calls(func).into_iter().map(|(f, _)| f).collect()
    }

    #[test]
    fn test_static_stack_bounds() {
        let mut b = FunctionBuilder::new("f", vec![], Type::i32());
        let arr = b.alloca(Type::array(Type::i32(), 10));
        let zero = b.const_int(Type::i64(), 0);
        let five = b.const_int(Type::i64(), 5);
        let elem = b.index(arr, vec![zero, five], Type::ptr(Type::i32()));
        let v = b.load(elem);
        b.ret(Some(v));
        let mut func = b.finish();

        let stats = run(&mut func, &[]);
        assert_eq!(stats.bounds_static_stack, 1);
        let calls = runtime_calls(&func);
        assert_eq!(calls.len(), 1);
        let (f, args) = &calls[0];
        assert_eq!(*f, RuntimeFn::BoundsCheckWithSize);
        assert_eq!(func.as_const_int(args[2]), Some(40));
        assert_eq!(func.as_const_int(args[3]), Some(4));
        // The check sits right before the load.
        let (_, load_pos) = func.locate(v).unwrap();
        let insts = &func.block(crate::ir::BlockId::ENTRY).insts;
        assert!(matches!(func.inst(insts[load_pos - 1]), Some(InstKind::Call { .. })));
    }

    #[test]
    fn test_store_gets_bounds_and_barrier() {
        let node = Type::structure(vec![Type::i64(), Type::i8_ptr()]);
        let mut b = FunctionBuilder::new("f", vec![Type::i8_ptr()], Type::Void);
        let slot = b.alloca(node.clone());
        let zero = b.const_int(Type::i32(), 0);
        let one = b.const_int(Type::i32(), 1);
        let field = b.index(slot, vec![zero, one], Type::ptr(Type::i8_ptr()));
        let arg = b.arg(0);
        let store = b.store(arg, field);
        b.ret(None);
        let mut func = b.finish();

        let stats = run(&mut func, &[]);
        assert_eq!(stats.bounds_static_stack, 1);
        assert_eq!(stats.write_barriers, 1);
        // The stored argument is a pointer: escape check too.
        assert_eq!(stats.escape_checks, 1);
        assert_eq!(
            called(&func),
            vec![
                RuntimeFn::EscapeCheck,
                RuntimeFn::BoundsCheckWithSize,
                RuntimeFn::WriteBarrierWithSize
            ]
        );

        let (_, args) = &runtime_calls(&func)[2];
        assert_eq!(func.as_const_int(args[2]), Some(16));
        assert_eq!(func.as_const_int(args[3]), Some(8));
        assert_eq!(func.as_const_int(args[4]), Some(0b110));

        // Barrier after the store, bounds check before it.
        let (_, store_pos) = func.locate(store).unwrap();
        let insts = func.block(crate::ir::BlockId::ENTRY).insts.clone();
        let after: Vec<_> = insts[store_pos + 1..].iter().filter_map(|&i| func.inst(i)).collect();
        assert!(after.iter().any(|k| matches!(k, InstKind::Call { callee: Callee::Direct(n), .. } if n == "safec_write_barrier_with_size")));
    }

    #[test]
    fn test_dynamic_stack_bounds() {
        let mut b = FunctionBuilder::new("f", vec![Type::i64()], Type::Void);
        let n = b.arg(0);
        let arr = b.alloca_array(Type::i32(), n);
        let seven = b.const_int(Type::i32(), 7);
        b.store(seven, arr);
        b.ret(None);
        let mut func = b.finish();

        let stats = run(&mut func, &[]);
        assert_eq!(stats.bounds_dynamic_stack, 1);
        let (f, args) = &runtime_calls(&func)[0];
        assert_eq!(*f, RuntimeFn::BoundsCheckWithSize);
        let Some(InstKind::Binary { op: BinaryOp::Mul, lhs, rhs }) = func.inst(args[2]) else {
            panic!("expected a multiply");
        };
        assert_eq!(*lhs, n);
        assert_eq!(func.as_const_int(*rhs), Some(4));
        // i32 elements have no pointers: bitmap 0.
        let (f, args) = &runtime_calls(&func)[1];
        assert_eq!(*f, RuntimeFn::WriteBarrierWithSize);
        assert_eq!(func.as_const_int(args[4]), Some(0));
    }

    #[test]
    fn test_global_bounds() {
        let mut module = Module::new("m");
        module.globals.push(Global::new("table", Type::array(Type::i64(), 8)));
        let mut b = FunctionBuilder::new("f", vec![], Type::Void);
        let elem = b.global_index("table", vec![0, 3], Type::ptr(Type::i64()));
        let v = b.const_int(Type::i64(), 1);
        b.store(v, elem);
        let g = b.global("table", Type::array(Type::i64(), 8));
        b.load(g);
        b.ret(None);
        let mut func = b.finish();

        let stats = run(&mut func, &module.globals);
        assert_eq!(stats.bounds_global, 2);
        for (f, args) in runtime_calls(&func) {
            if f == RuntimeFn::BoundsCheckWithSize {
                assert_eq!(func.as_const_int(args[2]), Some(64));
            }
        }
    }

    #[test]
    fn test_runtime_lookup_for_heap_pointer() {
        let mut b = FunctionBuilder::new("f", vec![Type::ptr(Type::i64())], Type::i64());
        let p = b.arg(0);
        let one = b.const_int(Type::i64(), 1);
        let q = b.index(p, vec![one], Type::ptr(Type::i64()));
        let v = b.load(q);
        b.store(v, q);
        b.ret(Some(v));
        let mut func = b.finish();

        let stats = run(&mut func, &[]);
        assert_eq!(stats.bounds_runtime, 2);
        assert_eq!(
            called(&func),
            vec![RuntimeFn::BoundsCheck, RuntimeFn::BoundsCheck, RuntimeFn::WriteBarrier]
        );
        // Base is the argument itself, cast to i8*.
        let (_, args) = &runtime_calls(&func)[0];
        assert_eq!(func.inst(args[0]), Some(&InstKind::Cast { value: p }));
        assert_eq!(func.inst(args[1]), Some(&InstKind::Cast { value: q }));
    }

    #[test]
    fn test_escape_checks_on_calls_and_returns() {
        let mut b = FunctionBuilder::new("f", vec![Type::i8_ptr()], Type::i8_ptr());
        let p = b.arg(0);
        let four = b.const_int(Type::i64(), 4);
        let q = b.index(p, vec![four], Type::i8_ptr());
        b.call("consume", vec![q, four], Type::Void);
        b.call("strlen", vec![q], Type::i64());
        b.ret(Some(q));
        let mut func = b.finish();

        let stats = run(&mut func, &[]);
        assert_eq!(stats.escape_checks, 2);
        for (f, args) in runtime_calls(&func) {
            assert_eq!(f, RuntimeFn::EscapeCheck);
            assert_eq!(args, vec![p, q]);
        }
    }

    #[test]
    fn test_null_and_global_stores_skip_escape_check() {
        let mut b = FunctionBuilder::new("f", vec![Type::ptr(Type::i8_ptr())], Type::Void);
        let slot = b.arg(0);
        let null = b.null(Type::i8_ptr());
        b.store(null, slot);
        let g = b.global("name", Type::array(Type::i8(), 4));
        let g8 = b.cast(g, Type::i8_ptr());
        b.store(g8, slot);
        b.ret(None);
        let mut func = b.finish();

        let stats = run(&mut func, &[]);
        assert_eq!(stats.escape_checks, 0);
        assert_eq!(stats.bounds_runtime, 2);
    }

    #[test]
    fn test_disabled_phases() {
        let mut b = FunctionBuilder::new("f", vec![Type::ptr(Type::i64())], Type::Void);
        let p = b.arg(0);
        let v = b.const_int(Type::i64(), 0);
        b.store(v, p);
        b.ret(None);
        let mut func = b.finish();

        let oracle = KnownLibraryCalls::new();
        let mut bitmaps = TypeBitmapComputer::new(DataLayout::lp64());
        let config = PassConfig {
            bounds_checks: false,
            ..PassConfig::default()
        };
        let stats = CheckInserter::new(&oracle, &[], &mut bitmaps, &config)
            .run(&mut func)
            .unwrap();
        assert_eq!(stats.bounds_runtime, 0);
        assert_eq!(called(&func), vec![RuntimeFn::WriteBarrier]);
    }

    #[test]
    fn test_bitmap_overflow_is_reported() {
        let big = Type::structure(vec![Type::array(Type::i64(), 70), Type::i8_ptr()]);
        let mut b = FunctionBuilder::new("f", vec![], Type::Void);
        let slot = b.alloca(big);
        let zero = b.const_int(Type::i64(), 0);
        let first = b.cast(slot, Type::ptr(Type::i64()));
        b.store(zero, first);
        b.ret(None);
        let mut func = b.finish();

        let oracle = KnownLibraryCalls::new();
        let mut bitmaps = TypeBitmapComputer::new(DataLayout::lp64());
        let config = PassConfig::default();
        let err = CheckInserter::new(&oracle, &[], &mut bitmaps, &config)
            .run(&mut func)
            .unwrap_err();
        assert!(matches!(err, InstrumentError::BitmapOverflow { slot: 71, .. }));
    }

    #[test]
    fn test_oversized_stack_bounds_is_reported() {
        let mut b = FunctionBuilder::new("f", vec![], Type::Void);
        let n = b.const_int(Type::i64(), i64::MAX / 2);
        let arr = b.alloca_array(Type::i32(), n);
        let zero = b.const_int(Type::i32(), 0);
        b.store(zero, arr);
        b.ret(None);
        let mut func = b.finish();

        let oracle = KnownLibraryCalls::new();
        let mut bitmaps = TypeBitmapComputer::new(DataLayout::lp64());
        let config = PassConfig::default();
        let err = CheckInserter::new(&oracle, &[], &mut bitmaps, &config)
            .run(&mut func)
            .unwrap_err();
        assert!(matches!(err, InstrumentError::AllocationTooLarge { count, .. } if count == i64::MAX / 2));
    }
}
