//! End-to-end tests for the instrumentation pipeline.
//!
//! These build small modules the way a C front end would lower them, run
//! the whole pass, and inspect the instrumented result.

use safec::ir::{BinaryOp, BlockId, Callee, Function, FunctionBuilder, Global, InstKind, Module, Type, ValueId};
use safec::{InstrumentError, LibraryCallOracle, MemSafePass, PassConfig, RuntimeFn};

/// Runtime calls of a function in block order.
fn runtime_calls(func: &Function) -> Vec<RuntimeFn> {
    func.instructions()
        .into_iter()
        .filter_map(|(_, i)| match func.inst(i) {
            Some(InstKind::Call { callee: Callee::Direct(name), .. }) => RuntimeFn::from_symbol(name),
            _ => None,
        })
        .collect()
}

fn count(calls: &[RuntimeFn], f: RuntimeFn) -> usize {
    calls.iter().filter(|&&c| c == f).count()
}

/// ```c
/// struct node { long value; struct node *next; };
/// struct node *head;
///
/// void push(long value) {
///     struct node n;
///     n.value = value;
///     n.next = head;
///     head = &n;
/// }
/// ```
fn push_module() -> Module {
    let node = Type::structure(vec![Type::i64(), Type::ptr(Type::i8())]);
    let mut module = Module::new("list");
    module.globals.push(Global::new("head", Type::i8_ptr()));

    let mut b = FunctionBuilder::new("push", vec![Type::i64()], Type::Void);
    let n = b.alloca(node.clone());
    b.name(n, "n");
    let zero = b.const_int(Type::i32(), 0);
    let one = b.const_int(Type::i32(), 1);
    let value_field = b.index(n, vec![zero, zero], Type::ptr(Type::i64()));
    let value = b.arg(0);
    b.store(value, value_field);
    let next_field = b.index(n, vec![zero, one], Type::ptr(Type::i8_ptr()));
    let head = b.global("head", Type::i8_ptr());
    let old = b.load(head);
    b.store(old, next_field);
    let n8 = b.cast(n, Type::i8_ptr());
    b.store(n8, head);
    b.ret(None);
    module.functions.push(b.finish());
    module
}

#[test]
fn test_linked_list_push() {
    let mut module = push_module();
    let stats = MemSafePass::default().run_on_module(&mut module).unwrap();

    // `&n` is stored into a global: the node moves to the heap.
    assert_eq!(stats.promoted_fixed, 1);
    // Two pointer stores: `old` (a loaded value) and `&n`.
    assert_eq!(stats.escape_checks, 2);
    // Stores into the node go through the promoted (heap) object; the
    // global is accessed with its static size.
    assert_eq!(stats.bounds_runtime, 2);
    assert_eq!(stats.bounds_global, 2);
    assert_eq!(stats.write_barriers, 3);

    let push = module.function("push").unwrap();
    let calls = runtime_calls(push);
    assert_eq!(calls.first(), Some(&RuntimeFn::Alloc));
    assert_eq!(count(&calls, RuntimeFn::Free), 1);
    assert_eq!(count(&calls, RuntimeFn::BoundsCheckWithSize), 2);
    assert_eq!(count(&calls, RuntimeFn::WriteBarrierWithSize), 1);
    assert_eq!(count(&calls, RuntimeFn::WriteBarrier), 2);

    // The free is the last thing before `ret`.
    let insts = &push.block(BlockId::ENTRY).insts;
    let before_ret = insts[insts.len() - 2];
    assert!(matches!(
        push.inst(before_ret),
        Some(InstKind::Call { callee: Callee::Direct(name), .. }) if name == "safec_free"
    ));

    // Every runtime function used is declared with its ABI signature.
    for f in [RuntimeFn::Alloc, RuntimeFn::Free, RuntimeFn::EscapeCheck] {
        let decl = module.function(f.symbol()).unwrap();
        assert_eq!(decl.params, f.params());
        assert_eq!(decl.ret, f.ret());
    }
}

#[test]
fn test_local_only_function_is_untouched_by_promotion() {
    // long square(long x) { long t = x; return t * t; }
    let mut b = FunctionBuilder::new("square", vec![Type::i64()], Type::i64());
    let t = b.alloca(Type::i64());
    let x = b.arg(0);
    b.store(x, t);
    let v = b.load(t);
    let sq = b.binary(BinaryOp::Mul, v, v);
    b.ret(Some(sq));
    let mut module = Module::new("m");
    module.functions.push(b.finish());

    let stats = MemSafePass::default().run_on_module(&mut module).unwrap();
    assert_eq!(stats.promoted_fixed + stats.promoted_vla, 0);
    assert_eq!(stats.escape_checks, 0);
    assert_eq!(stats.bounds_static_stack, 2);

    let calls = runtime_calls(module.function("square").unwrap());
    assert!(!calls.contains(&RuntimeFn::Alloc));
    assert!(module.function("safec_alloc").is_none());
}

#[test]
fn test_vla_scope() {
    // void f(long n) { { char buf[n]; fill(buf); } }
    let mut b = FunctionBuilder::new("f", vec![Type::i64()], Type::Void);
    let saved = b.stack_save();
    let n = b.arg(0);
    let buf = b.alloca_array(Type::i8(), n);
    b.call("fill", vec![buf], Type::Void);
    b.stack_restore(saved);
    b.ret(None);
    let mut module = Module::new("m");
    module.functions.push(b.finish());

    let stats = MemSafePass::default().run_on_module(&mut module).unwrap();
    assert_eq!(stats.promoted_vla, 1);

    let f = module.function("f").unwrap();
    let order: Vec<&InstKind> = f.block(BlockId::ENTRY).insts.iter().filter_map(|&i| f.inst(i)).collect();
    let free_pos = order
        .iter()
        .position(|k| matches!(k, InstKind::Call { callee: Callee::Direct(n), .. } if n == "safec_free"))
        .unwrap();
    assert!(matches!(order[free_pos + 1], InstKind::StackRestore { .. }));
}

struct TreatAsLibrary(&'static str);

impl LibraryCallOracle for TreatAsLibrary {
    fn is_library_call(&self, callee: &Callee) -> bool {
        callee.name() == Some(self.0)
    }
}

#[test]
fn test_custom_oracle() {
    let mut b = FunctionBuilder::new("f", vec![], Type::Void);
    let buf = b.alloca(Type::array(Type::i8(), 8));
    b.call("trusted", vec![buf], Type::Void);
    b.ret(None);
    let mut func = b.finish();

    let mut pass = MemSafePass::with_oracle(PassConfig::default(), Box::new(TreatAsLibrary("trusted")));
    let stats = pass.run_on_function(&[], &mut func).unwrap();
    assert_eq!(stats.promoted_fixed, 0);
    assert_eq!(stats.escape_checks, 0);
}

#[test]
fn test_json_module_round_trip() {
    let source = r#"{
        "name": "json",
        "globals": [],
        "functions": [{
            "name": "leak",
            "params": [],
            "ret": "void",
            "values": [
                { "ty": { "ptr": { "int": 32 } }, "def": { "inst": { "alloca": { "allocated": { "int": 32 } } } } },
                { "ty": "void", "def": { "inst": { "call": { "callee": { "direct": "sink" }, "args": [0] } } } },
                { "ty": "void", "def": { "inst": { "ret": {} } } }
            ],
            "blocks": [{ "insts": [0, 1, 2] }]
        }]
    }"#;
    let mut module: Module = serde_json::from_str(source).unwrap();
    let stats = MemSafePass::default().run_on_module(&mut module).unwrap();
    assert_eq!(stats.promoted_fixed, 1);

    let json = serde_json::to_string(&module).unwrap();
    let back: Module = serde_json::from_str(&json).unwrap();
    assert_eq!(back, module);

    let text = module.to_string();
    assert!(text.contains("call i8* @safec_alloc(i64 4)"));
    assert!(text.contains("declare void @safec_free(i8*)"));
}

#[test]
fn test_dangling_operand_is_rejected() {
    let mut b = FunctionBuilder::new("f", vec![], Type::Void);
    let slot = b.alloca(Type::i64());
    let zero = b.const_int(Type::i64(), 0);
    b.store(zero, slot);
    b.ret(None);
    let mut module = Module::new("m");
    module.functions.push(b.finish());

    // Point the store at a value the arena does not have.
    let mut json = serde_json::to_value(&module).unwrap();
    let store = &mut json["functions"][0]["values"][2]["def"]["inst"]["store"];
    assert_eq!(store["ptr"], 0);
    store["ptr"] = 999.into();
    let mut module: Module = serde_json::from_value(json).unwrap();

    let err = MemSafePass::default().run_on_module(&mut module).unwrap_err();
    assert_eq!(
        err,
        InstrumentError::DanglingValue {
            function: "f".to_string(),
            user: ValueId(2),
            value: ValueId(999),
        }
    );
    assert!(err.to_string().contains("%999"));
}

#[test]
fn test_bitmap_overflow_fails_the_module() {
    let big = Type::array(Type::i8_ptr(), 100);
    let mut module = Module::new("m");
    module.globals.push(Global::new("table", Type::structure(vec![big, Type::i64()])));
    let mut b = FunctionBuilder::new("f", vec![], Type::Void);
    let slot = b.global_index("table", vec![0, 1], Type::ptr(Type::i64()));
    let zero = b.const_int(Type::i64(), 0);
    b.store(zero, slot);
    b.ret(None);
    module.functions.push(b.finish());

    let err = MemSafePass::default().run_on_module(&mut module).unwrap_err();
    assert!(matches!(err, InstrumentError::BitmapOverflow { .. }));
}

macro_rules! exported {
    ($($f:ident),* $(,)?) => {
        [$((stringify!($f), safec_runtime::ffi::$f as usize)),*]
    };
}

#[test]
fn test_abi_table_matches_runtime_exports() {
    let exports = exported![
        safec_alloc,
        safec_free,
        safec_escape_check,
        safec_bounds_check,
        safec_bounds_check_with_size,
        safec_write_barrier,
        safec_write_barrier_with_size,
        safec_get_size,
        safec_get_type,
        safec_set_type,
        safec_get_aligned_addr,
        safec_cast,
        safec_print_stats,
        safec_collect,
    ];
    assert_eq!(exports.len(), RuntimeFn::ALL.len());
    for f in RuntimeFn::ALL {
        let found = exports.iter().find(|(name, _)| *name == f.symbol());
        assert!(matches!(found, Some((_, addr)) if *addr != 0), "{f} is not exported");
    }
}
