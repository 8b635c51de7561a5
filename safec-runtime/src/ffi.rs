//! # FFI Exports
//!
//! C-compatible exports for linking instrumented programs against the
//! runtime. The `safec` pass emits calls to exactly these symbols.
//!
//! ## Design
//!
//! One process-wide [`Heap`] sits behind a lock and is created on first
//! use from the installed [`RuntimeConfig`], or from the environment when
//! none was installed. Instrumented code has a single mutator thread; the
//! lock only keeps the global sound.
//!
//! Every error that reaches this layer is fatal: it is logged, printed as
//! `safec runtime error: ...` on stderr, and the process aborts. Execution
//! never continues past a detected violation.
//!
//! ## Usage
//!
//! Build as a cdylib or staticlib:
//! ```toml
//! [lib]
//! crate-type = ["cdylib", "staticlib", "rlib"]
//! ```
//!
//! Then link instrumented programs with `-lsafec_runtime`.

use std::ffi::c_int;
use std::fmt::Display;

use parking_lot::Mutex;
use tracing::error;

use crate::checks::bounds_check_with_size;
use crate::config::RuntimeConfig;
use crate::heap::{Heap, HeapStats};

static HEAP: Mutex<Option<Heap>> = parking_lot::const_mutex(None);

fn initial_config() -> RuntimeConfig {
    crate::runtime_config()
        .cloned()
        .unwrap_or_else(RuntimeConfig::from_env)
}

fn with_heap<R>(f: impl FnOnce(&mut Heap) -> R) -> R {
    let mut guard = HEAP.lock();
    let heap = guard.get_or_insert_with(|| or_abort(Heap::new(initial_config().memory)));
    f(heap)
}

/// Report an unrecoverable runtime error and abort.
fn fatal(err: impl Display) -> ! {
    error!(%err, "fatal runtime error");
    eprintln!("safec runtime error: {err}");
    std::process::abort();
}

fn or_abort<T, E: Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => fatal(err),
    }
}

/// Statistics of the process-wide heap, if it has been created.
pub fn heap_stats() -> Option<HeapStats> {
    HEAP.lock().as_ref().map(Heap::stats)
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Initialize the runtime.
///
/// Optional: the heap is created lazily by the first allocation. Returns
/// 0 on success and 1 if the environment holds an invalid configuration.
#[no_mangle]
pub extern "C" fn safec_runtime_init() -> c_int {
    if crate::runtime_config().is_none() && crate::init_from_env().is_err() {
        return 1;
    }
    with_heap(|_| ());
    0
}

// ============================================================================
// Allocation
// ============================================================================

/// Allocate `size` bytes of managed memory.
///
/// The memory is zero-initialized on first use of its page and at least
/// 8-byte aligned. Aborts if the allocation cannot be satisfied.
#[no_mangle]
pub extern "C" fn safec_alloc(size: usize) -> *mut u8 {
    or_abort(with_heap(|heap| heap.allocate(size))).as_ptr()
}

/// Release an object returned by [`safec_alloc`]. Null is ignored.
///
/// # Safety
/// `ptr` must not be used after this call.
#[no_mangle]
pub unsafe extern "C" fn safec_free(ptr: *mut u8) {
    or_abort(with_heap(|heap| heap.free(ptr as usize)));
}

/// Run a full collection now. Returns the number of bytes reclaimed.
#[no_mangle]
pub extern "C" fn safec_collect() -> usize {
    or_abort(with_heap(|heap| heap.collect())).freed_bytes
}

/// Print the heap statistics to stdout.
#[no_mangle]
pub extern "C" fn safec_print_stats() {
    let stats = with_heap(|heap| heap.stats());
    println!("{stats}");
}

// ============================================================================
// Checks
// ============================================================================

/// Abort unless `ptr` is inside the object owning `base`.
#[no_mangle]
pub extern "C" fn safec_escape_check(base: *const u8, ptr: *const u8) {
    or_abort(with_heap(|heap| heap.escape_check(base as usize, ptr as usize)));
}

/// Abort unless `[ptr, ptr + access)` is inside the object owning `base`.
#[no_mangle]
pub extern "C" fn safec_bounds_check(base: *const u8, ptr: *const u8, access: usize) {
    or_abort(with_heap(|heap| {
        heap.bounds_check(base as usize, ptr as usize, access)
    }));
}

/// Abort unless `[ptr, ptr + access)` is inside `[base, base + size)`.
#[no_mangle]
pub extern "C" fn safec_bounds_check_with_size(
    base: *const u8,
    ptr: *const u8,
    size: usize,
    access: usize,
) {
    or_abort(bounds_check_with_size(base as usize, ptr as usize, size, access));
}

/// Validate the pointer fields of a managed object just written at `ptr`.
#[no_mangle]
pub extern "C" fn safec_write_barrier(base: *const u8, ptr: *const u8, access: usize) {
    or_abort(with_heap(|heap| {
        heap.write_barrier(base as usize, ptr as usize, access)
    }));
}

/// Validate the pointer fields of `[base, base + size)` just written at
/// `ptr`, using the statically known `bitmap`.
///
/// # Safety
/// Every 8-byte slot of `[base, base + size)` overlapping
/// `[ptr, ptr + access)` must be readable.
#[no_mangle]
pub unsafe extern "C" fn safec_write_barrier_with_size(
    base: *const u8,
    ptr: *const u8,
    size: usize,
    access: usize,
    bitmap: u64,
) {
    or_abort(with_heap(|heap| {
        heap.write_barrier_with_size(base as usize, ptr as usize, size, access, bitmap)
    }));
}

// ============================================================================
// Object Metadata
// ============================================================================

/// Size requested when the object containing `obj` was allocated.
#[no_mangle]
pub extern "C" fn safec_get_size(obj: *const u8) -> usize {
    or_abort(with_heap(|heap| heap.size_of(obj as usize)))
}

/// Interior-pointer bitmap of the object containing `obj`.
#[no_mangle]
pub extern "C" fn safec_get_type(obj: *const u8) -> u64 {
    or_abort(with_heap(|heap| heap.type_of(obj as usize)))
}

/// Set the interior-pointer bitmap of the object containing `obj`.
#[no_mangle]
pub extern "C" fn safec_set_type(obj: *mut u8, bitmap: u64) {
    or_abort(with_heap(|heap| heap.set_type(obj as usize, bitmap)));
}

/// Record `alignment` for `obj` and return `obj` rounded up to it.
#[no_mangle]
pub extern "C" fn safec_get_aligned_addr(obj: *mut u8, alignment: usize) -> *mut u8 {
    or_abort(with_heap(|heap| heap.aligned_addr(obj as usize, alignment))) as *mut u8
}

/// Give the object at `ptr` the bitmap of its new static type.
#[no_mangle]
pub extern "C" fn safec_cast(ptr: *mut u8, bitmap: u64, size: usize) -> *mut u8 {
    or_abort(with_heap(|heap| heap.cast(ptr as usize, bitmap, size))) as *mut u8
}
