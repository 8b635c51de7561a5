//! # safec Runtime Library
//!
//! The execution-time half of safec. Instrumented programs link against
//! this crate (as a static or shared library) and call into it through the
//! C ABI in [`ffi`]:
//!
//! - **Heap**: a segmented, demand-paged bump allocator with per-page
//!   free-byte accounting and page decommit
//! - **Collector**: conservative, non-moving, stop-the-world mark-sweep
//! - **Checks**: escape checks, bounds checks and write barriers
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       SAFEC RUNTIME                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │   ffi.rs  (safec_alloc, safec_bounds_check, ...)             │
//! │      │                                                       │
//! │      ▼                                                       │
//! │  ┌──────────┐   ┌──────────┐   ┌──────────┐                  │
//! │  │  checks  │──▶│   heap   │◀──│    gc    │◀── roots         │
//! │  └──────────┘   └──────────┘   └──────────┘                  │
//! │                      │                                       │
//! │               segment / header                               │
//! │                      │                                       │
//! │                     os (mmap, mprotect, madvise)             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything below [`ffi`] works on an explicit [`Heap`] value, so
//! several heaps can coexist in one process (tests do exactly that).

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod checks;
pub mod config;
pub mod ffi;
pub mod gc;
pub mod header;
pub mod heap;
pub mod os;
pub mod roots;
pub mod segment;

// Re-exports
pub use checks::{bounds_check_with_size, SafetyViolation};
pub use config::{ConfigError, MemoryConfig, RuntimeConfig, RuntimeConfigBuilder};
pub use gc::CollectionStats;
pub use header::{ObjHeader, ObjStatus, HEADER_SIZE};
pub use heap::{Heap, HeapError, HeapStats};
pub use roots::{ExplicitRoots, MemoryRange, ProcessRoots, RootProvider};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Global runtime configuration.
static RUNTIME_CONFIG: std::sync::OnceLock<RuntimeConfig> = std::sync::OnceLock::new();

/// Install the configuration used by the process-wide heap.
///
/// Must run before the first allocation through the C ABI to have any
/// effect. Returns `Ok(false)` when a configuration was already installed.
///
/// # Example
///
/// ```rust,ignore
/// use safec_runtime::{init_with_config, RuntimeConfig};
///
/// let config = RuntimeConfig::builder()
///     .segment_size(64 << 20)
///     .gc_threshold(8 << 20)
///     .build()?;
/// init_with_config(config)?;
/// ```
pub fn init_with_config(config: RuntimeConfig) -> Result<bool, ConfigError> {
    config.validate()?;
    Ok(RUNTIME_CONFIG.set(config).is_ok())
}

/// Install the configuration read from `SAFEC_*` environment variables.
///
/// See [`RuntimeConfig::from_env`] for the supported variables.
pub fn init_from_env() -> Result<bool, ConfigError> {
    init_with_config(RuntimeConfig::from_env())
}

/// Get the installed runtime configuration.
///
/// Returns `None` if neither [`init_with_config`] nor [`init_from_env`]
/// has run.
pub fn runtime_config() -> Option<&'static RuntimeConfig> {
    RUNTIME_CONFIG.get()
}
