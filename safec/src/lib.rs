//! # SafeC Instrumentation
//!
//! Compile-time half of SafeC: retrofits spatial memory safety onto C-like
//! code by moving escaping stack objects to a garbage-collected heap and
//! guarding pointer uses with runtime checks. The other half, the managed
//! heap and the checks themselves, is the `safec-runtime` crate.
//!
//! ## Pipeline
//!
//! ```text
//! Module (JSON) -> EscapeAnalyzer -> HeapPromoter -> CheckInserter -> Module (JSON / text)
//!                                                          |
//!                                                 TypeBitmapComputer
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use safec::ir::{FunctionBuilder, Module, Type};
//! use safec::MemSafePass;
//!
//! let mut b = FunctionBuilder::new("f", vec![], Type::Void);
//! let buf = b.alloca(Type::array(Type::i8(), 64));
//! let p = b.cast(buf, Type::i8_ptr());
//! b.call("fill", vec![p], Type::Void);
//! b.ret(None);
//!
//! let mut module = Module::new("example");
//! module.functions.push(b.finish());
//!
//! let stats = MemSafePass::default().run_on_module(&mut module).unwrap();
//! assert_eq!(stats.promoted_fixed, 1);
//! println!("{module}");
//! ```
//!
//! ## Modules
//!
//! - [`ir`]: arena-based SSA representation, layout and printing
//! - [`escape`]: which allocations escape
//! - [`promote`]: allocation to heap rewriting
//! - [`checks`]: escape, bounds and write-barrier insertion
//! - [`bitmap`]: interior-pointer bitmaps for the write barrier
//! - [`error`]: compile-time errors
//! - [`libcall`]: library call recognition
//! - [`runtime`]: the runtime ABI table
//! - [`pass`]: the pass driver

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bitmap;
pub mod checks;
pub mod error;
pub mod escape;
pub mod ir;
pub mod libcall;
pub mod pass;
pub mod promote;
pub mod runtime;

pub use bitmap::{compute_bitmap, TypeBitmapComputer};
pub use error::InstrumentError;
pub use escape::{EscapeAnalyzer, EscapeReason, EscapeResults};
pub use libcall::{KnownLibraryCalls, LibraryCallOracle};
pub use pass::{MemSafePass, PassConfig, PassStats};
pub use promote::HeapPromoter;
pub use runtime::RuntimeFn;

/// Version of the instrumentation.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
