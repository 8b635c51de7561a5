//! # Instrumentation IR
//!
//! A small SSA representation of C-like code: the input and output of the
//! memory-safety pass.
//!
//! ## Structure
//!
//! ```text
//! Module
//! ├── globals: [Global { name, ty }]
//! └── functions: [Function]
//!     ├── values: arena of Value { ty, def }   (indexed by ValueId)
//!     └── blocks: [Block { insts: [ValueId] }] (indexed by BlockId)
//! ```
//!
//! Def-use edges are arena indices, so rewriting a function never fights
//! the borrow checker over a pointer graph.

pub mod builder;
pub mod function;
pub mod layout;
pub mod module;
pub mod printer;
pub mod types;

pub use builder::FunctionBuilder;
pub use function::{BinaryOp, Block, BlockId, Callee, Function, InstKind, Value, ValueDef, ValueId};
pub use layout::{DataLayout, Leaf};
pub use module::{Global, Module};
pub use types::Type;
