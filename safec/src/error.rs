//! Compile-time instrumentation errors.

use thiserror::Error;

use crate::ir::{BlockId, Type, ValueId};

/// Compile-time instrumentation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstrumentError {
    /// The type spans more slots than a bitmap can describe.
    #[error("type `{ty}` needs a bitmap sentinel at slot {slot}; at most 63 slots are supported")]
    BitmapOverflow {
        /// The offending type.
        ty: Type,
        /// Slot the sentinel would need.
        slot: u64,
    },

    /// A pointer-bearing type is not laid out in whole 8-byte slots.
    #[error("type `{ty}` contains pointers but is not 8-byte aligned (pointer at offset {offset}, size {size})")]
    MisalignedPointerField {
        /// The offending type.
        ty: Type,
        /// Offset of the first misaligned pointer, or the size if only the
        /// size is misaligned.
        offset: u64,
        /// Allocation size of the type.
        size: u64,
    },

    /// A constant-count allocation whose byte size does not fit in an
    /// `i64`.
    #[error("allocation of {count} x `{elem}` in `{function}` is too large")]
    AllocationTooLarge {
        /// Enclosing function.
        function: String,
        /// Element type.
        elem: Type,
        /// Constant element count.
        count: i64,
    },

    /// An operand names a value missing from the function's arena.
    #[error("`{function}`: {user} uses {value}, which does not exist")]
    DanglingValue {
        /// Enclosing function.
        function: String,
        /// The instruction holding the operand.
        user: ValueId,
        /// The missing value.
        value: ValueId,
    },

    /// A branch or phi names a block the function does not have.
    #[error("`{function}`: {user} refers to {block}, which does not exist")]
    DanglingBlock {
        /// Enclosing function.
        function: String,
        /// The branch or phi.
        user: ValueId,
        /// The missing block.
        block: BlockId,
    },

    /// A block lists something that is not an instruction of the arena.
    #[error("`{function}`: {block} lists {value}, which is not an instruction")]
    NotAnInstruction {
        /// Enclosing function.
        function: String,
        /// The block.
        block: BlockId,
        /// The listed value.
        value: ValueId,
    },

    /// The arena does not start with one argument per parameter.
    #[error("`{function}`: {value} is not parameter {index}")]
    MisplacedArgument {
        /// Enclosing function.
        function: String,
        /// The offending slot.
        value: ValueId,
        /// Parameter index expected at that slot.
        index: usize,
    },
}
