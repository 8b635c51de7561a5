//! Builder for constructing function bodies.

use super::function::{BinaryOp, BlockId, Callee, Function, InstKind, Value, ValueDef, ValueId};
use super::types::Type;

/// Builder for constructing function bodies.
///
/// Instructions are appended to the current block; a fresh builder starts
/// in the entry block.
pub struct FunctionBuilder {
    func: Function,
    current_block: BlockId,
}

impl FunctionBuilder {
    /// Create a new builder.
    pub fn new(name: impl Into<String>, params: Vec<Type>, ret: Type) -> Self {
        let mut func = Function::new(name, params, ret);
        let entry = func.new_block();
        Self {
            func,
            current_block: entry,
        }
    }

    /// The `index`-th parameter.
    pub fn arg(&self, index: usize) -> ValueId {
        self.func.arg(index)
    }

    /// Create a new basic block.
    pub fn new_block(&mut self) -> BlockId {
        self.func.new_block()
    }

    /// Get the current block.
    pub fn current_block(&self) -> BlockId {
        self.current_block
    }

    /// Switch to a different block.
    pub fn switch_to(&mut self, block: BlockId) {
        self.current_block = block;
    }

    /// Attach a source name to a value.
    pub fn name(&mut self, value: ValueId, name: impl Into<String>) {
        self.func.values[value.index()].name = Some(name.into());
    }

    fn push(&mut self, ty: Type, kind: InstKind) -> ValueId {
        self.func.push_inst(self.current_block, ty, kind)
    }

    // ------------------------------------------------------------------
    // Non-instruction values
    // ------------------------------------------------------------------

    /// Integer constant.
    pub fn const_int(&mut self, ty: Type, value: i64) -> ValueId {
        self.func.const_int(ty, value)
    }

    /// Null pointer of type `ty`.
    pub fn null(&mut self, ty: Type) -> ValueId {
        self.func.add_value(Value::new(ty, ValueDef::Null))
    }

    /// Address of the global `name`, whose variable type is `ty`.
    pub fn global(&mut self, name: impl Into<String>, ty: Type) -> ValueId {
        self.func
            .add_value(Value::new(Type::ptr(ty), ValueDef::Global(name.into())))
    }

    /// Constant indexing expression over a global, yielding `result_ty`.
    pub fn global_index(
        &mut self,
        global: impl Into<String>,
        indices: Vec<i64>,
        result_ty: Type,
    ) -> ValueId {
        self.func.add_value(Value::new(
            result_ty,
            ValueDef::GlobalIndex {
                global: global.into(),
                indices,
            },
        ))
    }

    // ------------------------------------------------------------------
    // Instructions
    // ------------------------------------------------------------------

    /// Stack slot for one `ty`.
    pub fn alloca(&mut self, ty: Type) -> ValueId {
        self.push(
            Type::ptr(ty.clone()),
            InstKind::Alloca {
                allocated: ty,
                count: None,
            },
        )
    }

    /// Stack array of `count` elements of `elem`.
    pub fn alloca_array(&mut self, elem: Type, count: ValueId) -> ValueId {
        self.push(
            Type::ptr(elem.clone()),
            InstKind::Alloca {
                allocated: elem,
                count: Some(count),
            },
        )
    }

    /// Load through `ptr`; the result has the pointee type.
    pub fn load(&mut self, ptr: ValueId) -> ValueId {
        let ty = self.func.ty(ptr).pointee().cloned().unwrap_or(Type::Void);
        self.push(ty, InstKind::Load { ptr })
    }

    /// Store `value` through `ptr`.
    pub fn store(&mut self, value: ValueId, ptr: ValueId) -> ValueId {
        self.push(Type::Void, InstKind::Store { value, ptr })
    }

    /// Reinterpret `value` as `ty`.
    pub fn cast(&mut self, value: ValueId, ty: Type) -> ValueId {
        self.push(ty, InstKind::Cast { value })
    }

    /// Address arithmetic from `base`, yielding `result_ty`.
    pub fn index(&mut self, base: ValueId, indices: Vec<ValueId>, result_ty: Type) -> ValueId {
        self.push(result_ty, InstKind::Index { base, indices })
    }

    /// Integer arithmetic; the result has the type of `lhs`.
    pub fn binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        let ty = self.func.ty(lhs).clone();
        self.push(ty, InstKind::Binary { op, lhs, rhs })
    }

    /// Direct call.
    pub fn call(&mut self, callee: impl Into<String>, args: Vec<ValueId>, ret: Type) -> ValueId {
        self.push(
            ret,
            InstKind::Call {
                callee: Callee::Direct(callee.into()),
                args,
            },
        )
    }

    /// Call through a function pointer.
    pub fn call_indirect(&mut self, target: ValueId, args: Vec<ValueId>, ret: Type) -> ValueId {
        self.push(
            ret,
            InstKind::Call {
                callee: Callee::Indirect(target),
                args,
            },
        )
    }

    /// SSA merge.
    pub fn phi(&mut self, ty: Type, incoming: Vec<(BlockId, ValueId)>) -> ValueId {
        self.push(ty, InstKind::Phi { incoming })
    }

    /// Capture the stack pointer.
    pub fn stack_save(&mut self) -> ValueId {
        self.push(Type::i8_ptr(), InstKind::StackSave)
    }

    /// Unwind the stack to `saved`.
    pub fn stack_restore(&mut self, saved: ValueId) -> ValueId {
        self.push(Type::Void, InstKind::StackRestore { saved })
    }

    // ------------------------------------------------------------------
    // Terminators
    // ------------------------------------------------------------------

    /// Unconditional branch.
    pub fn br(&mut self, target: BlockId) -> ValueId {
        self.push(Type::Void, InstKind::Br { target })
    }

    /// Two-way branch.
    pub fn cond_br(&mut self, cond: ValueId, then_bb: BlockId, else_bb: BlockId) -> ValueId {
        self.push(
            Type::Void,
            InstKind::CondBr {
                cond,
                then_bb,
                else_bb,
            },
        )
    }

    /// Return.
    pub fn ret(&mut self, value: Option<ValueId>) -> ValueId {
        self.push(Type::Void, InstKind::Ret { value })
    }

    /// Unreachable.
    pub fn unreachable(&mut self) -> ValueId {
        self.push(Type::Void, InstKind::Unreachable)
    }

    /// Check if the current block is terminated.
    pub fn is_current_terminated(&self) -> bool {
        self.func
            .block(self.current_block)
            .insts
            .last()
            .and_then(|&i| self.func.inst(i))
            .map(InstKind::is_terminator)
            .unwrap_or(false)
    }

    /// Finish building and return the function.
    pub fn finish(self) -> Function {
        self.func
    }
}
