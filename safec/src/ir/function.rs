//! # Function Bodies
//!
//! A function is an arena of [`Value`]s plus an ordered list of blocks.
//! Every operand is a [`ValueId`] into the arena, so def-use edges are plain
//! indices and the passes never hold references into the body while they
//! rewrite it.
//!
//! ## Value Convention
//!
//! - `%0..%n`: the parameters, in order
//! - after that: constants, global addresses and instructions, in creation
//!   order
//!
//! An instruction belongs to at most one block. Removing it from its block
//! leaves a dead arena slot behind; ids are never reused.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::Type;
use crate::error::InstrumentError;

/// Index of a value in its function's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValueId(pub u32);

impl ValueId {
    /// Create a new ValueId.
    pub const fn new(id: u32) -> Self {
        ValueId(id)
    }

    /// Get the index value.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Index of a block in its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u32);

impl BlockId {
    /// The entry block ID (always 0).
    pub const ENTRY: BlockId = BlockId(0);

    /// Create a new BlockId.
    pub const fn new(id: u32) -> Self {
        BlockId(id)
    }

    /// Get the index value.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    /// Multiplication.
    Mul,
    /// Addition.
    Add,
    /// Subtraction.
    Sub,
}

/// Target of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Callee {
    /// Call of a named function.
    Direct(String),
    /// Call through a function pointer.
    Indirect(ValueId),
}

impl Callee {
    /// Name of a direct callee.
    pub fn name(&self) -> Option<&str> {
        match self {
            Callee::Direct(name) => Some(name),
            Callee::Indirect(_) => None,
        }
    }
}

/// Instruction kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstKind {
    /// Stack allocation of `count` (default 1) values of `allocated`.
    Alloca {
        /// Element type.
        allocated: Type,
        /// Element count; a non-constant count makes this a VLA.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<ValueId>,
    },
    /// Read a value of the instruction's type from `ptr`.
    Load {
        /// Address read.
        ptr: ValueId,
    },
    /// Write `value` to `ptr`.
    Store {
        /// Value written.
        value: ValueId,
        /// Address written.
        ptr: ValueId,
    },
    /// Reinterpret `value` as the instruction's type.
    Cast {
        /// Source value.
        value: ValueId,
    },
    /// Address arithmetic from `base`.
    Index {
        /// Base address.
        base: ValueId,
        /// Index operands.
        indices: Vec<ValueId>,
    },
    /// Integer arithmetic.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        lhs: ValueId,
        /// Right operand.
        rhs: ValueId,
    },
    /// Function call.
    Call {
        /// Call target.
        callee: Callee,
        /// Arguments.
        args: Vec<ValueId>,
    },
    /// SSA merge.
    Phi {
        /// Value flowing in from each predecessor.
        incoming: Vec<(BlockId, ValueId)>,
    },
    /// Capture the stack pointer.
    StackSave,
    /// Unwind the stack to a saved pointer, releasing VLAs made since.
    StackRestore {
        /// Result of the matching `StackSave`.
        saved: ValueId,
    },
    /// Unconditional branch.
    Br {
        /// Successor.
        target: BlockId,
    },
    /// Two-way branch.
    CondBr {
        /// Condition.
        cond: ValueId,
        /// Successor when true.
        then_bb: BlockId,
        /// Successor when false.
        else_bb: BlockId,
    },
    /// Function exit.
    Ret {
        /// Returned value.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<ValueId>,
    },
    /// Unreachable code.
    Unreachable,
}

impl InstKind {
    /// Operands in order.
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            InstKind::Alloca { count, .. } => count.iter().copied().collect(),
            InstKind::Load { ptr } => vec![*ptr],
            InstKind::Store { value, ptr } => vec![*value, *ptr],
            InstKind::Cast { value } => vec![*value],
            InstKind::Index { base, indices } => {
                std::iter::once(*base).chain(indices.iter().copied()).collect()
            }
            InstKind::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            InstKind::Call { callee, args } => {
                let mut ops = Vec::with_capacity(args.len() + 1);
                if let Callee::Indirect(target) = callee {
                    ops.push(*target);
                }
                ops.extend(args.iter().copied());
                ops
            }
            InstKind::Phi { incoming } => incoming.iter().map(|(_, v)| *v).collect(),
            InstKind::StackRestore { saved } => vec![*saved],
            InstKind::CondBr { cond, .. } => vec![*cond],
            InstKind::Ret { value } => value.iter().copied().collect(),
            InstKind::StackSave | InstKind::Br { .. } | InstKind::Unreachable => Vec::new(),
        }
    }

    fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut ValueId)) {
        match self {
            InstKind::Alloca { count, .. } => count.iter_mut().for_each(f),
            InstKind::Load { ptr } => f(ptr),
            InstKind::Store { value, ptr } => {
                f(value);
                f(ptr);
            }
            InstKind::Cast { value } => f(value),
            InstKind::Index { base, indices } => {
                f(base);
                indices.iter_mut().for_each(f);
            }
            InstKind::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstKind::Call { callee, args } => {
                if let Callee::Indirect(target) = callee {
                    f(target);
                }
                args.iter_mut().for_each(f);
            }
            InstKind::Phi { incoming } => incoming.iter_mut().for_each(|(_, v)| f(v)),
            InstKind::StackRestore { saved } => f(saved),
            InstKind::CondBr { cond, .. } => f(cond),
            InstKind::Ret { value } => value.iter_mut().for_each(f),
            InstKind::StackSave | InstKind::Br { .. } | InstKind::Unreachable => {}
        }
    }

    /// Does this instruction end a block?
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Br { .. } | InstKind::CondBr { .. } | InstKind::Ret { .. } | InstKind::Unreachable
        )
    }

    /// Successor blocks of a terminator.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstKind::Br { target } => vec![*target],
            InstKind::CondBr { then_bb, else_bb, .. } => vec![*then_bb, *else_bb],
            _ => Vec::new(),
        }
    }
}

/// How a value is defined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueDef {
    /// The `index`-th parameter.
    Argument(u32),
    /// Address of a module global.
    Global(String),
    /// Constant address arithmetic over a module global.
    GlobalIndex {
        /// The indexed global.
        global: String,
        /// Constant indices.
        indices: Vec<i64>,
    },
    /// Integer constant.
    ConstInt(i64),
    /// Null pointer.
    Null,
    /// Result of an instruction.
    Inst(InstKind),
}

/// An arena slot: a typed value and its definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    /// Result type (`void` for instructions without a result).
    pub ty: Type,
    /// Definition.
    pub def: ValueDef,
    /// Optional source name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Value {
    /// A value without a source name.
    pub fn new(ty: Type, def: ValueDef) -> Self {
        Self { ty, def, name: None }
    }

    /// An instruction value.
    pub fn inst(ty: Type, kind: InstKind) -> Self {
        Self::new(ty, ValueDef::Inst(kind))
    }

    /// Instruction kind, if this is an instruction.
    pub fn as_inst(&self) -> Option<&InstKind> {
        match &self.def {
            ValueDef::Inst(kind) => Some(kind),
            _ => None,
        }
    }
}

/// A basic block: instructions in execution order, terminator last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Optional label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Instructions.
    pub insts: Vec<ValueId>,
}

/// A function: signature, value arena and blocks.
///
/// A function with no blocks is a declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    /// Symbol name.
    pub name: String,
    /// Parameter types.
    pub params: Vec<Type>,
    /// Return type.
    pub ret: Type,
    /// Value arena.
    #[serde(default)]
    pub values: Vec<Value>,
    /// Blocks; `bb0` is the entry.
    #[serde(default)]
    pub blocks: Vec<Block>,
}

impl Function {
    /// A function with its parameters in the arena and no blocks.
    pub fn new(name: impl Into<String>, params: Vec<Type>, ret: Type) -> Self {
        let values = params
            .iter()
            .enumerate()
            .map(|(i, ty)| Value::new(ty.clone(), ValueDef::Argument(i as u32)))
            .collect();
        Self {
            name: name.into(),
            params,
            ret,
            values,
            blocks: Vec::new(),
        }
    }

    /// Does this function have a body?
    pub fn has_body(&self) -> bool {
        !self.blocks.is_empty()
    }

    /// Value by id.
    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.index()]
    }

    /// Type of a value.
    pub fn ty(&self, id: ValueId) -> &Type {
        &self.value(id).ty
    }

    /// Instruction kind of a value, if it is one.
    pub fn inst(&self, id: ValueId) -> Option<&InstKind> {
        self.value(id).as_inst()
    }

    /// Id of the `index`-th parameter.
    pub fn arg(&self, index: usize) -> ValueId {
        debug_assert!(index < self.params.len());
        ValueId::new(index as u32)
    }

    /// Append a value to the arena without placing it in a block.
    pub fn add_value(&mut self, value: Value) -> ValueId {
        let id = ValueId::new(self.values.len() as u32);
        self.values.push(value);
        id
    }

    /// An integer constant.
    pub fn const_int(&mut self, ty: Type, value: i64) -> ValueId {
        self.add_value(Value::new(ty, ValueDef::ConstInt(value)))
    }

    /// Constant integer value of `id`, if it is one.
    pub fn as_const_int(&self, id: ValueId) -> Option<i64> {
        match self.value(id).def {
            ValueDef::ConstInt(value) => Some(value),
            _ => None,
        }
    }

    /// Append an empty block.
    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId::new(self.blocks.len() as u32);
        self.blocks.push(Block::default());
        id
    }

    /// Block by id.
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    /// Append an instruction to a block.
    pub fn push_inst(&mut self, block: BlockId, ty: Type, kind: InstKind) -> ValueId {
        let id = self.add_value(Value::inst(ty, kind));
        self.blocks[block.index()].insts.push(id);
        id
    }

    /// Block and position of a placed instruction.
    pub fn locate(&self, inst: ValueId) -> Option<(BlockId, usize)> {
        self.blocks.iter().enumerate().find_map(|(b, block)| {
            block
                .insts
                .iter()
                .position(|&i| i == inst)
                .map(|pos| (BlockId::new(b as u32), pos))
        })
    }

    /// Insert a new instruction right before `anchor`.
    ///
    /// # Panics
    /// If `anchor` is not placed in a block.
    pub fn insert_before(&mut self, anchor: ValueId, ty: Type, kind: InstKind) -> ValueId {
        let (block, pos) = self.locate(anchor).expect("anchor is not in a block");
        let id = self.add_value(Value::inst(ty, kind));
        self.blocks[block.index()].insts.insert(pos, id);
        id
    }

    /// Insert a new instruction right after `anchor`.
    ///
    /// # Panics
    /// If `anchor` is not placed in a block.
    pub fn insert_after(&mut self, anchor: ValueId, ty: Type, kind: InstKind) -> ValueId {
        let (block, pos) = self.locate(anchor).expect("anchor is not in a block");
        let id = self.add_value(Value::inst(ty, kind));
        self.blocks[block.index()].insts.insert(pos + 1, id);
        id
    }

    /// Detach an instruction from its block.
    pub fn remove(&mut self, inst: ValueId) -> bool {
        match self.locate(inst) {
            Some((block, pos)) => {
                self.blocks[block.index()].insts.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Rewrite every operand equal to `old` into `new`.
    ///
    /// Returns the number of operands rewritten.
    pub fn replace_all_uses(&mut self, old: ValueId, new: ValueId) -> usize {
        let mut replaced = 0;
        for value in &mut self.values {
            if let ValueDef::Inst(kind) = &mut value.def {
                kind.for_each_operand_mut(|op| {
                    if *op == old {
                        *op = new;
                        replaced += 1;
                    }
                });
            }
        }
        replaced
    }

    /// Placed instructions in block order.
    pub fn instructions(&self) -> Vec<(BlockId, ValueId)> {
        self.blocks
            .iter()
            .enumerate()
            .flat_map(|(b, block)| {
                block.insts.iter().map(move |&i| (BlockId::new(b as u32), i))
            })
            .collect()
    }

    /// Users of every value, in block order. A user appears once per value
    /// even if it has several operands referring to it.
    pub fn uses(&self) -> HashMap<ValueId, Vec<ValueId>> {
        let mut uses: HashMap<ValueId, Vec<ValueId>> = HashMap::new();
        for (_, user) in self.instructions() {
            let Some(kind) = self.inst(user) else { continue };
            let mut operands = kind.operands();
            operands.dedup();
            for operand in operands {
                let users = uses.entry(operand).or_default();
                if !users.contains(&user) {
                    users.push(user);
                }
            }
        }
        uses
    }

    /// Check that every id in the body resolves.
    ///
    /// Parameters must occupy the first arena slots, blocks may only list
    /// instructions, and every operand and successor must exist. The passes
    /// index the arena directly, so bodies read from outside go through
    /// this first. Declarations always pass.
    pub fn validate(&self) -> Result<(), InstrumentError> {
        if !self.has_body() {
            return Ok(());
        }
        for index in 0..self.params.len() {
            let value = ValueId::new(index as u32);
            match self.values.get(index).map(|v| &v.def) {
                Some(ValueDef::Argument(i)) if *i as usize == index => {}
                _ => {
                    return Err(InstrumentError::MisplacedArgument {
                        function: self.name.clone(),
                        value,
                        index,
                    })
                }
            }
        }

        for (index, value) in self.values.iter().enumerate() {
            let user = ValueId::new(index as u32);
            let kind = match &value.def {
                ValueDef::Argument(i) if *i as usize != index => {
                    return Err(InstrumentError::MisplacedArgument {
                        function: self.name.clone(),
                        value: user,
                        index: *i as usize,
                    })
                }
                ValueDef::Inst(kind) => kind,
                _ => continue,
            };
            if let Some(missing) = kind.operands().into_iter().find(|op| op.index() >= self.values.len()) {
                return Err(InstrumentError::DanglingValue {
                    function: self.name.clone(),
                    user,
                    value: missing,
                });
            }
            let mut targets = kind.successors();
            if let InstKind::Phi { incoming } = kind {
                targets.extend(incoming.iter().map(|(b, _)| *b));
            }
            if let Some(missing) = targets.into_iter().find(|b| b.index() >= self.blocks.len()) {
                return Err(InstrumentError::DanglingBlock {
                    function: self.name.clone(),
                    user,
                    block: missing,
                });
            }
        }

        for (b, block) in self.blocks.iter().enumerate() {
            let placed = |i: &&ValueId| self.values.get(i.index()).and_then(Value::as_inst).is_some();
            if let Some(&bad) = block.insts.iter().find(|i| !placed(i)) {
                return Err(InstrumentError::NotAnInstruction {
                    function: self.name.clone(),
                    block: BlockId::new(b as u32),
                    value: bad,
                });
            }
        }
        Ok(())
    }

    /// All `Ret` instructions.
    pub fn exits(&self) -> Vec<ValueId> {
        self.instructions()
            .into_iter()
            .map(|(_, i)| i)
            .filter(|&i| matches!(self.inst(i), Some(InstKind::Ret { .. })))
            .collect()
    }
}
