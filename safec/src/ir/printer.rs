//! Textual listing of modules and functions.
//!
//! The format is LLVM-flavoured and meant for humans; nothing parses it.
//!
//! ```text
//! define void @f(i8* %0) {
//! bb0:
//!   %1 = alloca i32
//!   store i32 7, i32* %1
//!   ret void
//! }
//! ```

use std::fmt;

use super::function::{BinaryOp, Callee, Function, InstKind, ValueDef, ValueId};
use super::module::Module;

struct Operand<'f> {
    func: &'f Function,
    id: ValueId,
}

impl fmt::Display for Operand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.func.value(self.id).def {
            ValueDef::ConstInt(value) => write!(f, "{value}"),
            ValueDef::Null => write!(f, "null"),
            ValueDef::Global(name) => write!(f, "@{name}"),
            ValueDef::GlobalIndex { global, indices } => {
                write!(f, "index (@{global}")?;
                for index in indices {
                    write!(f, ", {index}")?;
                }
                write!(f, ")")
            }
            ValueDef::Argument(_) | ValueDef::Inst(_) => write!(f, "{}", self.id),
        }
    }
}

fn operand(func: &Function, id: ValueId) -> Operand<'_> {
    Operand { func, id }
}

fn typed(func: &Function, id: ValueId) -> String {
    format!("{} {}", func.ty(id), operand(func, id))
}

fn typed_list(func: &Function, ids: &[ValueId]) -> String {
    ids.iter()
        .map(|&id| typed(func, id))
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            BinaryOp::Mul => "mul",
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
        };
        write!(f, "{op}")
    }
}

fn write_inst(f: &mut fmt::Formatter<'_>, func: &Function, id: ValueId, kind: &InstKind) -> fmt::Result {
    let ty = func.ty(id);
    write!(f, "  ")?;
    if !ty.is_void() {
        write!(f, "{id} = ")?;
    }
    match kind {
        InstKind::Alloca { allocated, count } => {
            write!(f, "alloca {allocated}")?;
            if let Some(count) = count {
                write!(f, ", {}", typed(func, *count))?;
            }
            Ok(())
        }
        InstKind::Load { ptr } => write!(f, "load {ty}, {}", typed(func, *ptr)),
        InstKind::Store { value, ptr } => {
            write!(f, "store {}, {}", typed(func, *value), typed(func, *ptr))
        }
        InstKind::Cast { value } => write!(f, "cast {} to {ty}", typed(func, *value)),
        InstKind::Index { base, indices } => {
            write!(f, "index {}", typed(func, *base))?;
            if !indices.is_empty() {
                write!(f, ", {}", typed_list(func, indices))?;
            }
            Ok(())
        }
        InstKind::Binary { op, lhs, rhs } => {
            write!(f, "{op} {ty} {}, {}", operand(func, *lhs), operand(func, *rhs))
        }
        InstKind::Call { callee, args } => {
            write!(f, "call {ty} ")?;
            match callee {
                Callee::Direct(name) => write!(f, "@{name}")?,
                Callee::Indirect(target) => write!(f, "{}", operand(func, *target))?,
            }
            write!(f, "({})", typed_list(func, args))
        }
        InstKind::Phi { incoming } => {
            write!(f, "phi {ty} ")?;
            for (i, (block, value)) in incoming.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "[ {}, {block} ]", operand(func, *value))?;
            }
            Ok(())
        }
        InstKind::StackSave => write!(f, "stacksave"),
        InstKind::StackRestore { saved } => write!(f, "stackrestore {}", typed(func, *saved)),
        InstKind::Br { target } => write!(f, "br {target}"),
        InstKind::CondBr { cond, then_bb, else_bb } => {
            write!(f, "br {}, {then_bb}, {else_bb}", typed(func, *cond))
        }
        InstKind::Ret { value: Some(value) } => write!(f, "ret {}", typed(func, *value)),
        InstKind::Ret { value: None } => write!(f, "ret void"),
        InstKind::Unreachable => write!(f, "unreachable"),
    }?;
    if let Some(name) = &func.value(id).name {
        write!(f, " ; {name}")?;
    }
    writeln!(f)
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyword = if self.has_body() { "define" } else { "declare" };
        write!(f, "{keyword} {} @{}(", self.ret, self.name)?;
        for (i, ty) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if self.has_body() {
                write!(f, "{ty} {}", self.arg(i))?;
            } else {
                write!(f, "{ty}")?;
            }
        }
        write!(f, ")")?;
        if !self.has_body() {
            return writeln!(f);
        }
        writeln!(f, " {{")?;
        for (b, block) in self.blocks.iter().enumerate() {
            write!(f, "bb{b}:")?;
            if let Some(name) = &block.name {
                write!(f, " ; {name}")?;
            }
            writeln!(f)?;
            for &id in &block.insts {
                if let Some(kind) = self.inst(id) {
                    write_inst(f, self, id, kind)?;
                }
            }
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        for global in &self.globals {
            writeln!(f, "@{} = global {}", global.name, global.ty)?;
        }
        for func in &self.functions {
            writeln!(f)?;
            write!(f, "{func}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FunctionBuilder, Global, Type};

    #[test]
    fn test_function_listing() {
        let mut b = FunctionBuilder::new("f", vec![Type::i8_ptr()], Type::Void);
        let slot = b.alloca(Type::i32());
        let seven = b.const_int(Type::i32(), 7);
        b.store(seven, slot);
        let arg = b.arg(0);
        b.call("sink", vec![arg], Type::Void);
        b.ret(None);
        let text = b.finish().to_string();
        assert_eq!(
            text,
            "define void @f(i8* %0) {\n\
             bb0:\n  \
             %1 = alloca i32\n  \
             store i32 7, i32* %1\n  \
             call void @sink(i8* %0)\n  \
             ret void\n\
             }\n"
        );
    }

    #[test]
    fn test_declaration_listing() {
        let func = Function::new("safec_free", vec![Type::i8_ptr()], Type::Void);
        assert_eq!(func.to_string(), "declare void @safec_free(i8*)\n");
    }

    #[test]
    fn test_module_listing() {
        let mut module = Module::new("m");
        module.globals.push(Global::new("g", Type::i64()));
        let text = module.to_string();
        assert!(text.starts_with("; module m\n@g = global i64\n"));
    }
}
