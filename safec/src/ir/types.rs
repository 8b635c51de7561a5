//! # IR Types
//!
//! The type language of the instrumentation IR. It is deliberately close
//! to what a C front end produces: fixed-width integers and floats, typed
//! pointers, arrays, structs (optionally packed) and function types.
//!
//! Types are plain values: they hash and compare structurally, so they can
//! key the per-type bitmap cache directly.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An IR type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Type {
    /// No value (function returns only).
    Void,
    /// Integer of the given bit width.
    Int(u32),
    /// Floating point value of the given bit width.
    Float(u32),
    /// Pointer to a value of the given type.
    Ptr(Box<Type>),
    /// Fixed-length array.
    Array(Box<Type>, u64),
    /// Aggregate of fields laid out in order.
    Struct {
        /// Field types in declaration order.
        fields: Vec<Type>,
        /// Fields are laid out without padding.
        #[serde(default)]
        packed: bool,
    },
    /// Function signature.
    Function {
        /// Parameter types.
        params: Vec<Type>,
        /// Return type.
        ret: Box<Type>,
    },
}

impl Type {
    /// `iN`.
    pub fn int(bits: u32) -> Self {
        Type::Int(bits)
    }

    /// `i8`.
    pub fn i8() -> Self {
        Type::Int(8)
    }

    /// `i32`.
    pub fn i32() -> Self {
        Type::Int(32)
    }

    /// `i64`.
    pub fn i64() -> Self {
        Type::Int(64)
    }

    /// `double`.
    pub fn f64() -> Self {
        Type::Float(64)
    }

    /// Pointer to `pointee`.
    pub fn ptr(pointee: Type) -> Self {
        Type::Ptr(Box::new(pointee))
    }

    /// `i8*`, the runtime's untyped pointer.
    pub fn i8_ptr() -> Self {
        Type::ptr(Type::i8())
    }

    /// `[len x elem]`.
    pub fn array(elem: Type, len: u64) -> Self {
        Type::Array(Box::new(elem), len)
    }

    /// Padded struct.
    pub fn structure(fields: Vec<Type>) -> Self {
        Type::Struct {
            fields,
            packed: false,
        }
    }

    /// Packed struct.
    pub fn packed(fields: Vec<Type>) -> Self {
        Type::Struct {
            fields,
            packed: true,
        }
    }

    /// Function type.
    pub fn function(params: Vec<Type>, ret: Type) -> Self {
        Type::Function {
            params,
            ret: Box::new(ret),
        }
    }

    /// Is this a pointer type?
    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Ptr(_))
    }

    /// Is this `void`?
    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    /// Pointee of a pointer type.
    pub fn pointee(&self) -> Option<&Type> {
        match self {
            Type::Ptr(pointee) => Some(pointee),
            _ => None,
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Type]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int(bits) => write!(f, "i{bits}"),
            Type::Float(32) => write!(f, "float"),
            Type::Float(64) => write!(f, "double"),
            Type::Float(bits) => write!(f, "f{bits}"),
            Type::Ptr(pointee) => write!(f, "{pointee}*"),
            Type::Array(elem, len) => write!(f, "[{len} x {elem}]"),
            Type::Struct { fields, packed } => {
                if *packed {
                    write!(f, "<{{ ")?;
                } else {
                    write!(f, "{{ ")?;
                }
                write_list(f, fields)?;
                if *packed {
                    write!(f, " }}>")
                } else {
                    write!(f, " }}")
                }
            }
            Type::Function { params, ret } => {
                write!(f, "{ret} (")?;
                write_list(f, params)?;
                write!(f, ")")
            }
        }
    }
}
