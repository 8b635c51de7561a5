//! Modules: globals plus functions, the unit the CLI reads and writes.

use serde::{Deserialize, Serialize};

use super::function::Function;
use super::layout::DataLayout;
use super::types::Type;
use crate::error::InstrumentError;

/// A module-level variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Global {
    /// Symbol name.
    pub name: String,
    /// Type of the variable (not of its address).
    pub ty: Type,
}

impl Global {
    /// Create a new global.
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self { name: name.into(), ty }
    }
}

/// A translation unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    /// Module name.
    pub name: String,
    /// Target layout.
    #[serde(default)]
    pub layout: DataLayout,
    /// Globals.
    #[serde(default)]
    pub globals: Vec<Global>,
    /// Functions and declarations.
    #[serde(default)]
    pub functions: Vec<Function>,
}

impl Module {
    /// An empty LP64 module.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layout: DataLayout::default(),
            globals: Vec::new(),
            functions: Vec::new(),
        }
    }

    /// Look up a global by name.
    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }

    /// Look up a function by name.
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Validate every function; see [`Function::validate`].
    pub fn validate(&self) -> Result<(), InstrumentError> {
        self.functions.iter().try_for_each(Function::validate)
    }

    /// Declare `name` unless a function of that name already exists.
    pub fn declare(&mut self, name: &str, params: Vec<Type>, ret: Type) {
        if self.function(name).is_none() {
            self.functions.push(Function::new(name, params, ret));
        }
    }
}
