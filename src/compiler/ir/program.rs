//! Function and module definitions handed over by the annotation stage

use super::instruction::{Location, Name, OpId, OpIds, OpKind, Operation};
use crate::compiler::types::{TypeId, TypeTable};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// A typed, named value available on function entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Name the slot starts with
    pub name: Name,
    /// Declared type
    pub ty: TypeId,
}

/// One function's annotated operation list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    /// Function name
    pub name: String,
    /// Provider owning the function; short names resolve against it
    pub provider: String,
    /// Location of the definition
    pub location: Location,
    /// Parameters in declaration order
    pub parameters: Vec<Binding>,
    /// External symbols and function references in declaration order
    pub externals: Vec<Binding>,
    /// Return types in declaration order
    pub returns: Vec<TypeId>,
    /// Label names declared by the function
    pub labels: BTreeSet<String>,
    /// Flat operation list, label markers included
    pub operations: Vec<Operation>,
    #[serde(skip)]
    ids: OpIds,
}

impl Function {
    /// Creates an empty function
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            location: Location::default(),
            parameters: Vec::new(),
            externals: Vec::new(),
            returns: Vec::new(),
            labels: BTreeSet::new(),
            operations: Vec::new(),
            ids: OpIds::starting_at(0),
        }
    }

    /// Declare a parameter named in the function's own provider
    pub fn add_parameter(&mut self, short: &str, ty: TypeId) -> &mut Self {
        let name = Name::new(self.provider.clone(), short);
        self.parameters.push(Binding { name, ty });
        self
    }

    /// Declare an external reference
    pub fn add_external(&mut self, name: Name, ty: TypeId) -> &mut Self {
        self.externals.push(Binding { name, ty });
        self
    }

    /// Declare a return type
    pub fn add_return(&mut self, ty: TypeId) -> &mut Self {
        self.returns.push(ty);
        self
    }

    /// Append an operation
    pub fn push(&mut self, kind: OpKind, location: Location) -> OpId {
        // deserialized functions start with a fresh allocator
        if self.ids.peek() == 0 && !self.operations.is_empty() {
            self.ids = self.op_ids();
        }
        let id = self.ids.next_id();
        self.operations.push(Operation::new(id, kind, location));
        id
    }

    /// Append an operation located on the next line
    pub fn op(&mut self, kind: OpKind) -> OpId {
        let line = self.operations.len() as u32 + 1;
        self.push(kind, Location::new(line, 1))
    }

    /// Declare a label and append its marker
    pub fn label(&mut self, name: &str) -> OpId {
        self.labels.insert(name.to_string());
        self.op(OpKind::Label(name.to_string()))
    }

    /// Id allocator continuing after every operation id in use
    pub fn op_ids(&self) -> OpIds {
        let next = self
            .operations
            .iter()
            .map(|op| op.id.0 + 1)
            .max()
            .unwrap_or(0);
        OpIds::starting_at(next.max(self.ids.peek()))
    }

    /// Check a function read from outside the crate against its type table
    pub fn validate(&self, types: &TypeTable) -> Result<()> {
        let bindings = self.parameters.iter().chain(&self.externals);
        if let Some(ty) = bindings
            .map(|binding| binding.ty)
            .chain(self.returns.iter().copied())
            .find(|ty| !types.contains(*ty))
        {
            return Err(self.malformed(format!("declares missing type {}", ty.index())));
        }

        let mut seen = HashSet::new();
        for op in &self.operations {
            if !seen.insert(op.id) {
                return Err(self.malformed(format!("reuses operation id {}", op.id.0)));
            }
            let ty = match &op.kind {
                OpKind::Load(constant) => Some(constant.ty),
                OpKind::AddUnsigned { ty, .. }
                | OpKind::Cast { ty, .. }
                | OpKind::Deref { ty } => Some(*ty),
                _ => None,
            };
            if let Some(ty) = ty.filter(|ty| !types.contains(*ty)) {
                return Err(Error::Serialization {
                    message: format!(
                        "function '{}': {} at {} uses missing type {}",
                        self.name,
                        op.kind.verb(),
                        op.location,
                        ty.index()
                    ),
                });
            }
        }
        Ok(())
    }

    fn malformed(&self, problem: String) -> Error {
        Error::Serialization {
            message: format!("function '{}' {}", self.name, problem),
        }
    }
}

/// All functions sharing one type table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Module {
    /// Type forest
    pub types: TypeTable,
    /// Functions in definition order
    pub functions: Vec<Function>,
}

impl Module {
    /// Create an empty module with the built-in types
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a module handed over by the front end as JSON
    ///
    /// Type references are checked so that later stages can index the type
    /// table freely.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut module: Module = serde_json::from_str(json)?;
        module.types.validate()?;
        for function in &mut module.functions {
            function.validate(&module.types)?;
            function.ids = function.op_ids();
        }
        Ok(module)
    }

    /// Render as JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
