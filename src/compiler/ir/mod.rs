//! # Intermediate Representation for I8Language Functions
//!
//! The annotation stage hands each function over as a flat list of stack
//! operations. Names and types are already resolved; jump targets are still
//! textual labels.
//!
//! ## Module Structure
//!
//! ```text
//! ir/
//! ├── mod.rs          # This file - module definition and re-exports
//! ├── instruction.rs  # OpKind, Operation, Label, Name, SlotRef
//! └── program.rs      # Function, Module
//! ```
//!
//! ## Key Types
//!
//! - [`OpKind`] - closed set of operation kinds, each with verb, arity and terminal class
//! - [`Operation`] - an operation with its id, location and synthetic origin
//! - [`Function`] - parameters, externals, returns, labels and operations
//! - [`Module`] - functions sharing a [`TypeTable`](crate::compiler::types::TypeTable)

mod instruction;
mod program;

pub use instruction::{
    BinaryOp, CompareOp, Constant, Label, Location, Name, NameRef, OpDisplay, OpId, OpIds,
    OpKind, Operation, SlotRef, StackOp, Terminal, UnaryOp,
};
pub use program::{Binding, Function, Module};
