//! # i8c - I8Language Compiler Middle End
//!
//! Turns the annotated, stack-based operation lists of I8Language functions
//! into verified, optimized operation streams ready for bytecode emission.
//!
//! ## Pipeline
//!
//! 1. **CFG Builder** - split each function into basic blocks with explicit
//!    successor edges
//! 2. **Verifier** - walk the blocks with an abstract stack, checking depth,
//!    types and names, and merging stacks where control flow joins
//! 3. **Block optimizer** - peephole rewrites, branch simplification and
//!    block deduplication on the verified CFG
//! 4. **Serializer** - flatten the CFG into an [`OperationStream`] with
//!    explicit jump links
//! 5. **Stream optimizer** - jump threading and dead-code removal
//!
//! ## Quick Start
//!
//! ```rust
//! use i8c::compiler::ir::{BinaryOp, Constant, Function, OpKind};
//! use i8c::{Compiler, Module, TypeTable};
//!
//! # fn main() -> i8c::Result<()> {
//! let mut function = Function::new("double", "demo");
//! function
//!     .add_parameter("x", TypeTable::INT)
//!     .add_return(TypeTable::INT);
//! function.op(OpKind::Load(Constant::int(2)));
//! function.op(OpKind::Binary(BinaryOp::Mul));
//! function.op(OpKind::Return);
//!
//! let mut module = Module::new();
//! module.functions.push(function);
//!
//! let result = Compiler::default().compile_module(&module)?;
//! let double = result.function("double").unwrap();
//! assert_eq!(double.max_stack_depth, 2);
//! assert_eq!(double.stream.len(), 3);
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Every failure is an [`Error`] carrying the source location of the
//! operation at fault and, for stack errors, a dump of the abstract stack:
//!
//! ```rust
//! use i8c::compiler::ir::{BinaryOp, Function, OpKind};
//! use i8c::{Compiler, Error, TypeTable};
//!
//! let mut function = Function::new("bad", "demo");
//! function.op(OpKind::Binary(BinaryOp::Add));
//!
//! let err = Compiler::default()
//!     .compile_function(&TypeTable::new(), &function)
//!     .unwrap_err();
//! assert!(matches!(err, Error::StackUnderflow { required: 2, .. }));
//! ```

#![allow(clippy::new_without_default)]

/// Version of the i8c middle end
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod compiler;
pub mod error;

// Re-export main types
pub use compiler::{
    CompileOptions, CompileResult, CompiledFunction, Compiler, Module, OperationStream, TypeTable,
};
pub use error::{Error, ErrorSeverity, Result};
