//! # I8Language Compiler - Middle End
//!
//! Takes annotated functions from the front end and produces verified,
//! optimized operation streams for the bytecode emitter.
//!
//! ## Architecture
//!
//! ```text
//! Function → CFG → Verify → Block optimizer → Serialize → Stream optimizer → Stream
//! ```
//!
//! ## Usage
//!
//! ```
//! use i8c::compiler::{CompileOptions, Compiler};
//! use i8c::compiler::ir::{Constant, Function, OpKind};
//! use i8c::compiler::types::TypeTable;
//!
//! let types = TypeTable::new();
//! let mut function = Function::new("answer", "demo");
//! function.add_return(TypeTable::INT);
//! function.op(OpKind::Load(Constant::int(42)));
//! function.op(OpKind::Return);
//!
//! let compiler = Compiler::new(CompileOptions::default());
//! let compiled = compiler.compile_function(&types, &function)?;
//! assert_eq!(compiled.max_stack_depth, 1);
//! # Ok::<(), i8c::Error>(())
//! ```

pub mod cfg;
pub mod debug;
pub mod ir;
pub mod optimizer;
pub mod stack;
pub mod stream;
pub mod stream_optimizer;
pub mod types;
pub mod verifier;

pub use cfg::{Block, BlockId, Cfg};
pub use debug::{dump_cfg, dump_stream, format_op};
pub use ir::{Function, Module, OpId, OpKind, Operation};
pub use optimizer::{BlockOptimizer, OptimizerStats};
pub use stream::{serialize, OperationStream};
pub use stream_optimizer::{StreamOptimizer, StreamStats};
pub use types::{TypeId, TypeTable};
pub use verifier::{Verification, Verifier};

use crate::Result;
use rayon::prelude::*;
use std::collections::HashMap;

/// Compilation options
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Optimization level (0-2)
    ///
    /// 0 verifies and serializes, 1 adds the stream optimizer, 2 adds the
    /// block-level optimizer.
    pub opt_level: u8,
    /// Verifier block walk budget per function
    pub max_block_walks: usize,
    /// Compile the functions of a module on the rayon pool
    pub parallel: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            opt_level: 2,
            max_block_walks: Verifier::DEFAULT_MAX_BLOCK_WALKS,
            parallel: false,
        }
    }
}

/// One compiled function
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    /// Function name
    pub name: String,
    /// Final operation stream
    pub stream: OperationStream,
    /// Deepest abstract stack
    pub max_stack_depth: usize,
    /// Stack index of every by-name slot reference
    pub resolutions: HashMap<OpId, usize>,
    /// Warnings generated during compilation
    pub warnings: Vec<String>,
    /// Operations in the CFG as built
    pub cfg_instruction_count: usize,
    /// Operations in the final stream
    pub stream_instruction_count: usize,
    /// Block optimizer counters (`None` below opt level 2)
    pub block_stats: Option<OptimizerStats>,
    /// Stream optimizer counters (`None` at opt level 0)
    pub stream_stats: Option<StreamStats>,
}

/// Compilation result for a whole module
#[derive(Debug, Clone, Default)]
pub struct CompileResult {
    /// Compiled functions in definition order
    pub functions: Vec<CompiledFunction>,
    /// Warnings of every function
    pub warnings: Vec<String>,
}

impl CompileResult {
    /// Compiled function by name
    pub fn function(&self, name: &str) -> Option<&CompiledFunction> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// Middle-end driver
pub struct Compiler {
    options: CompileOptions,
}

impl Compiler {
    /// Create a new compiler with options
    pub fn new(options: CompileOptions) -> Self {
        Self { options }
    }

    /// Options in use
    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Compile one function
    pub fn compile_function(
        &self,
        types: &TypeTable,
        function: &Function,
    ) -> Result<CompiledFunction> {
        // Phase 1: Build the CFG
        let mut cfg = Cfg::build(function)?;
        let cfg_instruction_count = cfg.instruction_count();
        let mut warnings = std::mem::take(&mut cfg.warnings);

        // Phase 2: Verify
        let verification = Verifier::new(types)
            .max_block_walks(self.options.max_block_walks)
            .verify(&cfg, function)?;
        warnings.extend(verification.warnings.iter().cloned());

        // Phase 3: Block-level optimization
        let block_stats = if self.options.opt_level >= 2 {
            Some(BlockOptimizer::new(&verification.resolutions).optimize(&mut cfg))
        } else {
            None
        };

        // Phase 4: Serialize
        let mut stream = serialize(&cfg);

        // Phase 5: Stream optimization
        let stream_stats = if self.options.opt_level >= 1 {
            Some(StreamOptimizer::new().optimize(&mut stream))
        } else {
            None
        };

        tracing::debug!(
            function = %function.name,
            max_stack_depth = verification.max_stack_depth,
            cfg_ops = cfg_instruction_count,
            stream_ops = stream.len(),
            "compiled function"
        );

        Ok(CompiledFunction {
            name: function.name.clone(),
            stream_instruction_count: stream.len(),
            stream,
            max_stack_depth: verification.max_stack_depth,
            resolutions: verification.resolutions,
            warnings,
            cfg_instruction_count,
            block_stats,
            stream_stats,
        })
    }

    /// Compile every function of a module, stopping at the first failure
    pub fn compile_module(&self, module: &Module) -> Result<CompileResult> {
        let compile = |function: &Function| {
            self.compile_function(&module.types, function)
                .map_err(|err| err.in_function(function.name.clone()))
        };

        let functions: Vec<CompiledFunction> = if self.options.parallel {
            module
                .functions
                .par_iter()
                .map(compile)
                .collect::<Result<_>>()?
        } else {
            module
                .functions
                .iter()
                .map(compile)
                .collect::<Result<_>>()?
        };

        let warnings = functions
            .iter()
            .flat_map(|f| f.warnings.iter().cloned())
            .collect();
        Ok(CompileResult {
            functions,
            warnings,
        })
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(CompileOptions::default())
    }
}
