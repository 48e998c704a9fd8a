//! # Stack Verifier
//!
//! Abstract interpretation of a function's CFG. Starting from an entry stack
//! built from the parameters and externals, every block is walked with a
//! [`WorkingStack`], each operation's typing rule is checked, and the stack
//! left at the terminal is published to every successor.
//!
//! A block reached again is not re-walked unless merging the new stack into
//! the stored entry stack changes something. Merges only ever generalise a
//! slot (wider type, fewer names, lost constant), so the walk converges; an
//! explicit walk budget turns a runaway into [`Error::FixpointLimit`].

use crate::compiler::cfg::{Block, BlockId, Cfg};
use crate::compiler::ir::{
    BinaryOp, Function, Location, Name, NameRef, OpId, OpKind, Operation, SlotRef, StackOp,
};
use crate::compiler::stack::{FrozenStack, MergeError, Slot, SlotArena, WorkingStack};
use crate::compiler::types::{TypeId, TypeName, TypeTable};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Stacks recorded for one verified block
#[derive(Debug, Clone)]
pub struct BlockStacks {
    /// Depth shared by every stack arriving at the block
    pub depth: usize,
    /// Merged entry stack
    pub merged: String,
    /// Last stack published by each predecessor (`None` = function entry)
    pub incoming: BTreeMap<Option<BlockId>, String>,
}

/// Outcome of a successful verification
#[derive(Debug, Clone, Default)]
pub struct Verification {
    /// Deepest stack seen anywhere in the function
    pub max_stack_depth: usize,
    /// Entry stacks of every reachable block
    pub entry_stacks: BTreeMap<BlockId, BlockStacks>,
    /// Stack index chosen for every by-name slot reference
    pub resolutions: HashMap<OpId, usize>,
    /// Number of block walks performed
    pub block_walks: usize,
    /// Non-fatal diagnostics
    pub warnings: Vec<String>,
}

/// Stack verifier
pub struct Verifier<'a> {
    types: &'a TypeTable,
    max_block_walks: usize,
}

impl<'a> Verifier<'a> {
    /// Default bound on block walks per function
    pub const DEFAULT_MAX_BLOCK_WALKS: usize = 100_000;

    /// Creates a verifier over a type table
    pub fn new(types: &'a TypeTable) -> Self {
        Self {
            types,
            max_block_walks: Self::DEFAULT_MAX_BLOCK_WALKS,
        }
    }

    /// Set the block walk budget
    pub fn max_block_walks(mut self, limit: usize) -> Self {
        self.max_block_walks = limit;
        self
    }

    /// Verify every block reachable from the entry
    pub fn verify(&self, cfg: &Cfg, function: &Function) -> Result<Verification> {
        let walk = Walk {
            types: self.types,
            cfg,
            function,
            limit: self.max_block_walks,
            arena: SlotArena::new(),
            states: HashMap::new(),
            resolutions: HashMap::new(),
            warned: HashSet::new(),
            warnings: Vec::new(),
            max_depth: 0,
            walks: 0,
        };
        walk.run()
    }
}

/// A stack published along one edge
struct Arrival {
    block: BlockId,
    from: Option<BlockId>,
    location: Location,
    stack: FrozenStack,
}

struct BlockState {
    entry: FrozenStack,
    incoming: BTreeMap<Option<BlockId>, FrozenStack>,
}

struct Walk<'a> {
    types: &'a TypeTable,
    cfg: &'a Cfg,
    function: &'a Function,
    limit: usize,
    arena: SlotArena,
    states: HashMap<BlockId, BlockState>,
    resolutions: HashMap<OpId, usize>,
    warned: HashSet<OpId>,
    warnings: Vec<String>,
    max_depth: usize,
    walks: usize,
}

impl<'a> Walk<'a> {
    fn run(mut self) -> Result<Verification> {
        let cfg = self.cfg;
        let entry = self.entry_stack()?;
        let mut worklist = vec![Arrival {
            block: cfg.entry,
            from: None,
            location: self.function.location,
            stack: entry,
        }];

        while let Some(arrival) = worklist.pop() {
            self.max_depth = self.max_depth.max(arrival.stack.depth());
            let id = arrival.block;
            let Some(entry) = self.enter(arrival)? else {
                continue;
            };
            let Some(block) = cfg.block(id) else {
                continue;
            };

            self.walks += 1;
            if self.walks > self.limit {
                return Err(Error::FixpointLimit {
                    function: self.function.name.clone(),
                    limit: self.limit,
                });
            }

            tracing::trace!(block = %id, depth = entry.depth(), "walking block");
            let exit = self.walk_block(block, &entry)?;
            let location = block
                .terminator()
                .map(|op| op.location)
                .unwrap_or(self.function.location);

            // Branched exit ends up on top of the worklist
            for &succ in block.successors.iter().rev() {
                worklist.push(Arrival {
                    block: succ,
                    from: Some(id),
                    location,
                    stack: exit.clone(),
                });
            }
        }

        tracing::debug!(
            function = %self.function.name,
            max_stack_depth = self.max_depth,
            block_walks = self.walks,
            "verified"
        );
        Ok(self.finish())
    }

    fn finish(self) -> Verification {
        let entry_stacks = self
            .states
            .iter()
            .map(|(&id, state)| {
                let stacks = BlockStacks {
                    depth: state.entry.depth(),
                    merged: state.entry.dump(&self.arena, self.types),
                    incoming: state
                        .incoming
                        .iter()
                        .map(|(&from, stack)| (from, stack.dump(&self.arena, self.types)))
                        .collect(),
                };
                (id, stacks)
            })
            .collect();

        Verification {
            max_stack_depth: self.max_depth,
            entry_stacks,
            resolutions: self.resolutions,
            block_walks: self.walks,
            warnings: self.warnings,
        }
    }

    /// Parameters then externals, each a named slot
    fn entry_stack(&mut self) -> Result<FrozenStack> {
        let mut stack = WorkingStack::new();
        let bindings = self
            .function
            .parameters
            .iter()
            .chain(&self.function.externals);

        for binding in bindings {
            if !stack.find_exact(&binding.name, &self.arena).is_empty() {
                return Err(Error::RedefinedName {
                    name: binding.name.full(),
                    location: self.function.location,
                    stack: stack.dump(&self.arena, self.types),
                });
            }
            let id = self
                .arena
                .alloc(Slot::named(binding.ty, binding.name.clone()));
            stack.push(id);
        }

        Ok(stack.freeze())
    }

    /// Record an arrival; returns the stack to walk the block with, if any
    fn enter(&mut self, arrival: Arrival) -> Result<Option<FrozenStack>> {
        let Some(state) = self.states.get_mut(&arrival.block) else {
            let mut incoming = BTreeMap::new();
            incoming.insert(arrival.from, arrival.stack.clone());
            self.states.insert(
                arrival.block,
                BlockState {
                    entry: arrival.stack.clone(),
                    incoming,
                },
            );
            return Ok(Some(arrival.stack));
        };

        let merged = match state.entry.merge(&arrival.stack, &mut self.arena, self.types) {
            Ok(merged) => merged,
            Err(err) => {
                let slot = match err {
                    MergeError::Depth => None,
                    MergeError::Slot(index) => Some(index),
                };
                return Err(Error::StackMergeMismatch {
                    slot,
                    location: arrival.location,
                    stack: format!(
                        "stored at {}:\n{}\nincoming:\n{}",
                        arrival.block,
                        state.entry.dump(&self.arena, self.types),
                        arrival.stack.dump(&self.arena, self.types)
                    ),
                });
            }
        };

        state.incoming.insert(arrival.from, arrival.stack);
        if merged == state.entry {
            return Ok(None);
        }
        state.entry = merged.clone();
        Ok(Some(merged))
    }

    fn walk_block(&mut self, block: &Block, entry: &FrozenStack) -> Result<FrozenStack> {
        let mut stack = entry.thaw();
        for op in &block.ops {
            self.transfer(op, &mut stack)?;
            self.max_depth = self.max_depth.max(stack.depth());
        }
        Ok(stack.freeze())
    }

    fn transfer(&mut self, op: &Operation, stack: &mut WorkingStack) -> Result<()> {
        let arity = op.kind.arity();
        if arity > 0 {
            self.underflow_check(op, stack, arity - 1)?;
        }

        match &op.kind {
            OpKind::Label(_) | OpKind::Goto(_) => {}
            OpKind::Load(constant) => {
                self.push(stack, Slot::constant(constant.ty, constant.value));
            }
            OpKind::LoadName(name) => {
                let index = self.resolve_name(op, stack, name)?;
                self.push_copy(stack, index);
            }
            OpKind::Pick(slot) => {
                let index = self.resolve(op, stack, slot)?;
                self.push_copy(stack, index);
            }
            OpKind::Name { slot, name } => self.name_slot(op, stack, slot, name)?,
            OpKind::Binary(binary) => {
                let b = self.peek(op, stack, 0)?;
                let a = self.peek(op, stack, 1)?;
                let result = self.arithmetic(op, stack, *binary, &a, &b)?;
                stack.pop_n(2);
                self.push(stack, result);
            }
            OpKind::AddUnsigned { value, ty } => {
                let a = self.peek(op, stack, 0)?;
                let b = Slot::constant(*ty, *value as i64);
                let result = self.arithmetic(op, stack, BinaryOp::Add, &a, &b)?;
                stack.pop_n(1);
                self.push(stack, result);
            }
            OpKind::Compare(compare) => {
                let b = self.peek(op, stack, 0)?;
                let a = self.peek(op, stack, 1)?;
                for slot in [&a, &b] {
                    self.require_computable(op, stack, slot.ty)?;
                }
                if self.types.basetype(a.ty) != self.types.basetype(b.ty) {
                    return Err(self.mismatch(
                        op,
                        stack,
                        self.type_name(self.types.basetype(a.ty)),
                        self.type_name(b.ty),
                    ));
                }
                let value = match (a.value, b.value) {
                    (Some(x), Some(y)) => Some(compare.fold(x, y)),
                    _ => None,
                };
                stack.pop_n(2);
                self.push(
                    stack,
                    Slot {
                        ty: TypeTable::BOOL,
                        names: BTreeSet::new(),
                        value,
                    },
                );
            }
            OpKind::Unary(unary) => {
                let a = self.peek(op, stack, 0)?;
                if !self.types.is_int(a.ty) {
                    return Err(self.mismatch(op, stack, "int".into(), self.type_name(a.ty)));
                }
                stack.pop_n(1);
                self.push(
                    stack,
                    Slot {
                        ty: a.ty,
                        names: BTreeSet::new(),
                        value: a.value.map(|v| unary.fold(v)),
                    },
                );
            }
            OpKind::Call => self.call(op, stack)?,
            OpKind::Cast { slot, ty } => self.cast(op, stack, slot, *ty)?,
            OpKind::Deref { ty } => {
                let pointer = self.peek(op, stack, 0)?;
                if !self.types.is_ptr(pointer.ty) {
                    return Err(self.mismatch(op, stack, "ptr".into(), self.type_name(pointer.ty)));
                }
                if !self.types.is_computable(*ty) {
                    return Err(self.mismatch(
                        op,
                        stack,
                        "int or ptr".into(),
                        self.type_name(*ty),
                    ));
                }
                stack.pop_n(1);
                self.push(stack, Slot::new(*ty));
            }
            OpKind::Stack(shuffle) => match shuffle {
                StackOp::Drop => stack.pop_n(1),
                StackOp::Dup => self.push_copy(stack, 0),
                StackOp::Over => self.push_copy(stack, 1),
                StackOp::Swap => stack.swap(0, 1),
                StackOp::Rot => stack.roll(2),
            },
            OpKind::Branch(_) => {
                let condition = self.peek(op, stack, 0)?;
                self.require_computable(op, stack, condition.ty)?;
                stack.pop_n(1);
            }
            OpKind::Return => self.check_return(op, stack)?,
        }

        Ok(())
    }

    fn arithmetic(
        &self,
        op: &Operation,
        stack: &WorkingStack,
        binary: BinaryOp,
        a: &Slot,
        b: &Slot,
    ) -> Result<Slot> {
        for slot in [a, b] {
            self.require_computable(op, stack, slot.ty)?;
        }

        let pointers = (self.types.is_ptr(a.ty), self.types.is_ptr(b.ty));
        let ty = match pointers {
            (false, false) => self.types.lowest_common_ancestor(a.ty, b.ty),
            (true, false) if matches!(binary, BinaryOp::Add | BinaryOp::Sub) => {
                Some(TypeTable::PTR)
            }
            (false, true) if binary == BinaryOp::Add => Some(TypeTable::PTR),
            _ => None,
        };
        let Some(ty) = ty else {
            return Err(self.mismatch(
                op,
                stack,
                "int, int".into(),
                format!("{}, {}", self.type_name(a.ty), self.type_name(b.ty)),
            ));
        };

        let value = match (a.value, b.value) {
            (Some(x), Some(y)) => binary.fold(x, y),
            _ => None,
        };
        Ok(Slot {
            ty,
            names: BTreeSet::new(),
            value,
        })
    }

    fn call(&mut self, op: &Operation, stack: &mut WorkingStack) -> Result<()> {
        let types = self.types;
        let callee = self.peek(op, stack, 0)?;
        let Some((parameters, returns)) = types.signature(callee.ty) else {
            return Err(self.mismatch(op, stack, "function".into(), self.type_name(callee.ty)));
        };

        self.underflow_check(op, stack, parameters.len())?;
        // Last parameter sits right below the callee
        for (offset, &parameter) in parameters.iter().rev().enumerate() {
            let argument = self.peek(op, stack, offset + 1)?;
            if types.basetype(argument.ty) != types.basetype(parameter) {
                return Err(self.mismatch(
                    op,
                    stack,
                    self.type_name(parameter),
                    self.type_name(argument.ty),
                ));
            }
        }

        stack.pop_n(parameters.len() + 1);
        for &ty in returns.iter().rev() {
            self.push(stack, Slot::new(ty));
        }
        Ok(())
    }

    fn cast(
        &mut self,
        op: &Operation,
        stack: &mut WorkingStack,
        slot: &SlotRef,
        ty: TypeId,
    ) -> Result<()> {
        let index = self.resolve(op, stack, slot)?;
        let current = self.peek(op, stack, index)?;

        if self.types.basetype(current.ty) == self.types.basetype(ty) {
            return Err(Error::UnnecessaryCast {
                from: self.type_name(current.ty),
                to: self.type_name(ty),
                location: op.location,
                stack: self.dump(stack),
            });
        }
        if !self.types.is_computable(current.ty) || !self.types.is_computable(ty) {
            return Err(Error::InvalidCast {
                from: self.type_name(current.ty),
                to: self.type_name(ty),
                location: op.location,
                stack: self.dump(stack),
            });
        }

        let id = self.arena.alloc(Slot { ty, ..current });
        stack.replace(index, id);
        Ok(())
    }

    fn name_slot(
        &mut self,
        op: &Operation,
        stack: &mut WorkingStack,
        slot: &SlotRef,
        name: &Name,
    ) -> Result<()> {
        let index = self.resolve(op, stack, slot)?;
        let holders = stack.find_exact(name, &self.arena);

        if holders.contains(&index) {
            if self.warned.insert(op.id) {
                let message = format!(
                    "{}: '{}' already names slot {} in '{}'",
                    op.location, name, index, self.function.name
                );
                tracing::warn!("{}", message);
                self.warnings.push(message);
            }
            return Ok(());
        }
        if !holders.is_empty() {
            return Err(Error::RedefinedName {
                name: name.full(),
                location: op.location,
                stack: self.dump(stack),
            });
        }

        let mut renamed = self.peek(op, stack, index)?;
        renamed.names.insert(name.clone());
        let id = self.arena.alloc(renamed);
        stack.replace(index, id);
        Ok(())
    }

    fn check_return(&self, op: &Operation, stack: &WorkingStack) -> Result<()> {
        let returns = &self.function.returns;
        if let Some(last) = returns.len().checked_sub(1) {
            self.underflow_check(op, stack, last)?;
        }

        let found: Vec<TypeId> = (0..returns.len())
            .filter_map(|index| stack.get(index))
            .map(|id| self.arena.get(id).ty)
            .collect();
        let matches = found
            .iter()
            .zip(returns)
            .all(|(&a, &b)| self.types.basetype(a) == self.types.basetype(b));

        if !matches {
            return Err(self.mismatch(
                op,
                stack,
                self.type_list(returns),
                self.type_list(&found),
            ));
        }
        Ok(())
    }

    fn resolve(&mut self, op: &Operation, stack: &WorkingStack, slot: &SlotRef) -> Result<usize> {
        match slot {
            SlotRef::Index(index) => {
                self.underflow_check(op, stack, *index)?;
                Ok(*index)
            }
            SlotRef::Name(name) => self.resolve_name(op, stack, name),
        }
    }

    /// Own provider first; a short name falls back to any provider
    fn resolve_name(
        &mut self,
        op: &Operation,
        stack: &WorkingStack,
        name: &NameRef,
    ) -> Result<usize> {
        let mut matches = stack.find_named(name, &self.function.provider, &self.arena);
        if matches.is_empty() && name.provider.is_none() {
            matches = stack.find_short(&name.short, &self.arena);
        }

        let index = match matches.as_slice() {
            [] => {
                return Err(Error::UndefinedName {
                    name: name.to_string(),
                    location: op.location,
                    stack: self.dump(stack),
                })
            }
            [index] => *index,
            _ => {
                return Err(Error::AmbiguousName {
                    name: name.to_string(),
                    slots: matches,
                    location: op.location,
                    stack: self.dump(stack),
                })
            }
        };

        match self.resolutions.insert(op.id, index) {
            Some(previous) if previous != index => Err(Error::InconsistentName {
                name: name.to_string(),
                previous,
                current: index,
                location: op.location,
                stack: self.dump(stack),
            }),
            _ => Ok(index),
        }
    }

    fn push(&mut self, stack: &mut WorkingStack, slot: Slot) {
        let id = self.arena.alloc(slot);
        stack.push(id);
    }

    fn push_copy(&mut self, stack: &mut WorkingStack, index: usize) {
        if let Some(source) = stack.get(index) {
            let copy = self.arena.get(source).anonymous_copy();
            self.push(stack, copy);
        }
    }

    fn peek(&self, op: &Operation, stack: &WorkingStack, index: usize) -> Result<Slot> {
        match stack.get(index) {
            Some(id) => Ok(self.arena.get(id).clone()),
            None => Err(self.underflow(op, stack, index + 1)),
        }
    }

    /// Fails unless at least `depth + 1` slots exist
    fn underflow_check(&self, op: &Operation, stack: &WorkingStack, depth: usize) -> Result<()> {
        if stack.has(depth) {
            Ok(())
        } else {
            Err(self.underflow(op, stack, depth + 1))
        }
    }

    fn require_computable(&self, op: &Operation, stack: &WorkingStack, ty: TypeId) -> Result<()> {
        if self.types.is_computable(ty) {
            Ok(())
        } else {
            Err(self.mismatch(op, stack, "int or ptr".into(), self.type_name(ty)))
        }
    }

    fn underflow(&self, op: &Operation, stack: &WorkingStack, required: usize) -> Error {
        Error::StackUnderflow {
            verb: op.kind.verb().to_string(),
            required,
            location: op.location,
            stack: self.dump(stack),
        }
    }

    fn mismatch(
        &self,
        op: &Operation,
        stack: &WorkingStack,
        expected: String,
        found: String,
    ) -> Error {
        Error::StackTypeMismatch {
            verb: op.kind.verb().to_string(),
            expected,
            found,
            location: op.location,
            stack: self.dump(stack),
        }
    }

    fn dump(&self, stack: &WorkingStack) -> String {
        stack.dump(&self.arena, self.types)
    }

    fn type_name(&self, ty: TypeId) -> String {
        TypeName(self.types, ty).to_string()
    }

    fn type_list(&self, types: &[TypeId]) -> String {
        let names: Vec<String> = types.iter().map(|&ty| self.type_name(ty)).collect();
        format!("({})", names.join(", "))
    }
}
