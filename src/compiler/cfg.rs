//! # Control Flow Graph Construction
//!
//! Splits a function's flat operation list into basic blocks. A block opens
//! at every label marker and after every terminal operation. Blocks that do
//! not end in a terminal get a synthetic `goto` to the next block (or a
//! synthetic `return` at the end of the function), and every `branch` gets a
//! synthetic fallthrough label for its not-taken exit.
//!
//! Blocks live in an arena keyed by [`BlockId`]; successor lists hold ids, so
//! the graph has no ownership cycles.

use crate::compiler::ir::{Function, Label, Location, OpIds, OpKind, Operation, Terminal};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

/// Index of a block in its function's [`Cfg`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// A basic block
///
/// Invariant: `ops` is non-empty, its last operation is terminal and every
/// earlier one is not. `successors` holds two ids for `branch` (branched,
/// not-branched), one for `goto` and none for `return`.
#[derive(Debug, Clone)]
pub struct Block {
    /// Block id
    pub id: BlockId,
    /// Operations, terminal last
    pub ops: Vec<Operation>,
    /// Resolved exits
    pub successors: Vec<BlockId>,
    /// Blocks with an edge into this one
    pub predecessors: BTreeSet<BlockId>,
}

impl Block {
    /// Terminal operation
    pub fn terminator(&self) -> Option<&Operation> {
        self.ops.last()
    }

    /// Terminal class of the last operation
    pub fn terminal(&self) -> Terminal {
        self.ops
            .last()
            .map(|op| op.terminal())
            .unwrap_or(Terminal::None)
    }

    /// Location used when the block itself must be blamed
    pub fn location(&self) -> Location {
        self.ops.first().map(|op| op.location).unwrap_or_default()
    }
}

/// Control flow graph of one function
#[derive(Debug, Clone)]
pub struct Cfg {
    /// Blocks by id
    pub blocks: BTreeMap<BlockId, Block>,
    /// Entry block
    pub entry: BlockId,
    /// Resolved label table (user and synthetic labels)
    pub labels: HashMap<Label, BlockId>,
    /// Non-fatal diagnostics found while building
    pub warnings: Vec<String>,
    /// Allocator for synthetic operations
    pub ids: OpIds,
}

/// Block under construction
#[derive(Debug, Default)]
struct Draft {
    ops: Vec<Operation>,
    exits: Vec<Label>,
}

impl Draft {
    fn only_markers(&self) -> bool {
        self.ops
            .iter()
            .all(|op| matches!(op.kind, OpKind::Label(_)))
    }
}

impl Cfg {
    /// Build the CFG of a function
    pub fn build(function: &Function) -> Result<Self> {
        let mut ids = function.op_ids();
        let mut drafts: Vec<Draft> = Vec::new();
        let mut labels: HashMap<Label, usize> = HashMap::new();
        let mut open = false;

        // Step 1: split into blocks
        for op in &function.operations {
            match &op.kind {
                OpKind::Label(name) => {
                    if !function.labels.contains(name) {
                        return Err(Error::UndefinedLabel {
                            label: name.clone(),
                            location: op.location,
                        });
                    }
                    let label = Label::User(name.clone());
                    if labels.contains_key(&label) {
                        return Err(Error::RedefinedLabel {
                            label: name.clone(),
                            location: op.location,
                        });
                    }

                    // Consecutive markers share a block
                    let reuse = open && drafts.last().is_some_and(Draft::only_markers);
                    if !reuse {
                        drafts.push(Draft::default());
                        open = true;
                    }
                    let index = drafts.len() - 1;
                    labels.insert(label, index);
                    drafts[index].ops.push(op.clone());
                }
                kind => {
                    if !open {
                        drafts.push(Draft::default());
                        open = true;
                    }
                    let index = drafts.len() - 1;
                    drafts[index].ops.push(op.clone());
                    if kind.is_terminal() {
                        open = false;
                    }
                }
            }
        }

        if drafts.is_empty() {
            drafts.push(Draft {
                ops: vec![Operation::synthetic_at(
                    ids.next_id(),
                    OpKind::Return,
                    function.location,
                )],
                exits: Vec::new(),
            });
        }

        // Step 2: close every block and name its exits
        let mut synthetic_labels = 0u32;
        let mut mint = |labels: &mut HashMap<Label, usize>, target: usize| {
            let label = Label::Synthetic(synthetic_labels);
            synthetic_labels += 1;
            labels.insert(label.clone(), target);
            label
        };

        let mut index = 0;
        while index < drafts.len() {
            let last = drafts[index].ops.last().cloned();
            let terminal = last
                .as_ref()
                .map(|op| op.terminal())
                .unwrap_or(Terminal::None);
            let synthetic = |ids: &mut OpIds, kind: OpKind| match &last {
                Some(op) => Operation::synthetic(ids.next_id(), kind, op),
                None => Operation::synthetic_at(ids.next_id(), kind, function.location),
            };

            match (terminal, last.as_ref().map(|op| &op.kind)) {
                (Terminal::Goto, Some(OpKind::Goto(target))) => {
                    drafts[index].exits = vec![target.clone()];
                }
                (Terminal::Branch, Some(OpKind::Branch(target))) => {
                    if index + 1 == drafts.len() {
                        let ret = synthetic(&mut ids, OpKind::Return);
                        drafts.push(Draft {
                            ops: vec![ret],
                            exits: Vec::new(),
                        });
                    }
                    let fallthrough = mint(&mut labels, index + 1);
                    drafts[index].exits = vec![target.clone(), fallthrough];
                }
                (Terminal::Return, _) => {}
                _ if index + 1 < drafts.len() => {
                    let label = mint(&mut labels, index + 1);
                    let goto = synthetic(&mut ids, OpKind::Goto(label.clone()));
                    drafts[index].ops.push(goto);
                    drafts[index].exits = vec![label];
                }
                _ => {
                    let ret = synthetic(&mut ids, OpKind::Return);
                    drafts[index].ops.push(ret);
                }
            }
            index += 1;
        }

        // Step 3: resolve exits and strip leading markers
        let mut blocks = BTreeMap::new();
        for (index, draft) in drafts.into_iter().enumerate() {
            let id = BlockId(index as u32);
            let location = draft
                .ops
                .last()
                .map(|op| op.location)
                .unwrap_or(function.location);

            let successors = draft
                .exits
                .iter()
                .map(|label| {
                    labels
                        .get(label)
                        .map(|&target| BlockId(target as u32))
                        .ok_or_else(|| Error::UndefinedLabel {
                            label: label.to_string(),
                            location,
                        })
                })
                .collect::<Result<Vec<_>>>()?;

            let ops = draft
                .ops
                .into_iter()
                .skip_while(|op| matches!(op.kind, OpKind::Label(_)))
                .collect();

            blocks.insert(
                id,
                Block {
                    id,
                    ops,
                    successors,
                    predecessors: BTreeSet::new(),
                },
            );
        }

        let mut cfg = Cfg {
            blocks,
            entry: BlockId(0),
            labels: labels
                .into_iter()
                .map(|(label, index)| (label, BlockId(index as u32)))
                .collect(),
            warnings: Vec::new(),
            ids,
        };
        cfg.recompute_predecessors();

        // Step 4: report blocks nothing jumps to
        for block in cfg.blocks.values() {
            if block.id != cfg.entry && block.predecessors.is_empty() {
                let message = format!(
                    "{}: unreachable code in '{}' ({})",
                    block.location(),
                    function.name,
                    block.id
                );
                tracing::warn!("{}", message);
                cfg.warnings.push(message);
            }
        }

        Ok(cfg)
    }

    /// Get block by ID
    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(&id)
    }

    /// Number of blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the graph has no blocks (never true for a built graph)
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Rebuild every predecessor set from the successor lists
    pub fn recompute_predecessors(&mut self) {
        let edges: Vec<(BlockId, BlockId)> = self
            .blocks
            .values()
            .flat_map(|block| block.successors.iter().map(move |&succ| (block.id, succ)))
            .collect();

        for block in self.blocks.values_mut() {
            block.predecessors.clear();
        }
        for (from, to) in edges {
            if let Some(block) = self.blocks.get_mut(&to) {
                block.predecessors.insert(from);
            }
        }
    }

    /// Remove a block and every label naming it
    ///
    /// Edges into the block are left alone; callers redirect them first.
    pub fn remove_block(&mut self, id: BlockId) -> Option<Block> {
        self.labels.retain(|_, target| *target != id);
        self.blocks.remove(&id)
    }

    /// Point every edge, label and the entry at `from` to `to` instead
    pub fn redirect(&mut self, from: BlockId, to: BlockId) {
        for block in self.blocks.values_mut() {
            for succ in block.successors.iter_mut() {
                if *succ == from {
                    *succ = to;
                }
            }
        }
        for target in self.labels.values_mut() {
            if *target == from {
                *target = to;
            }
        }
        if self.entry == from {
            self.entry = to;
        }
    }

    /// Blocks reachable from the entry in depth-first preorder, branched
    /// exits first
    pub fn reachable(&self) -> Vec<BlockId> {
        let mut visited: HashSet<BlockId> = HashSet::new();
        let mut order = Vec::new();
        let mut stack = vec![self.entry];

        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(block) = self.blocks.get(&id) else {
                continue;
            };
            order.push(id);
            for &succ in block.successors.iter().rev() {
                if !visited.contains(&succ) {
                    stack.push(succ);
                }
            }
        }

        order
    }

    /// Total number of operations over all blocks
    pub fn instruction_count(&self) -> usize {
        self.blocks.values().map(|block| block.ops.len()).sum()
    }
}
