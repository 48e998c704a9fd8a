//! # Block-Level Optimizer
//!
//! Rewrites applied to a verified CFG. None of them changes what the
//! function computes or how deep its stack gets:
//! - Identity elimination (`load 0; add`, `load 1; mul`, ...)
//! - Additive constant folding (`load n; add` becomes `addu n`)
//! - Constant-branch collapse
//! - Redundant zero compare before `branch`
//! - Branch-exit reversal
//! - Block deduplication
//! - Dead block elimination

use super::cfg::{Block, BlockId, Cfg};
use super::ir::{BinaryOp, CompareOp, OpId, OpIds, OpKind, Operation, SlotRef, Terminal};
use std::collections::{HashMap, HashSet};

/// Rewrite counters for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptimizerStats {
    /// `load <identity>; <op>` pairs removed
    pub identities_removed: usize,
    /// `load n; add` pairs turned into `addu n`
    pub additions_folded: usize,
    /// Branches replaced by their comparison result
    pub branches_collapsed: usize,
    /// `load 0; eq|ne` pairs removed before a branch
    pub zero_compares_removed: usize,
    /// Branches whose exits were swapped
    pub branches_reversed: usize,
    /// Duplicate blocks merged
    pub blocks_deduplicated: usize,
    /// Blocks unreachable from the entry removed
    pub dead_blocks_removed: usize,
}

impl OptimizerStats {
    /// Total number of rewrites
    pub fn total(&self) -> usize {
        self.identities_removed
            + self.additions_folded
            + self.branches_collapsed
            + self.zero_compares_removed
            + self.branches_reversed
            + self.blocks_deduplicated
            + self.dead_blocks_removed
    }
}

/// Block optimizer
///
/// Needs the verifier's slot resolutions so that two operations referring
/// to a slot by name are only treated as equal when they hit the same slot.
pub struct BlockOptimizer<'a> {
    resolutions: &'a HashMap<OpId, usize>,
    stats: OptimizerStats,
}

impl<'a> BlockOptimizer<'a> {
    /// Create an optimizer over a verification's slot resolutions
    pub fn new(resolutions: &'a HashMap<OpId, usize>) -> Self {
        Self {
            resolutions,
            stats: OptimizerStats::default(),
        }
    }

    /// Run all passes
    pub fn optimize(mut self, cfg: &mut Cfg) -> OptimizerStats {
        self.remove_unreachable(cfg);

        for id in cfg.reachable() {
            // Collapsing a branch may have dropped a block we were going to visit
            if !cfg.blocks.contains_key(&id) {
                continue;
            }
            self.peephole(cfg, id);
            self.collapse_constant_branch(cfg, id);
            self.drop_zero_compare(cfg, id);
            self.reverse_branch_exits(cfg, id);
        }

        self.deduplicate(cfg);
        self.remove_unreachable(cfg);

        tracing::debug!(
            blocks = cfg.len(),
            rewrites = self.stats.total(),
            "block optimizer finished"
        );
        self.stats
    }

    fn peephole(&mut self, cfg: &mut Cfg, id: BlockId) {
        let Some(block) = cfg.blocks.get_mut(&id) else {
            return;
        };
        let ops = std::mem::take(&mut block.ops);
        let ops = self.remove_identities(ops);
        let ops = self.fold_additions(ops, &mut cfg.ids);
        if let Some(block) = cfg.blocks.get_mut(&id) {
            block.ops = ops;
        }
    }

    fn remove_identities(&mut self, ops: Vec<Operation>) -> Vec<Operation> {
        let mut out: Vec<Operation> = Vec::with_capacity(ops.len());
        for op in ops {
            if let OpKind::Binary(binary) = op.kind {
                let previous = out.last().and_then(|prev| prev.kind.constant());
                if previous.is_some() && previous == binary.identity() {
                    out.pop();
                    self.stats.identities_removed += 1;
                    continue;
                }
            }
            out.push(op);
        }
        out
    }

    fn fold_additions(&mut self, ops: Vec<Operation>, ids: &mut OpIds) -> Vec<Operation> {
        let mut out: Vec<Operation> = Vec::with_capacity(ops.len());
        for op in ops {
            let addend = out.last().and_then(|prev| match prev.kind {
                OpKind::Load(constant) if constant.value >= 0 => Some(constant),
                _ => None,
            });
            match (&op.kind, addend) {
                (OpKind::Binary(BinaryOp::Add), Some(constant)) => {
                    out.pop();
                    let kind = OpKind::AddUnsigned {
                        value: constant.value as u64,
                        ty: constant.ty,
                    };
                    out.push(Operation::synthetic(ids.next_id(), kind, &op));
                    self.stats.additions_folded += 1;
                }
                _ => out.push(op),
            }
        }
        out
    }

    /// `cmp; branch` into two blocks that differ only in a leading
    /// `load 1` / `load 0` becomes `cmp; goto` into one of them
    fn collapse_constant_branch(&mut self, cfg: &mut Cfg, id: BlockId) {
        let Some((compare, taken, fallthrough)) = compare_and_branch(cfg, id) else {
            return;
        };
        if taken == fallthrough || taken == id || fallthrough == id {
            return;
        }
        let (Some(t), Some(f)) = (cfg.blocks.get(&taken), cfg.blocks.get(&fallthrough)) else {
            return;
        };
        if !only_predecessor(t, id) || !only_predecessor(f, id) {
            return;
        }
        if t.successors != f.successors || t.ops.len() != f.ops.len() || t.ops.len() < 2 {
            return;
        }

        let negate = match (t.ops[0].kind.constant(), f.ops[0].kind.constant()) {
            (Some(1), Some(0)) => false,
            (Some(0), Some(1)) => true,
            _ => return,
        };
        if !self.ops_equivalent(&t.ops[1..], &f.ops[1..]) {
            return;
        }

        let Some(block) = cfg.blocks.get_mut(&id) else {
            return;
        };
        let n = block.ops.len();
        if negate {
            let kind = OpKind::Compare(compare.negate());
            block.ops[n - 2] = Operation::synthetic(cfg.ids.next_id(), kind, &block.ops[n - 2]);
        }
        if let OpKind::Branch(label) = &block.ops[n - 1].kind {
            let kind = OpKind::Goto(label.clone());
            block.ops[n - 1] = Operation::synthetic(cfg.ids.next_id(), kind, &block.ops[n - 1]);
        }
        block.successors = vec![taken];

        if let Some(t) = cfg.blocks.get_mut(&taken) {
            t.ops.remove(0);
        }
        cfg.remove_block(fallthrough);
        cfg.recompute_predecessors();
        self.stats.branches_collapsed += 1;
    }

    /// `load 0; ne; branch` is `branch`; with `eq` the exits swap
    fn drop_zero_compare(&mut self, cfg: &mut Cfg, id: BlockId) {
        let Some(block) = cfg.blocks.get_mut(&id) else {
            return;
        };
        let n = block.ops.len();
        if n < 3 || block.terminal() != Terminal::Branch || block.successors.len() != 2 {
            return;
        }
        if block.ops[n - 3].kind.constant() != Some(0) {
            return;
        }
        let swap = match block.ops[n - 2].kind {
            OpKind::Compare(CompareOp::Ne) => false,
            OpKind::Compare(CompareOp::Eq) => true,
            _ => return,
        };

        block.ops.drain(n - 3..n - 1);
        if swap {
            block.successors.swap(0, 1);
        }
        self.stats.zero_compares_removed += 1;
    }

    /// Keep the common path as the fallthrough: if only the not-taken exit
    /// leaves straight away, invert the comparison and swap the exits
    fn reverse_branch_exits(&mut self, cfg: &mut Cfg, id: BlockId) {
        let Some((compare, taken, fallthrough)) = compare_and_branch(cfg, id) else {
            return;
        };
        if taken == fallthrough {
            return;
        }
        let leaves = |target: BlockId| {
            cfg.blocks
                .get(&target)
                .and_then(|block| block.ops.first())
                .is_some_and(|op| matches!(op.terminal(), Terminal::Goto | Terminal::Return))
        };
        if !leaves(fallthrough) || leaves(taken) {
            return;
        }

        let Some(block) = cfg.blocks.get_mut(&id) else {
            return;
        };
        let n = block.ops.len();
        let kind = OpKind::Compare(compare.negate());
        block.ops[n - 2] = Operation::synthetic(cfg.ids.next_id(), kind, &block.ops[n - 2]);
        block.successors.swap(0, 1);
        self.stats.branches_reversed += 1;
    }

    /// Merge blocks with identical operations and exits until none are left
    fn deduplicate(&mut self, cfg: &mut Cfg) {
        loop {
            let blocks: Vec<&Block> = cfg.blocks.values().collect();
            let mut duplicate = None;

            'search: for (i, a) in blocks.iter().enumerate() {
                for b in &blocks[i + 1..] {
                    if a.successors == b.successors && self.ops_equivalent(&a.ops, &b.ops) {
                        duplicate = Some((a.id, b.id));
                        break 'search;
                    }
                }
            }

            let Some((keep, drop)) = duplicate else {
                break;
            };
            tracing::trace!(%keep, %drop, "merging duplicate blocks");
            cfg.redirect(drop, keep);
            cfg.remove_block(drop);
            self.stats.blocks_deduplicated += 1;
        }
        cfg.recompute_predecessors();
    }

    fn remove_unreachable(&mut self, cfg: &mut Cfg) {
        let reachable: HashSet<BlockId> = cfg.reachable().into_iter().collect();
        let dead: Vec<BlockId> = cfg
            .blocks
            .keys()
            .filter(|id| !reachable.contains(id))
            .copied()
            .collect();

        for id in dead {
            cfg.remove_block(id);
            self.stats.dead_blocks_removed += 1;
        }
        cfg.recompute_predecessors();
    }

    fn ops_equivalent(&self, a: &[Operation], b: &[Operation]) -> bool {
        a.len() == b.len()
            && a.iter().zip(b).all(|(x, y)| {
                x.equivalent(y)
                    && (!by_name(x)
                        || self.resolutions.get(&x.id) == self.resolutions.get(&y.id))
            })
    }
}

/// Comparison feeding the block's closing `branch`, with both exits
fn compare_and_branch(cfg: &Cfg, id: BlockId) -> Option<(CompareOp, BlockId, BlockId)> {
    let block = cfg.blocks.get(&id)?;
    if block.terminal() != Terminal::Branch {
        return None;
    }
    let n = block.ops.len();
    let OpKind::Compare(compare) = block.ops.get(n.checked_sub(2)?)?.kind else {
        return None;
    };
    let &[taken, fallthrough] = block.successors.as_slice() else {
        return None;
    };
    Some((compare, taken, fallthrough))
}

fn only_predecessor(block: &Block, id: BlockId) -> bool {
    block.predecessors.len() == 1 && block.predecessors.contains(&id)
}

fn by_name(op: &Operation) -> bool {
    matches!(op.kind, OpKind::LoadName(_)) || matches!(op.kind.slot_ref(), Some(SlotRef::Name(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ir::{Constant, Function, Label, NameRef, StackOp};
    use crate::compiler::types::TypeTable;

    fn load(value: i64) -> OpKind {
        OpKind::Load(Constant::int(value))
    }

    fn optimize(function: &Function) -> (Cfg, OptimizerStats) {
        let mut cfg = Cfg::build(function).unwrap();
        let resolutions = HashMap::new();
        let stats = BlockOptimizer::new(&resolutions).optimize(&mut cfg);
        (cfg, stats)
    }

    fn kinds(block: &Block) -> Vec<OpKind> {
        block.ops.iter().map(|op| op.kind.clone()).collect()
    }

    #[test]
    fn test_identity_elimination() {
        let mut f = Function::new("f", "m");
        f.add_parameter("x", TypeTable::INT);
        f.op(load(0));
        f.op(OpKind::Binary(BinaryOp::Add));
        f.op(load(1));
        f.op(OpKind::Binary(BinaryOp::Mul));
        f.op(load(0));
        f.op(OpKind::Binary(BinaryOp::And));
        f.op(OpKind::Return);

        let (cfg, stats) = optimize(&f);
        assert_eq!(stats.identities_removed, 2);
        let entry = cfg.block(cfg.entry).unwrap();
        // and with 0 is not an identity
        assert_eq!(
            kinds(entry),
            vec![load(0), OpKind::Binary(BinaryOp::And), OpKind::Return]
        );
    }

    #[test]
    fn test_nested_identities() {
        let mut f = Function::new("f", "m");
        f.op(load(5));
        f.op(load(0));
        f.op(load(0));
        f.op(OpKind::Binary(BinaryOp::Or));
        f.op(OpKind::Binary(BinaryOp::Add));
        f.op(OpKind::Return);

        let (cfg, stats) = optimize(&f);
        // `load 0; or` goes first, exposing `load 0; add`
        assert_eq!(stats.identities_removed, 2);
        let entry = cfg.block(cfg.entry).unwrap();
        assert_eq!(kinds(entry), vec![load(5), OpKind::Return]);
    }

    #[test]
    fn test_addition_folding() {
        let mut f = Function::new("f", "m");
        f.op(load(5));
        f.op(load(3));
        f.op(OpKind::Binary(BinaryOp::Add));
        f.op(load(-3));
        f.op(OpKind::Binary(BinaryOp::Add));
        f.op(OpKind::Return);

        let (cfg, stats) = optimize(&f);
        assert_eq!(stats.additions_folded, 1);
        let entry = cfg.block(cfg.entry).unwrap();
        assert!(matches!(entry.ops[1].kind, OpKind::AddUnsigned { value: 3, .. }));
        assert!(entry.ops[1].is_synthetic());
        assert_eq!(entry.ops[2].kind, load(-3));
    }

    fn constant_branch(first: i64, second: i64) -> Function {
        let mut f = Function::new("f", "m");
        f.add_parameter("x", TypeTable::INT);
        f.op(OpKind::Stack(StackOp::Dup));
        f.op(load(3));
        f.op(OpKind::Compare(CompareOp::Lt));
        f.op(OpKind::Branch(Label::User("small".into())));
        f.op(load(first));
        f.op(OpKind::Return);
        f.label("small");
        f.op(load(second));
        f.op(OpKind::Return);
        f
    }

    #[test]
    fn test_constant_branch_collapse() {
        // taken path pushes 1, so the comparison result is used as is
        let (cfg, stats) = optimize(&constant_branch(0, 1));
        assert_eq!(stats.branches_collapsed, 1);
        assert_eq!(cfg.len(), 2);

        let entry = cfg.block(cfg.entry).unwrap();
        assert_eq!(entry.terminal(), Terminal::Goto);
        assert_eq!(entry.ops[2].kind, OpKind::Compare(CompareOp::Lt));
        let rest = cfg.block(entry.successors[0]).unwrap();
        assert_eq!(kinds(rest), vec![OpKind::Return]);
    }

    #[test]
    fn test_constant_branch_collapse_negates() {
        let (cfg, stats) = optimize(&constant_branch(1, 0));
        assert_eq!(stats.branches_collapsed, 1);
        let entry = cfg.block(cfg.entry).unwrap();
        assert_eq!(entry.ops[2].kind, OpKind::Compare(CompareOp::Ge));
        assert!(entry.ops[2].is_synthetic());
    }

    #[test]
    fn test_different_constants_do_not_collapse() {
        let (cfg, stats) = optimize(&constant_branch(2, 1));
        assert_eq!(stats.branches_collapsed, 0);
        assert_eq!(cfg.block(cfg.entry).unwrap().terminal(), Terminal::Branch);
    }

    #[test]
    fn test_zero_compare_dropped() {
        let mut f = Function::new("f", "m");
        f.add_parameter("x", TypeTable::INT);
        f.op(OpKind::Stack(StackOp::Dup));
        f.op(load(0));
        f.op(OpKind::Compare(CompareOp::Eq));
        f.op(OpKind::Branch(Label::User("zero".into())));
        f.op(load(7));
        f.op(OpKind::Binary(BinaryOp::Mul));
        f.op(OpKind::Return);
        f.label("zero");
        f.op(OpKind::Return);

        let mut cfg = Cfg::build(&f).unwrap();
        let before = cfg.block(cfg.entry).unwrap().successors.clone();
        let resolutions = HashMap::new();
        let stats = BlockOptimizer::new(&resolutions).optimize(&mut cfg);

        assert_eq!(stats.zero_compares_removed, 1);
        let entry = cfg.block(cfg.entry).unwrap();
        assert_eq!(entry.ops.len(), 2);
        assert_eq!(entry.successors, vec![before[1], before[0]]);
    }

    #[test]
    fn test_branch_exit_reversal() {
        let mut f = Function::new("f", "m");
        f.add_parameter("x", TypeTable::INT);
        f.op(OpKind::Stack(StackOp::Dup));
        f.op(load(10));
        f.op(OpKind::Compare(CompareOp::Gt));
        f.op(OpKind::Branch(Label::User("big".into())));
        f.op(OpKind::Return);
        f.label("big");
        f.op(load(2));
        f.op(OpKind::Binary(BinaryOp::Div));
        f.op(OpKind::Return);

        let mut cfg = Cfg::build(&f).unwrap();
        let before = cfg.block(cfg.entry).unwrap().successors.clone();
        let resolutions = HashMap::new();
        let stats = BlockOptimizer::new(&resolutions).optimize(&mut cfg);

        assert_eq!(stats.branches_reversed, 1);
        let entry = cfg.block(cfg.entry).unwrap();
        assert_eq!(entry.ops[2].kind, OpKind::Compare(CompareOp::Le));
        assert_eq!(entry.successors, vec![before[1], before[0]]);
    }

    #[test]
    fn test_duplicate_blocks_merge() {
        let mut f = Function::new("f", "m");
        f.add_parameter("x", TypeTable::INT);
        f.op(OpKind::Stack(StackOp::Dup));
        f.op(OpKind::Branch(Label::User("other".into())));
        f.op(load(4));
        f.op(OpKind::Binary(BinaryOp::Shl));
        f.op(OpKind::Return);
        f.label("other");
        f.op(load(4));
        f.op(OpKind::Binary(BinaryOp::Shl));
        f.op(OpKind::Return);

        let (cfg, stats) = optimize(&f);
        assert_eq!(stats.blocks_deduplicated, 1);
        assert_eq!(cfg.len(), 2);
        let entry = cfg.block(cfg.entry).unwrap();
        assert_eq!(entry.successors[0], entry.successors[1]);
    }

    #[test]
    fn test_by_name_references_need_same_resolution() {
        let mut f = Function::new("f", "m");
        f.add_parameter("x", TypeTable::INT);
        f.op(load(1));
        f.op(OpKind::Branch(Label::User("other".into())));
        let a = f.op(OpKind::LoadName(NameRef::short("x")));
        f.op(OpKind::Return);
        f.label("other");
        let b = f.op(OpKind::LoadName(NameRef::short("x")));
        f.op(OpKind::Return);

        let mut cfg = Cfg::build(&f).unwrap();
        let mut resolutions = HashMap::new();
        resolutions.insert(a, 0);
        resolutions.insert(b, 1);
        let stats = BlockOptimizer::new(&resolutions).optimize(&mut cfg);
        assert_eq!(stats.blocks_deduplicated, 0);

        let mut cfg = Cfg::build(&f).unwrap();
        resolutions.insert(b, 0);
        let stats = BlockOptimizer::new(&resolutions).optimize(&mut cfg);
        assert_eq!(stats.blocks_deduplicated, 1);
    }

    #[test]
    fn test_dead_blocks_removed() {
        let mut f = Function::new("f", "m");
        f.op(OpKind::Goto(Label::User("end".into())));
        f.op(load(1));
        f.op(OpKind::Stack(StackOp::Drop));
        f.label("end");
        f.op(OpKind::Return);

        let (cfg, stats) = optimize(&f);
        assert_eq!(stats.dead_blocks_removed, 1);
        assert_eq!(cfg.len(), 2);
    }
}
