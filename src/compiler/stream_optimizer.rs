//! # Stream Optimizer
//!
//! Dead-jump and dead-code removal on a serialized function. Three rewrites
//! run in priority order; after any of them changes the stream the loop
//! starts again from the first, until none applies:
//!
//! 1. Multi-jump collapse: a jump landing on a `goto` is pointed at the end
//!    of the chain
//! 2. Jump-to-next: an unlabeled `goto` to the following operation goes
//! 3. Unreachable code: an unlabeled operation after a `goto` or `return`
//!    goes

use super::ir::{OpId, Terminal};
use super::stream::OperationStream;
use std::collections::HashSet;

/// Rewrite counters for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Jumps pointed past an intermediate `goto`
    pub jumps_collapsed: usize,
    /// `goto`s to the next operation removed
    pub jumps_removed: usize,
    /// Unreachable operations removed
    pub unreachable_removed: usize,
    /// Rounds of the fixpoint loop
    pub rounds: usize,
}

/// Stream optimizer
#[derive(Debug, Default)]
pub struct StreamOptimizer {
    stats: StreamStats,
}

impl StreamOptimizer {
    /// Creates a stream optimizer
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite to a fixpoint
    pub fn optimize(mut self, stream: &mut OperationStream) -> StreamStats {
        loop {
            self.stats.rounds += 1;
            if self.collapse_jump_chains(stream) {
                continue;
            }
            if self.remove_jumps_to_next(stream) {
                continue;
            }
            if self.remove_unreachable(stream) {
                continue;
            }
            break;
        }

        tracing::debug!(
            ops = stream.len(),
            collapsed = self.stats.jumps_collapsed,
            removed = self.stats.jumps_removed + self.stats.unreachable_removed,
            "stream optimizer finished"
        );
        self.stats
    }

    fn collapse_jump_chains(&mut self, stream: &mut OperationStream) -> bool {
        let sources: Vec<OpId> = stream
            .ops
            .iter()
            .filter(|op| stream.jumps.contains_key(&op.id))
            .map(|op| op.id)
            .collect();

        let mut changed = false;
        for source in sources {
            let Some(target) = stream.target(source) else {
                continue;
            };
            if let Some(end) = chain_end(stream, target) {
                if end != target {
                    stream.retarget(source, end);
                    self.stats.jumps_collapsed += 1;
                    changed = true;
                }
            }
        }
        changed
    }

    fn remove_jumps_to_next(&mut self, stream: &mut OperationStream) -> bool {
        let mut changed = false;
        let mut index = 0;
        while index + 1 < stream.ops.len() {
            let op = &stream.ops[index];
            let next = stream.ops[index + 1].id;
            if op.terminal() == Terminal::Goto
                && !stream.is_labeled(op.id)
                && stream.target(op.id) == Some(next)
            {
                stream.remove(index);
                self.stats.jumps_removed += 1;
                changed = true;
            } else {
                index += 1;
            }
        }
        changed
    }

    fn remove_unreachable(&mut self, stream: &mut OperationStream) -> bool {
        let mut changed = false;
        let mut index = 1;
        while index < stream.ops.len() {
            let previous = stream.ops[index - 1].terminal();
            let unconditional = matches!(previous, Terminal::Goto | Terminal::Return);
            if unconditional && !stream.is_labeled(stream.ops[index].id) {
                stream.remove(index);
                self.stats.unreachable_removed += 1;
                changed = true;
            } else {
                index += 1;
            }
        }
        changed
    }
}

/// Follow `goto`s from `target` to the first operation that is not one.
/// `None` when the chain loops.
fn chain_end(stream: &OperationStream, target: OpId) -> Option<OpId> {
    let mut seen: HashSet<OpId> = HashSet::new();
    let mut current = target;
    loop {
        if !seen.insert(current) {
            return None;
        }
        let position = stream.position(current)?;
        if stream.ops[position].terminal() != Terminal::Goto {
            return Some(current);
        }
        match stream.target(current) {
            Some(next) => current = next,
            None => return Some(current),
        }
    }
}
