//! # Operation Stream
//!
//! Linear form of a function. The CFG is flattened by a depth-first walk
//! from the entry block; jumps are kept as an explicit source → target map
//! (plus the reverse label map) so later passes can retarget or delete them
//! without recomputing offsets. Byte offsets are the emitter's business.
//!
//! Every `return` is turned into a jump to one shared end marker, the only
//! real `return` left in the stream.

use super::cfg::{BlockId, Cfg};
use super::ir::{Label, OpId, OpIds, OpKind, Operation, Terminal};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Flat, ordered operations with resolved jumps
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationStream {
    /// Operations in emission order
    pub ops: Vec<Operation>,
    /// Jump source → jump target, for every `branch` and `goto`
    pub jumps: HashMap<OpId, OpId>,
    /// Jump target → sources jumping to it, in emission order
    pub labels: HashMap<OpId, Vec<OpId>>,
}

impl OperationStream {
    /// Number of operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the stream is empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Render as pretty JSON for the emitter
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read a stream written by [`OperationStream::to_json`]
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Position of an operation
    pub fn position(&self, id: OpId) -> Option<usize> {
        self.ops.iter().position(|op| op.id == id)
    }

    /// Target of a jump
    pub fn target(&self, source: OpId) -> Option<OpId> {
        self.jumps.get(&source).copied()
    }

    /// Whether some jump lands on this operation
    pub fn is_labeled(&self, id: OpId) -> bool {
        self.labels.get(&id).is_some_and(|sources| !sources.is_empty())
    }

    /// Record a jump
    pub fn link(&mut self, source: OpId, target: OpId) {
        self.jumps.insert(source, target);
        self.labels.entry(target).or_default().push(source);
    }

    /// Point an existing jump at a new target
    pub fn retarget(&mut self, source: OpId, target: OpId) {
        self.unlink(source);
        self.link(source, target);
    }

    /// Remove the operation at `index`, forgetting its outgoing jump
    ///
    /// Callers only remove operations nothing jumps to.
    pub fn remove(&mut self, index: usize) -> Operation {
        let op = self.ops.remove(index);
        self.unlink(op.id);
        op
    }

    fn unlink(&mut self, source: OpId) {
        let Some(old) = self.jumps.remove(&source) else {
            return;
        };
        if let Some(sources) = self.labels.get_mut(&old) {
            sources.retain(|&s| s != source);
            if sources.is_empty() {
                self.labels.remove(&old);
            }
        }
    }
}

/// Flatten a CFG
///
/// Blocks are emitted in depth-first preorder. A `branch` is followed by a
/// synthetic `goto` to its not-taken block, then the taken block; a block
/// already emitted is only jumped to.
pub fn serialize(cfg: &Cfg) -> OperationStream {
    let mut ids: OpIds = cfg.ids;
    let mut stream = OperationStream::default();
    let mut starts: HashMap<BlockId, OpId> = HashMap::new();
    let mut pending: Vec<(OpId, BlockId)> = Vec::new();
    let mut returns: Vec<OpId> = Vec::new();
    let mut end: Option<Operation> = None;

    let mut visited: HashSet<BlockId> = HashSet::new();
    let mut worklist = vec![cfg.entry];

    while let Some(id) = worklist.pop() {
        if !visited.insert(id) {
            continue;
        }
        let Some(block) = cfg.block(id) else {
            continue;
        };

        let first = stream.ops.len();
        let Some((terminator, body)) = block.ops.split_last() else {
            continue;
        };
        stream.ops.extend(body.iter().cloned());

        match (terminator.terminal(), block.successors.as_slice()) {
            (Terminal::Branch, &[taken, fallthrough]) => {
                pending.push((terminator.id, taken));
                stream.ops.push(terminator.clone());

                let goto = Operation::synthetic(
                    ids.next_id(),
                    OpKind::Goto(fallthrough_label(cfg, fallthrough)),
                    terminator,
                );
                pending.push((goto.id, fallthrough));
                stream.ops.push(goto);

                worklist.push(fallthrough);
                worklist.push(taken);
            }
            (Terminal::Goto, &[target]) => {
                pending.push((terminator.id, target));
                stream.ops.push(terminator.clone());
                worklist.push(target);
            }
            _ => {
                if end.is_none() {
                    end = Some(Operation::synthetic(ids.next_id(), OpKind::Return, terminator));
                }
                let goto = Operation::synthetic(ids.next_id(), OpKind::Goto(Label::End), terminator);
                returns.push(goto.id);
                stream.ops.push(goto);
            }
        }

        if let Some(op) = stream.ops.get(first) {
            starts.insert(id, op.id);
        }
    }

    for (source, block) in pending {
        if let Some(&target) = starts.get(&block) {
            stream.link(source, target);
        }
    }
    if let Some(end) = end {
        for source in returns {
            stream.link(source, end.id);
        }
        stream.ops.push(end);
    }

    stream
}

/// Some label naming `block`, for display only; the jump map is
/// authoritative
fn fallthrough_label(cfg: &Cfg, block: BlockId) -> Label {
    cfg.labels
        .iter()
        .filter(|(_, &target)| target == block)
        .map(|(label, _)| label.clone())
        .min()
        .unwrap_or(Label::End)
}
