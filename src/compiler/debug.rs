//! Debug utilities for the i8c middle end
//!
//! Textual listings of CFGs and operation streams.

use super::cfg::Cfg;
use super::ir::{OpId, OpKind, Operation};
use super::stream::OperationStream;
use super::types::TypeTable;
use std::collections::HashMap;
use std::fmt::Write;

const RULE: &str = "───────────────────────────────────────────────────────────";

/// Render a CFG block by block
pub fn dump_cfg(cfg: &Cfg, types: &TypeTable) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "entry: {}", cfg.entry);
    let _ = writeln!(out, "{}", RULE);

    for block in cfg.blocks.values() {
        let preds: Vec<String> = block.predecessors.iter().map(|p| p.to_string()).collect();
        let succs: Vec<String> = block.successors.iter().map(|s| s.to_string()).collect();
        let _ = writeln!(
            out,
            "{}:  ; preds [{}] succs [{}]",
            block.id,
            preds.join(", "),
            succs.join(", ")
        );
        for op in &block.ops {
            let _ = writeln!(out, "    {}", format_op(op, types));
        }
    }
    out
}

/// Render a stream with `L<n>:` markers in front of jump targets
pub fn dump_stream(stream: &OperationStream, types: &TypeTable) -> String {
    let mut names: HashMap<OpId, usize> = HashMap::new();
    for op in &stream.ops {
        if stream.is_labeled(op.id) {
            let next = names.len();
            names.insert(op.id, next);
        }
    }

    let mut out = String::new();
    for (index, op) in stream.ops.iter().enumerate() {
        if let Some(label) = names.get(&op.id) {
            let _ = writeln!(out, "L{}:", label);
        }
        let text = match (&op.kind, stream.target(op.id).and_then(|t| names.get(&t))) {
            (OpKind::Branch(_), Some(label)) => format!("branch L{}", label),
            (OpKind::Goto(_), Some(label)) => format!("goto L{}", label),
            _ => format_op(op, types),
        };
        let _ = writeln!(out, "{:04}: {}", index, text);
    }
    out
}

/// Format one operation, marking synthetic ones
pub fn format_op(op: &Operation, types: &TypeTable) -> String {
    let text = op.kind.display(types).to_string();
    if op.is_synthetic() {
        format!("{:<24} ; synthetic", text)
    } else {
        format!("{:<24} ; {}", text, op.location)
    }
}
