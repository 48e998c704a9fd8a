//! # Abstract Operand Stack
//!
//! Compile-time approximation of the runtime stack. Each slot records a
//! type, the names it is known by and, when known, its integer value.
//!
//! Slots live in a [`SlotArena`] and are never edited after allocation: a
//! cast or a new name allocates a fresh slot and swaps the id into the
//! stack. Two stacks holding the same ids are therefore identical, which is
//! what lets the verifier's merge detect its fixpoint cheaply.
//!
//! Stacks come in two flavours. A [`WorkingStack`] is owned by the block
//! walk that builds it; a [`FrozenStack`] is a published snapshot with no
//! mutating methods. Index 0 is always the top of the stack.

use crate::compiler::ir::{Name, NameRef};
use crate::compiler::types::{TypeId, TypeName, TypeTable};
use std::collections::BTreeSet;
use std::fmt::Write;

/// Index of a slot record in the [`SlotArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u32);

/// Contents of one stack slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    /// Static type
    pub ty: TypeId,
    /// Names the slot is known by
    pub names: BTreeSet<Name>,
    /// Known integer value
    pub value: Option<i64>,
}

impl Slot {
    /// Anonymous slot of unknown value
    pub fn new(ty: TypeId) -> Self {
        Self {
            ty,
            names: BTreeSet::new(),
            value: None,
        }
    }

    /// Anonymous slot holding a known value
    pub fn constant(ty: TypeId, value: i64) -> Self {
        Self {
            ty,
            names: BTreeSet::new(),
            value: Some(value),
        }
    }

    /// Slot known by a single name
    pub fn named(ty: TypeId, name: Name) -> Self {
        let mut slot = Self::new(ty);
        slot.names.insert(name);
        slot
    }

    /// Same type and value, no names
    pub fn anonymous_copy(&self) -> Self {
        Self {
            ty: self.ty,
            names: BTreeSet::new(),
            value: self.value,
        }
    }
}

/// Append-only storage for slot records
#[derive(Debug, Default)]
pub struct SlotArena {
    slots: Vec<Slot>,
}

impl SlotArena {
    /// Creates an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a slot record
    pub fn alloc(&mut self, slot: Slot) -> SlotId {
        let id = SlotId(self.slots.len() as u32);
        self.slots.push(slot);
        id
    }

    /// Read a slot record
    pub fn get(&self, id: SlotId) -> &Slot {
        &self.slots[id.0 as usize]
    }

    /// Number of records allocated so far
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether nothing was allocated yet
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Why two stacks could not be merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeError {
    /// The stacks have different depths
    Depth,
    /// The slot at this index (0 = top) has no common type
    Slot(usize),
}

/// Immutable stack snapshot handed to successor blocks
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FrozenStack {
    // bottom first
    slots: Vec<SlotId>,
}

impl FrozenStack {
    /// Snapshot from slots listed bottom first
    pub fn from_bottom(slots: Vec<SlotId>) -> Self {
        Self { slots }
    }

    /// Number of slots
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Slot id at `index` (0 = top)
    pub fn get(&self, index: usize) -> Option<SlotId> {
        top_down(&self.slots, index)
    }

    /// Start a mutable copy
    pub fn thaw(&self) -> WorkingStack {
        WorkingStack {
            slots: self.slots.clone(),
        }
    }

    /// Render for diagnostics
    pub fn dump(&self, arena: &SlotArena, types: &TypeTable) -> String {
        dump_slots(&self.slots, arena, types)
    }

    /// Merge `incoming` into `self` (the stored stack)
    ///
    /// Returns a clone of `self` when no slot changes, so the caller can
    /// detect the fixpoint by comparing the result with the stored stack.
    pub fn merge(
        &self,
        incoming: &FrozenStack,
        arena: &mut SlotArena,
        types: &TypeTable,
    ) -> Result<FrozenStack, MergeError> {
        if self.depth() != incoming.depth() {
            return Err(MergeError::Depth);
        }

        let depth = self.depth();
        let mut changed = false;
        let mut merged = Vec::with_capacity(depth);

        for (position, (&stored, &arriving)) in self.slots.iter().zip(&incoming.slots).enumerate()
        {
            if stored == arriving {
                merged.push(stored);
                continue;
            }

            let a = arena.get(stored);
            let b = arena.get(arriving);
            let index = depth - 1 - position;
            let ty = types
                .lowest_common_ancestor(a.ty, b.ty)
                .ok_or(MergeError::Slot(index))?;
            let value = if a.value == b.value { a.value } else { None };
            let names = a.names.intersection(&b.names).cloned().collect();

            let slot = Slot { ty, names, value };
            if slot == *a {
                merged.push(stored);
            } else {
                changed = true;
                merged.push(arena.alloc(slot));
            }
        }

        if changed {
            Ok(FrozenStack { slots: merged })
        } else {
            Ok(self.clone())
        }
    }
}

/// Mutable stack built while walking one block
#[derive(Debug, Clone, Default)]
pub struct WorkingStack {
    // bottom first
    slots: Vec<SlotId>,
}

impl WorkingStack {
    /// Empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    /// Whether at least `depth + 1` slots exist
    pub fn has(&self, depth: usize) -> bool {
        self.slots.len() > depth
    }

    /// Slot id at `index` (0 = top)
    pub fn get(&self, index: usize) -> Option<SlotId> {
        top_down(&self.slots, index)
    }

    /// Push onto the top
    pub fn push(&mut self, slot: SlotId) {
        self.slots.push(slot);
    }

    /// Pop the top
    pub fn pop(&mut self) -> Option<SlotId> {
        self.slots.pop()
    }

    /// Pop `count` slots
    pub fn pop_n(&mut self, count: usize) {
        let keep = self.slots.len().saturating_sub(count);
        self.slots.truncate(keep);
    }

    /// Swap in a new slot id at `index` (0 = top)
    pub fn replace(&mut self, index: usize, slot: SlotId) {
        if let Some(position) = self.position(index) {
            self.slots[position] = slot;
        }
    }

    /// Exchange two slots (0 = top)
    pub fn swap(&mut self, a: usize, b: usize) {
        if let (Some(a), Some(b)) = (self.position(a), self.position(b)) {
            self.slots.swap(a, b);
        }
    }

    /// Move the slot at `index` to the top
    pub fn roll(&mut self, index: usize) {
        if let Some(position) = self.position(index) {
            let slot = self.slots.remove(position);
            self.slots.push(slot);
        }
    }

    /// Indices (0 = top) of slots carrying a name matching `name`
    pub fn find_named(&self, name: &NameRef, provider: &str, arena: &SlotArena) -> Vec<usize> {
        self.slots
            .iter()
            .rev()
            .enumerate()
            .filter(|(_, &id)| {
                arena
                    .get(id)
                    .names
                    .iter()
                    .any(|candidate| name.matches(candidate, provider))
            })
            .map(|(index, _)| index)
            .collect()
    }

    /// Indices (0 = top) of slots carrying `short` in any provider
    pub fn find_short(&self, short: &str, arena: &SlotArena) -> Vec<usize> {
        self.slots
            .iter()
            .rev()
            .enumerate()
            .filter(|(_, &id)| arena.get(id).names.iter().any(|name| name.short == short))
            .map(|(index, _)| index)
            .collect()
    }

    /// Indices (0 = top) of slots carrying exactly `name`
    pub fn find_exact(&self, name: &Name, arena: &SlotArena) -> Vec<usize> {
        self.slots
            .iter()
            .rev()
            .enumerate()
            .filter(|(_, &id)| arena.get(id).names.contains(name))
            .map(|(index, _)| index)
            .collect()
    }

    /// Publish as an immutable snapshot
    pub fn freeze(&self) -> FrozenStack {
        FrozenStack {
            slots: self.slots.clone(),
        }
    }

    /// Render for diagnostics
    pub fn dump(&self, arena: &SlotArena, types: &TypeTable) -> String {
        dump_slots(&self.slots, arena, types)
    }

    fn position(&self, index: usize) -> Option<usize> {
        self.slots.len().checked_sub(index + 1)
    }
}

fn top_down(slots: &[SlotId], index: usize) -> Option<SlotId> {
    let position = slots.len().checked_sub(index + 1)?;
    slots.get(position).copied()
}

fn dump_slots(slots: &[SlotId], arena: &SlotArena, types: &TypeTable) -> String {
    if slots.is_empty() {
        return "  <empty stack>".to_string();
    }

    let mut out = String::new();
    for (index, &id) in slots.iter().rev().enumerate() {
        let slot = arena.get(id);
        let _ = write!(out, "  [{}] {}", index, TypeName(types, slot.ty));
        if !slot.names.is_empty() {
            let names: Vec<String> = slot.names.iter().map(Name::full).collect();
            let _ = write!(out, " ({})", names.join(", "));
        }
        if let Some(value) = slot.value {
            let _ = write!(out, " = {}", value);
        }
        out.push('\n');
    }
    out.pop();
    out
}
