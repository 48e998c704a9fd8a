//! Operation model: the closed set of stack operations

use crate::compiler::types::{TypeId, TypeName, TypeTable};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Source position of an operation
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Location {
    /// 1-based line
    pub line: u32,
    /// 1-based column
    pub column: u32,
}

impl Location {
    /// Creates a location
    pub const fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Identity of an operation, unique within its function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId(pub u32);

/// Jump target name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Label {
    /// Declared in the source
    User(String),
    /// Minted by the compiler
    Synthetic(u32),
    /// Shared end-of-function marker in a serialized stream
    End,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::User(name) => f.write_str(name),
            Label::Synthetic(n) => write!(f, ".L{}", n),
            Label::End => f.write_str(".end"),
        }
    }
}

/// Fully qualified name carried by a stack slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Name {
    /// Owning provider (module or function namespace)
    pub provider: String,
    /// Name inside the provider
    pub short: String,
}

impl Name {
    /// Creates a name
    pub fn new(provider: impl Into<String>, short: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            short: short.into(),
        }
    }

    /// `provider.short`
    pub fn full(&self) -> String {
        format!("{}.{}", self.provider, self.short)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.provider, self.short)
    }
}

/// Name as written at a use site; a missing provider means the compiling
/// function's own provider
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NameRef {
    /// Explicit provider, if written
    pub provider: Option<String>,
    /// Name inside the provider
    pub short: String,
}

impl NameRef {
    /// Short (implicit provider) reference
    pub fn short(short: impl Into<String>) -> Self {
        Self {
            provider: None,
            short: short.into(),
        }
    }

    /// Fully qualified reference
    pub fn full(provider: impl Into<String>, short: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.into()),
            short: short.into(),
        }
    }

    /// Whether `name` is what this reference denotes inside `own_provider`
    pub fn matches(&self, name: &Name, own_provider: &str) -> bool {
        let provider = self.provider.as_deref().unwrap_or(own_provider);
        name.short == self.short && name.provider == provider
    }
}

impl fmt::Display for NameRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.provider {
            Some(provider) => write!(f, "{}.{}", provider, self.short),
            None => f.write_str(&self.short),
        }
    }
}

/// Reference to a stack slot, by position (0 = top) or by name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotRef {
    /// Explicit index from the top
    Index(usize),
    /// Search by name
    Name(NameRef),
}

impl fmt::Display for SlotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotRef::Index(index) => write!(f, "#{}", index),
            SlotRef::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Two-operand arithmetic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    /// `a + b`
    Add,
    /// `a - b`
    Sub,
    /// `a * b`
    Mul,
    /// `a / b`
    Div,
    /// `a % b`
    Mod,
    /// `a << b`
    Shl,
    /// Logical `a >> b`
    Shr,
    /// Arithmetic `a >> b`
    Shra,
    /// `a & b`
    And,
    /// `a | b`
    Or,
    /// `a ^ b`
    Xor,
}

impl BinaryOp {
    /// Mnemonic
    pub fn verb(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Mod => "mod",
            BinaryOp::Shl => "shl",
            BinaryOp::Shr => "shr",
            BinaryOp::Shra => "shra",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Xor => "xor",
        }
    }

    /// Right operand that leaves the left operand unchanged
    pub fn identity(self) -> Option<i64> {
        match self {
            BinaryOp::Add
            | BinaryOp::Sub
            | BinaryOp::Shl
            | BinaryOp::Shr
            | BinaryOp::Shra
            | BinaryOp::Or
            | BinaryOp::Xor => Some(0),
            BinaryOp::Mul | BinaryOp::Div => Some(1),
            BinaryOp::Mod | BinaryOp::And => None,
        }
    }

    /// Evaluate on known operands (`None` on division by zero)
    pub fn fold(self, a: i64, b: i64) -> Option<i64> {
        let shift = (b & 63) as u32;
        Some(match self {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div => a.checked_div(b).or_else(|| (b == -1).then(|| a.wrapping_neg()))?,
            BinaryOp::Mod => a.checked_rem(b).or_else(|| (b == -1).then_some(0))?,
            BinaryOp::Shl => a.wrapping_shl(shift),
            BinaryOp::Shr => ((a as u64) >> shift) as i64,
            BinaryOp::Shra => a >> shift,
            BinaryOp::And => a & b,
            BinaryOp::Or => a | b,
            BinaryOp::Xor => a ^ b,
        })
    }
}

/// Comparison producing `bool`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    /// `a == b`
    Eq,
    /// `a != b`
    Ne,
    /// `a < b`
    Lt,
    /// `a <= b`
    Le,
    /// `a > b`
    Gt,
    /// `a >= b`
    Ge,
}

impl CompareOp {
    /// Mnemonic
    pub fn verb(self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Lt => "lt",
            CompareOp::Le => "le",
            CompareOp::Gt => "gt",
            CompareOp::Ge => "ge",
        }
    }

    /// Comparison with the opposite result
    pub fn negate(self) -> Self {
        match self {
            CompareOp::Eq => CompareOp::Ne,
            CompareOp::Ne => CompareOp::Eq,
            CompareOp::Lt => CompareOp::Ge,
            CompareOp::Le => CompareOp::Gt,
            CompareOp::Gt => CompareOp::Le,
            CompareOp::Ge => CompareOp::Lt,
        }
    }

    /// Evaluate on known operands
    pub fn fold(self, a: i64, b: i64) -> i64 {
        let result = match self {
            CompareOp::Eq => a == b,
            CompareOp::Ne => a != b,
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
        };
        result as i64
    }
}

/// One-operand arithmetic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    /// `|a|`
    Abs,
    /// `-a`
    Neg,
    /// `!a` (bitwise)
    Not,
}

impl UnaryOp {
    /// Mnemonic
    pub fn verb(self) -> &'static str {
        match self {
            UnaryOp::Abs => "abs",
            UnaryOp::Neg => "neg",
            UnaryOp::Not => "not",
        }
    }

    /// Evaluate on a known operand
    pub fn fold(self, a: i64) -> i64 {
        match self {
            UnaryOp::Abs => a.wrapping_abs(),
            UnaryOp::Neg => a.wrapping_neg(),
            UnaryOp::Not => !a,
        }
    }
}

/// Pure stack shuffles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StackOp {
    /// `a --`
    Drop,
    /// `a -- a a`
    Dup,
    /// `a b -- a b a`
    Over,
    /// `a b -- b a`
    Swap,
    /// `a b c -- b c a`
    Rot,
}

impl StackOp {
    /// Mnemonic
    pub fn verb(self) -> &'static str {
        match self {
            StackOp::Drop => "drop",
            StackOp::Dup => "dup",
            StackOp::Over => "over",
            StackOp::Swap => "swap",
            StackOp::Rot => "rot",
        }
    }

    /// Slots the shuffle needs
    pub fn arity(self) -> usize {
        match self {
            StackOp::Drop | StackOp::Dup => 1,
            StackOp::Over | StackOp::Swap => 2,
            StackOp::Rot => 3,
        }
    }
}

/// Integer constant with its annotated type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Constant {
    /// Value
    pub value: i64,
    /// Annotated type (`int` unless the front end says otherwise)
    pub ty: TypeId,
}

impl Constant {
    /// `int` constant
    pub fn int(value: i64) -> Self {
        Self {
            value,
            ty: TypeTable::INT,
        }
    }
}

/// How control leaves an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Terminal {
    /// Falls through to the next operation
    None,
    /// Two exits: branched, not-branched
    Branch,
    /// One exit
    Goto,
    /// No exits
    Return,
}

impl Terminal {
    /// Number of successor edges
    pub fn exits(self) -> usize {
        match self {
            Terminal::None | Terminal::Goto => 1,
            Terminal::Branch => 2,
            Terminal::Return => 0,
        }
    }
}

/// Operation kinds
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Label marker (pseudo operation, consumed by the CFG builder)
    Label(String),
    /// Push a constant
    Load(Constant),
    /// Push a copy of a named value (argument or external); the resolved
    /// stack index is cached by the verifier
    LoadName(NameRef),
    /// Push a copy of a slot
    Pick(SlotRef),
    /// Give a slot an additional name
    Name {
        /// Slot to name
        slot: SlotRef,
        /// New name
        name: Name,
    },
    /// Two-operand arithmetic
    Binary(BinaryOp),
    /// `add` of a known non-negative constant (produced by the optimizer)
    AddUnsigned {
        /// Addend
        value: u64,
        /// Type of the folded constant
        ty: TypeId,
    },
    /// Comparison
    Compare(CompareOp),
    /// One-operand arithmetic
    Unary(UnaryOp),
    /// Call the function reference on top of the stack
    Call,
    /// Retype a slot
    Cast {
        /// Slot to retype
        slot: SlotRef,
        /// Target type
        ty: TypeId,
    },
    /// Load through the pointer on top of the stack
    Deref {
        /// Type of the loaded value
        ty: TypeId,
    },
    /// Stack shuffle
    Stack(StackOp),
    /// Conditional jump; falls through when the condition is zero
    Branch(Label),
    /// Unconditional jump
    Goto(Label),
    /// Leave the function
    Return,
}

impl OpKind {
    /// Human-readable verb used in diagnostics
    pub fn verb(&self) -> &'static str {
        match self {
            OpKind::Label(_) => "label",
            OpKind::Load(_) | OpKind::LoadName(_) => "load",
            OpKind::Pick(_) => "pick",
            OpKind::Name { .. } => "name",
            OpKind::Binary(op) => op.verb(),
            OpKind::AddUnsigned { .. } => "addu",
            OpKind::Compare(op) => op.verb(),
            OpKind::Unary(op) => op.verb(),
            OpKind::Call => "call",
            OpKind::Cast { .. } => "cast",
            OpKind::Deref { .. } => "deref",
            OpKind::Stack(op) => op.verb(),
            OpKind::Branch(_) => "branch",
            OpKind::Goto(_) => "goto",
            OpKind::Return => "return",
        }
    }

    /// Minimum number of slots consumed before the operation runs
    ///
    /// `call` and `return` need more depending on signatures; the verifier
    /// checks those separately.
    pub fn arity(&self) -> usize {
        match self {
            OpKind::Label(_)
            | OpKind::Load(_)
            | OpKind::LoadName(_)
            | OpKind::Pick(_)
            | OpKind::Name { .. }
            | OpKind::Cast { .. }
            | OpKind::Goto(_)
            | OpKind::Return => 0,
            OpKind::AddUnsigned { .. }
            | OpKind::Unary(_)
            | OpKind::Call
            | OpKind::Deref { .. }
            | OpKind::Branch(_) => 1,
            OpKind::Binary(_) | OpKind::Compare(_) => 2,
            OpKind::Stack(op) => op.arity(),
        }
    }

    /// Terminal class
    pub fn terminal(&self) -> Terminal {
        match self {
            OpKind::Branch(_) => Terminal::Branch,
            OpKind::Goto(_) => Terminal::Goto,
            OpKind::Return => Terminal::Return,
            _ => Terminal::None,
        }
    }

    /// Whether the operation ends a basic block
    pub fn is_terminal(&self) -> bool {
        self.terminal() != Terminal::None
    }

    /// Constant pushed by a `load`, if this is one
    pub fn constant(&self) -> Option<i64> {
        match self {
            OpKind::Load(constant) => Some(constant.value),
            _ => None,
        }
    }

    /// Slot reference to resolve, if any
    pub fn slot_ref(&self) -> Option<&SlotRef> {
        match self {
            OpKind::Pick(slot) | OpKind::Name { slot, .. } | OpKind::Cast { slot, .. } => {
                Some(slot)
            }
            _ => None,
        }
    }

    /// Render with type names
    pub fn display<'a>(&'a self, types: &'a TypeTable) -> OpDisplay<'a> {
        OpDisplay { kind: self, types }
    }
}

/// [`OpKind`] formatter resolving type names
pub struct OpDisplay<'a> {
    kind: &'a OpKind,
    types: &'a TypeTable,
}

impl fmt::Display for OpDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = self.kind.verb();
        match self.kind {
            OpKind::Label(name) => write!(f, "{}:", name),
            OpKind::Load(constant) if constant.ty == TypeTable::INT => {
                write!(f, "{} {}", verb, constant.value)
            }
            OpKind::Load(constant) => write!(
                f,
                "{} {} as {}",
                verb,
                constant.value,
                TypeName(self.types, constant.ty)
            ),
            OpKind::LoadName(name) => write!(f, "{} {}", verb, name),
            OpKind::Pick(slot) => write!(f, "{} {}", verb, slot),
            OpKind::Name { slot, name } => write!(f, "{} {} {}", verb, slot, name),
            OpKind::AddUnsigned { value, .. } => write!(f, "{} {}", verb, value),
            OpKind::Cast { slot, ty } => {
                write!(f, "{} {} {}", verb, slot, TypeName(self.types, *ty))
            }
            OpKind::Deref { ty } => write!(f, "{} {}", verb, TypeName(self.types, *ty)),
            OpKind::Branch(label) | OpKind::Goto(label) => write!(f, "{} {}", verb, label),
            OpKind::Binary(_)
            | OpKind::Compare(_)
            | OpKind::Unary(_)
            | OpKind::Call
            | OpKind::Stack(_)
            | OpKind::Return => f.write_str(verb),
        }
    }
}

/// A single operation with its provenance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Identity within the function
    pub id: OpId,
    /// What the operation does
    pub kind: OpKind,
    /// Source location (inherited from `origin` for synthetic operations)
    pub location: Location,
    /// Real operation a synthetic one was derived from
    pub origin: Option<OpId>,
    /// Inserted by the compiler
    pub synthetic: bool,
}

impl Operation {
    /// Operation written in the source
    pub fn new(id: OpId, kind: OpKind, location: Location) -> Self {
        Self {
            id,
            kind,
            location,
            origin: None,
            synthetic: false,
        }
    }

    /// Compiler-inserted operation attributed to `from`
    pub fn synthetic(id: OpId, kind: OpKind, from: &Operation) -> Self {
        Self {
            id,
            kind,
            location: from.location,
            origin: Some(from.origin.unwrap_or(from.id)),
            synthetic: true,
        }
    }

    /// Compiler-inserted operation with no real operation to blame
    pub fn synthetic_at(id: OpId, kind: OpKind, location: Location) -> Self {
        Self {
            id,
            kind,
            location,
            origin: None,
            synthetic: true,
        }
    }

    /// Whether the compiler inserted this operation
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }

    /// Terminal class
    pub fn terminal(&self) -> Terminal {
        self.kind.terminal()
    }

    /// Same kind and operands; terminals only compare by class since their
    /// targets live in the block's successor list
    pub fn equivalent(&self, other: &Operation) -> bool {
        match (self.terminal(), other.terminal()) {
            (Terminal::None, Terminal::None) => self.kind == other.kind,
            (a, b) => a == b,
        }
    }
}

/// Allocator for operation ids within one function
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpIds {
    next: u32,
}

impl OpIds {
    /// Start allocating at `next`
    pub fn starting_at(next: u32) -> Self {
        Self { next }
    }

    /// Fresh id
    pub fn next_id(&mut self) -> OpId {
        let id = OpId(self.next);
        self.next += 1;
        id
    }

    /// Id the next call will return
    pub fn peek(&self) -> u32 {
        self.next
    }
}
