//! Shared helpers for the integration tests
//!
//! Holds a small reference machine that executes an operation stream, so
//! tests can check that optimization keeps observable behavior.

#![allow(dead_code)]

use i8c::compiler::ir::{
    BinaryOp, CompareOp, Constant, Function, Label, OpId, OpKind, SlotRef, StackOp,
};
use i8c::compiler::{CompileOptions, CompiledFunction, Compiler, OperationStream, TypeTable};
use std::collections::HashMap;

/// Instruction budget for one run
pub const FUEL: usize = 10_000;

/// Why a run stopped without returning
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trap {
    DivisionByZero,
    OutOfFuel,
    StackUnderflow,
    Unsupported(&'static str),
    BadJump,
}

/// Execute `stream` with `args` pushed in parameter order
///
/// Returns the top `returns` values, top first.
pub fn run(
    stream: &OperationStream,
    resolutions: &HashMap<OpId, usize>,
    args: &[i64],
    returns: usize,
) -> Result<Vec<i64>, Trap> {
    let positions: HashMap<OpId, usize> = stream
        .ops
        .iter()
        .enumerate()
        .map(|(index, op)| (op.id, index))
        .collect();
    let jump = |source: OpId| {
        stream
            .target(source)
            .and_then(|target| positions.get(&target).copied())
            .ok_or(Trap::BadJump)
    };

    let mut stack: Vec<i64> = args.to_vec();
    let mut pc = 0;
    for _ in 0..FUEL {
        let Some(op) = stream.ops.get(pc) else {
            return Err(Trap::BadJump);
        };
        pc += 1;

        match &op.kind {
            OpKind::Label(_) | OpKind::Name { .. } | OpKind::Cast { .. } => {}
            OpKind::Load(constant) => stack.push(constant.value),
            OpKind::LoadName(_) => {
                let index = resolutions.get(&op.id).copied().ok_or(Trap::BadJump)?;
                stack.push(peek(&stack, index)?);
            }
            OpKind::Pick(slot) => {
                let index = match slot {
                    SlotRef::Index(index) => *index,
                    SlotRef::Name(_) => resolutions.get(&op.id).copied().ok_or(Trap::BadJump)?,
                };
                stack.push(peek(&stack, index)?);
            }
            OpKind::Binary(binary) => {
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                stack.push(binary.fold(a, b).ok_or(Trap::DivisionByZero)?);
            }
            OpKind::AddUnsigned { value, .. } => {
                let a = pop(&mut stack)?;
                stack.push(a.wrapping_add(*value as i64));
            }
            OpKind::Compare(compare) => {
                let b = pop(&mut stack)?;
                let a = pop(&mut stack)?;
                stack.push(compare.fold(a, b));
            }
            OpKind::Unary(unary) => {
                let a = pop(&mut stack)?;
                stack.push(unary.fold(a));
            }
            OpKind::Stack(shuffle) => match shuffle {
                StackOp::Drop => {
                    pop(&mut stack)?;
                }
                StackOp::Dup => stack.push(peek(&stack, 0)?),
                StackOp::Over => stack.push(peek(&stack, 1)?),
                StackOp::Swap => {
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    stack.push(b);
                    stack.push(a);
                }
                StackOp::Rot => {
                    let c = pop(&mut stack)?;
                    let b = pop(&mut stack)?;
                    let a = pop(&mut stack)?;
                    stack.push(b);
                    stack.push(c);
                    stack.push(a);
                }
            },
            OpKind::Branch(_) => {
                if pop(&mut stack)? != 0 {
                    pc = jump(op.id)?;
                }
            }
            OpKind::Goto(_) => pc = jump(op.id)?,
            OpKind::Return => {
                return (0..returns).map(|index| peek(&stack, index)).collect();
            }
            OpKind::Call => return Err(Trap::Unsupported("call")),
            OpKind::Deref { .. } => return Err(Trap::Unsupported("deref")),
        }
    }
    Err(Trap::OutOfFuel)
}

fn pop(stack: &mut Vec<i64>) -> Result<i64, Trap> {
    stack.pop().ok_or(Trap::StackUnderflow)
}

fn peek(stack: &[i64], index: usize) -> Result<i64, Trap> {
    stack
        .len()
        .checked_sub(index + 1)
        .map(|position| stack[position])
        .ok_or(Trap::StackUnderflow)
}

/// Compile at a given optimization level
pub fn compile_at(
    types: &TypeTable,
    function: &Function,
    opt_level: u8,
) -> i8c::Result<CompiledFunction> {
    Compiler::new(CompileOptions {
        opt_level,
        ..Default::default()
    })
    .compile_function(types, function)
}

/// Run a compiled function
pub fn execute(compiled: &CompiledFunction, args: &[i64], returns: usize) -> Result<Vec<i64>, Trap> {
    run(&compiled.stream, &compiled.resolutions, args, returns)
}

pub fn load(value: i64) -> OpKind {
    OpKind::Load(Constant::int(value))
}

pub fn user(label: &str) -> Label {
    Label::User(label.to_string())
}

pub fn binary(op: BinaryOp) -> OpKind {
    OpKind::Binary(op)
}

pub fn compare(op: CompareOp) -> OpKind {
    OpKind::Compare(op)
}

pub fn shuffle(op: StackOp) -> OpKind {
    OpKind::Stack(op)
}

/// `int f(int x)` returning 1 if `x < limit`, else 0
pub fn below(limit: i64) -> Function {
    let mut f = Function::new("below", "test");
    f.add_parameter("x", TypeTable::INT)
        .add_return(TypeTable::INT);
    f.op(load(limit));
    f.op(compare(CompareOp::Lt));
    f.op(OpKind::Branch(user("yes")));
    f.op(load(0));
    f.op(OpKind::Return);
    f.label("yes");
    f.op(load(1));
    f.op(OpKind::Return);
    f
}

/// `int f(int n)` summing `n + (n-1) + ... + 1`
pub fn triangle() -> Function {
    let mut f = Function::new("triangle", "test");
    f.add_parameter("n", TypeTable::INT)
        .add_return(TypeTable::INT);
    // acc n
    f.op(load(0));
    f.op(shuffle(StackOp::Swap));
    f.label("top");
    f.op(shuffle(StackOp::Dup));
    f.op(load(0));
    f.op(compare(CompareOp::Gt));
    f.op(OpKind::Branch(user("body")));
    f.op(shuffle(StackOp::Drop));
    f.op(OpKind::Return);
    f.label("body");
    // acc n -- acc+n n-1
    f.op(shuffle(StackOp::Dup));
    f.op(shuffle(StackOp::Rot));
    f.op(binary(BinaryOp::Add));
    f.op(shuffle(StackOp::Swap));
    f.op(load(1));
    f.op(binary(BinaryOp::Sub));
    f.op(OpKind::Goto(user("top")));
    f
}
