//! Verifier tests through the public API

mod common;

use common::*;
use i8c::compiler::ir::{
    BinaryOp, Constant, Function, Module, Name, NameRef, OpKind, SlotRef, StackOp,
};
use i8c::compiler::{Cfg, CompileOptions, Compiler, Verification, Verifier};
use i8c::{Error, ErrorSeverity, TypeTable};

fn verify(types: &TypeTable, f: &Function) -> i8c::Result<Verification> {
    let cfg = Cfg::build(f)?;
    Verifier::new(types).verify(&cfg, f)
}

// =============================================================================
// CALLS AND EXTERNALS
// =============================================================================

fn caller(types: &mut TypeTable, pointer_first: bool) -> Function {
    let callee = types.function_type(vec![TypeTable::INT, TypeTable::PTR], vec![TypeTable::INT]);
    let mut f = Function::new("caller", "test");
    f.add_parameter("p", TypeTable::PTR)
        .add_external(Name::new("lib", "g"), callee)
        .add_return(TypeTable::INT);
    // p g
    if pointer_first {
        f.op(OpKind::Pick(SlotRef::Index(1)));
        f.op(load(4));
    } else {
        f.op(load(4));
        f.op(OpKind::Pick(SlotRef::Index(2)));
    }
    f.op(OpKind::LoadName(NameRef::short("g")));
    f.op(OpKind::Call);
    f.op(OpKind::Return);
    f
}

#[test]
fn test_external_call() {
    let mut types = TypeTable::new();
    let f = caller(&mut types, false);

    let verification = verify(&types, &f).unwrap();
    assert_eq!(verification.max_stack_depth, 5);
    // the short name falls back to the external's provider
    let load_g = f.operations[2].id;
    assert_eq!(verification.resolutions[&load_g], 2);
}

#[test]
fn test_call_argument_order() {
    let mut types = TypeTable::new();
    let f = caller(&mut types, true);

    match verify(&types, &f) {
        Err(Error::StackTypeMismatch {
            verb,
            expected,
            found,
            ..
        }) => {
            assert_eq!(verb, "call");
            assert_eq!(expected, "ptr");
            assert_eq!(found, "int");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_call_needs_function() {
    let types = TypeTable::new();
    let mut f = Function::new("f", "test");
    f.op(load(1));
    f.op(OpKind::Call);
    assert!(matches!(
        verify(&types, &f),
        Err(Error::StackTypeMismatch { ref verb, .. }) if verb == "call"
    ));
}

// =============================================================================
// MEMORY AND CASTS
// =============================================================================

#[test]
fn test_deref_to_sized_alias() {
    let types = TypeTable::new();
    let u8_type = types.lookup("u8").unwrap();

    let mut f = Function::new("f", "test");
    f.add_parameter("p", TypeTable::PTR)
        .add_return(TypeTable::INT);
    f.op(OpKind::Deref { ty: u8_type });
    f.op(OpKind::Return);
    assert!(verify(&types, &f).is_ok());

    let mut g = Function::new("g", "test");
    g.add_parameter("p", TypeTable::PTR);
    g.op(OpKind::Deref {
        ty: TypeTable::OPAQUE,
    });
    g.op(OpKind::Return);
    assert!(matches!(
        verify(&types, &g),
        Err(Error::StackTypeMismatch { .. })
    ));
}

#[test]
fn test_cast_by_name() {
    let types = TypeTable::new();
    let mut f = Function::new("f", "test");
    f.add_parameter("p", TypeTable::PTR)
        .add_return(TypeTable::INT);
    let cast = f.op(OpKind::Cast {
        slot: SlotRef::Name(NameRef::short("p")),
        ty: TypeTable::INT,
    });
    f.op(OpKind::Return);

    let verification = verify(&types, &f).unwrap();
    assert_eq!(verification.resolutions[&cast], 0);
}

#[test]
fn test_cast_within_basetype_is_unnecessary() {
    let types = TypeTable::new();
    let u32_type = types.lookup("u32").unwrap();

    let mut f = Function::new("f", "test");
    f.add_parameter("n", TypeTable::INT);
    f.op(OpKind::Cast {
        slot: SlotRef::Index(0),
        ty: u32_type,
    });
    assert!(matches!(
        verify(&types, &f),
        Err(Error::UnnecessaryCast { .. })
    ));
}

// =============================================================================
// NAMES ACROSS MERGES
// =============================================================================

fn named_join(both_paths_name: bool) -> Function {
    let mut f = Function::new("f", "test");
    f.add_parameter("x", TypeTable::INT)
        .add_return(TypeTable::INT);
    f.op(shuffle(StackOp::Dup));
    f.op(OpKind::Branch(user("other")));
    f.op(load(1));
    f.op(OpKind::Name {
        slot: SlotRef::Index(0),
        name: Name::new("test", "t"),
    });
    f.op(OpKind::Goto(user("join")));
    f.label("other");
    f.op(load(2));
    if both_paths_name {
        f.op(OpKind::Name {
            slot: SlotRef::Index(0),
            name: Name::new("test", "t"),
        });
    }
    f.op(OpKind::Goto(user("join")));
    f.label("join");
    f.op(OpKind::LoadName(NameRef::short("t")));
    f.op(binary(BinaryOp::Add));
    f.op(OpKind::Return);
    f
}

#[test]
fn test_name_survives_merge_when_both_paths_agree() {
    let types = TypeTable::new();
    let f = named_join(true);
    let verification = verify(&types, &f).unwrap();
    assert_eq!(verification.max_stack_depth, 3);

    let compiled = compile_at(&types, &f, 2).unwrap();
    // zero falls through to `load 1`
    assert_eq!(execute(&compiled, &[0], 1), Ok(vec![2]));
    assert_eq!(execute(&compiled, &[9], 1), Ok(vec![4]));
}

#[test]
fn test_name_dropped_by_merge() {
    let types = TypeTable::new();
    let f = named_join(false);
    assert!(matches!(
        verify(&types, &f),
        Err(Error::UndefinedName { ref name, .. }) if name == "t"
    ));
}

/// The back edge replaces `test.x` with an anonymous value, so the loop's
/// second walk finds `x` only through the external `lib.x`
fn shadowed_by_external() -> Function {
    let mut f = Function::new("f", "test");
    f.add_parameter("x", TypeTable::INT)
        .add_external(Name::new("lib", "x"), TypeTable::INT)
        .add_return(TypeTable::INT);
    // test.x lib.x
    f.op(OpKind::Goto(user("loop")));
    f.label("loop");
    f.op(OpKind::LoadName(NameRef::short("x")));
    f.op(OpKind::Branch(user("done")));
    f.op(shuffle(StackOp::Swap));
    f.op(shuffle(StackOp::Drop));
    f.op(load(0));
    f.op(shuffle(StackOp::Swap));
    f.op(OpKind::Goto(user("loop")));
    f.label("done");
    f.op(shuffle(StackOp::Drop));
    f.op(OpKind::Return);
    f
}

#[test]
fn test_rewalk_must_resolve_the_same_slot() {
    let types = TypeTable::new();
    let f = shadowed_by_external();

    match verify(&types, &f) {
        Err(Error::InconsistentName {
            name,
            previous,
            current,
            ..
        }) => {
            assert_eq!(name, "x");
            assert_eq!(previous, 1);
            assert_eq!(current, 0);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_duplicate_parameter() {
    let types = TypeTable::new();
    let mut f = Function::new("f", "test");
    f.add_parameter("x", TypeTable::INT)
        .add_parameter("x", TypeTable::PTR);
    f.op(OpKind::Return);
    assert!(matches!(
        verify(&types, &f),
        Err(Error::RedefinedName { .. })
    ));
}

// =============================================================================
// DEPTHS, DIAGNOSTICS AND LIMITS
// =============================================================================

#[test]
fn test_entry_stacks_agree_on_depth() {
    let types = TypeTable::new();
    let f = triangle();
    let verification = verify(&types, &f).unwrap();

    for stacks in verification.entry_stacks.values() {
        assert!(stacks.depth <= verification.max_stack_depth);
        assert_eq!(stacks.merged.lines().count(), stacks.depth);
        for incoming in stacks.incoming.values() {
            assert_eq!(incoming.lines().count(), stacks.depth);
        }
    }
}

#[test]
fn test_error_shows_stack_before_operation() {
    let types = TypeTable::new();
    let mut f = Function::new("f", "test");
    f.op(load(1));
    f.op(OpKind::Load(Constant {
        value: 0,
        ty: TypeTable::PTR,
    }));
    let mul = f.op(binary(BinaryOp::Mul));

    let err = verify(&types, &f).unwrap_err();
    let location = f.operations.iter().find(|op| op.id == mul).unwrap().location;
    assert_eq!(err.location(), Some(location));

    let text = err.to_string();
    assert!(text.contains("mul"));
    assert!(text.contains("[0] ptr = 0"));
    assert!(text.contains("[1] int = 1"));
}

#[test]
fn test_missing_return_values() {
    let types = TypeTable::new();
    let mut f = Function::new("f", "test");
    f.add_return(TypeTable::INT).add_return(TypeTable::INT);
    f.op(load(1));
    f.op(OpKind::Return);
    assert!(matches!(
        verify(&types, &f),
        Err(Error::StackUnderflow { ref verb, required: 2, .. }) if verb == "return"
    ));
}

#[test]
fn test_walk_budget_reported_per_function() {
    let mut module = Module::new();
    module.functions.push(below(3));
    module.functions.push(triangle());

    let compiler = Compiler::new(CompileOptions {
        max_block_walks: 3,
        ..Default::default()
    });
    let err = compiler.compile_module(&module).unwrap_err();
    assert_eq!(err.classify(), ErrorSeverity::Fatal);
    match err {
        Error::InFunction { function, source } => {
            assert_eq!(function, "triangle");
            assert!(matches!(*source, Error::FixpointLimit { limit: 3, .. }));
        }
        other => panic!("unexpected error: {other}"),
    }
}
