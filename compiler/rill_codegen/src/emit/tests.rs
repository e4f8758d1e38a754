use std::sync::Arc;

use pretty_assertions::assert_eq;
use rill_ir::{BinOp, BoundArena, BoundId, BoundKind, Builtin, StringInterner, Ty};
use rill_rt::{ExecCtx, ExecError, Value};

use super::{compile, GlobalBindings};
use crate::CodegenError;

fn int(arena: &mut BoundArena, n: i64) -> BoundId {
    arena.push(BoundKind::Int(n), Ty::Int)
}

fn text(arena: &mut BoundArena, s: &str) -> BoundId {
    arena.push(BoundKind::Text(Arc::from(s)), Ty::Text)
}

fn global(arena: &mut BoundArena, interner: &StringInterner, name: &str, ty: Ty) -> BoundId {
    let name = interner.intern(name);
    arena.push(BoundKind::Global { name }, ty)
}

fn binary(arena: &mut BoundArena, op: BinOp, l: BoundId, r: BoundId, ty: Ty) -> BoundId {
    arena.push(BoundKind::Binary { op, left: l, right: r }, ty)
}

fn eval(arena: &BoundArena, root: BoundId, bindings: &GlobalBindings, ci: bool) -> Value {
    let compiled = compile(arena, root).expect("compile");
    compiled
        .evaluate(bindings, &ExecCtx::new(ci))
        .expect("evaluate")
}

fn int_seq(values: &[i64]) -> Value {
    Value::seq(values.iter().copied().map(Value::Int).collect())
}

#[test]
fn literal_arithmetic() {
    let mut arena = BoundArena::new();
    let two = int(&mut arena, 2);
    let three = int(&mut arena, 3);
    let sum = binary(&mut arena, BinOp::Add, two, three, Ty::Int);
    let four = int(&mut arena, 4);
    let root = binary(&mut arena, BinOp::Mul, sum, four, Ty::Int);

    assert_eq!(
        eval(&arena, root, &GlobalBindings::new(), false),
        Value::Int(20)
    );
}

#[test]
fn globals_and_self_come_from_the_externals_tuple() {
    let mut arena = BoundArena::new();
    let interner = StringInterner::new();
    let x = global(&mut arena, &interner, "x", Ty::Int);
    let this = arena.push(BoundKind::This, Ty::Int);
    let root = binary(&mut arena, BinOp::Add, x, this, Ty::Int);

    let mut bindings = GlobalBindings::new();
    bindings.set(interner.intern("x"), Value::Int(7));
    bindings.set_this(Value::Int(100));
    assert_eq!(eval(&arena, root, &bindings, false), Value::Int(107));
}

#[test]
fn missing_global_is_reported_at_evaluation() {
    let mut arena = BoundArena::new();
    let interner = StringInterner::new();
    let root = global(&mut arena, &interner, "absent", Ty::Int);

    let compiled = compile(&arena, root).expect("compile");
    let err = compiled
        .evaluate(&GlobalBindings::new(), &ExecCtx::default())
        .expect_err("must fail");
    assert!(matches!(err, ExecError::MissingGlobal { .. }));
}

#[test]
fn map_body_reads_globals_through_its_own_routine() {
    // Map(s, x => x * g)
    let mut arena = BoundArena::new();
    let interner = StringInterner::new();
    let s = global(&mut arena, &interner, "s", Ty::seq(Ty::Int));
    let token = arena.fresh_token();
    let x = arena.push(BoundKind::ScopeRef { token }, Ty::Int);
    let g = global(&mut arena, &interner, "g", Ty::Int);
    let body = binary(&mut arena, BinOp::Mul, x, g, Ty::Int);
    let root = arena.push(
        BoundKind::Map { seq: s, token, body },
        Ty::seq(Ty::Int),
    );

    let mut bindings = GlobalBindings::new();
    bindings.set(interner.intern("s"), int_seq(&[1, 2, 3]));
    bindings.set(interner.intern("g"), Value::Int(5));
    assert_eq!(eval(&arena, root, &bindings, false), int_seq(&[5, 10, 15]));
}

#[test]
fn nested_iteration_captures_the_outer_element() {
    // Map(outer, x => Sum(inner, y => x + y))
    let mut arena = BoundArena::new();
    let interner = StringInterner::new();
    let outer = global(&mut arena, &interner, "outer", Ty::seq(Ty::Int));
    let tok_x = arena.fresh_token();
    let inner = global(&mut arena, &interner, "inner", Ty::seq(Ty::Int));
    let tok_y = arena.fresh_token();
    let x = arena.push(BoundKind::ScopeRef { token: tok_x }, Ty::Int);
    let y = arena.push(BoundKind::ScopeRef { token: tok_y }, Ty::Int);
    let term = binary(&mut arena, BinOp::Add, x, y, Ty::Int);
    let sum = arena.push(
        BoundKind::Sum {
            seq: inner,
            token: tok_y,
            selector: term,
        },
        Ty::Int,
    );
    let root = arena.push(
        BoundKind::Map {
            seq: outer,
            token: tok_x,
            body: sum,
        },
        Ty::seq(Ty::Int),
    );

    let mut bindings = GlobalBindings::new();
    bindings.set(interner.intern("outer"), int_seq(&[10, 20]));
    bindings.set(interner.intern("inner"), int_seq(&[1, 2]));
    assert_eq!(eval(&arena, root, &bindings, false), int_seq(&[23, 43]));
}

#[test]
fn with_binding_evaluates_once_and_is_reusable() {
    // With(v = g + 1, v * v)
    let mut arena = BoundArena::new();
    let interner = StringInterner::new();
    let g = global(&mut arena, &interner, "g", Ty::Int);
    let one = int(&mut arena, 1);
    let value = binary(&mut arena, BinOp::Add, g, one, Ty::Int);
    let token = arena.fresh_token();
    let v1 = arena.push(BoundKind::ScopeRef { token }, Ty::Int);
    let v2 = arena.push(BoundKind::ScopeRef { token }, Ty::Int);
    let body = binary(&mut arena, BinOp::Mul, v1, v2, Ty::Int);
    let root = arena.push(BoundKind::With { value, token, body }, Ty::Int);

    let mut bindings = GlobalBindings::new();
    bindings.set(interner.intern("g"), Value::Int(6));
    assert_eq!(eval(&arena, root, &bindings, false), Value::Int(49));
}

#[test]
fn capture_through_a_with_binding() {
    // With(v = 10, Map(s, x => x + v)): the body routine captures v's
    // slot from the enclosing activation.
    let mut arena = BoundArena::new();
    let interner = StringInterner::new();
    let ten = int(&mut arena, 10);
    let tok_v = arena.fresh_token();
    let s = global(&mut arena, &interner, "s", Ty::seq(Ty::Int));
    let tok_x = arena.fresh_token();
    let x = arena.push(BoundKind::ScopeRef { token: tok_x }, Ty::Int);
    let v = arena.push(BoundKind::ScopeRef { token: tok_v }, Ty::Int);
    let body = binary(&mut arena, BinOp::Add, x, v, Ty::Int);
    let map = arena.push(
        BoundKind::Map {
            seq: s,
            token: tok_x,
            body,
        },
        Ty::seq(Ty::Int),
    );
    let root = arena.push(
        BoundKind::With {
            value: ten,
            token: tok_v,
            body: map,
        },
        Ty::seq(Ty::Int),
    );

    let mut bindings = GlobalBindings::new();
    bindings.set(interner.intern("s"), int_seq(&[1, 2]));
    assert_eq!(eval(&arena, root, &bindings, false), int_seq(&[11, 12]));
}

#[test]
fn filter_honors_the_context_case_mode() {
    // Filter(names, n => n ~= "bob")
    let mut arena = BoundArena::new();
    let interner = StringInterner::new();
    let names = global(&mut arena, &interner, "names", Ty::seq(Ty::Text));
    let token = arena.fresh_token();
    let n = arena.push(BoundKind::ScopeRef { token }, Ty::Text);
    let bob = text(&mut arena, "bob");
    let pred = binary(&mut arena, BinOp::TextEqCi, n, bob, Ty::Bool);
    let root = arena.push(
        BoundKind::Filter {
            seq: names,
            token,
            pred,
        },
        Ty::seq(Ty::Text),
    );

    let mut bindings = GlobalBindings::new();
    bindings.set(
        interner.intern("names"),
        Value::seq(vec![Value::text("Bob"), Value::text("ann"), Value::text("bob")]),
    );

    assert_eq!(
        eval(&arena, root, &bindings, true),
        Value::seq(vec![Value::text("Bob"), Value::text("bob")])
    );
    assert_eq!(
        eval(&arena, root, &bindings, false),
        Value::seq(vec![Value::text("bob")])
    );
}

#[test]
fn membership_and_contains_use_the_context() {
    // (g in s) and Contains(h, "world")
    let mut arena = BoundArena::new();
    let interner = StringInterner::new();
    let g = text(&mut arena, "ANN");
    let s = global(&mut arena, &interner, "s", Ty::seq(Ty::Text));
    let member = binary(&mut arena, BinOp::In, g, s, Ty::Bool);
    let h = global(&mut arena, &interner, "h", Ty::Text);
    let needle = text(&mut arena, "WORLD");
    let contains = arena.push(
        BoundKind::Call {
            func: Builtin::Contains,
            args: vec![h, needle],
        },
        Ty::Bool,
    );
    let root = binary(&mut arena, BinOp::And, member, contains, Ty::Bool);

    let mut bindings = GlobalBindings::new();
    bindings.set(
        interner.intern("s"),
        Value::seq(vec![Value::text("ann"), Value::text("bob")]),
    );
    bindings.set(interner.intern("h"), Value::text("hello world"));

    assert_eq!(eval(&arena, root, &bindings, true), Value::Bool(true));
    assert_eq!(eval(&arena, root, &bindings, false), Value::Bool(false));
}

#[test]
fn distinct_switches_comparer_with_the_case_mode() {
    let mut arena = BoundArena::new();
    let interner = StringInterner::new();
    let s = global(&mut arena, &interner, "s", Ty::seq(Ty::Text));
    let root = arena.push(BoundKind::Distinct { seq: s }, Ty::seq(Ty::Text));

    let mut bindings = GlobalBindings::new();
    bindings.set(
        interner.intern("s"),
        Value::seq(vec![Value::text("A"), Value::text("a"), Value::text("B")]),
    );

    assert_eq!(
        eval(&arena, root, &bindings, true),
        Value::seq(vec![Value::text("A"), Value::text("B")])
    );
    assert_eq!(
        eval(&arena, root, &bindings, false),
        Value::seq(vec![Value::text("A"), Value::text("a"), Value::text("B")])
    );
}

#[test]
fn record_construction_sorts_fields_by_name() {
    let mut arena = BoundArena::new();
    let interner = StringInterner::new();
    let b = interner.intern("b");
    let a = interner.intern("a");
    let one = int(&mut arena, 1);
    let two = int(&mut arena, 2);
    let shape = Ty::record(vec![(b, Ty::Int), (a, Ty::Int)]);
    let root = arena.push(
        BoundKind::Record {
            shape: shape.clone(),
            fields: vec![(b, one), (a, two)],
        },
        shape,
    );

    let out = eval(&arena, root, &GlobalBindings::new(), false);
    let record = out.as_record().expect("record");
    assert_eq!(record.get(a), Some(&Value::Int(2)));
    assert_eq!(record.get(b), Some(&Value::Int(1)));
}

#[test]
fn aggregate_equality_goes_through_the_comparer() {
    let mut arena = BoundArena::new();
    let interner = StringInterner::new();
    let l = global(&mut arena, &interner, "l", Ty::seq(Ty::Int));
    let r = global(&mut arena, &interner, "r", Ty::seq(Ty::Int));
    let root = binary(&mut arena, BinOp::Ne, l, r, Ty::Bool);

    let mut bindings = GlobalBindings::new();
    bindings.set(interner.intern("l"), int_seq(&[1, 2]));
    bindings.set(interner.intern("r"), int_seq(&[1, 2]));
    assert_eq!(eval(&arena, root, &bindings, false), Value::Bool(false));

    bindings.set(interner.intern("r"), int_seq(&[1, 3]));
    assert_eq!(eval(&arena, root, &bindings, false), Value::Bool(true));
}

#[test]
fn module_equality_is_rejected_at_compile_time() {
    let mut arena = BoundArena::new();
    let interner = StringInterner::new();
    let shape = Arc::new(rill_ir::RecordTy::new(vec![]));
    let l = global(&mut arena, &interner, "l", Ty::Module(Arc::clone(&shape)));
    let r = global(&mut arena, &interner, "r", Ty::Module(shape));
    let root = binary(&mut arena, BinOp::Eq, l, r, Ty::Bool);

    let err = compile(&arena, root).expect_err("must fail");
    assert!(matches!(err, CodegenError::NotComparable { .. }));
    assert!(err.is_invalid_input());
}

#[test]
fn shared_node_evaluates_once_per_occurrence() {
    // g + g with g bound once: both occurrences read the same slot.
    let mut arena = BoundArena::new();
    let interner = StringInterner::new();
    let g = global(&mut arena, &interner, "g", Ty::Int);
    let root = binary(&mut arena, BinOp::Add, g, g, Ty::Int);

    let mut bindings = GlobalBindings::new();
    bindings.set(interner.intern("g"), Value::Int(21));
    assert_eq!(eval(&arena, root, &bindings, false), Value::Int(42));
}

#[test]
fn compilation_is_behaviorally_deterministic() {
    let mut arena = BoundArena::new();
    let interner = StringInterner::new();
    let s = global(&mut arena, &interner, "s", Ty::seq(Ty::Int));
    let token = arena.fresh_token();
    let x = arena.push(BoundKind::ScopeRef { token }, Ty::Int);
    let two = int(&mut arena, 2);
    let body = binary(&mut arena, BinOp::Mul, x, two, Ty::Int);
    let root = arena.push(
        BoundKind::Map { seq: s, token, body },
        Ty::seq(Ty::Int),
    );

    let mut bindings = GlobalBindings::new();
    bindings.set(interner.intern("s"), int_seq(&[3, 4]));
    let ctx = ExecCtx::default();

    let first = compile(&arena, root).expect("compile");
    let second = compile(&arena, root).expect("compile");
    assert_eq!(
        first.evaluate(&bindings, &ctx).expect("evaluate"),
        second.evaluate(&bindings, &ctx).expect("evaluate")
    );
}
