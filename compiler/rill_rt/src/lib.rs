//! Rill RT - runtime substrate for routines generated by `rill_codegen`.
//!
//! Provides the value model, the routine/instruction format, and a small
//! stack interpreter. Finalized routines ([`EntryPoint`]) are immutable
//! and safe to invoke concurrently and repeatedly.
//!
//! # Contents
//!
//! - `Value` and friends: runtime values with `Arc`-shared aggregates
//! - `RecordValue` / `PartialRecord`: complete vs partially populated records
//! - `ModuleValue`: record + recompute/update machinery
//! - `Instr` / `Routine` / `EntryPoint`: the generated routine format
//! - `ExecCtx`: ambient execution context (case mode)

mod ctx;
mod error;
pub mod exec;
mod module;
mod record;
mod value;

pub use ctx::ExecCtx;
pub use error::{ExecError, ExecResult};
pub use exec::{eval_binary, eval_binary_ctx, EntryPoint, Instr, Routine};
pub use module::{ModuleAssembly, ModuleDescriptor, ModuleValue};
pub use record::{PartialRecord, RecordValue};
pub use value::{ClosureValue, Comparer, Value};

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rill_ir::BinOp;
    use std::sync::Arc;

    fn entry(name: &str, params: usize, locals: usize, instrs: Vec<Instr>) -> EntryPoint {
        EntryPoint::new(Routine::new(name.to_string(), params, locals, instrs))
    }

    #[test]
    fn const_return() {
        let ep = entry("k", 0, 0, vec![Instr::Const(Value::Int(42)), Instr::Return]);
        assert_eq!(ep.invoke(&[]), Ok(Value::Int(42)));
    }

    #[test]
    fn arity_checked() {
        let ep = entry("k", 1, 0, vec![Instr::LoadArg(0), Instr::Return]);
        assert!(matches!(
            ep.invoke(&[]),
            Err(ExecError::ArityMismatch { .. })
        ));
    }

    #[test]
    fn binary_add_and_div_by_zero() {
        let add = entry(
            "add",
            2,
            0,
            vec![
                Instr::LoadArg(0),
                Instr::LoadArg(1),
                Instr::Binary(BinOp::Add),
                Instr::Return,
            ],
        );
        assert_eq!(
            add.invoke(&[Value::Int(2), Value::Int(3)]),
            Ok(Value::Int(5))
        );

        let div = entry(
            "div",
            2,
            0,
            vec![
                Instr::LoadArg(0),
                Instr::LoadArg(1),
                Instr::Binary(BinOp::Div),
                Instr::Return,
            ],
        );
        assert_eq!(
            div.invoke(&[Value::Int(1), Value::Int(0)]),
            Err(ExecError::DivideByZero)
        );
    }

    #[test]
    fn locals_and_jumps() {
        // if arg0 { 1 } else { 2 }
        let ep = entry(
            "pick",
            1,
            1,
            vec![
                Instr::LoadArg(0),
                Instr::JumpIfFalse(4),
                Instr::Const(Value::Int(1)),
                Instr::Jump(5),
                Instr::Const(Value::Int(2)),
                Instr::StoreLocal(0),
                Instr::LoadLocal(0),
                Instr::Return,
            ],
        );
        assert_eq!(ep.invoke(&[Value::Bool(true)]), Ok(Value::Int(1)));
        assert_eq!(ep.invoke(&[Value::Bool(false)]), Ok(Value::Int(2)));
    }

    #[test]
    fn map_seq_invokes_body_per_element() {
        // body: (element, addend) -> element + addend
        let body = entry(
            "body",
            2,
            0,
            vec![
                Instr::LoadArg(0),
                Instr::LoadArg(1),
                Instr::Binary(BinOp::Add),
                Instr::Return,
            ],
        );
        let main = entry(
            "main",
            0,
            0,
            vec![
                Instr::Const(Value::Int(10)),
                Instr::Const(Value::seq(vec![
                    Value::Int(1),
                    Value::Int(2),
                    Value::Int(3),
                ])),
                Instr::MapSeq { body, extra: 1 },
                Instr::Return,
            ],
        );
        assert_eq!(
            main.invoke(&[]),
            Ok(Value::seq(vec![
                Value::Int(11),
                Value::Int(12),
                Value::Int(13)
            ]))
        );
    }

    #[test]
    fn tuple_with_replaces_one_slot() {
        let ep = entry(
            "upd",
            0,
            0,
            vec![
                Instr::Const(Value::tuple(vec![Value::Int(1), Value::Int(2)])),
                Instr::Const(Value::Int(9)),
                Instr::TupleWith(1),
                Instr::Return,
            ],
        );
        assert_eq!(
            ep.invoke(&[]),
            Ok(Value::tuple(vec![Value::Int(1), Value::Int(9)]))
        );
    }

    #[test]
    fn membership_uses_context_case_mode() {
        let hay = Value::seq(vec![Value::text("Apple"), Value::text("Pear")]);
        let ci = ExecCtx::new(true);
        let cs = ExecCtx::new(false);
        assert_eq!(
            eval_binary_ctx(BinOp::In, &Value::text("apple"), &hay, &ci),
            Ok(Value::Bool(true))
        );
        assert_eq!(
            eval_binary_ctx(BinOp::In, &Value::text("apple"), &hay, &cs),
            Ok(Value::Bool(false))
        );
    }

    #[test]
    fn pop_discards_the_stack_top() {
        let ep = entry(
            "pop",
            0,
            0,
            vec![
                Instr::Const(Value::Int(99)),
                Instr::Const(Value::Int(42)),
                Instr::Pop,
                Instr::Return,
            ],
        );
        assert_eq!(ep.invoke(&[]), Ok(Value::Int(99)));
    }

    #[test]
    fn tuple_and_seq_construction_keep_push_order() {
        let tup = entry(
            "tup",
            0,
            0,
            vec![
                Instr::Const(Value::Int(1)),
                Instr::Const(Value::Int(2)),
                Instr::MakeTuple(2),
                Instr::Return,
            ],
        );
        assert_eq!(
            tup.invoke(&[]),
            Ok(Value::tuple(vec![Value::Int(1), Value::Int(2)]))
        );

        let seq = entry(
            "seq",
            0,
            0,
            vec![
                Instr::Const(Value::Int(1)),
                Instr::Const(Value::Int(2)),
                Instr::MakeSeq(2),
                Instr::Return,
            ],
        );
        assert_eq!(
            seq.invoke(&[]),
            Ok(Value::seq(vec![Value::Int(1), Value::Int(2)]))
        );
    }

    #[test]
    fn closures_build_and_call_through_instructions() {
        // body: (arg, capture) -> arg * capture
        let body = entry(
            "body",
            2,
            0,
            vec![
                Instr::LoadArg(0),
                Instr::LoadArg(1),
                Instr::Binary(BinOp::Mul),
                Instr::Return,
            ],
        );
        let main = entry(
            "main",
            0,
            0,
            vec![
                Instr::Const(Value::Int(4)),
                Instr::MakeClosure {
                    entry: body,
                    captures: 1,
                },
                Instr::Const(Value::Int(5)),
                Instr::CallClosure { argc: 1 },
                Instr::Return,
            ],
        );
        assert_eq!(main.invoke(&[]), Ok(Value::Int(20)));
    }

    #[test]
    fn assembled_module_nests_and_updates_through_its_externals() {
        let interner = rill_ir::StringInterner::new();
        let a = interner.intern("a");

        // setter: (skips, takes, override, items, externals) -> items with
        // slot 0 replaced by externals[0]
        let setter = entry(
            "set",
            5,
            0,
            vec![
                Instr::LoadArg(3),
                Instr::LoadArg(4),
                Instr::Index(0),
                Instr::TupleWith(0),
                Instr::Return,
            ],
        );
        let maker = entry(
            "mk",
            1,
            0,
            vec![
                Instr::LoadArg(0),
                Instr::Index(0),
                Instr::MakeRecord(Arc::from(vec![a])),
                Instr::Return,
            ],
        );
        let assembly = Arc::new(ModuleAssembly {
            setter: setter.clone(),
            maker,
            descriptor: ModuleDescriptor {
                item_count: 1,
                fields: vec![(a, 0)],
                symbols: vec![],
            },
            has_externals: true,
        });
        let main = entry(
            "main",
            0,
            0,
            vec![
                Instr::Const(Value::flags(vec![false])),
                Instr::Const(Value::flags(vec![false])),
                Instr::Const(Value::Partial(PartialRecord::empty())),
                Instr::Const(Value::tuple(vec![Value::Null])),
                Instr::Const(Value::tuple(vec![Value::Int(7)])),
                Instr::CallEntry {
                    entry: setter,
                    argc: 5,
                },
                Instr::Const(Value::tuple(vec![Value::Int(7)])),
                Instr::MakeModule { assembly },
                Instr::Return,
            ],
        );

        let out = main.invoke(&[]).expect("assemble");
        let module = match &out {
            Value::Module(m) => m.clone(),
            other => panic!("expected module, got {other:?}"),
        };
        assert_eq!(module.record().expect("record").get(a), Some(&Value::Int(7)));

        // Module values nest inside other values like any aggregate.
        let nested = Value::seq(vec![out]);
        assert_eq!(nested.as_seq().expect("seq").len(), 1);

        // An empty update re-invokes the setter against the stored
        // externals tuple.
        let updated = module
            .update(&PartialRecord::empty(), &[])
            .expect("update");
        assert_eq!(updated.record().expect("record").get(a), Some(&Value::Int(7)));
    }

    #[test]
    fn closure_appends_captures() {
        let body = entry(
            "body",
            2,
            0,
            vec![
                Instr::LoadArg(0),
                Instr::LoadArg(1),
                Instr::Binary(BinOp::Mul),
                Instr::Return,
            ],
        );
        let closure = ClosureValue::new(body, Arc::from(vec![Value::Int(4)]));
        assert_eq!(closure.invoke(&[Value::Int(5)]), Ok(Value::Int(20)));
        assert_eq!(closure.captures(), &[Value::Int(4)]);
    }
}
