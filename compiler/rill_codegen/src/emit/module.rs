//! Module-construct assembly.
//!
//! A module lowers to two generated routines plus a constructor call in the
//! enclosing routine:
//!
//! 1. **items-setter** `(skip-flags, take-flags, override, items,
//!    [externals]) → items`: walks every item slot; a skipped slot keeps
//!    its current value, a taken slot is read from the override record,
//!    and every other slot re-evaluates its formula against the
//!    items-in-progress tuple.
//! 2. the **eager initial call**: the enclosing routine invokes the setter
//!    with all-false flags, an empty override, and an all-null items tuple
//!    to compute the initial items.
//! 3. **record-maker** `(items) → record`: projects the exported item
//!    slots into the module's record shape.
//! 4. the **constructor**: bundles setter, maker, descriptor, initial
//!    items, and (when the formulas reference globals) the externals tuple
//!    into a module value.
//!
//! Incremental update re-invokes the setter with real flags; that path
//! lives on [`rill_rt::ModuleValue`].

use std::sync::Arc;

use rill_ir::{ModuleItem, Name, ScopeToken, Ty};
use rill_rt::{Instr, ModuleAssembly, ModuleDescriptor, PartialRecord, Value};

use super::{Emitter, Frame, ScopeLoc};
use crate::routine::{ParamTy, RoutineBuilder};
use crate::{CodegenError, CodegenResult};

/// Setter parameter layout; the externals tuple, when present, follows.
const SETTER_SKIPS: u32 = 0;
const SETTER_TAKES: u32 = 1;
const SETTER_OVERRIDE: u32 = 2;
const SETTER_ITEMS: u32 = 3;
const SETTER_FIXED_PARAMS: usize = 4;

impl Emitter<'_> {
    /// Emit a module construct, leaving the module value on the stack.
    pub(super) fn emit_module(
        &mut self,
        frame: &mut Frame,
        my_pos: u32,
        token: ScopeToken,
        items: &[ModuleItem],
    ) -> CodegenResult<()> {
        let arg = self
            .map
            .nested_arg_for(my_pos, -1)
            .ok_or(CodegenError::Internal("module boundary missing from map"))?;
        let scope = self
            .map
            .scope_for(my_pos, token)
            .ok_or(CodegenError::Internal("items scope missing from map"))?;
        // The setter outlives the enclosing activation (updates re-invoke
        // it arbitrarily later), so its formulas may only reach values
        // that live inside the module value itself: items, the override,
        // and the read-only externals tuple.
        if !self.map.find_capture_set(arg)?.is_empty() {
            return Err(CodegenError::Unsupported(
                "module construct capturing an enclosing scope",
            ));
        }
        if self.map.uses_exec_ctx(arg) {
            return Err(CodegenError::Unsupported(
                "context-sensitive operation inside a module item",
            ));
        }
        let has_externals = self.map.uses_globals(arg);
        let item_count = u32::try_from(items.len())
            .map_err(|_| CodegenError::Internal("item count exceeds u32"))?;

        // Phase 1: the items-setter.
        let items_ty = self.map.scope(scope).ty.clone();
        let mut setter_params = vec![
            ParamTy::Flags,
            ParamTy::Flags,
            ParamTy::Partial,
            ParamTy::Val(items_ty.clone()),
        ];
        if has_externals {
            setter_params.push(ParamTy::Externals);
        }
        let mut setter = Frame::new(
            format!("module-setter#{my_pos}"),
            setter_params,
            items_ty.clone(),
        );
        if has_externals {
            setter.externals_param = Some(SETTER_ITEMS + 1);
        }
        let cur = setter.builder.alloc_local(&items_ty);
        setter.builder.emit_load_arg(SETTER_ITEMS);
        setter.builder.emit_store_local(&cur);
        setter.scope_locs.insert(scope, ScopeLoc::Local(cur));

        for (i, item) in items.iter().enumerate() {
            let slot = u32::try_from(i)
                .map_err(|_| CodegenError::Internal("item count exceeds u32"))?;
            let next = setter.builder.new_label();
            if item.settable {
                setter.builder.emit_load_arg(SETTER_SKIPS);
                setter.builder.emit(Instr::Index(slot));
                setter.builder.emit_jump_if_true(next);

                let evaluate = setter.builder.new_label();
                setter.builder.emit_load_arg(SETTER_TAKES);
                setter.builder.emit(Instr::Index(slot));
                setter.builder.emit_jump_if_false(evaluate);

                // Taken: replace the slot with the override's field.
                setter.load_scope(scope)?;
                setter.builder.emit_load_arg(SETTER_OVERRIDE);
                setter.builder.emit(Instr::FieldGet(item.name));
                setter.builder.emit(Instr::TupleWith(slot));
                setter.store_scope(scope)?;
                setter.builder.emit_jump(next);

                setter.builder.bind_label(evaluate);
            }
            // Re-evaluate the formula against the items-in-progress tuple.
            setter.load_scope(scope)?;
            self.emit_expr(&mut setter, item.value)?;
            setter.builder.emit(Instr::TupleWith(slot));
            setter.store_scope(scope)?;
            setter.builder.bind_label(next);
        }
        setter.load_scope(scope)?;
        setter.builder.emit(Instr::Return);
        let setter_entry = setter.builder.finish()?;

        // Phase 3: the record-maker.
        let exported: Vec<(Name, u32)> = items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.exported)
            .map(|(i, item)| (item.name, slot_u32(i)))
            .collect();
        let record_ty = Ty::record(
            items
                .iter()
                .filter(|item| item.exported)
                .map(|item| (item.name, self.graph.ty(item.value).clone()))
                .collect(),
        );
        let mut maker = RoutineBuilder::new(
            format!("module-maker#{my_pos}"),
            vec![ParamTy::Val(items_ty)],
            record_ty,
        );
        for &(_, item_slot) in &exported {
            maker.emit_load_arg(0);
            maker.emit(Instr::Index(item_slot));
        }
        let field_names: Arc<[Name]> = exported.iter().map(|&(name, _)| name).collect();
        maker.emit(Instr::MakeRecord(field_names));
        maker.emit(Instr::Return);
        let maker_entry = maker.finish()?;

        let symbols: Vec<(Name, u32)> = items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.settable)
            .map(|(i, item)| (item.name, slot_u32(i)))
            .collect();
        let assembly = Arc::new(ModuleAssembly {
            setter: setter_entry.clone(),
            maker: maker_entry,
            descriptor: ModuleDescriptor {
                item_count,
                fields: exported,
                symbols,
            },
            has_externals,
        });

        // Phase 2: the eager initial call, in the enclosing routine.
        let n = items.len();
        frame.builder.emit_const(Value::flags(vec![false; n]));
        frame.builder.emit_const(Value::flags(vec![false; n]));
        frame
            .builder
            .emit_const(Value::Partial(PartialRecord::empty()));
        frame.builder.emit_const(Value::tuple(vec![Value::Null; n]));
        let mut argc = u32::try_from(SETTER_FIXED_PARAMS)
            .unwrap_or_else(|_| unreachable!("fixed param count fits u32"));
        if has_externals {
            frame.load_externals()?;
            argc += 1;
        }
        frame.builder.emit(Instr::CallEntry {
            entry: setter_entry,
            argc,
        });

        // Phase 4: the constructor.
        if has_externals {
            frame.load_externals()?;
        }
        frame.builder.emit(Instr::MakeModule { assembly });
        Ok(())
    }
}

fn slot_u32(i: usize) -> u32 {
    u32::try_from(i).unwrap_or_else(|_| unreachable!("item index exceeds u32"))
}
