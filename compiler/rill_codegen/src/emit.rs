//! Codegen orchestration.
//!
//! The orchestrator walks the bound graph a second time, in exactly the
//! analyzer's order, emitting instructions into one routine builder per
//! capture boundary that needs its own routine. The [`ScopeMap`] tells it,
//! at each boundary, which outer scopes to capture, whether to thread the
//! externals tuple, and whether to thread the execution context; because
//! both walks share one ordering, occurrence indices line up and no
//! re-analysis happens during emission.
//!
//! Parameter conventions (fixed, relied on by the runtime drivers):
//! - root routine: `([externals tuple], [context])`
//! - boundary routine: `(own scope value, captures in scope-index order,
//!   [externals tuple], [context])`
//! - module setter and maker: see [`module`].

use std::sync::Arc;

use rill_ir::{BinOp, BoundArena, BoundId, BoundKind, Name, ProjectionOverride, Ty};
use rill_rt::{EntryPoint, ExecCtx, ExecError, ExecResult, Instr, Value};
use rustc_hash::FxHashMap;

use crate::equality::{ComparerProvider, StandardComparers};
use crate::routine::{LocalSlot, ParamTy, RoutineBuilder};
use crate::scope_map::{analyze, ArgId, GlobalSlot, ScopeId, ScopeMap};
use crate::{CodegenError, CodegenResult};

mod module;

/// Where a scope's value lives within the routine under construction.
enum ScopeLoc {
    Arg(u32),
    Local(LocalSlot),
}

/// One routine under construction plus the emission context its
/// instructions assume.
struct Frame {
    builder: RoutineBuilder,
    /// Scopes whose values are reachable from this routine.
    scope_locs: FxHashMap<ScopeId, ScopeLoc>,
    /// Parameter holding the externals tuple, when threaded.
    externals_param: Option<u32>,
    /// Parameter holding the execution context, when threaded.
    ctx_param: Option<u32>,
}

impl Frame {
    fn new(name: String, params: Vec<ParamTy>, result: Ty) -> Self {
        Self {
            builder: RoutineBuilder::new(name, params, result),
            scope_locs: FxHashMap::default(),
            externals_param: None,
            ctx_param: None,
        }
    }

    fn load_scope(&mut self, scope: ScopeId) -> CodegenResult<()> {
        match self.scope_locs.get(&scope) {
            Some(ScopeLoc::Arg(n)) => {
                self.builder.emit_load_arg(*n);
                Ok(())
            }
            Some(ScopeLoc::Local(slot)) => {
                self.builder.emit_load_local(slot);
                Ok(())
            }
            None => Err(CodegenError::Internal("scope value not reachable in frame")),
        }
    }

    /// Store the stack top back into a scope's slot. Only meaningful for
    /// scopes held in locals (the items-in-progress tuple).
    fn store_scope(&mut self, scope: ScopeId) -> CodegenResult<()> {
        match self.scope_locs.get(&scope) {
            Some(ScopeLoc::Local(slot)) => {
                self.builder.emit_store_local(slot);
                Ok(())
            }
            _ => Err(CodegenError::Internal("scope value is not writable")),
        }
    }

    fn load_externals(&mut self) -> CodegenResult<()> {
        let param = self
            .externals_param
            .ok_or(CodegenError::Internal("externals tuple not threaded"))?;
        self.builder.emit_load_arg(param);
        Ok(())
    }

    fn load_ctx(&mut self) -> CodegenResult<()> {
        let param = self
            .ctx_param
            .ok_or(CodegenError::Internal("execution context not threaded"))?;
        self.builder.emit_load_arg(param);
        Ok(())
    }
}

/// A compiled expression: the root entry point plus the binding surface
/// the caller needs to invoke it.
#[derive(Debug)]
pub struct CompiledExpr {
    entry: EntryPoint,
    global_slots: Vec<GlobalSlot>,
    uses_globals: bool,
    uses_ctx: bool,
}

impl CompiledExpr {
    pub fn entry(&self) -> &EntryPoint {
        &self.entry
    }

    /// Externals-tuple layout, in first-reference order. Empty when the
    /// expression references no globals and no self value.
    pub fn global_slots(&self) -> &[GlobalSlot] {
        &self.global_slots
    }

    pub fn uses_globals(&self) -> bool {
        self.uses_globals
    }

    pub fn uses_exec_ctx(&self) -> bool {
        self.uses_ctx
    }

    /// Evaluate against bindings and a context, assembling the externals
    /// tuple in slot order.
    pub fn evaluate(&self, bindings: &GlobalBindings, ctx: &ExecCtx) -> ExecResult<Value> {
        let mut args = Vec::with_capacity(2);
        if self.uses_globals {
            let mut slots = Vec::with_capacity(self.global_slots.len());
            for slot in &self.global_slots {
                let value = match slot.name {
                    Some(name) => bindings.values.get(&name).cloned(),
                    None => bindings.this.clone(),
                };
                slots.push(value.ok_or(ExecError::MissingGlobal {
                    global: slot.name.map_or(u32::MAX, Name::raw),
                })?);
            }
            args.push(Value::tuple(slots));
        }
        if self.uses_ctx {
            args.push(Value::Ctx(Arc::new(ctx.clone())));
        }
        self.entry.invoke(&args)
    }
}

/// Values for the free variables (and the self value) a compiled
/// expression references.
#[derive(Default)]
pub struct GlobalBindings {
    values: FxHashMap<Name, Value>,
    this: Option<Value>,
}

impl GlobalBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: Name, value: Value) -> &mut Self {
        self.values.insert(name, value);
        self
    }

    pub fn set_this(&mut self, value: Value) -> &mut Self {
        self.this = Some(value);
        self
    }
}

/// Compile a bound graph with the stock comparer provider.
pub fn compile(graph: &BoundArena, root: BoundId) -> CodegenResult<CompiledExpr> {
    compile_with(graph, root, &StandardComparers)
}

/// Compile a bound graph: analyze, then emit routines for the root and
/// every boundary that needs one.
#[tracing::instrument(level = "debug", skip_all)]
pub fn compile_with(
    graph: &BoundArena,
    root: BoundId,
    comparers: &dyn ComparerProvider,
) -> CodegenResult<CompiledExpr> {
    let map = analyze(graph, root)?;

    let uses_globals = map.uses_globals(ArgId::ROOT);
    let uses_ctx = map.uses_exec_ctx(ArgId::ROOT);
    let mut params = Vec::new();
    if uses_globals {
        params.push(ParamTy::Externals);
    }
    if uses_ctx {
        params.push(ParamTy::Ctx);
    }
    let mut frame = Frame::new("expr".to_string(), params, graph.ty(root).clone());
    if uses_globals {
        frame.externals_param = Some(0);
    }
    if uses_ctx {
        frame.ctx_param = Some(u32::from(uses_globals));
    }

    let mut emitter = Emitter {
        graph,
        map: &map,
        comparers,
        pos: 0,
    };
    emitter.emit_expr(&mut frame, root)?;
    if emitter.pos != map.total_nodes() {
        return Err(CodegenError::Internal("emission drifted from analysis"));
    }
    frame.builder.emit(Instr::Return);
    let entry = frame.builder.finish()?;

    tracing::debug!(
        routine = entry.name(),
        globals = map.global_slots().len(),
        uses_ctx,
        "compilation complete"
    );
    Ok(CompiledExpr {
        entry,
        global_slots: map.global_slots().to_vec(),
        uses_globals,
        uses_ctx,
    })
}

struct Emitter<'a> {
    graph: &'a BoundArena,
    map: &'a ScopeMap,
    comparers: &'a dyn ComparerProvider,
    /// Next occurrence index; advances in lockstep with the analyzer's
    /// traversal.
    pos: u32,
}

impl Emitter<'_> {
    /// Emit instructions leaving the node's value on the stack.
    fn emit_expr(&mut self, frame: &mut Frame, id: BoundId) -> CodegenResult<()> {
        let my_pos = self.pos;
        self.pos += 1;

        match self.graph.kind(id) {
            BoundKind::Null => frame.builder.emit_const(Value::Null),
            BoundKind::Bool(b) => frame.builder.emit_const(Value::Bool(*b)),
            BoundKind::Int(n) => frame.builder.emit_const(Value::Int(*n)),
            BoundKind::Float(f) => frame.builder.emit_const(Value::Float(*f)),
            BoundKind::Text(text) => {
                let text = Arc::clone(text);
                frame.builder.emit_const(Value::Text(text));
            }
            BoundKind::Global { name } => {
                let slot = self
                    .map
                    .global_slot(Some(*name))
                    .ok_or(CodegenError::Internal("global missing from slot table"))?;
                frame.load_externals()?;
                frame.builder.emit(Instr::Index(slot));
            }
            BoundKind::This => {
                let slot = self
                    .map
                    .global_slot(None)
                    .ok_or(CodegenError::Internal("self missing from slot table"))?;
                frame.load_externals()?;
                frame.builder.emit(Instr::Index(slot));
            }
            BoundKind::ScopeRef { .. } => {
                let scope = self
                    .map
                    .resolved_scope(my_pos)
                    .ok_or(CodegenError::Internal("unresolved occurrence at emission"))?;
                frame.load_scope(scope)?;
            }
            BoundKind::ItemRef { item, .. } => {
                let scope = self
                    .map
                    .resolved_scope(my_pos)
                    .ok_or(CodegenError::Internal("unresolved occurrence at emission"))?;
                frame.load_scope(scope)?;
                frame.builder.emit(Instr::Index(*item));
            }
            BoundKind::Binary { op, left, right } => {
                let (op, left, right) = (*op, *left, *right);
                self.emit_binary(frame, op, left, right)?;
            }
            BoundKind::Call { func, args } => {
                let func = *func;
                let args = args.clone();
                for arg in args {
                    self.emit_expr(frame, arg)?;
                }
                if func.needs_exec_ctx() {
                    frame.load_ctx()?;
                }
                frame.builder.emit(Instr::CallBuiltin(func));
            }
            BoundKind::Map { seq, token, body } => {
                let (seq, token, body) = (*seq, *token, *body);
                self.emit_iteration(frame, my_pos, "map", seq, token, body, |body, extra| {
                    Instr::MapSeq { body, extra }
                })?;
            }
            BoundKind::Filter { seq, token, pred } => {
                let (seq, token, pred) = (*seq, *token, *pred);
                self.emit_iteration(frame, my_pos, "filter", seq, token, pred, |body, extra| {
                    Instr::FilterSeq { body, extra }
                })?;
            }
            BoundKind::Sum {
                seq,
                token,
                selector,
            } => {
                let (seq, token, selector) = (*seq, *token, *selector);
                self.emit_iteration(frame, my_pos, "sum", seq, token, selector, |body, extra| {
                    Instr::SumSeq { body, extra }
                })?;
            }
            BoundKind::Distinct { seq } => {
                let seq = *seq;
                let elem_ty = self
                    .graph
                    .ty(seq)
                    .seq_item()
                    .cloned()
                    .ok_or(CodegenError::Internal("distinct over a non-sequence"))?;
                let set = self.comparers.resolve(&elem_ty)?;
                self.emit_expr(frame, seq)?;
                frame.load_ctx()?;
                frame.builder.emit(Instr::DistinctSeq {
                    strict: set.default,
                    loose: set.loose,
                });
            }
            BoundKind::With { value, token, body } => {
                let (value, token, body) = (*value, *token, *body);
                self.emit_expr(frame, value)?;
                let scope = self
                    .map
                    .scope_for(my_pos, token)
                    .ok_or(CodegenError::Internal("binding scope missing from map"))?;
                let slot = frame.builder.alloc_local(self.graph.ty(value));
                frame.builder.emit_store_local(&slot);
                frame.scope_locs.insert(scope, ScopeLoc::Local(slot));
                self.emit_expr(frame, body)?;
                // Dropping the loc releases the slot for reuse.
                frame.scope_locs.remove(&scope);
            }
            BoundKind::Record { fields, .. } => {
                let fields = fields.clone();
                let names: Arc<[Name]> = fields.iter().map(|&(name, _)| name).collect();
                for (_, value) in fields {
                    self.emit_expr(frame, value)?;
                }
                frame.builder.emit(Instr::MakeRecord(names));
            }
            BoundKind::Module { token, items } => {
                let (token, items) = (*token, items.clone());
                self.emit_module(frame, my_pos, token, &items)?;
            }
            BoundKind::ModuleProjection { module, with } => {
                let (module, with) = (*module, with.clone());
                self.emit_expr(frame, module)?;
                match with {
                    ProjectionOverride::Fields(fields) => {
                        let names: Arc<[Name]> = fields.iter().map(|&(name, _)| name).collect();
                        for (_, value) in fields {
                            self.emit_expr(frame, value)?;
                        }
                        frame.builder.emit(Instr::MakePartial(Arc::clone(&names)));
                        frame.builder.emit(Instr::ModuleUpdate { names });
                    }
                    ProjectionOverride::Record(record) => {
                        self.emit_expr(frame, record)?;
                        frame.builder.emit(Instr::ModuleUpdateRecord);
                    }
                }
            }
        }
        Ok(())
    }

    fn emit_binary(
        &mut self,
        frame: &mut Frame,
        op: BinOp,
        left: BoundId,
        right: BoundId,
    ) -> CodegenResult<()> {
        // Equality over aggregates goes through the comparer service so a
        // non-comparable operand type fails at compile time, not at run
        // time.
        let compare_with = match op {
            BinOp::Eq | BinOp::Ne => {
                let ty = self.graph.ty(left);
                match ty {
                    Ty::Seq(_) | Ty::Tuple(_) | Ty::Record(_) | Ty::Module(_) => {
                        Some(self.comparers.resolve(ty)?.default)
                    }
                    _ => None,
                }
            }
            _ => None,
        };
        self.emit_expr(frame, left)?;
        self.emit_expr(frame, right)?;
        match compare_with {
            Some(cmp) => {
                frame.builder.emit(Instr::EqWith(cmp));
                if op == BinOp::Ne {
                    frame.builder.emit(Instr::Not);
                }
            }
            None if op.needs_exec_ctx() => {
                frame.load_ctx()?;
                frame.builder.emit(Instr::BinaryCtx(op));
            }
            None => frame.builder.emit(Instr::Binary(op)),
        }
        Ok(())
    }

    /// Emit a per-element driver: the body becomes its own routine invoked
    /// once per element with `(element, captures..., [externals], [ctx])`.
    ///
    /// The driver instruction pops the sequence then the extras, so the
    /// extras are pushed first and the sequence last.
    #[expect(clippy::too_many_arguments, reason = "one call site per iteration kind")]
    fn emit_iteration(
        &mut self,
        frame: &mut Frame,
        my_pos: u32,
        kind: &str,
        seq: BoundId,
        token: rill_ir::ScopeToken,
        body: BoundId,
        driver: impl FnOnce(EntryPoint, u32) -> Instr,
    ) -> CodegenResult<()> {
        let arg = self
            .map
            .nested_arg_for(my_pos, 1)
            .ok_or(CodegenError::Internal("boundary missing from map"))?;
        let scope = self
            .map
            .scope_for(my_pos, token)
            .ok_or(CodegenError::Internal("iteration scope missing from map"))?;
        let captures = self.map.find_capture_set(arg)?;
        let needs_globals = self.map.uses_globals(arg);
        let needs_ctx = self.map.uses_exec_ctx(arg);

        // Extras, pushed in the order the body routine's trailing
        // parameters expect them.
        for &cap in &captures {
            frame.load_scope(cap)?;
        }
        if needs_globals {
            frame.load_externals()?;
        }
        if needs_ctx {
            frame.load_ctx()?;
        }
        let extra_count = captures.len() + usize::from(needs_globals) + usize::from(needs_ctx);
        let extra = u32::try_from(extra_count)
            .map_err(|_| CodegenError::Internal("capture count exceeds u32"))?;

        self.emit_expr(frame, seq)?;

        let mut params = Vec::with_capacity(1 + extra_count);
        params.push(ParamTy::Val(self.map.scope(scope).ty.clone()));
        for &cap in &captures {
            params.push(ParamTy::Val(self.map.scope(cap).ty.clone()));
        }
        if needs_globals {
            params.push(ParamTy::Externals);
        }
        if needs_ctx {
            params.push(ParamTy::Ctx);
        }
        let mut body_frame = Frame::new(
            format!("{kind}#{my_pos}"),
            params,
            self.graph.ty(body).clone(),
        );
        body_frame.scope_locs.insert(scope, ScopeLoc::Arg(0));
        let mut next_param = 1u32;
        for &cap in &captures {
            body_frame.scope_locs.insert(cap, ScopeLoc::Arg(next_param));
            next_param += 1;
        }
        if needs_globals {
            body_frame.externals_param = Some(next_param);
            next_param += 1;
        }
        if needs_ctx {
            body_frame.ctx_param = Some(next_param);
        }
        self.emit_expr(&mut body_frame, body)?;
        body_frame.builder.emit(Instr::Return);
        let entry = body_frame.builder.finish()?;

        frame.builder.emit(driver(entry, extra));
        Ok(())
    }
}

#[cfg(test)]
mod tests;
