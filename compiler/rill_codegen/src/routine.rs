//! Routine construction.
//!
//! [`RoutineBuilder`] accumulates instructions for one routine and finalizes
//! them into an invocable [`EntryPoint`]. Finalization consumes the builder,
//! so a finalized routine can never be appended to and double finalization
//! is unrepresentable.
//!
//! Local slots are handed out as [`LocalSlot`] handles backed by per-type
//! free lists: releasing a handle returns its slot for reuse by a later
//! acquisition of the same type, so N sequential same-typed temporaries
//! share one slot while N simultaneously-live temporaries get N distinct
//! slots. Release is idempotent (dropping a handle releases it too), but
//! emitting through a released handle is a bug in the emitter and panics.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use rill_ir::Ty;
use rill_rt::{ClosureValue, EntryPoint, Instr, Routine, Value};
use rustc_hash::FxHashMap;

use crate::{CodegenError, CodegenResult};

/// Forward-reference jump target. Created unbound, bound once to an
/// instruction position, resolved at finalization.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Label(u32);

/// Declared shape of one routine parameter.
///
/// Values flowing out of the bound graph carry their semantic [`Ty`]; the
/// remaining shapes are backend plumbing with no bound-graph counterpart.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ParamTy {
    /// A bound-graph value of the given type.
    Val(Ty),
    /// The externals tuple: free variables plus the self value.
    Externals,
    /// The threaded execution context.
    Ctx,
    /// A per-item flag array (module setter input).
    Flags,
    /// A partial record (module override input).
    Partial,
}

/// Handle to one local slot of the routine under construction.
///
/// The handle owns the slot while active; releasing (or dropping) it
/// returns the slot to the builder's pool for its type.
pub struct LocalSlot {
    index: u32,
    ty: Ty,
    active: bool,
    pool: Weak<RefCell<FxHashMap<Ty, Vec<u32>>>>,
}

impl LocalSlot {
    /// Raw slot index, for tests and debug output.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn ty(&self) -> &Ty {
        &self.ty
    }

    /// Whether the slot is still usable for emission. `false` after
    /// [`release`](LocalSlot::release), and for any handle that outlives
    /// its builder.
    pub fn is_active(&self) -> bool {
        self.active && self.pool.strong_count() > 0
    }

    /// Return the slot to the pool. Idempotent; the handle only reports
    /// "no longer active" afterwards.
    pub fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(pool) = self.pool.upgrade() {
            pool.borrow_mut()
                .entry(self.ty.clone())
                .or_default()
                .push(self.index);
        }
    }

    fn active_index(&self) -> u32 {
        assert!(self.active, "use of a released local slot");
        self.index
    }
}

impl Drop for LocalSlot {
    fn drop(&mut self) {
        self.release();
    }
}

/// Single-routine instruction accumulator.
///
/// A thin, stateful emission surface plus the slot pool; it does not
/// understand bound-graph semantics.
pub struct RoutineBuilder {
    name: String,
    params: Vec<ParamTy>,
    result: Ty,
    instrs: Vec<Instr>,
    /// Bound position per label, `None` while unbound.
    labels: Vec<Option<u32>>,
    /// Instruction indices whose jump target is still a label id.
    fixups: Vec<(usize, Label)>,
    /// Released slot indices, keyed by exact slot type.
    free_slots: Rc<RefCell<FxHashMap<Ty, Vec<u32>>>>,
    /// High-water local count.
    locals: u32,
}

impl RoutineBuilder {
    pub fn new(name: impl Into<String>, params: Vec<ParamTy>, result: Ty) -> Self {
        Self {
            name: name.into(),
            params,
            result,
            instrs: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            free_slots: Rc::new(RefCell::new(FxHashMap::default())),
            locals: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared parameter shapes, in argument order.
    pub fn params(&self) -> &[ParamTy] {
        &self.params
    }

    /// Declared result type.
    pub fn result(&self) -> &Ty {
        &self.result
    }

    /// Next instruction position.
    pub fn pos(&self) -> usize {
        self.instrs.len()
    }

    pub fn emit(&mut self, instr: Instr) {
        self.instrs.push(instr);
    }

    pub fn emit_const(&mut self, value: Value) {
        self.instrs.push(Instr::Const(value));
    }

    pub fn emit_load_arg(&mut self, n: u32) {
        self.instrs.push(Instr::LoadArg(n));
    }

    /// Claim a local slot for values of the given type, reusing a released
    /// slot of the same exact type when one is free.
    pub fn alloc_local(&mut self, ty: &Ty) -> LocalSlot {
        let reused = self
            .free_slots
            .borrow_mut()
            .get_mut(ty)
            .and_then(Vec::pop);
        let index = match reused {
            Some(index) => index,
            None => {
                let index = self.locals;
                self.locals += 1;
                index
            }
        };
        LocalSlot {
            index,
            ty: ty.clone(),
            active: true,
            pool: Rc::downgrade(&self.free_slots),
        }
    }

    pub fn emit_load_local(&mut self, slot: &LocalSlot) {
        self.instrs.push(Instr::LoadLocal(slot.active_index()));
    }

    pub fn emit_store_local(&mut self, slot: &LocalSlot) {
        self.instrs.push(Instr::StoreLocal(slot.active_index()));
    }

    pub fn new_label(&mut self) -> Label {
        let id = u32::try_from(self.labels.len())
            .unwrap_or_else(|_| unreachable!("label count exceeds u32"));
        self.labels.push(None);
        Label(id)
    }

    /// Bind a label to the current position. Each label binds exactly once.
    pub fn bind_label(&mut self, label: Label) {
        let slot = &mut self.labels[label.0 as usize];
        debug_assert!(slot.is_none(), "label bound twice");
        *slot = Some(
            u32::try_from(self.instrs.len())
                .unwrap_or_else(|_| unreachable!("instruction count exceeds u32")),
        );
    }

    pub fn emit_jump(&mut self, label: Label) {
        self.fixups.push((self.instrs.len(), label));
        self.instrs.push(Instr::Jump(u32::MAX));
    }

    pub fn emit_jump_if_false(&mut self, label: Label) {
        self.fixups.push((self.instrs.len(), label));
        self.instrs.push(Instr::JumpIfFalse(u32::MAX));
    }

    pub fn emit_jump_if_true(&mut self, label: Label) {
        self.fixups.push((self.instrs.len(), label));
        self.instrs.push(Instr::JumpIfTrue(u32::MAX));
    }

    /// Resolve labels and freeze into an invocable entry point. Consuming
    /// `self` retires every outstanding slot handle.
    pub fn finish(mut self) -> CodegenResult<EntryPoint> {
        for &(at, label) in &self.fixups {
            let target = self.labels[label.0 as usize]
                .ok_or(CodegenError::Internal("jump to an unbound label"))?;
            match &mut self.instrs[at] {
                Instr::Jump(t) | Instr::JumpIfFalse(t) | Instr::JumpIfTrue(t) => *t = target,
                _ => return Err(CodegenError::Internal("label fixup on a non-jump")),
            }
        }
        tracing::trace!(
            name = %self.name,
            params = self.params.len(),
            result = %self.result,
            locals = self.locals,
            instrs = self.instrs.len(),
            "routine finalized"
        );
        Ok(EntryPoint::new(Routine::new(
            self.name,
            self.params.len(),
            self.locals as usize,
            self.instrs,
        )))
    }

    /// Finalize into a first-class closure value bound to the given
    /// captures (appended as trailing arguments on invocation).
    pub fn finish_bound(self, captures: Vec<Value>) -> CodegenResult<ClosureValue> {
        let entry = self.finish()?;
        Ok(ClosureValue::new(entry, captures.into()))
    }
}
