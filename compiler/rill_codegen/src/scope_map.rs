//! Scope and reference analysis.
//!
//! One pre-order traversal of the bound graph, producing an immutable
//! [`ScopeMap`] the orchestrator consults during emission. The traversal
//! numbers every node occurrence, records scope introductions and uses,
//! records capture boundaries, and indexes all global, execution-context,
//! and scope references.
//!
//! Because the traversal is a single DFS with strict push/pop discipline,
//! every reference recorded between a boundary's push and its pop forms one
//! contiguous range in each reference list. "Does this subtree use a
//! global / the execution context" is then an O(1) range-nonempty check,
//! and "which outer scopes does this subtree capture" is a linear scan of
//! one contiguous slice; no tree walk happens at emission time.

use rill_ir::{BoundArena, BoundId, BoundKind, Name, ProjectionOverride, ScopeToken, Ty};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::{CodegenError, CodegenResult};

/// Index of a [`ScopeInfo`] in the analysis result. Index 0 is the blank
/// root sentinel.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[repr(transparent)]
pub struct ScopeId(u32);

impl ScopeId {
    /// The blank root scope.
    pub const ROOT: ScopeId = ScopeId(0);

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a [`NestedArg`] in the analysis result. Index 0 is the root
/// boundary covering the whole compiled expression.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(transparent)]
pub struct ArgId(u32);

impl ArgId {
    /// The root boundary.
    pub const ROOT: ArgId = ArgId(0);

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Half-open range `[min, lim)` into one of the reference lists.
#[derive(Copy, Clone, Default, Eq, PartialEq, Debug)]
pub struct RefRange {
    pub min: u32,
    pub lim: u32,
}

impl RefRange {
    pub fn is_empty(self) -> bool {
        self.min >= self.lim
    }

    pub fn as_range(self) -> std::ops::Range<usize> {
        self.min as usize..self.lim as usize
    }
}

/// One scope *introduction*. The same token may be introduced at multiple
/// disjoint points; each introduction gets its own `ScopeInfo`.
#[derive(Clone, Debug)]
pub struct ScopeInfo {
    pub index: ScopeId,
    /// Immediately enclosing scope.
    pub outer: ScopeId,
    /// `None` only for the blank root.
    pub token: Option<ScopeToken>,
    /// Owning node and its occurrence index.
    pub owner: BoundId,
    pub owner_pos: u32,
    /// Owner-specific slot; non-negative = positional argument slot,
    /// negative = reserved synthetic slot (−1 = items-in-progress tuple).
    pub slot: i32,
    /// `outer.depth + 1`; the root has depth 0.
    pub depth: u32,
    /// Type of the value this scope binds.
    pub ty: Ty,
}

/// One capture boundary: a point where a sub-expression may become its own
/// routine because it is evaluated in a different activation.
#[derive(Clone, Debug)]
pub struct NestedArg {
    pub index: ArgId,
    pub outer: ArgId,
    /// Base scope of the boundary: the innermost scope active while its
    /// subtree is visited. For a boundary that introduces a scope (an
    /// iteration body, a module's items-setter) this is the introduced
    /// scope itself, which the boundary's routine receives as its own
    /// scope parameter; references to it are locals, references to
    /// anything outside it are captures.
    pub scope: ScopeId,
    pub owner: BoundId,
    pub owner_pos: u32,
    pub slot: i32,
    pub depth: u32,
    /// Whether the sub-expression is evaluated repeatedly in a different
    /// activation and therefore needs its own routine.
    pub needs_own_routine: bool,
    /// Ranges into the three reference lists covering this boundary's
    /// subtree.
    pub globals: RefRange,
    pub ctx_uses: RefRange,
    pub scope_refs: RefRange,
}

/// One slot of the external-capture tuple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalSlot {
    /// `None` for the distinguished self reference.
    pub name: Option<Name>,
    pub ty: Ty,
}

/// One recorded global/self reference.
#[derive(Copy, Clone, Debug)]
pub struct GlobalRef {
    /// Occurrence index of the referencing node.
    pub pos: u32,
    /// Index into [`ScopeMap::global_slots`].
    pub slot: u32,
}

/// One recorded use of a scope token.
#[derive(Copy, Clone, Debug)]
pub struct ScopeRefUse {
    pub pos: u32,
    /// The introduction the use resolved to.
    pub scope: ScopeId,
}

/// Immutable analysis result.
#[derive(Debug)]
pub struct ScopeMap {
    scopes: Vec<ScopeInfo>,
    args: Vec<NestedArg>,
    globals: Vec<GlobalRef>,
    ctx_uses: Vec<u32>,
    scope_refs: Vec<ScopeRefUse>,
    /// Occurrence index → node, for positional lookup.
    nodes_by_pos: Vec<BoundId>,
    /// Occurrence index of a scope-reference node → resolved introduction.
    resolved: FxHashMap<u32, ScopeId>,
    /// Owner occurrence → slot-sorted nested args.
    args_by_owner: FxHashMap<u32, Vec<(i32, ArgId)>>,
    global_slots: Vec<GlobalSlot>,
    global_index: FxHashMap<Option<Name>, u32>,
}

impl ScopeMap {
    pub fn scope(&self, id: ScopeId) -> &ScopeInfo {
        &self.scopes[id.index()]
    }

    pub fn arg(&self, id: ArgId) -> &NestedArg {
        &self.args[id.index()]
    }

    pub fn scopes(&self) -> &[ScopeInfo] {
        &self.scopes
    }

    pub fn args(&self) -> &[NestedArg] {
        &self.args
    }

    pub fn globals(&self) -> &[GlobalRef] {
        &self.globals
    }

    pub fn ctx_uses(&self) -> &[u32] {
        &self.ctx_uses
    }

    pub fn scope_refs(&self) -> &[ScopeRefUse] {
        &self.scope_refs
    }

    /// Layout of the external-capture tuple, in first-appearance order.
    pub fn global_slots(&self) -> &[GlobalSlot] {
        &self.global_slots
    }

    /// Externals-tuple slot of a global (`None` = self), if referenced.
    pub fn global_slot(&self, name: Option<Name>) -> Option<u32> {
        self.global_index.get(&name).copied()
    }

    /// Total number of node occurrences in the traversal.
    pub fn total_nodes(&self) -> u32 {
        u32::try_from(self.nodes_by_pos.len()).unwrap_or(u32::MAX)
    }

    /// Node at an occurrence index.
    pub fn node_at(&self, pos: u32) -> Option<BoundId> {
        self.nodes_by_pos.get(pos as usize).copied()
    }

    /// Introduction a scope-reference occurrence resolved to.
    pub fn resolved_scope(&self, pos: u32) -> Option<ScopeId> {
        self.resolved.get(&pos).copied()
    }

    /// Scope introduced by an owner occurrence for a given token.
    pub fn scope_for(&self, owner_pos: u32, token: ScopeToken) -> Option<ScopeId> {
        self.scopes
            .iter()
            .find(|s| s.owner_pos == owner_pos && s.token == Some(token))
            .map(|s| s.index)
    }

    /// Nested arg introduced by an owner occurrence at a given slot.
    ///
    /// Binary search: a wide field-set owner may have very many nested
    /// args, one per field.
    pub fn nested_arg_for(&self, owner_pos: u32, slot: i32) -> Option<ArgId> {
        let slots = self.args_by_owner.get(&owner_pos)?;
        slots
            .binary_search_by_key(&slot, |&(s, _)| s)
            .ok()
            .map(|i| slots[i].1)
    }

    /// Whether `a` is an ancestor-or-self of `b` in the scope chain.
    ///
    /// Holds iff walking `b`'s outer chain up to `a`'s depth reaches
    /// exactly `a`.
    pub fn encompasses(&self, a: ScopeId, b: ScopeId) -> bool {
        let target_depth = self.scope(a).depth;
        let mut cur = b;
        while self.scope(cur).depth > target_depth {
            cur = self.scope(cur).outer;
        }
        cur == a
    }

    /// Whether the boundary's subtree references any global or the self
    /// value.
    pub fn uses_globals(&self, arg: ArgId) -> bool {
        !self.arg(arg).globals.is_empty()
    }

    /// Whether the boundary's subtree contains an execution-context-
    /// sensitive operation.
    pub fn uses_exec_ctx(&self, arg: ArgId) -> bool {
        !self.arg(arg).ctx_uses.is_empty()
    }

    /// Partition the boundary's scope references against its base scope.
    ///
    /// References to scopes defined within the base are locals of the
    /// boundary's own routine and are skipped; references to scopes
    /// defined outside must be captured from the enclosing activation and
    /// are returned, deduplicated, in scope-index order. A reference that
    /// is neither an ancestor nor a descendant of the base scope indicates
    /// corrupted analysis state (scope nesting is tree-structured), which
    /// is an internal error.
    pub fn find_capture_set(&self, arg: ArgId) -> CodegenResult<SmallVec<[ScopeId; 4]>> {
        let info = self.arg(arg);
        let base = info.scope;
        let mut captures: SmallVec<[ScopeId; 4]> = SmallVec::new();
        for use_ in &self.scope_refs[info.scope_refs.as_range()] {
            let scope = use_.scope;
            if self.encompasses(base, scope) {
                // Introduced within the boundary: a local, not a capture.
                continue;
            }
            if !self.encompasses(scope, base) {
                return Err(CodegenError::Internal(
                    "scope reference neither inside nor outside its boundary",
                ));
            }
            if !captures.contains(&scope) {
                captures.push(scope);
            }
        }
        captures.sort_unstable();
        Ok(captures)
    }
}

/// Analyze a bound graph, producing the scope/reference index.
///
/// Fails on a malformed graph: nested token reuse, unresolved scope
/// references, inconsistent global typing, duplicate projection override
/// fields, or subtree-count bookkeeping that disagrees with the traversal.
#[tracing::instrument(level = "debug", skip_all)]
pub fn analyze(graph: &BoundArena, root: BoundId) -> CodegenResult<ScopeMap> {
    let mut analyzer = Analyzer::new(graph);
    analyzer.visit(root)?;

    debug_assert_eq!(analyzer.cur_scope, ScopeId::ROOT, "unbalanced scope stack");
    debug_assert_eq!(analyzer.cur_arg, ArgId::ROOT, "unbalanced boundary stack");

    analyzer.finish()
}

struct Analyzer<'a> {
    graph: &'a BoundArena,
    /// Next occurrence index.
    pos: u32,
    cur_scope: ScopeId,
    cur_arg: ArgId,
    scopes: Vec<ScopeInfo>,
    args: Vec<NestedArg>,
    globals: Vec<GlobalRef>,
    ctx_uses: Vec<u32>,
    scope_refs: Vec<ScopeRefUse>,
    nodes_by_pos: Vec<BoundId>,
    resolved: FxHashMap<u32, ScopeId>,
    args_by_owner: FxHashMap<u32, Vec<(i32, ArgId)>>,
    global_slots: Vec<GlobalSlot>,
    global_index: FxHashMap<Option<Name>, u32>,
}

impl<'a> Analyzer<'a> {
    /// Fresh state: both stacks start at the index-0 sentinels.
    fn new(graph: &'a BoundArena) -> Self {
        Analyzer {
            graph,
            pos: 0,
            cur_scope: ScopeId::ROOT,
            cur_arg: ArgId::ROOT,
            scopes: vec![ScopeInfo {
                index: ScopeId::ROOT,
                outer: ScopeId::ROOT,
                token: None,
                owner: BoundId::INVALID,
                owner_pos: 0,
                slot: 0,
                depth: 0,
                ty: Ty::Null,
            }],
            args: vec![NestedArg {
                index: ArgId::ROOT,
                outer: ArgId::ROOT,
                scope: ScopeId::ROOT,
                owner: BoundId::INVALID,
                owner_pos: 0,
                slot: 0,
                depth: 0,
                needs_own_routine: true,
                globals: RefRange::default(),
                ctx_uses: RefRange::default(),
                scope_refs: RefRange::default(),
            }],
            globals: Vec::new(),
            ctx_uses: Vec::new(),
            scope_refs: Vec::new(),
            nodes_by_pos: Vec::new(),
            resolved: FxHashMap::default(),
            args_by_owner: FxHashMap::default(),
            global_slots: Vec::new(),
            global_index: FxHashMap::default(),
        }
    }

    fn finish(mut self) -> CodegenResult<ScopeMap> {
        // Close the root boundary's ranges over the full lists.
        let globals_len = len_u32(self.globals.len());
        let ctx_len = len_u32(self.ctx_uses.len());
        let refs_len = len_u32(self.scope_refs.len());
        {
            let root = &mut self.args[ArgId::ROOT.index()];
            root.globals.lim = globals_len;
            root.ctx_uses.lim = ctx_len;
            root.scope_refs.lim = refs_len;
        }
        for slots in self.args_by_owner.values_mut() {
            slots.sort_unstable_by_key(|&(slot, _)| slot);
        }
        tracing::debug!(
            nodes = self.nodes_by_pos.len(),
            scopes = self.scopes.len(),
            boundaries = self.args.len(),
            globals = self.globals.len(),
            "analysis complete"
        );
        Ok(ScopeMap {
            scopes: self.scopes,
            args: self.args,
            globals: self.globals,
            ctx_uses: self.ctx_uses,
            scope_refs: self.scope_refs,
            nodes_by_pos: self.nodes_by_pos,
            resolved: self.resolved,
            args_by_owner: self.args_by_owner,
            global_slots: self.global_slots,
            global_index: self.global_index,
        })
    }

    fn visit(&mut self, id: BoundId) -> CodegenResult<()> {
        let my_pos = self.pos;
        self.pos += 1;
        self.nodes_by_pos.push(id);
        let expected_end = my_pos + self.graph.node_count(id);

        match self.graph.kind(id) {
            BoundKind::Null
            | BoundKind::Bool(_)
            | BoundKind::Int(_)
            | BoundKind::Float(_)
            | BoundKind::Text(_) => {}
            BoundKind::Global { name } => {
                self.record_global(my_pos, Some(*name), self.graph.ty(id).clone())?;
            }
            BoundKind::This => {
                self.record_global(my_pos, None, self.graph.ty(id).clone())?;
            }
            BoundKind::ScopeRef { token } | BoundKind::ItemRef { token, .. } => {
                self.record_scope_ref(my_pos, *token)?;
            }
            BoundKind::Binary { op, left, right } => {
                if op.needs_exec_ctx() {
                    self.ctx_uses.push(my_pos);
                }
                let (left, right) = (*left, *right);
                self.visit(left)?;
                self.visit(right)?;
            }
            BoundKind::Call { func, args } => {
                if func.needs_exec_ctx() {
                    self.ctx_uses.push(my_pos);
                }
                let args = args.clone();
                for arg in args {
                    self.visit(arg)?;
                }
            }
            BoundKind::Map { seq, token, body }
            | BoundKind::Filter {
                seq,
                token,
                pred: body,
            }
            | BoundKind::Sum {
                seq,
                token,
                selector: body,
            } => {
                let (seq, token, body) = (*seq, *token, *body);
                self.visit(seq)?;
                let elem_ty = self
                    .graph
                    .ty(seq)
                    .seq_item()
                    .cloned()
                    .ok_or(CodegenError::Internal("iteration over a non-sequence"))?;
                let scope = self.push_scope(id, my_pos, token, 0, elem_ty)?;
                let arg = self.push_arg(id, my_pos, 1, true);
                self.visit(body)?;
                self.pop_arg(arg);
                self.pop_scope(scope, token);
            }
            BoundKind::Distinct { seq } => {
                self.ctx_uses.push(my_pos);
                let seq = *seq;
                self.visit(seq)?;
            }
            BoundKind::With { value, token, body } => {
                let (value, token, body) = (*value, *token, *body);
                self.visit(value)?;
                let value_ty = self.graph.ty(value).clone();
                // Evaluated once in the caller's activation: a boundary,
                // but not its own routine.
                let scope = self.push_scope(id, my_pos, token, 0, value_ty)?;
                let arg = self.push_arg(id, my_pos, 1, false);
                self.visit(body)?;
                self.pop_arg(arg);
                self.pop_scope(scope, token);
            }
            BoundKind::Record { fields, .. } => {
                let fields: Vec<BoundId> = fields.iter().map(|&(_, v)| v).collect();
                for (i, value) in fields.into_iter().enumerate() {
                    let arg = self.push_arg(id, my_pos, slot_i32(i), false);
                    self.visit(value)?;
                    self.pop_arg(arg);
                }
            }
            BoundKind::Module { token, items } => {
                let token = *token;
                let item_values: Vec<BoundId> = items.iter().map(|item| item.value).collect();
                let item_tys: Vec<Ty> = item_values
                    .iter()
                    .map(|&v| self.graph.ty(v).clone())
                    .collect();
                // The whole construct is a boundary (the items-setter gets
                // its own routine); slot −1 marks it synthetic so it never
                // collides with an item slot.
                let scope = self.push_scope(id, my_pos, token, -1, Ty::tuple(item_tys))?;
                let arg = self.push_arg(id, my_pos, -1, true);
                for (i, value) in item_values.into_iter().enumerate() {
                    let item_arg = self.push_arg(id, my_pos, slot_i32(i), false);
                    self.visit(value)?;
                    self.pop_arg(item_arg);
                }
                self.pop_arg(arg);
                self.pop_scope(scope, token);
            }
            BoundKind::ModuleProjection { module, with } => {
                let module = *module;
                let with = with.clone();
                if let ProjectionOverride::Fields(fields) = &with {
                    let mut seen = FxHashSet::default();
                    for &(name, _) in fields {
                        if !seen.insert(name) {
                            return Err(CodegenError::DuplicateOverrideField { name });
                        }
                    }
                }
                self.visit(module)?;
                match with {
                    ProjectionOverride::Fields(fields) => {
                        for (_, value) in fields {
                            self.visit(value)?;
                        }
                    }
                    ProjectionOverride::Record(record) => self.visit(record)?,
                }
            }
        }

        if self.pos != expected_end {
            return Err(CodegenError::NodeCountMismatch { pos: my_pos });
        }
        Ok(())
    }

    fn record_global(&mut self, pos: u32, name: Option<Name>, ty: Ty) -> CodegenResult<()> {
        let slot = match self.global_index.get(&name) {
            Some(&slot) => {
                // Type must be consistent across all references to the
                // same name.
                if self.global_slots[slot as usize].ty != ty {
                    return Err(CodegenError::GlobalTypeMismatch {
                        name: name.unwrap_or_default(),
                    });
                }
                slot
            }
            None => {
                let slot = len_u32(self.global_slots.len());
                self.global_slots.push(GlobalSlot { name, ty });
                self.global_index.insert(name, slot);
                slot
            }
        };
        self.globals.push(GlobalRef { pos, slot });
        Ok(())
    }

    fn record_scope_ref(&mut self, pos: u32, token: ScopeToken) -> CodegenResult<()> {
        // Resolve by walking the current chain outward.
        let mut cur = self.cur_scope;
        loop {
            let info = &self.scopes[cur.index()];
            if info.token == Some(token) {
                break;
            }
            if cur == ScopeId::ROOT {
                return Err(CodegenError::UnresolvedScopeRef { token, pos });
            }
            cur = info.outer;
        }
        self.scope_refs.push(ScopeRefUse { pos, scope: cur });
        self.resolved.insert(pos, cur);
        Ok(())
    }

    fn push_scope(
        &mut self,
        owner: BoundId,
        owner_pos: u32,
        token: ScopeToken,
        slot: i32,
        ty: Ty,
    ) -> CodegenResult<ScopeId> {
        // A token must not be re-introduced while active in its own
        // ancestor chain (disjoint sibling reuse is fine).
        let mut cur = self.cur_scope;
        loop {
            let info = &self.scopes[cur.index()];
            if info.token == Some(token) {
                return Err(CodegenError::NestedTokenReuse { token });
            }
            if cur == ScopeId::ROOT {
                break;
            }
            cur = info.outer;
        }

        let index = ScopeId(len_u32(self.scopes.len()));
        let depth = self.scopes[self.cur_scope.index()].depth + 1;
        self.scopes.push(ScopeInfo {
            index,
            outer: self.cur_scope,
            token: Some(token),
            owner,
            owner_pos,
            slot,
            depth,
            ty,
        });
        self.cur_scope = index;
        Ok(index)
    }

    fn pop_scope(&mut self, scope: ScopeId, token: ScopeToken) {
        let info = &self.scopes[self.cur_scope.index()];
        debug_assert_eq!(self.cur_scope, scope, "popping a non-current scope");
        debug_assert_eq!(info.token, Some(token), "popped token mismatch");
        self.cur_scope = info.outer;
    }

    fn push_arg(&mut self, owner: BoundId, owner_pos: u32, slot: i32, needs_own_routine: bool) -> ArgId {
        let index = ArgId(len_u32(self.args.len()));
        let depth = self.args[self.cur_arg.index()].depth + 1;
        self.args.push(NestedArg {
            index,
            outer: self.cur_arg,
            scope: self.cur_scope,
            owner,
            owner_pos,
            slot,
            depth,
            needs_own_routine,
            // Provisional: `min` is the list length at entry; `lim` is
            // filled at pop.
            globals: RefRange {
                min: len_u32(self.globals.len()),
                lim: 0,
            },
            ctx_uses: RefRange {
                min: len_u32(self.ctx_uses.len()),
                lim: 0,
            },
            scope_refs: RefRange {
                min: len_u32(self.scope_refs.len()),
                lim: 0,
            },
        });
        self.args_by_owner
            .entry(owner_pos)
            .or_default()
            .push((slot, index));
        self.cur_arg = index;
        index
    }

    fn pop_arg(&mut self, arg: ArgId) {
        debug_assert_eq!(self.cur_arg, arg, "popping a non-current boundary");
        let globals_len = len_u32(self.globals.len());
        let ctx_len = len_u32(self.ctx_uses.len());
        let refs_len = len_u32(self.scope_refs.len());
        let info = &mut self.args[arg.index()];
        info.globals.lim = globals_len;
        info.ctx_uses.lim = ctx_len;
        info.scope_refs.lim = refs_len;
        self.cur_arg = info.outer;
    }
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or_else(|_| unreachable!("list length exceeds u32"))
}

fn slot_i32(i: usize) -> i32 {
    i32::try_from(i).unwrap_or_else(|_| unreachable!("slot index exceeds i32"))
}
