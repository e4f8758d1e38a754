//! Bound expression graph.
//!
//! The bound graph is the backend's input: an immutable, typed expression
//! graph produced by the binder. Nodes live in a flat arena and reference
//! children by [`BoundId`]; the same node may be referenced from multiple
//! parents (the graph is a DAG, not a tree). Each node records its subtree
//! node count at allocation time, which lets a traversal address every
//! *occurrence* by its pre-order position without parent pointers: a node
//! at position `i` with count `n` owns exactly the half-open position range
//! `[i, i + n)`.

use std::fmt;
use std::sync::Arc;

use crate::{Name, Ty};

/// Index into the bound arena.
///
/// 4 bytes, O(1) equality, contiguous storage. `u32::MAX` is the invalid
/// sentinel, following the flat-arena convention.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct BoundId(u32);

impl BoundId {
    /// Invalid node ID (sentinel value).
    pub const INVALID: BoundId = BoundId(u32::MAX);

    #[inline]
    pub const fn new(index: u32) -> Self {
        BoundId(index)
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

impl fmt::Debug for BoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "BoundId({})", self.0)
        } else {
            write!(f, "BoundId::INVALID")
        }
    }
}

impl Default for BoundId {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Opaque capability identifying one introduced set of nameable values
/// (e.g. the loop variable of an iteration).
///
/// Tokens are allocated by the graph builder. A token must not be
/// re-introduced while already active in its own ancestor chain, but may
/// be reused in disjoint sibling contexts.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
#[repr(transparent)]
pub struct ScopeToken(u32);

impl ScopeToken {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        ScopeToken(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Binary operators.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    /// Text concatenation.
    Concat,
    /// Membership: `left in right` where right is a sequence.
    In,
    /// Text equality honoring the execution context's case mode.
    TextEqCi,
}

impl BinOp {
    /// Whether evaluating this operator requires the ambient execution
    /// context. Fixed allow-list; kept in one place so a per-operator
    /// capability flag can replace it later.
    pub fn needs_exec_ctx(self) -> bool {
        matches!(self, BinOp::In | BinOp::TextEqCi)
    }
}

/// Builtin functions callable from the graph.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Builtin {
    Abs,
    Min,
    Max,
    /// Sequence length.
    Count,
    Lower,
    Upper,
    /// Substring search honoring the execution context's case mode.
    Contains,
}

impl Builtin {
    /// Whether this call form requires the ambient execution context.
    pub fn needs_exec_ctx(self) -> bool {
        matches!(self, Builtin::Contains)
    }
}

/// One item of a module construct: a named formula slot.
#[derive(Clone, Debug)]
pub struct ModuleItem {
    /// Item name; also the record field name when `exported`.
    pub name: Name,
    /// The item's formula.
    pub value: BoundId,
    /// Whether the item appears as a field of the evaluated record.
    pub exported: bool,
    /// Whether the item is a publicly settable symbol (parameter or free
    /// variable); settable items can be overridden through projection.
    pub settable: bool,
}

/// Override source for a module projection.
#[derive(Clone, Debug)]
pub enum ProjectionOverride {
    /// Explicit `field: value` list.
    Fields(Vec<(Name, BoundId)>),
    /// A record-typed expression; every one of its fields overrides.
    Record(BoundId),
}

/// Bound-graph node kinds.
#[derive(Clone, Debug)]
pub enum BoundKind {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Text literal; carries its content directly (the interner holds
    /// identifiers, not literal payloads).
    Text(Arc<str>),
    /// Reference to an external free variable.
    Global { name: Name },
    /// The distinguished self reference.
    This,
    /// Use of a previously introduced scope token.
    ScopeRef { token: ScopeToken },
    /// Use of one slot of a module's items scope: the scope value is the
    /// items-in-progress tuple, and `item` addresses a slot in it.
    ItemRef { token: ScopeToken, item: u32 },
    Binary {
        op: BinOp,
        left: BoundId,
        right: BoundId,
    },
    Call {
        func: Builtin,
        args: Vec<BoundId>,
    },
    /// Per-element transform: `seq` iterated, `body` evaluated once per
    /// element with `token` bound to the element.
    Map {
        seq: BoundId,
        token: ScopeToken,
        body: BoundId,
    },
    /// Per-element keep/drop: `pred` must be boolean.
    Filter {
        seq: BoundId,
        token: ScopeToken,
        pred: BoundId,
    },
    /// Aggregation: sum of `selector` over the elements.
    Sum {
        seq: BoundId,
        token: ScopeToken,
        selector: BoundId,
    },
    /// Distinct elements under the execution context's case mode.
    Distinct { seq: BoundId },
    /// Single-value binding evaluated once in the same activation.
    With {
        value: BoundId,
        token: ScopeToken,
        body: BoundId,
    },
    /// Record construction; one capture boundary per field.
    Record {
        shape: Ty,
        fields: Vec<(Name, BoundId)>,
    },
    /// Module construct: items scope + settable symbols.
    Module {
        token: ScopeToken,
        items: Vec<ModuleItem>,
    },
    /// Projection: a module value with some symbols overridden.
    ModuleProjection {
        module: BoundId,
        with: ProjectionOverride,
    },
}

/// One bound node: kind, result type, subtree node count.
#[derive(Clone, Debug)]
pub struct BoundNode {
    kind: BoundKind,
    ty: Ty,
    node_count: u32,
}

impl BoundNode {
    pub fn kind(&self) -> &BoundKind {
        &self.kind
    }

    pub fn ty(&self) -> &Ty {
        &self.ty
    }

    /// Number of nodes in this subtree, including this node. Shared
    /// children are counted once per reference, matching occurrence
    /// addressing.
    pub fn node_count(&self) -> u32 {
        self.node_count
    }
}

/// Flat arena of bound nodes.
#[derive(Default)]
pub struct BoundArena {
    nodes: Vec<BoundNode>,
    next_token: u32,
}

impl BoundArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a node, computing its subtree count from its children.
    ///
    /// Children must already be allocated in this arena.
    pub fn push(&mut self, kind: BoundKind, ty: Ty) -> BoundId {
        let mut count: u32 = 1;
        self.for_each_child_of(&kind, |child| {
            count += self.nodes[child.index()].node_count;
        });
        let id = u32::try_from(self.nodes.len()).unwrap_or_else(|_| {
            unreachable!("bound arena capacity exceeded")
        });
        self.nodes.push(BoundNode {
            kind,
            ty,
            node_count: count,
        });
        BoundId::new(id)
    }

    /// Allocate a fresh scope token.
    pub fn fresh_token(&mut self) -> ScopeToken {
        let token = ScopeToken::from_raw(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn node(&self, id: BoundId) -> &BoundNode {
        &self.nodes[id.index()]
    }

    pub fn kind(&self, id: BoundId) -> &BoundKind {
        &self.nodes[id.index()].kind
    }

    pub fn ty(&self, id: BoundId) -> &Ty {
        &self.nodes[id.index()].ty
    }

    pub fn node_count(&self, id: BoundId) -> u32 {
        self.nodes[id.index()].node_count
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Visit each direct child of a kind, in evaluation (pre-order) order.
    ///
    /// This is the single source of truth for child ordering; the subtree
    /// counts, the analyzer, and the orchestrator all follow it.
    pub fn for_each_child_of(&self, kind: &BoundKind, mut f: impl FnMut(BoundId)) {
        match kind {
            BoundKind::Null
            | BoundKind::Bool(_)
            | BoundKind::Int(_)
            | BoundKind::Float(_)
            | BoundKind::Text(_)
            | BoundKind::Global { .. }
            | BoundKind::This
            | BoundKind::ScopeRef { .. }
            | BoundKind::ItemRef { .. } => {}
            BoundKind::Binary { left, right, .. } => {
                f(*left);
                f(*right);
            }
            BoundKind::Call { args, .. } => {
                for &arg in args {
                    f(arg);
                }
            }
            BoundKind::Map { seq, body, .. } => {
                f(*seq);
                f(*body);
            }
            BoundKind::Filter { seq, pred, .. } => {
                f(*seq);
                f(*pred);
            }
            BoundKind::Sum { seq, selector, .. } => {
                f(*seq);
                f(*selector);
            }
            BoundKind::Distinct { seq } => f(*seq),
            BoundKind::With { value, body, .. } => {
                f(*value);
                f(*body);
            }
            BoundKind::Record { fields, .. } => {
                for &(_, value) in fields {
                    f(value);
                }
            }
            BoundKind::Module { items, .. } => {
                for item in items {
                    f(item.value);
                }
            }
            BoundKind::ModuleProjection { module, with } => {
                f(*module);
                match with {
                    ProjectionOverride::Fields(fields) => {
                        for &(_, value) in fields {
                            f(value);
                        }
                    }
                    ProjectionOverride::Record(record) => f(*record),
                }
            }
        }
    }

    /// Direct children of a node, in evaluation order.
    pub fn children(&self, id: BoundId) -> Vec<BoundId> {
        let mut out = Vec::new();
        self.for_each_child_of(self.kind(id), |child| out.push(child));
        out
    }
}
