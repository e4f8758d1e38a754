//! Rill IR - bound expression graph for the Rill compiler backend.
//!
//! The bound graph is produced by the upstream binder/type checker and
//! consumed by `rill_codegen`. It is immutable once built, typed on every
//! node, and may share sub-expressions between parents (a DAG). Each node
//! carries its subtree node count so traversals can address occurrences by
//! pre-order position.
//!
//! # Contents
//!
//! - `Name` / `StringInterner`: compact interned identifiers
//! - `Ty` / `RecordTy`: structural semantic types
//! - `BoundArena` / `BoundId` / `BoundKind`: the graph itself
//! - `ScopeToken`: scope capabilities introduced by owner nodes

mod interner;
mod name;
mod node;
mod ty;

pub use interner::StringInterner;
pub use name::Name;
pub use node::{
    BinOp, BoundArena, BoundId, BoundKind, BoundNode, Builtin, ModuleItem, ProjectionOverride,
    ScopeToken,
};
pub use ty::{RecordTy, Ty};
