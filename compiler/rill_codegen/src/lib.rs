//! Rill codegen - the expression-to-routine backend.
//!
//! Takes an immutable, typed bound graph (produced by an upstream binder)
//! and compiles it into one or more callable routines for the `rill_rt`
//! substrate. The pipeline has three stages:
//!
//! 1. **analysis** ([`scope_map`]): one pre-order traversal numbering every
//!    node occurrence, resolving scope references, and indexing global,
//!    execution-context, and scope references into contiguous per-boundary
//!    ranges;
//! 2. **routine construction** ([`routine`]): an instruction accumulator
//!    with pooled local slots and label backpatching;
//! 3. **orchestration** ([`emit`]): a second traversal in the same order,
//!    emitting one routine per capture boundary that needs its own
//!    activation and assembling the module construct's multi-routine
//!    protocol.
//!
//! Compilation is a pure function of the input graph; it either returns a
//! complete [`CompiledExpr`] or fails with a [`CodegenError`], never a
//! partial artifact.

pub mod emit;
pub mod equality;
mod error;
pub mod routine;
pub mod scope_map;

pub use emit::{compile, compile_with, CompiledExpr, GlobalBindings};
pub use equality::{ComparerProvider, ComparerSet, StandardComparers};
pub use error::{CodegenError, CodegenResult};
pub use routine::{Label, LocalSlot, ParamTy, RoutineBuilder};
pub use scope_map::{analyze, ArgId, GlobalSlot, NestedArg, RefRange, ScopeId, ScopeInfo, ScopeMap};
