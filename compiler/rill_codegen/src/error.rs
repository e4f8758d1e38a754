//! Compilation errors.
//!
//! Two fatal categories, neither recoverable:
//!
//! - **invalid input**: the bound graph violates a structural invariant the
//!   backend depends on; the upstream binder produced a malformed graph.
//! - **internal**: the backend reached a case it cannot lower or a state
//!   that should be structurally unreachable; a codegen bug, not bad input.
//!
//! Compilation is a pure function of the input graph: deterministic
//! success or deterministic failure, never a partial artifact.

use rill_ir::{Name, ScopeToken};
use thiserror::Error;

/// Fatal compilation error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodegenError {
    // Malformed-input errors.
    #[error("scope token {token:?} introduced while already active in its ancestor chain")]
    NestedTokenReuse { token: ScopeToken },

    #[error("unresolved scope reference to {token:?} at occurrence {pos}")]
    UnresolvedScopeRef { token: ScopeToken, pos: u32 },

    #[error("global {name:?} referenced with inconsistent types")]
    GlobalTypeMismatch { name: Name },

    #[error("duplicate field {name:?} in projection override")]
    DuplicateOverrideField { name: Name },

    #[error("occurrence-index bookkeeping mismatch at position {pos}: declared subtree size disagrees with traversal")]
    NodeCountMismatch { pos: u32 },

    #[error("values of type {ty} are not comparable under the required mode")]
    NotComparable { ty: String },

    // Internal-consistency errors.
    #[error("unsupported lowering: {0}")]
    Unsupported(&'static str),

    #[error("internal codegen error: {0}")]
    Internal(&'static str),
}

impl CodegenError {
    /// Whether this error reports a malformed bound graph (as opposed to a
    /// codegen bug).
    pub fn is_invalid_input(&self) -> bool {
        !matches!(
            self,
            CodegenError::Unsupported(_) | CodegenError::Internal(_)
        )
    }
}

/// Result alias for compilation.
pub type CodegenResult<T> = Result<T, CodegenError>;
