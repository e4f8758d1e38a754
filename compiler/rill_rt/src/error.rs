//! Runtime errors.

use thiserror::Error;

/// Error raised while executing a generated routine.
///
/// Type mismatches and arity mismatches indicate a codegen bug (generated
/// routines are typed); the remaining variants are genuine runtime
/// conditions surfaced to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("division by zero")]
    DivideByZero,

    #[error("integer overflow")]
    Overflow,

    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("routine '{routine}' expects {expected} arguments, got {found}")]
    ArityMismatch {
        routine: String,
        expected: usize,
        found: usize,
    },

    #[error("record has no field #{field}")]
    MissingField { field: u32 },

    #[error("module has no settable symbol #{symbol}")]
    UnknownSymbol { symbol: u32 },

    #[error("no value bound for global #{global}")]
    MissingGlobal { global: u32 },

    #[error("internal execution error: {0}")]
    Internal(&'static str),
}

/// Result alias for routine execution.
pub type ExecResult<T> = Result<T, ExecError>;
