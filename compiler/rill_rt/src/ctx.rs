//! Ambient execution context.

/// Execution context threaded into routines that evaluate
/// context-sensitive operations (case-mode text comparison, membership,
/// distinct).
///
/// Passed by the caller at invocation time; generated routines receive it
/// as a trailing parameter only when the analyzer recorded a context use
/// in their subtree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecCtx {
    /// Whether text comparisons ignore case.
    pub case_insensitive: bool,
}

impl ExecCtx {
    pub fn new(case_insensitive: bool) -> Self {
        Self { case_insensitive }
    }
}
