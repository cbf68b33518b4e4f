use thiserror::Error;

use crate::ir::MethodSig;

/// Failures surfaced by the analysis engine.
///
/// Every variant is a data problem the caller can react to. Broken internal
/// invariants are not represented here; they panic.
#[derive(Debug, Error)]
pub(crate) enum Error {
    /// A value token in a call site could not be typed.
    #[error("fail to resolve type of `{token}` in {method}")]
    UnresolvedValue { method: MethodSig, token: String },

    /// A jump names a label the method never defines.
    #[error("undefined label `{label}` in {method}")]
    UndefinedLabel { method: MethodSig, label: String },

    /// A method body branches more often than the configured ceiling.
    #[error("{method} has {branches} branches (limit {limit})")]
    TooManyBranches {
        method: MethodSig,
        branches: usize,
        limit: usize,
    },

    #[error("entry point not found: {method}")]
    EntryPointNotFound { method: MethodSig },

    /// Call trees and summary table do not belong together.
    #[error("inconsistent index: {0}")]
    InconsistentIndex(String),

    #[error("malformed query: {0}")]
    MalformedQuery(String),

    #[error("invalid pattern `{word}`")]
    InvalidPattern {
        word: String,
        #[source]
        source: regex::Error,
    },
}

pub(crate) type Result<T> = std::result::Result<T, Error>;
