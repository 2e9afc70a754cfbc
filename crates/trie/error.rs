//! §7: the error taxonomy. Every failure kind is a typed variant; nothing is swallowed.

use thiserror::Error;

use crate::node_id::NodeId;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed json in {file}: {source}")]
    Json {
        file: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("corruption detected: {0}")]
    CorruptionDetected(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("mode mismatch: forest was opened with {expected}, directory holds {found}")]
    ModeMismatch { expected: String, found: String },

    #[error("directory is locked by another process: {0}")]
    Contention(String),

    #[error("unknown or released node id {0:?}")]
    UnknownNodeId(NodeId),

    #[error("lock poisoned: a prior panic left internal state inconsistent")]
    LockPoisoned,
}

/// Accumulates multiple errors from an operation like `flush`/`close` so a single failure
/// doesn't mask the rest (§7, "multi-error-accumulation").
#[derive(Debug, Error)]
#[error("{} error(s) occurred: {}", .0.len(), join_errors(.0))]
pub struct MultiError(pub Vec<StateError>);

fn join_errors(errors: &[StateError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl MultiError {
    pub fn from_results<T>(results: Vec<Result<T, StateError>>) -> Result<Vec<T>, MultiError> {
        let mut oks = Vec::with_capacity(results.len());
        let mut errs = Vec::new();
        for result in results {
            match result {
                Ok(v) => oks.push(v),
                Err(e) => errs.push(e),
            }
        }
        if errs.is_empty() {
            Ok(oks)
        } else {
            Err(MultiError(errs))
        }
    }

    pub fn into_result(errors: Vec<StateError>) -> Result<(), MultiError> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(MultiError(errors))
        }
    }
}

pub type Result<T> = std::result::Result<T, StateError>;

impl<T> From<std::sync::PoisonError<T>> for StateError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        StateError::LockPoisoned
    }
}
