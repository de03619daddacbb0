use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TesseraError>;

/// Error taxonomy for the execution core.
///
/// `Stale`, `NotLeader` and `TimedOut` are recovered locally (refresh,
/// redirect, bounded retry); everything else bubbles up as a transaction
/// abort or an operator-visible failure.
#[derive(Debug, Error)]
pub enum TesseraError {
    #[error("shard map is stale: {0}")]
    Stale(String),
    #[error("request reached a non-leader replica")]
    NotLeader,
    #[error("request timed out: {0}")]
    TimedOut(String),
    #[error("optimistic concurrency conflict: {0}")]
    Conflict(String),
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("transaction aborted: {0}")]
    Aborted(String),
    #[error("operation state already exhausted")]
    StateExhausted,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("corruption detected: {0}")]
    Corruption(String),
}

/// Error payload carried inside RPC responses so it survives the wire
/// envelope round-trip. Translated into [`TesseraError`] at the client
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardError {
    pub kind: ShardErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardErrorKind {
    /// The shard no longer owns the addressed key (e.g. after a split).
    NotOwned,
    /// Write-write serialization conflict on an entity chain.
    Conflict,
    /// Primary key does not match the label schema.
    SchemaViolation,
    /// Addressed entity does not exist under the requested view.
    NotFound,
    /// Transaction was aborted by the store.
    Aborted,
    /// Invariant violation inside the engine.
    Corruption,
}

impl ShardError {
    pub fn new(kind: ShardErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_owned(message: impl Into<String>) -> Self {
        Self::new(ShardErrorKind::NotOwned, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ShardErrorKind::Conflict, message)
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(ShardErrorKind::SchemaViolation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ShardErrorKind::NotFound, message)
    }
}

impl From<ShardError> for TesseraError {
    fn from(err: ShardError) -> Self {
        match err.kind {
            ShardErrorKind::NotOwned => TesseraError::Stale(err.message),
            ShardErrorKind::Conflict => TesseraError::Conflict(err.message),
            ShardErrorKind::SchemaViolation => TesseraError::SchemaViolation(err.message),
            ShardErrorKind::NotFound => TesseraError::NotFound(err.message),
            ShardErrorKind::Aborted => TesseraError::Aborted(err.message),
            ShardErrorKind::Corruption => TesseraError::Corruption(err.message),
        }
    }
}

/// Result alias used inside RPC response payloads.
pub type ShardResult<T> = std::result::Result<T, ShardError>;
