//! Per-operation execution state.

use crate::error::{Result, TesseraError};
use crate::hlc::Hlc;
use crate::shard_map::Shard;
use crate::value::PrimaryKey;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExecutionStatus {
    Initializing,
    Executing,
    Completed,
}

/// Pagination progress of one shard inside a scan.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PaginatedResponseState {
    /// The next batch has not been requested yet.
    Pending,
    /// A batch arrived and more remain; waiting for the caller to ask for
    /// the next page.
    PartiallyFinished,
}

/// State of one in-flight multi-shard operation. `shard_cache` lists the
/// shards with outstanding work and stays strictly one-to-one with
/// `requests`; both shrink as shards finish, and the operation completes
/// when they are empty.
#[derive(Debug)]
pub struct ExecutionState<Req> {
    /// Present for operations addressed by label (scans, updates).
    pub label: Option<String>,
    /// Present for operations pinned to a single key.
    pub key: Option<PrimaryKey>,
    /// Filled in from the router's current transaction on first use.
    pub transaction_id: Hlc,
    /// Optional request template (cursor defaults, filters, batch limits).
    pub template: Option<Req>,
    pub shard_cache: Vec<Shard>,
    pub requests: Vec<Req>,
    pub status: ExecutionStatus,
}

impl<Req> Default for ExecutionState<Req> {
    fn default() -> Self {
        Self {
            label: None,
            key: None,
            transaction_id: Hlc::default(),
            template: None,
            shard_cache: Vec::new(),
            requests: Vec::new(),
            status: ExecutionStatus::Initializing,
        }
    }
}

impl<Req> ExecutionState<Req> {
    pub fn with_label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::default()
        }
    }

    /// A completed state must be reset (dropped) before re-use.
    pub fn check_not_exhausted(&self) -> Result<()> {
        if self.status == ExecutionStatus::Completed {
            return Err(TesseraError::StateExhausted);
        }
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}
