//! Per-shard transaction records.
//!
//! A transaction owns every delta it produced; entities reference those
//! deltas by [`DeltaId`] and never own them. Commit is a status flip plus a
//! commit timestamp; it never rewrites chains.

use serde::{Deserialize, Serialize};

use crate::hlc::Hlc;
use crate::storage::delta::{Delta, DeltaId};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    Pending,
    Committed,
    Aborted,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub start: Hlc,
    pub commit: Option<Hlc>,
    pub status: TxnStatus,
    pub deltas: Vec<Delta>,
}

impl Transaction {
    pub fn new(start: Hlc) -> Self {
        Self {
            start,
            commit: None,
            status: TxnStatus::Pending,
            deltas: Vec::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == TxnStatus::Pending
    }

    /// Appends a delta and returns its stable address.
    pub fn push_delta(&mut self, delta: Delta) -> DeltaId {
        let id = DeltaId::new(self.start.logical_id, self.deltas.len() as u32);
        self.deltas.push(delta);
        id
    }

    pub fn delta(&self, id: DeltaId) -> Option<&Delta> {
        debug_assert_eq!(id.txn, self.start.logical_id);
        self.deltas.get(id.ix as usize)
    }

    pub fn delta_mut(&mut self, id: DeltaId) -> Option<&mut Delta> {
        debug_assert_eq!(id.txn, self.start.logical_id);
        self.deltas.get_mut(id.ix as usize)
    }

    /// Flips the transaction to committed under `commit_timestamp`.
    /// Idempotent: re-committing an already committed transaction is a
    /// no-op, which the at-least-once commit broadcast relies on.
    pub fn commit(&mut self, commit_timestamp: Hlc) {
        if self.status == TxnStatus::Pending {
            self.status = TxnStatus::Committed;
            self.commit = Some(commit_timestamp);
        }
    }

    pub fn abort(&mut self) {
        if self.status == TxnStatus::Pending {
            self.status = TxnStatus::Aborted;
        }
    }
}
