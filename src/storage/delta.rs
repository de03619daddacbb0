//! MVCC delta records.
//!
//! A delta stores the *inverse* of a mutation: applying it to the current
//! materialized entity state steps one version back in time. Chains run from
//! the entity's newest delta (`delta_head`) toward older versions via
//! `next`; `prev` points the other way, at the delta that superseded this
//! one or at the owning entity itself. Deltas are owned by the transaction
//! that produced them and addressed by stable `(transaction, index)` pairs,
//! so relocating a shard's data never invalidates a link.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{EdgeTypeId, Gid, LabelId, PropertyId};
use crate::value::{PrimaryKey, Value, VertexId};

/// Stable address of one delta: the start logical id of the owning
/// transaction plus the delta's position in that transaction's list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeltaId {
    pub txn: u64,
    pub ix: u32,
}

impl DeltaId {
    pub fn new(txn: u64, ix: u32) -> Self {
        Self { txn, ix }
    }
}

/// Back link of a delta: the entity it mutated, or the delta that superseded
/// it. Following `prev` any number of times never cycles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrevPtr {
    Null,
    Delta(DeltaId),
    Vertex(PrimaryKey),
    Edge(Gid),
}

/// The recorded inverse of one mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaAction {
    /// Inverse of creation: before this point the object did not exist.
    /// Every live entity's chain terminates in one of these.
    DeleteObject,
    /// Inverse of deletion.
    RecreateObject,
    /// Inverse of a property write; `value` is the prior value, `None`
    /// meaning the property was absent.
    SetProperty {
        property: PropertyId,
        value: Option<Value>,
    },
    /// Inverse of removing a secondary label.
    AddLabel { label: LabelId },
    /// Inverse of adding a secondary label.
    RemoveLabel { label: LabelId },
    /// Inverse of removing an in-edge link.
    AddInEdge {
        edge_type: EdgeTypeId,
        other: VertexId,
        gid: Gid,
    },
    /// Inverse of adding an in-edge link.
    RemoveInEdge {
        edge_type: EdgeTypeId,
        other: VertexId,
        gid: Gid,
    },
    /// Inverse of removing an out-edge link.
    AddOutEdge {
        edge_type: EdgeTypeId,
        other: VertexId,
        gid: Gid,
    },
    /// Inverse of adding an out-edge link.
    RemoveOutEdge {
        edge_type: EdgeTypeId,
        other: VertexId,
        gid: Gid,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Delta {
    pub action: DeltaAction,
    /// Identity that survives cloning during a shard split.
    pub uuid: Uuid,
    /// Toward older versions.
    pub next: Option<DeltaId>,
    /// Toward the entity / the superseding delta.
    pub prev: PrevPtr,
}

impl Delta {
    pub fn new(action: DeltaAction, prev: PrevPtr, next: Option<DeltaId>) -> Self {
        Self {
            action,
            uuid: Uuid::new_v4(),
            next,
            prev,
        }
    }
}
