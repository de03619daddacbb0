//! Vertex and edge records.
//!
//! Containers are ordered maps keyed by the stable identity the shard map
//! routes on (primary key for vertices, gid for edges); the records hold the
//! newest materialized state, with older versions reachable through the
//! delta chain. Edges appear as links inside both incident vertices; for a
//! cross-shard edge each endpoint shard records its own side.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::storage::delta::DeltaId;
use crate::types::{EdgeTypeId, Gid, LabelId, PropertyId};
use crate::value::{PrimaryKey, Value, VertexId};

/// One incident-edge entry: `(edge_type, other_vertex, edge_ref)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeLink {
    pub edge_type: EdgeTypeId,
    pub other: VertexId,
    pub gid: Gid,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VertexRecord {
    pub primary_label: LabelId,
    pub primary_key: PrimaryKey,
    pub secondary_labels: Vec<LabelId>,
    pub properties: BTreeMap<PropertyId, Value>,
    pub in_edges: Vec<EdgeLink>,
    pub out_edges: Vec<EdgeLink>,
    pub deleted: bool,
    pub delta_head: Option<DeltaId>,
}

impl VertexRecord {
    pub fn new(primary_label: LabelId, primary_key: PrimaryKey) -> Self {
        Self {
            primary_label,
            primary_key,
            secondary_labels: Vec::new(),
            properties: BTreeMap::new(),
            in_edges: Vec::new(),
            out_edges: Vec::new(),
            deleted: false,
            delta_head: None,
        }
    }

    pub fn id(&self) -> VertexId {
        VertexId::new(self.primary_label, self.primary_key.clone())
    }

    pub fn has_label(&self, label: LabelId) -> bool {
        self.primary_label == label || self.secondary_labels.contains(&label)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub gid: Gid,
    pub properties: BTreeMap<PropertyId, Value>,
    pub deleted: bool,
    pub delta_head: Option<DeltaId>,
}

impl EdgeRecord {
    pub fn new(gid: Gid) -> Self {
        Self {
            gid,
            properties: BTreeMap::new(),
            deleted: false,
            delta_head: None,
        }
    }
}

pub type VertexContainer = BTreeMap<PrimaryKey, VertexRecord>;
pub type EdgeContainer = BTreeMap<Gid, EdgeRecord>;
