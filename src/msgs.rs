//! Shard request and response messages.
//!
//! Tagged unions dispatched through the RSM runtime: reads resolve at the
//! shard leader without a log entry, writes replicate through the log and
//! must be idempotent (the client delivers at-least-once). Every message is
//! serde-serializable so it round-trips the wire envelope.

use serde::{Deserialize, Serialize};

use crate::error::ShardResult;
use crate::hlc::Hlc;
use crate::rsm::RsmClient;
use crate::storage::splitter::SplitData;
use crate::types::{EdgeTypeId, Gid, LabelId, PropertyId};
use crate::value::{EdgeId, PrimaryKey, Value, Vertex, VertexId};

/// Which version of an entity a read resolves.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageView {
    /// Ignore uncommitted changes and commits at-or-after the reader.
    Old,
    /// Additionally admit the reader's own pending deltas.
    New,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeDirection {
    Out,
    In,
    Both,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderingDirection {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderBy {
    pub property: PropertyId,
    pub direction: OrderingDirection,
}

/// Structural filter predicates evaluable without the query engine's
/// expression evaluator (which lives outside the core).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FilterExpression {
    PropertyEquals { property: PropertyId, value: Value },
    HasLabel { label: LabelId },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanVerticesRequest {
    pub transaction_id: Hlc,
    /// Cursor: scan resumes at this key (inclusive).
    pub start_id: VertexId,
    /// `None` returns all properties, `Some(vec![])` returns none.
    pub props_to_return: Option<Vec<PropertyId>>,
    pub filter_expressions: Option<Vec<FilterExpression>>,
    pub batch_limit: Option<usize>,
    pub storage_view: StorageView,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanResultRow {
    pub vertex: Vertex,
    pub props: Vec<(PropertyId, Value)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanVerticesResponse {
    pub results: Vec<ScanResultRow>,
    /// Present when the batch limit cut the scan short; the client re-issues
    /// the request starting here.
    pub next_start_id: Option<VertexId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PropertiesTarget {
    Vertices(Vec<VertexId>),
    Edges(Vec<EdgeId>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetPropertiesRequest {
    pub transaction_id: Hlc,
    pub target: PropertiesTarget,
    /// `None` returns all properties.
    pub property_ids: Option<Vec<PropertyId>>,
    pub filter: Option<FilterExpression>,
    pub order_by: Option<Vec<OrderBy>>,
    pub limit: Option<usize>,
    pub only_unique: bool,
    pub storage_view: StorageView,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetPropertiesResultRow {
    pub vertex: Vertex,
    /// Set when the row describes an edge of `vertex`.
    pub edge: Option<Gid>,
    pub props: Vec<(PropertyId, Value)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetPropertiesResponse {
    pub result_row: Vec<GetPropertiesResultRow>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExpandOneRequest {
    pub transaction_id: Hlc,
    pub src_vertices: Vec<VertexId>,
    /// Empty means every edge type.
    pub edge_types: Vec<EdgeTypeId>,
    pub direction: EdgeDirection,
    /// `None` returns all source-vertex properties, `Some(vec![])` none.
    pub src_vertex_properties: Option<Vec<PropertyId>>,
    /// Same convention for the chosen edges' properties.
    pub edge_properties: Option<Vec<PropertyId>>,
    pub filter: Option<FilterExpression>,
    pub order_by: Option<Vec<OrderBy>>,
    pub limit: Option<usize>,
    pub storage_view: StorageView,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExpandedEdge {
    pub gid: Gid,
    pub edge_type: EdgeTypeId,
    pub other_vertex: VertexId,
    pub properties: Option<Vec<(PropertyId, Value)>>,
}

/// One row per source vertex. Destination-vertex properties are not fetched
/// here; the caller issues a second expand against the destination shard.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExpandOneResultRow {
    pub src_vertex: Vertex,
    pub src_vertex_properties: Option<Vec<(PropertyId, Value)>>,
    pub in_edges: Vec<ExpandedEdge>,
    pub out_edges: Vec<ExpandedEdge>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExpandOneResponse {
    pub result: Vec<ExpandOneResultRow>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewVertex {
    pub primary_label: LabelId,
    pub secondary_labels: Vec<LabelId>,
    pub primary_key: PrimaryKey,
    pub properties: Vec<(PropertyId, Value)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateVerticesRequest {
    pub transaction_id: Hlc,
    pub new_vertices: Vec<NewVertex>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewExpand {
    pub gid: Gid,
    pub edge_type: EdgeTypeId,
    pub src_vertex: VertexId,
    pub dest_vertex: VertexId,
    pub properties: Vec<(PropertyId, Value)>,
}

/// Edge creation. A cross-shard edge is delivered to both endpoint shards;
/// each splices the link incident to the vertex it owns.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateExpandRequest {
    pub transaction_id: Hlc,
    pub new_expands: Vec<NewExpand>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionType {
    Delete,
    DetachDelete,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteVerticesRequest {
    pub transaction_id: Hlc,
    pub primary_keys: Vec<PrimaryKey>,
    pub deletion_type: DeletionType,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateVertex {
    pub primary_key: PrimaryKey,
    pub add_labels: Vec<LabelId>,
    pub remove_labels: Vec<LabelId>,
    /// `None` clears the property.
    pub property_updates: Vec<(PropertyId, Option<Value>)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateVerticesRequest {
    pub transaction_id: Hlc,
    pub update_vertices: Vec<UpdateVertex>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateEdgeProp {
    pub edge: EdgeId,
    pub property_updates: Vec<(PropertyId, Option<Value>)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateEdgesRequest {
    pub transaction_id: Hlc,
    pub new_properties: Vec<UpdateEdgeProp>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeleteEdgesRequest {
    pub transaction_id: Hlc,
    pub edges: Vec<EdgeId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitRequest {
    pub transaction_id: Hlc,
    pub commit_timestamp: Hlc,
}

/// Drives the data move of an already-published shard-map split: the parent
/// extracts everything at-or-above the split key into a [`SplitData`]
/// bundle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PerformSplitRequest {
    pub split_key: PrimaryKey,
}

/// Installs a [`SplitData`] bundle on the new shard, atomically.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSplitRequest {
    pub data: SplitData,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ShardReadRequest {
    ScanVertices(ScanVerticesRequest),
    GetProperties(GetPropertiesRequest),
    ExpandOne(ExpandOneRequest),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ShardReadResponse {
    ScanVertices(ShardResult<ScanVerticesResponse>),
    GetProperties(ShardResult<GetPropertiesResponse>),
    ExpandOne(ShardResult<ExpandOneResponse>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ShardWriteRequest {
    CreateVertices(CreateVerticesRequest),
    CreateExpand(CreateExpandRequest),
    DeleteVertices(DeleteVerticesRequest),
    UpdateVertices(UpdateVerticesRequest),
    UpdateEdges(UpdateEdgesRequest),
    DeleteEdges(DeleteEdgesRequest),
    Commit(CommitRequest),
    PerformSplit(PerformSplitRequest),
    InstallSplit(InstallSplitRequest),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ShardWriteResponse {
    CreateVertices(ShardResult<()>),
    CreateExpand(ShardResult<()>),
    DeleteVertices(ShardResult<()>),
    UpdateVertices(ShardResult<()>),
    UpdateEdges(ShardResult<()>),
    DeleteEdges(ShardResult<()>),
    Commit(ShardResult<()>),
    PerformSplit(ShardResult<SplitData>),
    InstallSplit(ShardResult<()>),
}

/// Client handle for one shard's replica group.
pub type ShardClient =
    RsmClient<ShardWriteRequest, ShardReadRequest, ShardWriteResponse, ShardReadResponse>;
