//! Per-shard storage engine.
//!
//! Owns the vertex container for one contiguous primary-key range of a
//! label space, the edge container, the secondary indices and the
//! transaction table. All mutations are serialized through the hosting
//! replica's apply loop (single writer per shard); reads resolve a snapshot
//! by walking delta chains, so they never observe a half-applied mutation.
//!
//! Visibility: a change is visible to a reader `T` when its transaction
//! committed strictly before `T`, or (under the `New` view) when it is the
//! reader's own pending change. Readers materialize the newest state and
//! roll invisible deltas back, newest first.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::error::{ShardError, ShardErrorKind, ShardResult};
use crate::hlc::Hlc;
use crate::msgs::{
    CommitRequest, CreateExpandRequest, CreateVerticesRequest, DeleteEdgesRequest,
    DeleteVerticesRequest, DeletionType, EdgeDirection, ExpandOneRequest, ExpandOneResponse,
    ExpandOneResultRow, ExpandedEdge, FilterExpression, GetPropertiesRequest,
    GetPropertiesResponse, GetPropertiesResultRow, OrderBy, OrderingDirection, PropertiesTarget,
    ScanResultRow, ScanVerticesRequest, ScanVerticesResponse, ShardReadRequest, ShardReadResponse,
    ShardWriteRequest, ShardWriteResponse, StorageView, UpdateEdgesRequest, UpdateVerticesRequest,
};
use crate::rsm::StateMachine;
use crate::shard_map::SchemaProperty;
use crate::storage::delta::{Delta, DeltaAction, DeltaId, PrevPtr};
use crate::storage::indices::Indices;
use crate::storage::splitter;
use crate::storage::transaction::{Transaction, TxnStatus};
use crate::storage::vertex::{
    EdgeContainer, EdgeLink, EdgeRecord, VertexContainer, VertexRecord,
};
use crate::types::{Gid, LabelId, PropertyId};
use crate::value::{PrimaryKey, Value, Vertex, VertexId};

/// Chain-walk step bound; a longer walk means a broken `next` link.
const MAX_CHAIN_STEPS: usize = 1 << 20;

pub struct ShardEngine {
    pub(crate) label: LabelId,
    pub(crate) schema: Vec<SchemaProperty>,
    pub(crate) low_key: PrimaryKey,
    /// Exclusive upper bound; `None` for the last shard of the space.
    pub(crate) high_key: Option<PrimaryKey>,
    pub(crate) vertices: VertexContainer,
    pub(crate) edges: EdgeContainer,
    pub(crate) transactions: BTreeMap<u64, Transaction>,
    pub(crate) indices: Indices,
    pub(crate) properties_on_edges: bool,
}

impl ShardEngine {
    pub fn new(
        label: LabelId,
        schema: Vec<SchemaProperty>,
        low_key: PrimaryKey,
        high_key: Option<PrimaryKey>,
        properties_on_edges: bool,
    ) -> Self {
        Self {
            label,
            schema,
            low_key,
            high_key,
            vertices: VertexContainer::new(),
            edges: EdgeContainer::new(),
            transactions: BTreeMap::new(),
            indices: Indices::new(),
            properties_on_edges,
        }
    }

    /// A standby engine owns no range; it answers `NotOwned` to everything
    /// until a split bundle is installed on it.
    pub fn standby() -> Self {
        Self::new(
            LabelId(0),
            Vec::new(),
            PrimaryKey::default(),
            Some(PrimaryKey::default()),
            true,
        )
    }

    pub fn owns_key(&self, key: &PrimaryKey) -> bool {
        *key >= self.low_key
            && self
                .high_key
                .as_ref()
                .map(|high| key < high)
                .unwrap_or(true)
    }

    fn not_owned(&self, key: &PrimaryKey) -> ShardError {
        ShardError::not_owned(format!(
            "key {key} is outside this shard's range starting at {}",
            self.low_key
        ))
    }

    fn check_schema(&self, key: &PrimaryKey) -> ShardResult<()> {
        if key.len() != self.schema.len() {
            return Err(ShardError::schema(format!(
                "primary key arity {} does not match schema arity {}",
                key.len(),
                self.schema.len()
            )));
        }
        for (ix, (value, prop)) in key.0.iter().zip(self.schema.iter()).enumerate() {
            if !value.conforms_to(prop.ty) {
                return Err(ShardError::schema(format!(
                    "primary key component {ix} has the wrong type for property {}",
                    prop.property_id
                )));
            }
        }
        Ok(())
    }

    fn ensure_transaction(&mut self, transaction_id: Hlc) -> u64 {
        let start = transaction_id.logical_id;
        self.transactions
            .entry(start)
            .or_insert_with(|| Transaction::new(transaction_id));
        start
    }

    fn transaction(&self, start: u64) -> ShardResult<&Transaction> {
        self.transactions.get(&start).ok_or_else(|| {
            ShardError::new(
                ShardErrorKind::Corruption,
                format!("orphan delta: transaction {start} is unknown"),
            )
        })
    }

    fn check_transaction_usable(&self, transaction_id: Hlc) -> ShardResult<()> {
        if let Some(txn) = self.transactions.get(&transaction_id.logical_id) {
            match txn.status {
                TxnStatus::Aborted => Err(ShardError::new(
                    ShardErrorKind::Aborted,
                    format!("transaction {} was aborted", transaction_id.logical_id),
                )),
                TxnStatus::Committed => Err(ShardError::conflict(format!(
                    "transaction {} already committed",
                    transaction_id.logical_id
                ))),
                TxnStatus::Pending => Ok(()),
            }
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Visibility
    // ------------------------------------------------------------------

    fn change_visible(txn: &Transaction, reader: Hlc, view: StorageView) -> bool {
        match txn.status {
            TxnStatus::Committed => txn.commit.map(|c| c < reader).unwrap_or(false),
            TxnStatus::Aborted => false,
            TxnStatus::Pending => view == StorageView::New && txn.start == reader,
        }
    }

    /// Rolls a cloned vertex record back to the version visible under
    /// `(reader, view)`. Returns `None` for entities that are deleted, or
    /// not yet created, at that version.
    pub(crate) fn vertex_snapshot(
        &self,
        record: &VertexRecord,
        reader: Hlc,
        view: StorageView,
    ) -> ShardResult<Option<VertexRecord>> {
        let mut snapshot = record.clone();
        let mut cursor = record.delta_head;
        let mut steps = 0usize;
        while let Some(id) = cursor {
            let txn = self.transaction(id.txn)?;
            if Self::change_visible(txn, reader, view) {
                break;
            }
            let delta = txn.delta(id).ok_or_else(|| {
                ShardError::new(ShardErrorKind::Corruption, "dangling delta index")
            })?;
            apply_inverse_to_vertex(&mut snapshot, &delta.action);
            cursor = delta.next;
            steps += 1;
            if steps > MAX_CHAIN_STEPS {
                return Err(ShardError::new(
                    ShardErrorKind::Corruption,
                    "delta chain does not terminate",
                ));
            }
        }
        snapshot.delta_head = None;
        Ok((!snapshot.deleted).then_some(snapshot))
    }

    pub(crate) fn edge_snapshot(
        &self,
        record: &EdgeRecord,
        reader: Hlc,
        view: StorageView,
    ) -> ShardResult<Option<EdgeRecord>> {
        let mut snapshot = record.clone();
        let mut cursor = record.delta_head;
        let mut steps = 0usize;
        while let Some(id) = cursor {
            let txn = self.transaction(id.txn)?;
            if Self::change_visible(txn, reader, view) {
                break;
            }
            let delta = txn.delta(id).ok_or_else(|| {
                ShardError::new(ShardErrorKind::Corruption, "dangling delta index")
            })?;
            apply_inverse_to_edge(&mut snapshot, &delta.action);
            cursor = delta.next;
            steps += 1;
            if steps > MAX_CHAIN_STEPS {
                return Err(ShardError::new(
                    ShardErrorKind::Corruption,
                    "delta chain does not terminate",
                ));
            }
        }
        snapshot.delta_head = None;
        Ok((!snapshot.deleted).then_some(snapshot))
    }

    // ------------------------------------------------------------------
    // Write plumbing
    // ------------------------------------------------------------------

    /// Serialization check before splicing onto an entity chain: the newest
    /// delta must not belong to another pending transaction, nor to a commit
    /// at-or-after the writer's start.
    fn check_write_conflict(&self, head: Option<DeltaId>, writer: Hlc) -> ShardResult<()> {
        let Some(head) = head else { return Ok(()) };
        let owner = self.transaction(head.txn)?;
        match owner.status {
            TxnStatus::Pending if head.txn != writer.logical_id => Err(ShardError::conflict(
                format!("entity is locked by pending transaction {}", head.txn),
            )),
            TxnStatus::Committed
                if owner.commit.map(|c| c >= writer).unwrap_or(false) =>
            {
                Err(ShardError::conflict(
                    "entity was modified after this transaction started",
                ))
            }
            _ => Ok(()),
        }
    }

    /// Appends `action` to the writer's delta list and splices it at the
    /// head of the vertex chain.
    fn splice_vertex_delta(
        &mut self,
        pk: &PrimaryKey,
        writer: u64,
        action: DeltaAction,
    ) -> ShardResult<DeltaId> {
        let old_head = self
            .vertices
            .get(pk)
            .ok_or_else(|| ShardError::not_found(format!("vertex {pk}")))?
            .delta_head;
        let delta = Delta::new(action, PrevPtr::Vertex(pk.clone()), old_head);
        let txn = self.transactions.get_mut(&writer).ok_or_else(|| {
            ShardError::new(ShardErrorKind::Corruption, "writer transaction vanished")
        })?;
        let new_id = txn.push_delta(delta);
        if let Some(old) = old_head {
            if let Some(old_delta) = self
                .transactions
                .get_mut(&old.txn)
                .and_then(|t| t.delta_mut(old))
            {
                old_delta.prev = PrevPtr::Delta(new_id);
            }
        }
        if let Some(vertex) = self.vertices.get_mut(pk) {
            vertex.delta_head = Some(new_id);
        }
        Ok(new_id)
    }

    fn splice_edge_delta(
        &mut self,
        gid: Gid,
        writer: u64,
        action: DeltaAction,
    ) -> ShardResult<DeltaId> {
        let old_head = self
            .edges
            .get(&gid)
            .ok_or_else(|| ShardError::not_found(format!("edge {gid}")))?
            .delta_head;
        let delta = Delta::new(action, PrevPtr::Edge(gid), old_head);
        let txn = self.transactions.get_mut(&writer).ok_or_else(|| {
            ShardError::new(ShardErrorKind::Corruption, "writer transaction vanished")
        })?;
        let new_id = txn.push_delta(delta);
        if let Some(old) = old_head {
            if let Some(old_delta) = self
                .transactions
                .get_mut(&old.txn)
                .and_then(|t| t.delta_mut(old))
            {
                old_delta.prev = PrevPtr::Delta(new_id);
            }
        }
        if let Some(edge) = self.edges.get_mut(&gid) {
            edge.delta_head = Some(new_id);
        }
        Ok(new_id)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn scan_vertices(&self, request: ScanVerticesRequest) -> ShardResult<ScanVerticesResponse> {
        let start = &request.start_id.primary_key;
        if !self.owns_key(start) {
            return Err(self.not_owned(start));
        }
        let limit = request.batch_limit.unwrap_or(usize::MAX);
        let mut results = Vec::new();
        let mut next_start_id = None;
        for (pk, record) in self.vertices.range(start.clone()..) {
            if results.len() >= limit {
                next_start_id = Some(VertexId::new(self.label, pk.clone()));
                break;
            }
            let Some(snapshot) =
                self.vertex_snapshot(record, request.transaction_id, request.storage_view)?
            else {
                continue;
            };
            if let Some(filters) = &request.filter_expressions {
                if !filters.iter().all(|f| filter_matches(f, &snapshot)) {
                    continue;
                }
            }
            results.push(ScanResultRow {
                vertex: Vertex {
                    id: snapshot.id(),
                    labels: snapshot.secondary_labels.clone(),
                },
                props: project_properties(&snapshot.properties, request.props_to_return.as_deref()),
            });
        }
        if next_start_id.is_none() {
            // Container exhausted: point the caller at the rest of the label
            // space. Under a current map the cursor lands on a neighbour
            // shard and the caller drops it; under a stale map re-issuing it
            // here draws the NotOwned that triggers a refresh.
            next_start_id = self
                .high_key
                .clone()
                .map(|high| VertexId::new(self.label, high));
        }
        Ok(ScanVerticesResponse {
            results,
            next_start_id,
        })
    }

    pub fn get_properties(
        &self,
        request: GetPropertiesRequest,
    ) -> ShardResult<GetPropertiesResponse> {
        let mut rows = Vec::new();
        match &request.target {
            PropertiesTarget::Vertices(ids) => {
                for id in ids {
                    if !self.owns_key(&id.primary_key) {
                        return Err(self.not_owned(&id.primary_key));
                    }
                    let Some(record) = self.vertices.get(&id.primary_key) else {
                        continue;
                    };
                    let Some(snapshot) =
                        self.vertex_snapshot(record, request.transaction_id, request.storage_view)?
                    else {
                        continue;
                    };
                    if let Some(filter) = &request.filter {
                        if !filter_matches(filter, &snapshot) {
                            continue;
                        }
                    }
                    rows.push(GetPropertiesResultRow {
                        vertex: Vertex {
                            id: snapshot.id(),
                            labels: snapshot.secondary_labels.clone(),
                        },
                        edge: None,
                        props: project_properties(
                            &snapshot.properties,
                            request.property_ids.as_deref(),
                        ),
                    });
                }
            }
            PropertiesTarget::Edges(ids) => {
                for id in ids {
                    let Some(record) = self.edges.get(&id.gid) else {
                        continue;
                    };
                    let Some(snapshot) =
                        self.edge_snapshot(record, request.transaction_id, request.storage_view)?
                    else {
                        continue;
                    };
                    rows.push(GetPropertiesResultRow {
                        vertex: Vertex {
                            id: id.src.clone(),
                            labels: Vec::new(),
                        },
                        edge: Some(id.gid),
                        props: project_properties(
                            &snapshot.properties,
                            request.property_ids.as_deref(),
                        ),
                    });
                }
            }
        }
        if let Some(order_by) = &request.order_by {
            sort_rows(&mut rows, order_by);
        }
        if request.only_unique {
            let mut seen = Vec::new();
            rows.retain(|row| {
                if seen.contains(&row.props) {
                    false
                } else {
                    seen.push(row.props.clone());
                    true
                }
            });
        }
        if let Some(limit) = request.limit {
            rows.truncate(limit);
        }
        Ok(GetPropertiesResponse { result_row: rows })
    }

    pub fn expand_one(&self, request: ExpandOneRequest) -> ShardResult<ExpandOneResponse> {
        let mut result = Vec::new();
        for src in &request.src_vertices {
            if !self.owns_key(&src.primary_key) {
                return Err(self.not_owned(&src.primary_key));
            }
            let Some(record) = self.vertices.get(&src.primary_key) else {
                return Err(ShardError::not_found(format!(
                    "source vertex {}",
                    src.primary_key
                )));
            };
            let Some(snapshot) =
                self.vertex_snapshot(record, request.transaction_id, request.storage_view)?
            else {
                continue;
            };
            if let Some(filter) = &request.filter {
                if !filter_matches(filter, &snapshot) {
                    continue;
                }
            }
            let wants_type =
                |edge_type| request.edge_types.is_empty() || request.edge_types.contains(&edge_type);
            let mut in_edges = Vec::new();
            let mut out_edges = Vec::new();
            if matches!(request.direction, EdgeDirection::In | EdgeDirection::Both) {
                for link in snapshot.in_edges.iter().filter(|l| wants_type(l.edge_type)) {
                    in_edges.push(self.expanded_edge(link, &request)?);
                }
            }
            if matches!(request.direction, EdgeDirection::Out | EdgeDirection::Both) {
                for link in snapshot.out_edges.iter().filter(|l| wants_type(l.edge_type)) {
                    out_edges.push(self.expanded_edge(link, &request)?);
                }
            }
            if let Some(order_by) = &request.order_by {
                sort_edges(&mut in_edges, order_by);
                sort_edges(&mut out_edges, order_by);
            }
            if let Some(limit) = request.limit {
                in_edges.truncate(limit);
                out_edges.truncate(limit);
            }
            result.push(ExpandOneResultRow {
                src_vertex: Vertex {
                    id: snapshot.id(),
                    labels: snapshot.secondary_labels.clone(),
                },
                src_vertex_properties: Some(project_properties(
                    &snapshot.properties,
                    request.src_vertex_properties.as_deref(),
                )),
                in_edges,
                out_edges,
            });
        }
        Ok(ExpandOneResponse { result })
    }

    fn expanded_edge(
        &self,
        link: &EdgeLink,
        request: &ExpandOneRequest,
    ) -> ShardResult<ExpandedEdge> {
        let properties = if self.properties_on_edges {
            match self.edges.get(&link.gid) {
                Some(record) => self
                    .edge_snapshot(record, request.transaction_id, request.storage_view)?
                    .map(|snapshot| {
                        project_properties(
                            &snapshot.properties,
                            request.edge_properties.as_deref(),
                        )
                    }),
                None => None,
            }
        } else {
            None
        };
        Ok(ExpandedEdge {
            gid: link.gid,
            edge_type: link.edge_type,
            other_vertex: link.other.clone(),
            properties,
        })
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub fn create_vertices(&mut self, request: CreateVerticesRequest) -> ShardResult<()> {
        self.check_transaction_usable(request.transaction_id)?;
        // Validate everything first so one request applies atomically.
        for new_vertex in &request.new_vertices {
            self.check_schema(&new_vertex.primary_key)?;
            if !self.owns_key(&new_vertex.primary_key) {
                return Err(self.not_owned(&new_vertex.primary_key));
            }
            if let Some(existing) = self.vertices.get(&new_vertex.primary_key) {
                let retried = existing
                    .delta_head
                    .map(|head| head.txn == request.transaction_id.logical_id)
                    .unwrap_or(false);
                if !retried {
                    return Err(ShardError::conflict(format!(
                        "vertex {} already exists",
                        new_vertex.primary_key
                    )));
                }
            }
        }
        let writer = self.ensure_transaction(request.transaction_id);
        for new_vertex in request.new_vertices {
            if self.vertices.contains_key(&new_vertex.primary_key) {
                // At-least-once redelivery of a create this transaction
                // already performed.
                continue;
            }
            let pk = new_vertex.primary_key.clone();
            let mut record = VertexRecord::new(new_vertex.primary_label, pk.clone());
            record.secondary_labels = new_vertex.secondary_labels.clone();
            for (property, value) in &new_vertex.properties {
                record.properties.insert(*property, value.clone());
            }
            self.vertices.insert(pk.clone(), record);
            self.splice_vertex_delta(&pk, writer, DeltaAction::DeleteObject)?;
            for label in &new_vertex.secondary_labels {
                self.indices.add_label_entry(*label, &pk);
            }
            for (property, value) in &new_vertex.properties {
                self.indices
                    .add_property_entry(new_vertex.primary_label, *property, value, &pk);
            }
            debug!(key = %pk, txn = writer, "vertex created");
        }
        Ok(())
    }

    pub fn create_expand(&mut self, request: CreateExpandRequest) -> ShardResult<()> {
        self.check_transaction_usable(request.transaction_id)?;
        for expand in &request.new_expands {
            let src_owned = self.owns_key(&expand.src_vertex.primary_key)
                && expand.src_vertex.label == self.label;
            let dst_owned = self.owns_key(&expand.dest_vertex.primary_key)
                && expand.dest_vertex.label == self.label;
            if !src_owned && !dst_owned {
                return Err(self.not_owned(&expand.src_vertex.primary_key));
            }
            if src_owned && !self.vertices.contains_key(&expand.src_vertex.primary_key) {
                return Err(ShardError::not_found(format!(
                    "source vertex {}",
                    expand.src_vertex.primary_key
                )));
            }
            if dst_owned && !self.vertices.contains_key(&expand.dest_vertex.primary_key) {
                return Err(ShardError::not_found(format!(
                    "destination vertex {}",
                    expand.dest_vertex.primary_key
                )));
            }
            if src_owned {
                let head = self.vertices[&expand.src_vertex.primary_key].delta_head;
                self.check_write_conflict(head, request.transaction_id)?;
            }
            if dst_owned {
                let head = self.vertices[&expand.dest_vertex.primary_key].delta_head;
                self.check_write_conflict(head, request.transaction_id)?;
            }
        }
        let writer = self.ensure_transaction(request.transaction_id);
        for expand in request.new_expands {
            let src_owned = self.owns_key(&expand.src_vertex.primary_key)
                && expand.src_vertex.label == self.label;
            let dst_owned = self.owns_key(&expand.dest_vertex.primary_key)
                && expand.dest_vertex.label == self.label;
            if src_owned {
                let pk = expand.src_vertex.primary_key.clone();
                let duplicate = self.vertices[&pk].out_edges.iter().any(|l| l.gid == expand.gid);
                if !duplicate {
                    self.splice_vertex_delta(
                        &pk,
                        writer,
                        DeltaAction::RemoveOutEdge {
                            edge_type: expand.edge_type,
                            other: expand.dest_vertex.clone(),
                            gid: expand.gid,
                        },
                    )?;
                    if let Some(vertex) = self.vertices.get_mut(&pk) {
                        vertex.out_edges.push(EdgeLink {
                            edge_type: expand.edge_type,
                            other: expand.dest_vertex.clone(),
                            gid: expand.gid,
                        });
                    }
                }
            }
            if dst_owned {
                let pk = expand.dest_vertex.primary_key.clone();
                let duplicate = self.vertices[&pk].in_edges.iter().any(|l| l.gid == expand.gid);
                if !duplicate {
                    self.splice_vertex_delta(
                        &pk,
                        writer,
                        DeltaAction::RemoveInEdge {
                            edge_type: expand.edge_type,
                            other: expand.src_vertex.clone(),
                            gid: expand.gid,
                        },
                    )?;
                    if let Some(vertex) = self.vertices.get_mut(&pk) {
                        vertex.in_edges.push(EdgeLink {
                            edge_type: expand.edge_type,
                            other: expand.src_vertex.clone(),
                            gid: expand.gid,
                        });
                    }
                }
            }
            if self.properties_on_edges && !self.edges.contains_key(&expand.gid) {
                let mut record = EdgeRecord::new(expand.gid);
                for (property, value) in &expand.properties {
                    record.properties.insert(*property, value.clone());
                }
                self.edges.insert(expand.gid, record);
                self.splice_edge_delta(expand.gid, writer, DeltaAction::DeleteObject)?;
            }
            debug!(gid = %expand.gid, txn = writer, "expand created");
        }
        Ok(())
    }

    pub fn delete_vertices(&mut self, request: DeleteVerticesRequest) -> ShardResult<()> {
        self.check_transaction_usable(request.transaction_id)?;
        for pk in &request.primary_keys {
            if !self.owns_key(pk) {
                return Err(self.not_owned(pk));
            }
            let record = self
                .vertices
                .get(pk)
                .ok_or_else(|| ShardError::not_found(format!("vertex {pk}")))?;
            self.check_write_conflict(record.delta_head, request.transaction_id)?;
            let snapshot = self
                .vertex_snapshot(record, request.transaction_id, StorageView::New)?
                .ok_or_else(|| ShardError::not_found(format!("vertex {pk}")))?;
            if request.deletion_type == DeletionType::Delete
                && (!snapshot.in_edges.is_empty() || !snapshot.out_edges.is_empty())
            {
                return Err(ShardError::conflict(format!(
                    "vertex {pk} still has incident edges; use detach delete"
                )));
            }
        }
        let writer = self.ensure_transaction(request.transaction_id);
        for pk in request.primary_keys {
            if request.deletion_type == DeletionType::DetachDelete {
                let links: Vec<(bool, EdgeLink)> = {
                    let record = &self.vertices[&pk];
                    record
                        .in_edges
                        .iter()
                        .map(|l| (true, l.clone()))
                        .chain(record.out_edges.iter().map(|l| (false, l.clone())))
                        .collect()
                };
                for (incoming, link) in links {
                    let inverse = if incoming {
                        DeltaAction::AddInEdge {
                            edge_type: link.edge_type,
                            other: link.other.clone(),
                            gid: link.gid,
                        }
                    } else {
                        DeltaAction::AddOutEdge {
                            edge_type: link.edge_type,
                            other: link.other.clone(),
                            gid: link.gid,
                        }
                    };
                    self.splice_vertex_delta(&pk, writer, inverse)?;
                    if let Some(vertex) = self.vertices.get_mut(&pk) {
                        if incoming {
                            vertex.in_edges.retain(|l| l.gid != link.gid);
                        } else {
                            vertex.out_edges.retain(|l| l.gid != link.gid);
                        }
                    }
                    if self.properties_on_edges && self.edges.contains_key(&link.gid) {
                        self.splice_edge_delta(link.gid, writer, DeltaAction::RecreateObject)?;
                        if let Some(edge) = self.edges.get_mut(&link.gid) {
                            edge.deleted = true;
                        }
                    }
                }
            }
            self.splice_vertex_delta(&pk, writer, DeltaAction::RecreateObject)?;
            let (labels, props): (Vec<LabelId>, Vec<(PropertyId, Value)>) = {
                let vertex = &self.vertices[&pk];
                (
                    vertex.secondary_labels.clone(),
                    vertex
                        .properties
                        .iter()
                        .map(|(p, v)| (*p, v.clone()))
                        .collect(),
                )
            };
            if let Some(vertex) = self.vertices.get_mut(&pk) {
                vertex.deleted = true;
            }
            for label in labels {
                self.indices.remove_label_entry(label, &pk);
            }
            for (property, value) in props {
                self.indices
                    .remove_property_entry(self.label, property, &value, &pk);
            }
            info!(key = %pk, txn = writer, "vertex deleted");
        }
        Ok(())
    }

    pub fn update_vertices(&mut self, request: UpdateVerticesRequest) -> ShardResult<()> {
        self.check_transaction_usable(request.transaction_id)?;
        for update in &request.update_vertices {
            if !self.owns_key(&update.primary_key) {
                return Err(self.not_owned(&update.primary_key));
            }
            let record = self
                .vertices
                .get(&update.primary_key)
                .ok_or_else(|| ShardError::not_found(format!("vertex {}", update.primary_key)))?;
            self.check_write_conflict(record.delta_head, request.transaction_id)?;
        }
        let writer = self.ensure_transaction(request.transaction_id);
        for update in request.update_vertices {
            let pk = update.primary_key.clone();
            for label in &update.add_labels {
                if self.vertices[&pk].secondary_labels.contains(label) {
                    continue;
                }
                self.splice_vertex_delta(&pk, writer, DeltaAction::RemoveLabel { label: *label })?;
                if let Some(vertex) = self.vertices.get_mut(&pk) {
                    vertex.secondary_labels.push(*label);
                }
                self.indices.add_label_entry(*label, &pk);
            }
            for label in &update.remove_labels {
                if !self.vertices[&pk].secondary_labels.contains(label) {
                    continue;
                }
                self.splice_vertex_delta(&pk, writer, DeltaAction::AddLabel { label: *label })?;
                if let Some(vertex) = self.vertices.get_mut(&pk) {
                    vertex.secondary_labels.retain(|l| l != label);
                }
                self.indices.remove_label_entry(*label, &pk);
            }
            for (property, new_value) in update.property_updates {
                let old_value = self.vertices[&pk].properties.get(&property).cloned();
                self.splice_vertex_delta(
                    &pk,
                    writer,
                    DeltaAction::SetProperty {
                        property,
                        value: old_value.clone(),
                    },
                )?;
                if let Some(vertex) = self.vertices.get_mut(&pk) {
                    match &new_value {
                        Some(value) => {
                            vertex.properties.insert(property, value.clone());
                        }
                        None => {
                            vertex.properties.remove(&property);
                        }
                    }
                }
                if let Some(old) = &old_value {
                    self.indices
                        .remove_property_entry(self.label, property, old, &pk);
                }
                if let Some(new) = &new_value {
                    self.indices
                        .add_property_entry(self.label, property, new, &pk);
                }
            }
        }
        Ok(())
    }

    pub fn update_edges(&mut self, request: UpdateEdgesRequest) -> ShardResult<()> {
        self.check_transaction_usable(request.transaction_id)?;
        if !self.properties_on_edges {
            return Err(ShardError::schema(
                "edges carry no properties in this deployment",
            ));
        }
        for update in &request.new_properties {
            let record = self
                .edges
                .get(&update.edge.gid)
                .ok_or_else(|| ShardError::not_found(format!("edge {}", update.edge.gid)))?;
            self.check_write_conflict(record.delta_head, request.transaction_id)?;
        }
        let writer = self.ensure_transaction(request.transaction_id);
        for update in request.new_properties {
            let gid = update.edge.gid;
            for (property, new_value) in update.property_updates {
                let old_value = self.edges[&gid].properties.get(&property).cloned();
                self.splice_edge_delta(
                    gid,
                    writer,
                    DeltaAction::SetProperty {
                        property,
                        value: old_value,
                    },
                )?;
                if let Some(edge) = self.edges.get_mut(&gid) {
                    match new_value {
                        Some(value) => {
                            edge.properties.insert(property, value);
                        }
                        None => {
                            edge.properties.remove(&property);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn delete_edges(&mut self, request: DeleteEdgesRequest) -> ShardResult<()> {
        self.check_transaction_usable(request.transaction_id)?;
        for edge in &request.edges {
            let src_owned =
                edge.src.label == self.label && self.owns_key(&edge.src.primary_key);
            let dst_owned =
                edge.dst.label == self.label && self.owns_key(&edge.dst.primary_key);
            if !src_owned && !dst_owned {
                return Err(self.not_owned(&edge.src.primary_key));
            }
            // Same serialization check as every other write: the chains
            // this delete will splice onto must not be held by another
            // pending transaction.
            if src_owned {
                if let Some(record) = self.vertices.get(&edge.src.primary_key) {
                    self.check_write_conflict(record.delta_head, request.transaction_id)?;
                }
            }
            if dst_owned {
                if let Some(record) = self.vertices.get(&edge.dst.primary_key) {
                    self.check_write_conflict(record.delta_head, request.transaction_id)?;
                }
            }
            if self.properties_on_edges {
                if let Some(record) = self.edges.get(&edge.gid) {
                    self.check_write_conflict(record.delta_head, request.transaction_id)?;
                }
            }
        }
        let writer = self.ensure_transaction(request.transaction_id);
        for edge in request.edges {
            let src_owned =
                edge.src.label == self.label && self.owns_key(&edge.src.primary_key);
            let dst_owned =
                edge.dst.label == self.label && self.owns_key(&edge.dst.primary_key);
            if src_owned && self.vertices.contains_key(&edge.src.primary_key) {
                let pk = edge.src.primary_key.clone();
                if let Some(link) = self.vertices[&pk]
                    .out_edges
                    .iter()
                    .find(|l| l.gid == edge.gid)
                    .cloned()
                {
                    self.splice_vertex_delta(
                        &pk,
                        writer,
                        DeltaAction::AddOutEdge {
                            edge_type: link.edge_type,
                            other: link.other.clone(),
                            gid: link.gid,
                        },
                    )?;
                    if let Some(vertex) = self.vertices.get_mut(&pk) {
                        vertex.out_edges.retain(|l| l.gid != edge.gid);
                    }
                }
            }
            if dst_owned && self.vertices.contains_key(&edge.dst.primary_key) {
                let pk = edge.dst.primary_key.clone();
                if let Some(link) = self.vertices[&pk]
                    .in_edges
                    .iter()
                    .find(|l| l.gid == edge.gid)
                    .cloned()
                {
                    self.splice_vertex_delta(
                        &pk,
                        writer,
                        DeltaAction::AddInEdge {
                            edge_type: link.edge_type,
                            other: link.other.clone(),
                            gid: link.gid,
                        },
                    )?;
                    if let Some(vertex) = self.vertices.get_mut(&pk) {
                        vertex.in_edges.retain(|l| l.gid != edge.gid);
                    }
                }
            }
            if self.properties_on_edges && self.edges.contains_key(&edge.gid) {
                self.splice_edge_delta(edge.gid, writer, DeltaAction::RecreateObject)?;
                if let Some(record) = self.edges.get_mut(&edge.gid) {
                    record.deleted = true;
                }
            }
        }
        Ok(())
    }

    /// Commit is keyed by the transaction HLC and idempotent: re-delivery,
    /// and delivery to a shard the transaction never touched (the router
    /// broadcasts), are both no-ops.
    pub fn commit(&mut self, request: CommitRequest) -> ShardResult<()> {
        let start = request.transaction_id.logical_id;
        let Some(txn) = self.transactions.get_mut(&start) else {
            return Ok(());
        };
        match txn.status {
            TxnStatus::Aborted => Err(ShardError::new(
                ShardErrorKind::Aborted,
                format!("transaction {start} was aborted"),
            )),
            _ => {
                txn.commit(request.commit_timestamp);
                info!(
                    txn = start,
                    commit = request.commit_timestamp.logical_id,
                    "transaction committed"
                );
                Ok(())
            }
        }
    }

    /// Aborts a pending transaction and rolls its effects out of the
    /// materialized state. Pending deltas of one transaction sit
    /// contiguously at the head of every chain they touch (the write
    /// conflict check guarantees it), so unsplicing walks each affected
    /// chain from the head until it leaves this transaction. Chains never
    /// retain aborted deltas afterwards, which the splitter relies on.
    pub fn abort_transaction(&mut self, start: u64) {
        let Some(txn) = self.transactions.get_mut(&start) else {
            return;
        };
        if txn.status != TxnStatus::Pending {
            return;
        }
        txn.abort();
        warn!(txn = start, "aborting transaction, rolling back its deltas");

        let touched_vertices: Vec<PrimaryKey> = self
            .vertices
            .iter()
            .filter(|(_, v)| v.delta_head.map(|h| h.txn == start).unwrap_or(false))
            .map(|(pk, _)| pk.clone())
            .collect();
        for pk in touched_vertices {
            if let Some(vertex) = self.vertices.get(&pk) {
                for label in vertex.secondary_labels.clone() {
                    self.indices.remove_label_entry(label, &pk);
                }
                for (property, value) in vertex.properties.clone() {
                    self.indices
                        .remove_property_entry(self.label, property, &value, &pk);
                }
            }
            loop {
                let Some(head) = self.vertices.get(&pk).and_then(|v| v.delta_head) else {
                    break;
                };
                if head.txn != start {
                    break;
                }
                let Some((action, next)) = self
                    .transactions
                    .get(&start)
                    .and_then(|t| t.delta(head))
                    .map(|d| (d.action.clone(), d.next))
                else {
                    break;
                };
                if let Some(vertex) = self.vertices.get_mut(&pk) {
                    apply_inverse_to_vertex(vertex, &action);
                    vertex.delta_head = next;
                }
            }
            if let Some(head) = self.vertices.get(&pk).and_then(|v| v.delta_head) {
                if let Some(delta) = self
                    .transactions
                    .get_mut(&head.txn)
                    .and_then(|t| t.delta_mut(head))
                {
                    delta.prev = PrevPtr::Vertex(pk.clone());
                }
            }
            let rolled_back_to_nothing = self
                .vertices
                .get(&pk)
                .map(|v| v.deleted && v.delta_head.is_none())
                .unwrap_or(false);
            if rolled_back_to_nothing {
                self.vertices.remove(&pk);
            } else if let Some(vertex) = self.vertices.get(&pk) {
                for label in vertex.secondary_labels.clone() {
                    self.indices.add_label_entry(label, &pk);
                }
                for (property, value) in vertex.properties.clone() {
                    self.indices
                        .add_property_entry(self.label, property, &value, &pk);
                }
            }
        }

        let touched_edges: Vec<Gid> = self
            .edges
            .iter()
            .filter(|(_, e)| e.delta_head.map(|h| h.txn == start).unwrap_or(false))
            .map(|(gid, _)| *gid)
            .collect();
        for gid in touched_edges {
            loop {
                let Some(head) = self.edges.get(&gid).and_then(|e| e.delta_head) else {
                    break;
                };
                if head.txn != start {
                    break;
                }
                let Some((action, next)) = self
                    .transactions
                    .get(&start)
                    .and_then(|t| t.delta(head))
                    .map(|d| (d.action.clone(), d.next))
                else {
                    break;
                };
                if let Some(edge) = self.edges.get_mut(&gid) {
                    apply_inverse_to_edge(edge, &action);
                    edge.delta_head = next;
                }
            }
            if let Some(head) = self.edges.get(&gid).and_then(|e| e.delta_head) {
                if let Some(delta) = self
                    .transactions
                    .get_mut(&head.txn)
                    .and_then(|t| t.delta_mut(head))
                {
                    delta.prev = PrevPtr::Edge(gid);
                }
            }
            let rolled_back_to_nothing = self
                .edges
                .get(&gid)
                .map(|e| e.deleted && e.delta_head.is_none())
                .unwrap_or(false);
            if rolled_back_to_nothing {
                self.edges.remove(&gid);
            }
        }
    }

    /// A non-recoverable failure poisons the transaction on this shard;
    /// stale-routing errors stay recoverable and leave it untouched.
    fn abort_on_failure(&mut self, transaction_id: Hlc, result: &ShardResult<()>) {
        if let Err(err) = result {
            if err.kind != ShardErrorKind::NotOwned {
                self.abort_transaction(transaction_id.logical_id);
            }
        }
    }
}

fn project_properties(
    properties: &BTreeMap<PropertyId, Value>,
    wanted: Option<&[PropertyId]>,
) -> Vec<(PropertyId, Value)> {
    match wanted {
        None => properties.iter().map(|(p, v)| (*p, v.clone())).collect(),
        Some(wanted) => wanted
            .iter()
            .filter_map(|p| properties.get(p).map(|v| (*p, v.clone())))
            .collect(),
    }
}

fn filter_matches(filter: &FilterExpression, snapshot: &VertexRecord) -> bool {
    match filter {
        FilterExpression::PropertyEquals { property, value } => snapshot
            .properties
            .get(property)
            .map(|v| v == value)
            .unwrap_or(false),
        FilterExpression::HasLabel { label } => snapshot.has_label(*label),
    }
}

fn sort_rows(rows: &mut [GetPropertiesResultRow], order_by: &[OrderBy]) {
    rows.sort_by(|a, b| {
        for order in order_by {
            let left = a.props.iter().find(|(p, _)| p == &order.property);
            let right = b.props.iter().find(|(p, _)| p == &order.property);
            let ordering = match (left, right) {
                (Some((_, l)), Some((_, r))) => l.cmp(r),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            };
            let ordering = match order.direction {
                OrderingDirection::Ascending => ordering,
                OrderingDirection::Descending => ordering.reverse(),
            };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn sort_edges(edges: &mut [ExpandedEdge], order_by: &[OrderBy]) {
    edges.sort_by(|a, b| {
        for order in order_by {
            let find = |edge: &ExpandedEdge| {
                edge.properties
                    .as_ref()
                    .and_then(|props| props.iter().find(|(p, _)| p == &order.property).cloned())
            };
            let ordering = match (find(a), find(b)) {
                (Some((_, l)), Some((_, r))) => l.cmp(&r),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            };
            let ordering = match order.direction {
                OrderingDirection::Ascending => ordering,
                OrderingDirection::Descending => ordering.reverse(),
            };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn apply_inverse_to_vertex(snapshot: &mut VertexRecord, action: &DeltaAction) {
    match action {
        DeltaAction::DeleteObject => snapshot.deleted = true,
        DeltaAction::RecreateObject => snapshot.deleted = false,
        DeltaAction::SetProperty { property, value } => match value {
            Some(value) => {
                snapshot.properties.insert(*property, value.clone());
            }
            None => {
                snapshot.properties.remove(property);
            }
        },
        DeltaAction::AddLabel { label } => {
            if !snapshot.secondary_labels.contains(label) {
                snapshot.secondary_labels.push(*label);
            }
        }
        DeltaAction::RemoveLabel { label } => {
            snapshot.secondary_labels.retain(|l| l != label);
        }
        DeltaAction::AddInEdge {
            edge_type,
            other,
            gid,
        } => {
            snapshot.in_edges.push(EdgeLink {
                edge_type: *edge_type,
                other: other.clone(),
                gid: *gid,
            });
        }
        DeltaAction::RemoveInEdge { gid, .. } => {
            snapshot.in_edges.retain(|l| l.gid != *gid);
        }
        DeltaAction::AddOutEdge {
            edge_type,
            other,
            gid,
        } => {
            snapshot.out_edges.push(EdgeLink {
                edge_type: *edge_type,
                other: other.clone(),
                gid: *gid,
            });
        }
        DeltaAction::RemoveOutEdge { gid, .. } => {
            snapshot.out_edges.retain(|l| l.gid != *gid);
        }
    }
}

fn apply_inverse_to_edge(snapshot: &mut EdgeRecord, action: &DeltaAction) {
    match action {
        DeltaAction::DeleteObject => snapshot.deleted = true,
        DeltaAction::RecreateObject => snapshot.deleted = false,
        DeltaAction::SetProperty { property, value } => match value {
            Some(value) => {
                snapshot.properties.insert(*property, value.clone());
            }
            None => {
                snapshot.properties.remove(property);
            }
        },
        other => {
            warn!(?other, "ignoring vertex-only delta on an edge chain");
        }
    }
}

impl StateMachine for ShardEngine {
    type ReadRequest = ShardReadRequest;
    type ReadResponse = ShardReadResponse;
    type WriteRequest = ShardWriteRequest;
    type WriteResponse = ShardWriteResponse;

    fn read(&mut self, request: ShardReadRequest) -> ShardReadResponse {
        match request {
            ShardReadRequest::ScanVertices(request) => {
                ShardReadResponse::ScanVertices(self.scan_vertices(request))
            }
            ShardReadRequest::GetProperties(request) => {
                ShardReadResponse::GetProperties(self.get_properties(request))
            }
            ShardReadRequest::ExpandOne(request) => {
                ShardReadResponse::ExpandOne(self.expand_one(request))
            }
        }
    }

    fn apply(&mut self, request: ShardWriteRequest) -> ShardWriteResponse {
        match request {
            ShardWriteRequest::CreateVertices(request) => {
                let txn = request.transaction_id;
                let result = self.create_vertices(request);
                self.abort_on_failure(txn, &result);
                ShardWriteResponse::CreateVertices(result)
            }
            ShardWriteRequest::CreateExpand(request) => {
                let txn = request.transaction_id;
                let result = self.create_expand(request);
                self.abort_on_failure(txn, &result);
                ShardWriteResponse::CreateExpand(result)
            }
            ShardWriteRequest::DeleteVertices(request) => {
                let txn = request.transaction_id;
                let result = self.delete_vertices(request);
                self.abort_on_failure(txn, &result);
                ShardWriteResponse::DeleteVertices(result)
            }
            ShardWriteRequest::UpdateVertices(request) => {
                let txn = request.transaction_id;
                let result = self.update_vertices(request);
                self.abort_on_failure(txn, &result);
                ShardWriteResponse::UpdateVertices(result)
            }
            ShardWriteRequest::UpdateEdges(request) => {
                let txn = request.transaction_id;
                let result = self.update_edges(request);
                self.abort_on_failure(txn, &result);
                ShardWriteResponse::UpdateEdges(result)
            }
            ShardWriteRequest::DeleteEdges(request) => {
                let txn = request.transaction_id;
                let result = self.delete_edges(request);
                self.abort_on_failure(txn, &result);
                ShardWriteResponse::DeleteEdges(result)
            }
            ShardWriteRequest::Commit(request) => ShardWriteResponse::Commit(self.commit(request)),
            ShardWriteRequest::PerformSplit(request) => {
                ShardWriteResponse::PerformSplit(splitter::split_shard(self, &request.split_key))
            }
            ShardWriteRequest::InstallSplit(request) => {
                ShardWriteResponse::InstallSplit(splitter::install_split(self, request.data))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::msgs::{NewVertex, UpdateVertex};
    use crate::types::EdgeTypeId;
    use crate::value::{EdgeId, ValueType};

    pub(crate) fn int_schema() -> Vec<SchemaProperty> {
        vec![
            SchemaProperty {
                property_id: PropertyId(100),
                ty: ValueType::Int,
            },
            SchemaProperty {
                property_id: PropertyId(101),
                ty: ValueType::Int,
            },
        ]
    }

    pub(crate) fn pk(a: i64, b: i64) -> PrimaryKey {
        PrimaryKey::new(vec![Value::Int(a), Value::Int(b)])
    }

    pub(crate) fn txn(n: u64) -> Hlc {
        Hlc::new(n, 0)
    }

    pub(crate) fn test_engine() -> ShardEngine {
        ShardEngine::new(LabelId(1), int_schema(), pk(0, 0), None, true)
    }

    pub(crate) fn create(engine: &mut ShardEngine, id: Hlc, keys: &[(i64, i64)]) {
        let new_vertices = keys
            .iter()
            .map(|(a, b)| NewVertex {
                primary_label: LabelId(1),
                secondary_labels: Vec::new(),
                primary_key: pk(*a, *b),
                properties: vec![(PropertyId(7), Value::Int(a + b))],
            })
            .collect();
        engine
            .create_vertices(CreateVerticesRequest {
                transaction_id: id,
                new_vertices,
            })
            .unwrap();
    }

    pub(crate) fn scan(
        engine: &ShardEngine,
        id: Hlc,
        view: StorageView,
    ) -> Vec<ScanResultRow> {
        engine
            .scan_vertices(ScanVerticesRequest {
                transaction_id: id,
                start_id: VertexId::new(LabelId(1), engine.low_key.clone()),
                props_to_return: None,
                filter_expressions: None,
                batch_limit: None,
                storage_view: view,
            })
            .unwrap()
            .results
    }

    #[test]
    fn create_then_scan_in_own_transaction() {
        let mut engine = test_engine();
        create(&mut engine, txn(1), &[(0, 0), (13, 13)]);
        assert_eq!(scan(&engine, txn(1), StorageView::New).len(), 2);
    }

    #[test]
    fn pending_writes_are_invisible_to_other_transactions() {
        let mut engine = test_engine();
        create(&mut engine, txn(1), &[(0, 0)]);
        assert!(scan(&engine, txn(5), StorageView::Old).is_empty());
        assert!(scan(&engine, txn(5), StorageView::New).is_empty());
    }

    #[test]
    fn commit_ordering_governs_visibility() {
        let mut engine = test_engine();
        create(&mut engine, txn(1), &[(5, 5)]);
        engine
            .commit(CommitRequest {
                transaction_id: txn(1),
                commit_timestamp: txn(10),
            })
            .unwrap();
        // A transaction started after the commit sees it.
        assert_eq!(scan(&engine, txn(11), StorageView::Old).len(), 1);
        // One started before does not, under either view.
        assert!(scan(&engine, txn(5), StorageView::Old).is_empty());
        assert!(scan(&engine, txn(10), StorageView::Old).is_empty());
    }

    #[test]
    fn update_records_inverse_and_rolls_back() {
        let mut engine = test_engine();
        create(&mut engine, txn(1), &[(0, 0)]);
        engine
            .commit(CommitRequest {
                transaction_id: txn(1),
                commit_timestamp: txn(2),
            })
            .unwrap();
        let update = |value| UpdateVerticesRequest {
            transaction_id: txn(3),
            update_vertices: vec![UpdateVertex {
                primary_key: pk(0, 0),
                add_labels: Vec::new(),
                remove_labels: Vec::new(),
                property_updates: vec![(PropertyId(7), Some(Value::Int(value)))],
            }],
        };
        engine.update_vertices(update(42)).unwrap();
        // Applying the same update again is safe: the chain still rolls
        // back to the committed value.
        engine.update_vertices(update(42)).unwrap();

        let own = scan(&engine, txn(3), StorageView::New);
        assert_eq!(own[0].props[0].1, Value::Int(42));
        let other = scan(&engine, txn(9), StorageView::Old);
        assert_eq!(other[0].props[0].1, Value::Int(0));

        engine
            .commit(CommitRequest {
                transaction_id: txn(3),
                commit_timestamp: txn(10),
            })
            .unwrap();
        let later = scan(&engine, txn(11), StorageView::Old);
        assert_eq!(later[0].props[0].1, Value::Int(42));
    }

    #[test]
    fn write_write_conflict_is_detected() {
        let mut engine = test_engine();
        create(&mut engine, txn(1), &[(0, 0)]);
        let err = engine
            .update_vertices(UpdateVerticesRequest {
                transaction_id: txn(2),
                update_vertices: vec![UpdateVertex {
                    primary_key: pk(0, 0),
                    add_labels: Vec::new(),
                    remove_labels: Vec::new(),
                    property_updates: vec![(PropertyId(7), None)],
                }],
            })
            .unwrap_err();
        assert_eq!(err.kind, ShardErrorKind::Conflict);
    }

    #[test]
    fn delete_demands_detach_when_edges_exist() {
        let mut engine = test_engine();
        create(&mut engine, txn(1), &[(0, 0), (1, 1)]);
        engine
            .create_expand(CreateExpandRequest {
                transaction_id: txn(1),
                new_expands: vec![crate::msgs::NewExpand {
                    gid: Gid(0),
                    edge_type: EdgeTypeId(1),
                    src_vertex: VertexId::new(LabelId(1), pk(0, 0)),
                    dest_vertex: VertexId::new(LabelId(1), pk(1, 1)),
                    properties: Vec::new(),
                }],
            })
            .unwrap();
        let err = engine
            .delete_vertices(DeleteVerticesRequest {
                transaction_id: txn(1),
                primary_keys: vec![pk(0, 0)],
                deletion_type: DeletionType::Delete,
            })
            .unwrap_err();
        assert_eq!(err.kind, ShardErrorKind::Conflict);
        engine
            .delete_vertices(DeleteVerticesRequest {
                transaction_id: txn(1),
                primary_keys: vec![pk(0, 0)],
                deletion_type: DeletionType::DetachDelete,
            })
            .unwrap();
        assert_eq!(scan(&engine, txn(1), StorageView::New).len(), 1);
    }

    fn expand(
        engine: &ShardEngine,
        id: Hlc,
        view: StorageView,
        key: PrimaryKey,
    ) -> ExpandOneResultRow {
        let response = engine
            .expand_one(ExpandOneRequest {
                transaction_id: id,
                src_vertices: vec![VertexId::new(LabelId(1), key)],
                edge_types: Vec::new(),
                direction: EdgeDirection::Both,
                src_vertex_properties: Some(Vec::new()),
                edge_properties: None,
                filter: None,
                order_by: None,
                limit: None,
                storage_view: view,
            })
            .unwrap();
        response.result.into_iter().next().unwrap()
    }

    #[test]
    fn delete_edges_unlinks_both_endpoints() {
        let mut engine = test_engine();
        create(&mut engine, txn(1), &[(0, 0), (1, 1)]);
        engine
            .create_expand(CreateExpandRequest {
                transaction_id: txn(1),
                new_expands: vec![crate::msgs::NewExpand {
                    gid: Gid(0),
                    edge_type: EdgeTypeId(1),
                    src_vertex: VertexId::new(LabelId(1), pk(0, 0)),
                    dest_vertex: VertexId::new(LabelId(1), pk(1, 1)),
                    properties: vec![(PropertyId(7), Value::Int(5))],
                }],
            })
            .unwrap();
        engine
            .commit(CommitRequest {
                transaction_id: txn(1),
                commit_timestamp: txn(2),
            })
            .unwrap();

        engine
            .delete_edges(DeleteEdgesRequest {
                transaction_id: txn(3),
                edges: vec![EdgeId {
                    src: VertexId::new(LabelId(1), pk(0, 0)),
                    dst: VertexId::new(LabelId(1), pk(1, 1)),
                    gid: Gid(0),
                }],
            })
            .unwrap();

        // The deleting transaction no longer sees the edge from either side.
        let src = expand(&engine, txn(3), StorageView::New, pk(0, 0));
        assert!(src.out_edges.is_empty());
        let dst = expand(&engine, txn(3), StorageView::New, pk(1, 1));
        assert!(dst.in_edges.is_empty());
        // A reader that predates the commit still does: the recorded
        // inverse restores the links.
        let earlier = expand(&engine, txn(9), StorageView::Old, pk(0, 0));
        assert_eq!(earlier.out_edges.len(), 1);

        engine
            .commit(CommitRequest {
                transaction_id: txn(3),
                commit_timestamp: txn(10),
            })
            .unwrap();
        let later = expand(&engine, txn(11), StorageView::Old, pk(0, 0));
        assert!(later.out_edges.is_empty());
        let earlier = expand(&engine, txn(9), StorageView::Old, pk(0, 0));
        assert_eq!(earlier.out_edges.len(), 1, "the commit is after this reader");
        // Both vertices survive the edge deletion.
        assert_eq!(scan(&engine, txn(11), StorageView::Old).len(), 2);
    }

    #[test]
    fn delete_edges_conflicts_with_a_pending_writer() {
        let mut engine = test_engine();
        create(&mut engine, txn(1), &[(0, 0), (1, 1)]);
        engine
            .create_expand(CreateExpandRequest {
                transaction_id: txn(1),
                new_expands: vec![crate::msgs::NewExpand {
                    gid: Gid(0),
                    edge_type: EdgeTypeId(1),
                    src_vertex: VertexId::new(LabelId(1), pk(0, 0)),
                    dest_vertex: VertexId::new(LabelId(1), pk(1, 1)),
                    properties: Vec::new(),
                }],
            })
            .unwrap();
        // The creating transaction is still pending; another writer must
        // not splice over its chains.
        let err = engine
            .delete_edges(DeleteEdgesRequest {
                transaction_id: txn(2),
                edges: vec![EdgeId {
                    src: VertexId::new(LabelId(1), pk(0, 0)),
                    dst: VertexId::new(LabelId(1), pk(1, 1)),
                    gid: Gid(0),
                }],
            })
            .unwrap_err();
        assert_eq!(err.kind, ShardErrorKind::Conflict);
        // The chains still belong exclusively to the pending creator.
        assert_eq!(
            engine.vertices[&pk(0, 0)].delta_head.map(|h| h.txn),
            Some(1)
        );
    }

    #[test]
    fn commit_is_idempotent_and_tolerates_unknown_transactions() {
        let mut engine = test_engine();
        create(&mut engine, txn(1), &[(0, 0)]);
        let commit = CommitRequest {
            transaction_id: txn(1),
            commit_timestamp: txn(5),
        };
        engine.commit(commit.clone()).unwrap();
        engine.commit(commit).unwrap();
        assert_eq!(
            engine.transactions[&1].commit,
            Some(txn(5)),
            "second commit must not move the timestamp"
        );
        engine
            .commit(CommitRequest {
                transaction_id: txn(77),
                commit_timestamp: txn(78),
            })
            .unwrap();
    }

    #[test]
    fn abort_rolls_the_materialized_state_back() {
        let mut engine = test_engine();
        create(&mut engine, txn(1), &[(0, 0)]);
        engine
            .commit(CommitRequest {
                transaction_id: txn(1),
                commit_timestamp: txn(2),
            })
            .unwrap();
        engine
            .update_vertices(UpdateVerticesRequest {
                transaction_id: txn(3),
                update_vertices: vec![UpdateVertex {
                    primary_key: pk(0, 0),
                    add_labels: vec![LabelId(9)],
                    remove_labels: Vec::new(),
                    property_updates: vec![(PropertyId(7), Some(Value::Int(99)))],
                }],
            })
            .unwrap();
        create(&mut engine, txn(3), &[(2, 2)]);
        engine.abort_transaction(3);

        let rows = scan(&engine, txn(50), StorageView::Old);
        assert_eq!(rows.len(), 1, "the aborted create must vanish");
        assert_eq!(rows[0].props[0].1, Value::Int(0));
        assert!(rows[0].vertex.labels.is_empty());
        // The chain must not retain aborted deltas.
        assert!(engine.vertices[&pk(0, 0)]
            .delta_head
            .map(|h| h.txn != 3)
            .unwrap_or(true));
    }

    #[test]
    fn every_live_chain_terminates_in_a_creation_marker() {
        let mut engine = test_engine();
        create(&mut engine, txn(1), &[(0, 0)]);
        engine
            .update_vertices(UpdateVerticesRequest {
                transaction_id: txn(1),
                update_vertices: vec![UpdateVertex {
                    primary_key: pk(0, 0),
                    add_labels: Vec::new(),
                    remove_labels: Vec::new(),
                    property_updates: vec![(PropertyId(8), Some(Value::Int(1)))],
                }],
            })
            .unwrap();
        let mut cursor = engine.vertices[&pk(0, 0)].delta_head;
        let mut last = None;
        let mut steps = 0;
        while let Some(id) = cursor {
            let delta = engine.transactions[&id.txn].delta(id).unwrap();
            last = Some(delta.action.clone());
            cursor = delta.next;
            steps += 1;
            assert!(steps < 16, "chain must be acyclic");
        }
        assert_eq!(last, Some(DeltaAction::DeleteObject));
    }

    #[test]
    fn scan_paginates_with_a_cursor() {
        let mut engine = test_engine();
        create(&mut engine, txn(1), &[(0, 0), (1, 0), (2, 0), (3, 0)]);
        let first = engine
            .scan_vertices(ScanVerticesRequest {
                transaction_id: txn(1),
                start_id: VertexId::new(LabelId(1), pk(0, 0)),
                props_to_return: Some(Vec::new()),
                filter_expressions: None,
                batch_limit: Some(3),
                storage_view: StorageView::New,
            })
            .unwrap();
        assert_eq!(first.results.len(), 3);
        let next = first.next_start_id.expect("a cursor must be returned");
        assert_eq!(next.primary_key, pk(3, 0));
        let second = engine
            .scan_vertices(ScanVerticesRequest {
                transaction_id: txn(1),
                start_id: next,
                props_to_return: Some(Vec::new()),
                filter_expressions: None,
                batch_limit: Some(3),
                storage_view: StorageView::New,
            })
            .unwrap();
        assert_eq!(second.results.len(), 1);
        assert!(second.next_start_id.is_none());
    }

    #[test]
    fn scan_outside_the_owned_range_is_rejected() {
        let mut engine = test_engine();
        engine.high_key = Some(pk(10, 0));
        let err = engine
            .scan_vertices(ScanVerticesRequest {
                transaction_id: txn(1),
                start_id: VertexId::new(LabelId(1), pk(10, 0)),
                props_to_return: None,
                filter_expressions: None,
                batch_limit: None,
                storage_view: StorageView::New,
            })
            .unwrap_err();
        assert_eq!(err.kind, ShardErrorKind::NotOwned);
    }

    #[test]
    fn expand_one_reports_both_directions() {
        let mut engine = test_engine();
        create(&mut engine, txn(1), &[(0, 0), (1, 1)]);
        engine
            .create_expand(CreateExpandRequest {
                transaction_id: txn(1),
                new_expands: vec![crate::msgs::NewExpand {
                    gid: Gid(0),
                    edge_type: EdgeTypeId(1),
                    src_vertex: VertexId::new(LabelId(1), pk(0, 0)),
                    dest_vertex: VertexId::new(LabelId(1), pk(1, 1)),
                    properties: vec![(PropertyId(7), Value::Int(5))],
                }],
            })
            .unwrap();
        let response = engine
            .expand_one(ExpandOneRequest {
                transaction_id: txn(1),
                src_vertices: vec![VertexId::new(LabelId(1), pk(0, 0))],
                edge_types: Vec::new(),
                direction: EdgeDirection::Both,
                src_vertex_properties: Some(Vec::new()),
                edge_properties: None,
                filter: None,
                order_by: None,
                limit: None,
                storage_view: StorageView::New,
            })
            .unwrap();
        assert_eq!(response.result.len(), 1);
        let row = &response.result[0];
        assert_eq!(row.out_edges.len(), 1);
        assert!(row.in_edges.is_empty());
        assert_eq!(row.out_edges[0].other_vertex.primary_key, pk(1, 1));
        assert_eq!(
            row.out_edges[0].properties.as_deref(),
            Some(&[(PropertyId(7), Value::Int(5))][..])
        );
    }
}
