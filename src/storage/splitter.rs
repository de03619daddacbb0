//! Online shard split.
//!
//! Rehomes the key suffix `[split_key, high)` of one shard onto a new one:
//! vertices are extracted from the parent's container, incident edges are
//! moved or mirrored, and every *pending* transaction referenced by a moved
//! chain is cloned onto the bundle with its full, order-preserving delta
//! vector. Because deltas are addressed by `(transaction, index)` and
//! entities by key, the cloned graph needs no pointer rewriting: the clone's
//! links resolve against the child's own transaction table and containers.
//! Delta identity across the clone is witnessed by the delta `uuid`.
//!
//! Committed and aborted transactions are frozen history and are not
//! cloned; moved chains are cut at the first delta that belongs to one, so
//! a reader at or above the oldest-active watermark observes the same
//! logical state on parent+child as it would have on the unsplit shard.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ShardError, ShardErrorKind, ShardResult};
use crate::shard_map::SchemaProperty;
use crate::storage::delta::DeltaId;
use crate::storage::shard::ShardEngine;
use crate::storage::transaction::Transaction;
use crate::storage::vertex::{EdgeContainer, VertexContainer};
use crate::storage::Indices;
use crate::types::LabelId;
use crate::value::PrimaryKey;

/// Everything the new shard needs to take over `[low_key, high_key)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SplitData {
    pub label: LabelId,
    pub schema: Vec<SchemaProperty>,
    pub low_key: PrimaryKey,
    pub high_key: Option<PrimaryKey>,
    pub properties_on_edges: bool,
    pub vertices: Vec<(PrimaryKey, crate::storage::vertex::VertexRecord)>,
    pub edges: Vec<(crate::types::Gid, crate::storage::vertex::EdgeRecord)>,
    pub transactions: Vec<(u64, Transaction)>,
    pub indices: Indices,
}

/// Extracts the split bundle from `engine` and shrinks its owned range to
/// `[low, split_key)`. Runs inside the parent's apply loop, so readers
/// never observe a half-moved shard.
pub fn split_shard(engine: &mut ShardEngine, split_key: &PrimaryKey) -> ShardResult<SplitData> {
    if *split_key <= engine.low_key {
        return Err(ShardError::new(
            ShardErrorKind::Conflict,
            format!("split key {split_key} is at or below the shard's low key"),
        ));
    }
    if let Some(high) = &engine.high_key {
        if split_key >= high {
            return Err(ShardError::new(
                ShardErrorKind::Conflict,
                format!("split key {split_key} is outside the shard's range"),
            ));
        }
    }

    // 1. Extract the moved vertices and gather every transaction their
    //    chains reference.
    let mut moved_vertices: VertexContainer = engine.vertices.split_off(split_key);
    let mut referenced: BTreeSet<u64> = BTreeSet::new();
    for vertex in moved_vertices.values() {
        scan_chain(engine, vertex.delta_head, &mut referenced)?;
    }

    // 2. Incident edges. An edge entirely within the moved range is
    //    extracted; one whose other endpoint stays behind is mirrored so
    //    both shards can expand from their own side.
    let mut moved_edges: EdgeContainer = EdgeContainer::new();
    if engine.properties_on_edges {
        for vertex in moved_vertices.values() {
            for link in vertex.in_edges.iter().chain(vertex.out_edges.iter()) {
                let Some(record) = engine.edges.get(&link.gid) else {
                    continue;
                };
                scan_chain(engine, record.delta_head, &mut referenced)?;
                let other_stays = link.other.label == engine.label
                    && link.other.primary_key >= engine.low_key
                    && link.other.primary_key < *split_key;
                if other_stays {
                    moved_edges.insert(link.gid, record.clone());
                } else if let Some(extracted) = engine.edges.remove(&link.gid) {
                    moved_edges.insert(link.gid, extracted);
                }
            }
        }
    }

    // 3. Clone the referenced transactions that are still pending. The
    //    whole delta vector is copied in order, keeping every DeltaId (and
    //    uuid) stable across the clone.
    let cloned: BTreeMap<u64, Transaction> = referenced
        .iter()
        .filter_map(|start| {
            engine
                .transactions
                .get(start)
                .filter(|txn| txn.is_pending())
                .map(|txn| (*start, txn.clone()))
        })
        .collect();
    let mut cloned = cloned;

    // 4. Cut every moved chain at the first delta belonging to a
    //    transaction that was not cloned (frozen history).
    for vertex in moved_vertices.values_mut() {
        truncate_chain(&mut vertex.delta_head, &mut cloned)?;
    }
    for edge in moved_edges.values_mut() {
        truncate_chain(&mut edge.delta_head, &mut cloned)?;
    }

    // 5. Index entries follow their vertices.
    let moved_indices = engine.indices.split_off(split_key);

    let high_key = engine.high_key.replace(split_key.clone());
    info!(
        label = %engine.label,
        split_key = %split_key,
        vertices = moved_vertices.len(),
        edges = moved_edges.len(),
        transactions = cloned.len(),
        "shard split extracted"
    );

    Ok(SplitData {
        label: engine.label,
        schema: engine.schema.clone(),
        low_key: split_key.clone(),
        high_key,
        properties_on_edges: engine.properties_on_edges,
        vertices: moved_vertices.into_iter().collect(),
        edges: moved_edges.into_iter().collect(),
        transactions: cloned.into_iter().collect(),
        indices: moved_indices,
    })
}

/// Installs a split bundle on the receiving shard. Runs inside the child's
/// apply loop; once this returns, any read against the child resolves
/// exactly as it would have on the unsplit parent.
pub fn install_split(engine: &mut ShardEngine, data: SplitData) -> ShardResult<()> {
    if engine.label != data.label && !engine.vertices.is_empty() {
        return Err(ShardError::new(
            ShardErrorKind::Corruption,
            format!(
                "split bundle for label {} installed on a {} shard",
                data.label, engine.label
            ),
        ));
    }
    engine.label = data.label;
    engine.low_key = data.low_key.clone();
    engine.high_key = data.high_key.clone();
    engine.schema = data.schema.clone();
    engine.properties_on_edges = data.properties_on_edges;
    let vertices = data.vertices.len();
    for (pk, vertex) in data.vertices {
        engine.vertices.insert(pk, vertex);
    }
    for (gid, edge) in data.edges {
        engine.edges.insert(gid, edge);
    }
    for (start, txn) in data.transactions {
        // An install retry must not clobber a transaction the router has
        // already progressed on this shard.
        engine.transactions.entry(start).or_insert(txn);
    }
    engine.indices.absorb(data.indices);
    info!(
        label = %engine.label,
        low_key = %engine.low_key,
        vertices,
        "shard split installed"
    );
    Ok(())
}

/// Walks one chain and records every transaction it references.
fn scan_chain(
    engine: &ShardEngine,
    mut cursor: Option<DeltaId>,
    referenced: &mut BTreeSet<u64>,
) -> ShardResult<()> {
    while let Some(id) = cursor {
        referenced.insert(id.txn);
        let delta = engine
            .transactions
            .get(&id.txn)
            .and_then(|txn| txn.delta(id))
            .ok_or_else(|| {
                ShardError::new(
                    ShardErrorKind::Corruption,
                    format!("orphan delta {:?} while splitting", id),
                )
            })?;
        cursor = delta.next;
    }
    Ok(())
}

/// Cuts a cloned chain at the first delta owned by a non-cloned
/// transaction.
fn truncate_chain(
    head: &mut Option<DeltaId>,
    cloned: &mut BTreeMap<u64, Transaction>,
) -> ShardResult<()> {
    let Some(first) = *head else {
        return Ok(());
    };
    if !cloned.contains_key(&first.txn) {
        debug!(txn = first.txn, "chain head is frozen history, dropping");
        *head = None;
        return Ok(());
    }
    let mut cursor = first;
    loop {
        let next = cloned
            .get(&cursor.txn)
            .and_then(|txn| txn.delta(cursor))
            .ok_or_else(|| {
                ShardError::new(
                    ShardErrorKind::Corruption,
                    format!("cloned delta {:?} is missing", cursor),
                )
            })?
            .next;
        match next {
            Some(next_id) if cloned.contains_key(&next_id.txn) => cursor = next_id,
            Some(_) => {
                if let Some(delta) = cloned
                    .get_mut(&cursor.txn)
                    .and_then(|txn| txn.delta_mut(cursor))
                {
                    delta.next = None;
                }
                return Ok(());
            }
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgs::{
        CommitRequest, CreateExpandRequest, EdgeDirection, ExpandOneRequest, NewExpand,
        StorageView, UpdateVertex, UpdateVerticesRequest,
    };
    use crate::storage::shard::tests::{create, pk, scan, test_engine, txn};
    use crate::storage::TxnStatus;
    use crate::types::{EdgeTypeId, Gid, PropertyId};
    use crate::value::{Value, VertexId};

    /// Committed vertices at (1,1), (100,100), (1000,1000); an open
    /// transaction holds a pending property write on (100,100).
    fn split_fixture() -> (crate::storage::ShardEngine, crate::hlc::Hlc) {
        let mut engine = test_engine();
        create(&mut engine, txn(1), &[(1, 1), (100, 100), (1000, 1000)]);
        engine
            .commit(CommitRequest {
                transaction_id: txn(1),
                commit_timestamp: txn(2),
            })
            .unwrap();
        let open = txn(3);
        engine
            .update_vertices(UpdateVerticesRequest {
                transaction_id: open,
                update_vertices: vec![UpdateVertex {
                    primary_key: pk(100, 100),
                    add_labels: Vec::new(),
                    remove_labels: Vec::new(),
                    property_updates: vec![(PropertyId(7), Some(Value::Int(777)))],
                }],
            })
            .unwrap();
        (engine, open)
    }

    #[test]
    fn split_partitions_vertices_and_clones_open_transactions() {
        let (mut parent, open) = split_fixture();
        let data = split_shard(&mut parent, &pk(50, 0)).unwrap();

        assert_eq!(scan(&parent, txn(90), StorageView::Old).len(), 1);
        assert_eq!(data.vertices.len(), 2);
        assert_eq!(data.transactions.len(), 1, "only the open transaction moves");
        assert_eq!(data.transactions[0].0, open.logical_id);

        let mut child = crate::storage::ShardEngine::standby();
        install_split(&mut child, data).unwrap();

        // Pending value under the owner's NEW view, committed value for
        // everyone else: identical to the unsplit world.
        let own = scan(&child, open, StorageView::New);
        let hundred = own
            .iter()
            .find(|r| r.vertex.id.primary_key == pk(100, 100))
            .unwrap();
        assert_eq!(hundred.props[0].1, Value::Int(777));
        let other = scan(&child, txn(90), StorageView::Old);
        assert_eq!(other.len(), 2);
        let hundred = other
            .iter()
            .find(|r| r.vertex.id.primary_key == pk(100, 100))
            .unwrap();
        assert_eq!(hundred.props[0].1, Value::Int(200));

        // Committing the open transaction on the child surfaces its effect.
        child
            .commit(CommitRequest {
                transaction_id: open,
                commit_timestamp: txn(40),
            })
            .unwrap();
        let later = scan(&child, txn(41), StorageView::Old);
        let hundred = later
            .iter()
            .find(|r| r.vertex.id.primary_key == pk(100, 100))
            .unwrap();
        assert_eq!(hundred.props[0].1, Value::Int(777));
        assert_eq!(child.transactions[&open.logical_id].status, TxnStatus::Committed);
        // The parent's original record is independent of the clone.
        assert_eq!(
            parent.transactions[&open.logical_id].status,
            TxnStatus::Pending
        );
    }

    #[test]
    fn split_ranges_shrink_and_reject_foreign_keys() {
        let (mut parent, _) = split_fixture();
        let data = split_shard(&mut parent, &pk(50, 0)).unwrap();
        assert!(parent.owns_key(&pk(1, 1)));
        assert!(!parent.owns_key(&pk(100, 100)));
        assert_eq!(data.low_key, pk(50, 0));
        assert_eq!(data.high_key, None);

        let err = split_shard(&mut parent, &pk(60, 0)).unwrap_err();
        assert_eq!(err.kind, crate::error::ShardErrorKind::Conflict);
    }

    #[test]
    fn cross_range_edges_are_mirrored_not_moved() {
        let (mut parent, open) = split_fixture();
        parent
            .create_expand(CreateExpandRequest {
                transaction_id: open,
                new_expands: vec![NewExpand {
                    gid: Gid(8),
                    edge_type: EdgeTypeId(1),
                    src_vertex: VertexId::new(parent.label, pk(1, 1)),
                    dest_vertex: VertexId::new(parent.label, pk(1000, 1000)),
                    properties: vec![(PropertyId(9), Value::Int(1))],
                }],
            })
            .unwrap();
        let data = split_shard(&mut parent, &pk(50, 0)).unwrap();
        // The edge record must exist on both sides: the parent still owns
        // the source endpoint, the child owns the destination.
        assert!(parent.edges.contains_key(&Gid(8)));
        assert!(data.edges.iter().any(|(gid, _)| *gid == Gid(8)));

        let mut child = crate::storage::ShardEngine::standby();
        install_split(&mut child, data).unwrap();
        let rows = child
            .expand_one(ExpandOneRequest {
                transaction_id: open,
                src_vertices: vec![VertexId::new(child.label, pk(1000, 1000))],
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
        assert_eq!(rows.result.len(), 1);
        assert_eq!(rows.result[0].in_edges.len(), 1);
        assert_eq!(rows.result[0].in_edges[0].other_vertex.primary_key, pk(1, 1));
    }

    #[test]
    fn frozen_history_is_cut_from_moved_chains() {
        let (mut parent, _) = split_fixture();
        let data = split_shard(&mut parent, &pk(500, 0)).unwrap();
        // (1000,1000) carries only committed history, so its chain is cut
        // to nothing and the materialized state stands alone.
        let (_, vertex) = data
            .vertices
            .iter()
            .find(|(pk_, _)| *pk_ == pk(1000, 1000))
            .unwrap();
        assert!(vertex.delta_head.is_none());
    }
}
