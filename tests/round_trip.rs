//! End-to-end round-trips against an in-process cluster: create, scan,
//! cross-shard edges, expand.

use tessera::cluster::{Cluster, LabelSpec};
use tessera::msgs::{
    EdgeDirection, ExpandOneRequest, NewExpand, NewVertex, ScanResultRow, ScanVerticesRequest,
    StorageView,
};
use tessera::router::{ExecutionState, RequestRouter};
use tessera::value::{PrimaryKey, Value, ValueType, VertexId};
use tessera::{ClusterConfig, Hlc, LabelId};

const TEST_LABEL: &str = "test_label";

fn pk(a: i64, b: i64) -> PrimaryKey {
    PrimaryKey::new(vec![Value::Int(a), Value::Int(b)])
}

/// One label space split at sixteen points across the non-negative keys.
fn sixteen_way_cluster() -> Cluster {
    let split_points = (0..16)
        .map(|i| PrimaryKey::new(vec![Value::Int(i), Value::Int(i64::MIN)]))
        .collect();
    Cluster::bootstrap(
        ClusterConfig::testing(),
        1,
        vec![LabelSpec {
            name: TEST_LABEL.into(),
            schema: vec![
                ("property_1".into(), ValueType::Int),
                ("property_2".into(), ValueType::Int),
            ],
            edge_types: vec!["edge_type".into()],
            split_points,
        }],
        0,
    )
    .expect("cluster boots")
}

fn new_vertex(router: &RequestRouter, a: i64, b: i64) -> NewVertex {
    NewVertex {
        primary_label: router.name_to_label(TEST_LABEL).unwrap(),
        secondary_labels: Vec::new(),
        primary_key: pk(a, b),
        properties: Vec::new(),
    }
}

fn scan_all(router: &mut RequestRouter, view: StorageView) -> Vec<ScanResultRow> {
    let mut state = ExecutionState::with_label(TEST_LABEL);
    state.template = Some(ScanVerticesRequest {
        transaction_id: Hlc::default(),
        start_id: VertexId::new(LabelId(0), PrimaryKey::default()),
        props_to_return: None,
        filter_expressions: None,
        batch_limit: Some(4),
        storage_view: view,
    });
    let mut rows = Vec::new();
    while !state.is_completed() {
        rows.extend(router.scan_vertices(&mut state).expect("scan succeeds"));
    }
    rows
}

#[test]
fn create_scan_commit_round_trip() {
    let cluster = sixteen_way_cluster();
    let mut router = cluster.router();
    router.start_transaction().unwrap();

    let vertices = vec![new_vertex(&router, 0, 0), new_vertex(&router, 13, 13)];
    let mut state = ExecutionState::default();
    router.create_vertices(&mut state, vertices).unwrap();

    let rows = scan_all(&mut router, StorageView::New);
    assert_eq!(rows.len(), 2);

    router.commit().unwrap();

    // A later transaction observes the committed vertices.
    let mut reader = cluster.router();
    reader.start_transaction().unwrap();
    let rows = scan_all(&mut reader, StorageView::Old);
    let mut keys: Vec<PrimaryKey> = rows
        .into_iter()
        .map(|r| r.vertex.id.primary_key)
        .collect();
    keys.sort();
    assert_eq!(keys, vec![pk(0, 0), pk(13, 13)]);
}

#[test]
fn cross_shard_edges_expand_in_both_directions() {
    let cluster = sixteen_way_cluster();
    let mut router = cluster.router();
    router.start_transaction().unwrap();
    let mut state = ExecutionState::default();
    router
        .create_vertices(
            &mut state,
            vec![new_vertex(&router, 0, 0), new_vertex(&router, 13, 13)],
        )
        .unwrap();
    router.commit().unwrap();

    // (0,0) and (13,13) live on different shards, so each expand lands on
    // two shards.
    router.start_transaction().unwrap();
    let label = router.name_to_label(TEST_LABEL).unwrap();
    let edge_type = router.name_to_edge_type("edge_type").unwrap();
    let mut state = ExecutionState::default();
    router
        .create_expand(
            &mut state,
            vec![
                NewExpand {
                    gid: tessera::Gid(0),
                    edge_type,
                    src_vertex: VertexId::new(label, pk(0, 0)),
                    dest_vertex: VertexId::new(label, pk(13, 13)),
                    properties: Vec::new(),
                },
                NewExpand {
                    gid: tessera::Gid(1),
                    edge_type,
                    src_vertex: VertexId::new(label, pk(13, 13)),
                    dest_vertex: VertexId::new(label, pk(0, 0)),
                    properties: Vec::new(),
                },
            ],
        )
        .unwrap();
    router.commit().unwrap();

    let mut reader = cluster.router();
    reader.start_transaction().unwrap();
    let label = reader.name_to_label(TEST_LABEL).unwrap();
    let mut state = ExecutionState::default();
    let rows = reader
        .expand_one(
            &mut state,
            ExpandOneRequest {
                transaction_id: Hlc::default(),
                src_vertices: vec![VertexId::new(label, pk(0, 0))],
                edge_types: Vec::new(),
                direction: EdgeDirection::Both,
                src_vertex_properties: Some(Vec::new()),
                edge_properties: None,
                filter: None,
                order_by: None,
                limit: None,
                storage_view: StorageView::Old,
            },
        )
        .unwrap();
    assert_eq!(rows.len(), 1, "one row per source vertex");
    assert_eq!(rows[0].out_edges.len(), 1);
    assert_eq!(rows[0].in_edges.len(), 1);
    assert_eq!(rows[0].out_edges[0].other_vertex.primary_key, pk(13, 13));
    assert_eq!(rows[0].in_edges[0].other_vertex.primary_key, pk(13, 13));
}

#[test]
fn reentering_a_completed_operation_fails() {
    let cluster = sixteen_way_cluster();
    let mut router = cluster.router();
    router.start_transaction().unwrap();
    let mut state = ExecutionState::default();
    router
        .create_vertices(&mut state, vec![new_vertex(&router, 1, 1)])
        .unwrap();
    let err = router
        .create_vertices(&mut state, vec![new_vertex(&router, 2, 2)])
        .unwrap_err();
    assert!(matches!(err, tessera::TesseraError::StateExhausted));
}
