//! Commit-timestamp visibility across transactions: a reader started after
//! a commit observes it; one started before does not.

use tessera::cluster::{Cluster, LabelSpec};
use tessera::msgs::{
    GetPropertiesRequest, NewVertex, PropertiesTarget, StorageView, UpdateVertex,
};
use tessera::router::ExecutionState;
use tessera::value::{PrimaryKey, Value, ValueType, VertexId};
use tessera::{ClusterConfig, Hlc};

const TEST_LABEL: &str = "test_label";

fn pk(a: i64, b: i64) -> PrimaryKey {
    PrimaryKey::new(vec![Value::Int(a), Value::Int(b)])
}

fn cluster() -> Cluster {
    Cluster::bootstrap(
        ClusterConfig::testing(),
        1,
        vec![LabelSpec {
            name: TEST_LABEL.into(),
            schema: vec![
                ("property_1".into(), ValueType::Int),
                ("property_2".into(), ValueType::Int),
            ],
            edge_types: Vec::new(),
            split_points: vec![PrimaryKey::new(vec![
                Value::Int(0),
                Value::Int(i64::MIN),
            ])],
        }],
        0,
    )
    .expect("cluster boots")
}

fn fetch_value(
    router: &mut tessera::router::RequestRouter,
    view: StorageView,
) -> Option<Value> {
    let label = router.name_to_label(TEST_LABEL).unwrap();
    let value_prop = router.name_to_property("property_1").unwrap();
    let mut state = ExecutionState::default();
    let rows = router
        .get_properties(
            &mut state,
            GetPropertiesRequest {
                transaction_id: Hlc::default(),
                target: PropertiesTarget::Vertices(vec![VertexId::new(label, pk(5, 5))]),
                property_ids: None,
                filter: None,
                order_by: None,
                limit: None,
                only_unique: false,
                storage_view: view,
            },
        )
        .unwrap();
    rows.into_iter().next().and_then(|row| {
        row.props
            .into_iter()
            .find(|(p, _)| *p == value_prop)
            .map(|(_, v)| v)
    })
}

#[test]
fn later_transactions_see_commits_earlier_ones_do_not() {
    let cluster = cluster();

    // T1 creates the vertex but does not commit yet.
    let mut t1 = cluster.router();
    t1.start_transaction().unwrap();
    let label = t1.name_to_label(TEST_LABEL).unwrap();
    let mut state = ExecutionState::default();
    t1.create_vertices(
        &mut state,
        vec![NewVertex {
            primary_label: label,
            secondary_labels: Vec::new(),
            primary_key: pk(5, 5),
            properties: Vec::new(),
        }],
    )
    .unwrap();
    t1.commit().unwrap();

    // T1b sets the property; T3 starts before T1b commits.
    let mut t1b = cluster.router();
    t1b.start_transaction().unwrap();
    let mut state = ExecutionState::with_label(TEST_LABEL);
    t1b.update_vertices(
        &mut state,
        vec![UpdateVertex {
            primary_key: pk(5, 5),
            add_labels: Vec::new(),
            remove_labels: Vec::new(),
            property_updates: vec![(
                t1b.name_to_property("property_1").unwrap(),
                Some(Value::Int(42)),
            )],
        }],
    )
    .unwrap();

    let mut t3 = cluster.router();
    t3.start_transaction().unwrap();

    t1b.commit().unwrap();

    // T2 starts after the commit and sees the new value.
    let mut t2 = cluster.router();
    t2.start_transaction().unwrap();
    assert_eq!(fetch_value(&mut t2, StorageView::Old), Some(Value::Int(42)));

    // T3 predates the commit: under the OLD view the write is invisible.
    assert_eq!(fetch_value(&mut t3, StorageView::Old), None);
}
