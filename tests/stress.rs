//! Seeded randomized workload against a multi-shard cluster, checked
//! against an in-memory model after every commit.

use std::collections::BTreeMap;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use tessera::cluster::{Cluster, LabelSpec};
use tessera::msgs::{
    NewVertex, ScanResultRow, ScanVerticesRequest, StorageView, UpdateVertex,
};
use tessera::router::{ExecutionState, RequestRouter};
use tessera::value::{PrimaryKey, Value, ValueType, VertexId};
use tessera::{ClusterConfig, Hlc, LabelId};

const TEST_LABEL: &str = "item";
const SEED: u64 = 0x5eed_cafe;

fn pk(a: i64) -> PrimaryKey {
    PrimaryKey::new(vec![Value::Int(a)])
}

fn cluster() -> Cluster {
    let split_points = (0..4)
        .map(|i| PrimaryKey::new(vec![Value::Int(i * 256)]))
        .collect();
    Cluster::bootstrap(
        ClusterConfig::testing(),
        1,
        vec![LabelSpec {
            name: TEST_LABEL.into(),
            schema: vec![("id".into(), ValueType::Int)],
            edge_types: Vec::new(),
            split_points,
        }],
        0,
    )
    .expect("cluster boots")
}

fn scan_all(router: &mut RequestRouter) -> Vec<ScanResultRow> {
    let mut state = ExecutionState::with_label(TEST_LABEL);
    state.template = Some(ScanVerticesRequest {
        transaction_id: Hlc::default(),
        start_id: VertexId::new(LabelId(0), PrimaryKey::default()),
        props_to_return: None,
        filter_expressions: None,
        batch_limit: Some(16),
        storage_view: StorageView::Old,
    });
    let mut rows = Vec::new();
    while !state.is_completed() {
        rows.extend(router.scan_vertices(&mut state).expect("scan succeeds"));
    }
    rows
}

#[test]
fn randomized_workload_matches_a_sequential_model() {
    let cluster = cluster();
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);

    // Committed state the cluster must agree with: key → property value.
    let mut model: BTreeMap<i64, i64> = BTreeMap::new();

    for round in 0..12 {
        let mut router = cluster.router();
        router.start_transaction().unwrap();
        let label = router.name_to_label(TEST_LABEL).unwrap();
        let prop = router.name_to_property("id").unwrap();

        let creates: Vec<i64> = (0..rng.gen_range(1..6))
            .map(|_| rng.gen_range(0i64..1024))
            .filter(|k| !model.contains_key(k))
            .collect();
        let mut creates = creates;
        creates.sort();
        creates.dedup();
        if !creates.is_empty() {
            let mut state = ExecutionState::default();
            router
                .create_vertices(
                    &mut state,
                    creates
                        .iter()
                        .map(|k| NewVertex {
                            primary_label: label,
                            secondary_labels: Vec::new(),
                            primary_key: pk(*k),
                            properties: vec![(prop, Value::Int(*k))],
                        })
                        .collect(),
                )
                .unwrap();
        }

        let sampled_keys: Vec<i64> = model
            .keys()
            .filter(|_| rng.gen_bool(0.2))
            .copied()
            .collect();
        let updates: Vec<(i64, i64)> = sampled_keys
            .into_iter()
            .map(|k| (k, rng.gen_range(0i64..10_000)))
            .collect();
        if !updates.is_empty() {
            let mut state = ExecutionState::with_label(TEST_LABEL);
            router
                .update_vertices(
                    &mut state,
                    updates
                        .iter()
                        .map(|(k, v)| UpdateVertex {
                            primary_key: pk(*k),
                            add_labels: Vec::new(),
                            remove_labels: Vec::new(),
                            property_updates: vec![(prop, Some(Value::Int(*v)))],
                        })
                        .collect(),
                )
                .unwrap();
        }

        router.commit().unwrap();
        for k in creates {
            model.insert(k, k);
        }
        for (k, v) in updates {
            model.insert(k, v);
        }

        // A fresh transaction must observe exactly the model.
        let mut reader = cluster.router();
        reader.start_transaction().unwrap();
        let rows = scan_all(&mut reader);
        assert_eq!(rows.len(), model.len(), "round {round}: row count differs");
        for row in rows {
            let &Value::Int(key) = &row.vertex.id.primary_key.0[0] else {
                panic!("unexpected key type");
            };
            let expected = model[&key];
            let actual = row
                .props
                .iter()
                .find(|(p, _)| *p == prop)
                .map(|(_, v)| v.clone());
            assert_eq!(
                actual,
                Some(Value::Int(expected)),
                "round {round}: value of {key} differs"
            );
        }
    }
}
