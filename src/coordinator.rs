//! Coordinator state machine.
//!
//! A single-writer replicated state machine owning the authoritative shard
//! map and the hybrid logical clock. Batch reservation keeps HLC handouts
//! off the consensus path: `highest_reserved` is replicated, the allocation
//! cursor is leader-volatile, and a fresh leader must commit a new batch
//! (strictly above the old ceiling) before it hands out a single timestamp,
//! so no HLC is ever reused across leaderships.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::error::{ShardError, ShardErrorKind, ShardResult};
use crate::hlc::{wall_clock_ms, Hlc};
use crate::rsm::{Address, RsmClient, StateMachine};
use crate::shard_map::{PeerInfo, ShardMap};
use crate::types::LabelId;
use crate::value::PrimaryKey;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HlcRequest {
    pub last_shard_map_version: Hlc,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum HlcResponse {
    Allocated {
        new_hlc: Hlc,
        /// Present when the caller's cached map is older than authoritative;
        /// the caller must replace its map atomically.
        fresher_shard_map: Option<Box<ShardMap>>,
    },
    /// The leader has no reserved window yet (fresh leadership, batch still
    /// in the log). Retryable.
    Unavailable,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetShardMapRequest {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetShardMapResponse {
    pub shard_map: ShardMap,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocateHlcBatchRequest {
    pub low: u64,
    pub high: u64,
    /// Identifies the proposing replica, so a replica can tell its own
    /// reservation apart from an identical-range one left behind by a
    /// predecessor.
    pub proposer: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocateHlcBatchResponse {
    pub success: bool,
    pub low: u64,
    pub high: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SplitShardRequest {
    pub previous_shard_map_version: Hlc,
    pub label: LabelId,
    pub split_key: PrimaryKey,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterStorageEngineRequest {
    pub address: Address,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeregisterStorageEngineRequest {
    pub address: Address,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CoordinatorReadRequest {
    Hlc(HlcRequest),
    GetShardMap(GetShardMapRequest),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CoordinatorReadResponse {
    Hlc(HlcResponse),
    GetShardMap(GetShardMapResponse),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CoordinatorWriteRequest {
    AllocateHlcBatch(AllocateHlcBatchRequest),
    SplitShard(SplitShardRequest),
    RegisterStorageEngine(RegisterStorageEngineRequest),
    DeregisterStorageEngine(DeregisterStorageEngineRequest),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CoordinatorWriteResponse {
    AllocateHlcBatch(AllocateHlcBatchResponse),
    /// The updated map on success.
    SplitShard(ShardResult<ShardMap>),
    RegisterStorageEngine(bool),
    DeregisterStorageEngine(bool),
}

/// Client handle for the coordinator replica group.
pub type CoordinatorClient = RsmClient<
    CoordinatorWriteRequest,
    CoordinatorReadRequest,
    CoordinatorWriteResponse,
    CoordinatorReadResponse,
>;

pub struct Coordinator {
    shard_map: ShardMap,
    storage_pool: BTreeSet<Address>,
    /// Highest timestamp durably reserved through the log.
    highest_reserved: u64,
    /// Highest timestamp actually handed out. Leader-volatile: reset to the
    /// reserved ceiling on every leadership change.
    highest_allocated: u64,
    /// Leader-volatile guard so the refill proposal is not duplicated while
    /// one is in the log.
    batch_in_flight: bool,
    /// The batch this leadership proposed and has not yet seen applied.
    /// Only a window granted to *this* replica may be allocated from; a
    /// batch committed by a predecessor could already be partially handed
    /// out.
    my_pending_batch: Option<(u64, u64)>,
    proposer_id: u64,
    hlc_batch_size: u64,
    hlc_refill_margin: u64,
}

impl Coordinator {
    pub fn new(shard_map: ShardMap, config: &ClusterConfig) -> Self {
        let floor = shard_map.version.logical_id;
        Self {
            shard_map,
            storage_pool: BTreeSet::new(),
            highest_reserved: floor,
            highest_allocated: floor,
            batch_in_flight: false,
            my_pending_batch: None,
            proposer_id: rand::random(),
            hlc_batch_size: config.hlc_batch_size,
            hlc_refill_margin: config.hlc_refill_margin,
        }
    }

    fn fresher_map_for(&self, last_seen: Hlc) -> Option<Box<ShardMap>> {
        (last_seen < self.shard_map.version).then(|| Box::new(self.shard_map.clone()))
    }

    fn handle_hlc_request(&mut self, request: HlcRequest) -> HlcResponse {
        if self.highest_allocated >= self.highest_reserved {
            debug!(
                allocated = self.highest_allocated,
                reserved = self.highest_reserved,
                "allocation window exhausted"
            );
            return HlcResponse::Unavailable;
        }
        self.highest_allocated += 1;
        HlcResponse::Allocated {
            new_hlc: Hlc::new(self.highest_allocated, wall_clock_ms()),
            fresher_shard_map: self.fresher_map_for(request.last_shard_map_version),
        }
    }

    fn apply_allocate_batch(&mut self, request: AllocateHlcBatchRequest) -> AllocateHlcBatchResponse {
        self.batch_in_flight = false;
        let pending = self.my_pending_batch.take();
        let mine =
            request.proposer == self.proposer_id && pending == Some((request.low, request.high));
        // A duplicate application (at-least-once delivery, or a deposed
        // leader's proposal) no longer lines up with the ceiling; reject it.
        if request.low != self.highest_reserved || request.high <= request.low {
            warn!(
                low = request.low,
                high = request.high,
                reserved = self.highest_reserved,
                "rejecting misaligned HLC batch"
            );
            return AllocateHlcBatchResponse {
                success: false,
                low: request.low,
                high: request.high,
            };
        }
        self.highest_reserved = request.high;
        if !mine {
            // A predecessor's reservation that committed under our feet:
            // anything inside it may already be in circulation, so the whole
            // window is burned.
            self.highest_allocated = self.highest_allocated.max(request.high);
        }
        debug!(reserved = self.highest_reserved, mine, "HLC batch reserved");
        AllocateHlcBatchResponse {
            success: true,
            low: request.low,
            high: request.high,
        }
    }

    fn apply_split_shard(&mut self, request: SplitShardRequest) -> ShardResult<ShardMap> {
        let new_version = Hlc::new(
            self.shard_map.version.logical_id + 1,
            self.shard_map.version.coordinator_wall_clock,
        );
        // Place the child on a standby storage engine when one is
        // registered; the pool lives in replicated state, so every replica
        // picks the same one. With an empty pool the child inherits the
        // parent's replica set.
        let standby = self.storage_pool.iter().next().copied();
        let new_peers = standby.map(|address| {
            vec![PeerInfo {
                address,
                is_leader_hint: true,
            }]
        });
        match self.shard_map.split_shard(
            request.previous_shard_map_version,
            request.label,
            request.split_key.clone(),
            new_peers,
            new_version,
        ) {
            Ok(()) => {
                if let Some(address) = standby {
                    self.storage_pool.remove(&address);
                }
                info!(
                    label = %request.label,
                    split_key = %request.split_key,
                    version = new_version.logical_id,
                    "shard map split applied"
                );
                Ok(self.shard_map.clone())
            }
            Err(err) => Err(ShardError::new(ShardErrorKind::Conflict, err.to_string())),
        }
    }
}

impl StateMachine for Coordinator {
    type ReadRequest = CoordinatorReadRequest;
    type ReadResponse = CoordinatorReadResponse;
    type WriteRequest = CoordinatorWriteRequest;
    type WriteResponse = CoordinatorWriteResponse;

    fn read(&mut self, request: CoordinatorReadRequest) -> CoordinatorReadResponse {
        match request {
            CoordinatorReadRequest::Hlc(request) => {
                CoordinatorReadResponse::Hlc(self.handle_hlc_request(request))
            }
            CoordinatorReadRequest::GetShardMap(GetShardMapRequest {}) => {
                CoordinatorReadResponse::GetShardMap(GetShardMapResponse {
                    shard_map: self.shard_map.clone(),
                })
            }
        }
    }

    fn apply(&mut self, request: CoordinatorWriteRequest) -> CoordinatorWriteResponse {
        match request {
            CoordinatorWriteRequest::AllocateHlcBatch(request) => {
                CoordinatorWriteResponse::AllocateHlcBatch(self.apply_allocate_batch(request))
            }
            CoordinatorWriteRequest::SplitShard(request) => {
                CoordinatorWriteResponse::SplitShard(self.apply_split_shard(request))
            }
            CoordinatorWriteRequest::RegisterStorageEngine(request) => {
                let inserted = self.storage_pool.insert(request.address);
                CoordinatorWriteResponse::RegisterStorageEngine(inserted)
            }
            CoordinatorWriteRequest::DeregisterStorageEngine(request) => {
                let removed = self.storage_pool.remove(&request.address);
                CoordinatorWriteResponse::DeregisterStorageEngine(removed)
            }
        }
    }

    fn on_leader_start(&mut self) -> Option<CoordinatorWriteRequest> {
        // Everything below the old ceiling may have been handed out by a
        // previous leadership; burn it.
        self.highest_allocated = self.highest_reserved;
        self.batch_in_flight = true;
        let batch = (
            self.highest_reserved,
            self.highest_reserved + self.hlc_batch_size,
        );
        self.my_pending_batch = Some(batch);
        Some(CoordinatorWriteRequest::AllocateHlcBatch(
            AllocateHlcBatchRequest {
                low: batch.0,
                high: batch.1,
                proposer: self.proposer_id,
            },
        ))
    }

    fn maintenance(&mut self) -> Option<CoordinatorWriteRequest> {
        if self.batch_in_flight {
            return None;
        }
        let margin = self.highest_reserved.saturating_sub(self.highest_allocated);
        if margin >= self.hlc_refill_margin {
            return None;
        }
        self.batch_in_flight = true;
        let batch = (
            self.highest_reserved,
            self.highest_reserved + self.hlc_batch_size,
        );
        self.my_pending_batch = Some(batch);
        Some(CoordinatorWriteRequest::AllocateHlcBatch(
            AllocateHlcBatchRequest {
                low: batch.0,
                high: batch.1,
                proposer: self.proposer_id,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard_map::SchemaProperty;
    use crate::types::PropertyId;
    use crate::value::{Value, ValueType};

    fn bootstrap() -> Coordinator {
        let mut map = ShardMap::new();
        let label = map.add_label(
            "node",
            vec![SchemaProperty {
                property_id: PropertyId(0),
                ty: ValueType::Int,
            }],
            1,
        );
        map.place_shard(
            label,
            PrimaryKey::new(vec![Value::Int(i64::MIN)]),
            Vec::new(),
        )
        .unwrap();
        map.set_version(Hlc::new(1, 0));
        Coordinator::new(map, &ClusterConfig::testing())
    }

    #[test]
    fn fresh_leader_cannot_allocate_until_batch_commits() {
        let mut coordinator = bootstrap();
        let response = coordinator.handle_hlc_request(HlcRequest {
            last_shard_map_version: Hlc::default(),
        });
        assert!(matches!(response, HlcResponse::Unavailable));

        let proposal = coordinator.on_leader_start().unwrap();
        let CoordinatorWriteRequest::AllocateHlcBatch(batch) = proposal else {
            panic!("leader start must reserve a batch");
        };
        let applied = coordinator.apply_allocate_batch(batch);
        assert!(applied.success);

        match coordinator.handle_hlc_request(HlcRequest {
            last_shard_map_version: Hlc::default(),
        }) {
            HlcResponse::Allocated { new_hlc, .. } => assert_eq!(new_hlc.logical_id, 2),
            HlcResponse::Unavailable => panic!("window must be open"),
        }
    }

    #[test]
    fn leader_change_never_reuses_reserved_window() {
        let mut coordinator = bootstrap();
        let CoordinatorWriteRequest::AllocateHlcBatch(batch) =
            coordinator.on_leader_start().unwrap()
        else {
            panic!("expected a batch proposal");
        };
        let ceiling = batch.high;
        coordinator.apply_allocate_batch(batch);
        // Hand out a few timestamps, then simulate a new leadership.
        for _ in 0..3 {
            coordinator.handle_hlc_request(HlcRequest {
                last_shard_map_version: Hlc::default(),
            });
        }
        let CoordinatorWriteRequest::AllocateHlcBatch(next) =
            coordinator.on_leader_start().unwrap()
        else {
            panic!("expected a batch proposal");
        };
        assert_eq!(next.low, ceiling, "new batch starts above the old ceiling");
        coordinator.apply_allocate_batch(next);
        match coordinator.handle_hlc_request(HlcRequest {
            last_shard_map_version: Hlc::default(),
        }) {
            HlcResponse::Allocated { new_hlc, .. } => {
                assert!(new_hlc.logical_id > ceiling);
            }
            HlcResponse::Unavailable => panic!("window must be open"),
        }
    }

    #[test]
    fn foreign_reservations_are_burned_wholesale() {
        let mut coordinator = bootstrap();
        // A predecessor's committed reservation applies before this replica
        // ever leads.
        let applied = coordinator.apply_allocate_batch(AllocateHlcBatchRequest {
            low: 1,
            high: 65,
            proposer: coordinator.proposer_id.wrapping_add(1),
        });
        assert!(applied.success);
        assert_eq!(
            coordinator.highest_allocated, 65,
            "nothing inside a foreign window may be handed out"
        );
        let CoordinatorWriteRequest::AllocateHlcBatch(batch) =
            coordinator.on_leader_start().unwrap()
        else {
            panic!("expected a batch proposal");
        };
        assert_eq!(batch.low, 65);
    }

    #[test]
    fn identical_range_from_another_proposer_is_not_claimed() {
        let mut coordinator = bootstrap();
        let CoordinatorWriteRequest::AllocateHlcBatch(batch) =
            coordinator.on_leader_start().unwrap()
        else {
            panic!("expected a batch proposal");
        };
        // A predecessor's identical-range entry commits first.
        let foreign = AllocateHlcBatchRequest {
            proposer: coordinator.proposer_id.wrapping_add(1),
            ..batch.clone()
        };
        assert!(coordinator.apply_allocate_batch(foreign).success);
        assert_eq!(
            coordinator.highest_allocated, batch.high,
            "the identical foreign window must be burned"
        );
        // This replica's own (now misaligned) proposal is rejected.
        assert!(!coordinator.apply_allocate_batch(batch).success);
    }

    #[test]
    fn storage_pool_registration_round_trips() {
        let mut coordinator = bootstrap();
        let address = Address::new(42);
        let registered = coordinator.apply(CoordinatorWriteRequest::RegisterStorageEngine(
            RegisterStorageEngineRequest { address },
        ));
        assert!(matches!(
            registered,
            CoordinatorWriteResponse::RegisterStorageEngine(true)
        ));
        let again = coordinator.apply(CoordinatorWriteRequest::RegisterStorageEngine(
            RegisterStorageEngineRequest { address },
        ));
        assert!(matches!(
            again,
            CoordinatorWriteResponse::RegisterStorageEngine(false)
        ));
        let removed = coordinator.apply(CoordinatorWriteRequest::DeregisterStorageEngine(
            DeregisterStorageEngineRequest { address },
        ));
        assert!(matches!(
            removed,
            CoordinatorWriteResponse::DeregisterStorageEngine(true)
        ));
    }

    #[test]
    fn split_places_the_child_on_a_registered_standby() {
        let mut coordinator = bootstrap();
        let standby = Address::new(9);
        coordinator.apply(CoordinatorWriteRequest::RegisterStorageEngine(
            RegisterStorageEngineRequest { address: standby },
        ));
        let response = coordinator.apply(CoordinatorWriteRequest::SplitShard(SplitShardRequest {
            previous_shard_map_version: Hlc::new(1, 0),
            label: LabelId(0),
            split_key: PrimaryKey::new(vec![Value::Int(100)]),
        }));
        let CoordinatorWriteResponse::SplitShard(Ok(map)) = response else {
            panic!("split must succeed");
        };
        let child = map
            .shard_for_key(LabelId(0), &PrimaryKey::new(vec![Value::Int(100)]))
            .unwrap();
        assert_eq!(child.peers.len(), 1);
        assert_eq!(child.peers[0].address, standby);
    }

    #[test]
    fn duplicate_batch_application_is_rejected() {
        let mut coordinator = bootstrap();
        let CoordinatorWriteRequest::AllocateHlcBatch(batch) =
            coordinator.on_leader_start().unwrap()
        else {
            panic!("expected a batch proposal");
        };
        assert!(coordinator.apply_allocate_batch(batch.clone()).success);
        assert!(!coordinator.apply_allocate_batch(batch).success);
    }

    #[test]
    fn stale_caller_receives_the_whole_map() {
        let mut coordinator = bootstrap();
        let CoordinatorWriteRequest::AllocateHlcBatch(batch) =
            coordinator.on_leader_start().unwrap()
        else {
            panic!("expected a batch proposal");
        };
        coordinator.apply_allocate_batch(batch);
        match coordinator.handle_hlc_request(HlcRequest {
            last_shard_map_version: Hlc::default(),
        }) {
            HlcResponse::Allocated {
                fresher_shard_map, ..
            } => assert!(fresher_shard_map.is_some()),
            HlcResponse::Unavailable => panic!("window must be open"),
        }
        match coordinator.handle_hlc_request(HlcRequest {
            last_shard_map_version: Hlc::new(1, 0),
        }) {
            HlcResponse::Allocated {
                fresher_shard_map, ..
            } => assert!(fresher_shard_map.is_none()),
            HlcResponse::Unavailable => panic!("window must be open"),
        }
    }
}
