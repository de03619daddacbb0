//! In-process cluster harness.
//!
//! Boots a coordinator replica group and one replica per shard over the
//! shared transport, registers standby storage engines for split placement,
//! and drives the data move of a shard split after the map change commits.
//! Production deployments wire the same pieces to real machines; the
//! harness is what integration tests and embedding code talk to.

use tracing::info;

use crate::config::ClusterConfig;
use crate::coordinator::{
    Coordinator, CoordinatorClient, CoordinatorReadRequest, CoordinatorReadResponse,
    CoordinatorWriteRequest, CoordinatorWriteResponse, GetShardMapRequest,
    RegisterStorageEngineRequest, SplitShardRequest,
};
use crate::error::{Result, TesseraError};
use crate::hlc::{wall_clock_ms, Hlc};
use crate::msgs::{
    InstallSplitRequest, PerformSplitRequest, ShardClient, ShardWriteRequest, ShardWriteResponse,
};
use crate::router::RequestRouter;
use crate::rsm::{spawn_replica, Address, Network, ReplicaHandle};
use crate::shard_map::{PeerInfo, SchemaProperty, Shard, ShardMap};
use crate::storage::ShardEngine;
use crate::value::{PrimaryKey, ValueType};

/// Declarative description of one primary label at bootstrap.
pub struct LabelSpec {
    pub name: String,
    /// Ordered primary-key schema: property name and type.
    pub schema: Vec<(String, ValueType)>,
    /// Edge types this label space uses, interned into the map's registry.
    pub edge_types: Vec<String>,
    /// Low keys of the initial shards; the first one is the bottom of the
    /// key space.
    pub split_points: Vec<PrimaryKey>,
}

pub struct Cluster {
    network: Network,
    config: ClusterConfig,
    coordinator_addrs: Vec<Address>,
    coordinator_replicas: Vec<ReplicaHandle>,
    shard_replicas: Vec<ReplicaHandle>,
    admin: CoordinatorClient,
}

impl Cluster {
    /// Boots a cluster: `coordinator_replica_count` coordinator replicas,
    /// one shard replica per declared split point, and `standby_count`
    /// standby storage engines registered for future split placement.
    pub fn bootstrap(
        config: ClusterConfig,
        coordinator_replica_count: usize,
        labels: Vec<LabelSpec>,
        standby_count: usize,
    ) -> Result<Cluster> {
        let network = Network::new();

        let mut coordinator_addrs = Vec::new();
        let mut coordinator_inboxes = Vec::new();
        for _ in 0..coordinator_replica_count.max(1) {
            let (address, inbox) = network.register();
            coordinator_addrs.push(address);
            coordinator_inboxes.push(inbox);
        }

        // Build the bootstrap shard map, pre-registering one address per
        // shard so the map can name its replica before the thread runs.
        let mut map = ShardMap::new();
        let mut shard_plans = Vec::new();
        for spec in &labels {
            let schema: Vec<SchemaProperty> = spec
                .schema
                .iter()
                .map(|(prop_name, ty)| SchemaProperty {
                    property_id: map.intern_property(prop_name),
                    ty: *ty,
                })
                .collect();
            let label = map.add_label(&spec.name, schema.clone(), config.replication_factor);
            for edge_type in &spec.edge_types {
                map.intern_edge_type(edge_type);
            }
            for (ix, low_key) in spec.split_points.iter().enumerate() {
                let (address, inbox) = network.register();
                let high_key = spec.split_points.get(ix + 1).cloned();
                map.place_shard(
                    label,
                    low_key.clone(),
                    vec![PeerInfo {
                        address,
                        is_leader_hint: true,
                    }],
                )?;
                shard_plans.push((
                    address,
                    inbox,
                    ShardEngine::new(
                        label,
                        schema.clone(),
                        low_key.clone(),
                        high_key,
                        config.properties_on_edges,
                    ),
                ));
            }
        }
        map.set_version(Hlc::new(1, wall_clock_ms()));

        let mut coordinator_replicas = Vec::new();
        for (address, inbox) in coordinator_addrs.iter().zip(coordinator_inboxes) {
            coordinator_replicas.push(spawn_replica(
                network.clone(),
                *address,
                inbox,
                coordinator_addrs.clone(),
                Coordinator::new(map.clone(), &config),
                config.clone(),
            ));
        }

        let mut shard_replicas = Vec::new();
        for (address, inbox, engine) in shard_plans {
            shard_replicas.push(spawn_replica(
                network.clone(),
                address,
                inbox,
                vec![address],
                engine,
                config.clone(),
            ));
        }

        let admin = CoordinatorClient::new(network.clone(), coordinator_addrs.clone(), &config);
        let mut cluster = Cluster {
            network,
            config,
            coordinator_addrs,
            coordinator_replicas,
            shard_replicas,
            admin,
        };
        for _ in 0..standby_count {
            cluster.add_standby()?;
        }
        info!(
            coordinators = cluster.coordinator_addrs.len(),
            shards = cluster.shard_replicas.len(),
            "cluster bootstrapped"
        );
        Ok(cluster)
    }

    pub fn network(&self) -> Network {
        self.network.clone()
    }

    pub fn coordinator_addresses(&self) -> Vec<Address> {
        self.coordinator_addrs.clone()
    }

    /// A fresh router bound to this cluster's coordinator group.
    pub fn router(&self) -> RequestRouter {
        RequestRouter::new(
            self.network.clone(),
            self.coordinator_addrs.clone(),
            self.config.clone(),
        )
    }

    /// Spawns an empty standby shard replica and registers it in the
    /// coordinator's placement pool.
    pub fn add_standby(&mut self) -> Result<Address> {
        let (address, inbox) = self.network.register();
        self.shard_replicas.push(spawn_replica(
            self.network.clone(),
            address,
            inbox,
            vec![address],
            ShardEngine::standby(),
            self.config.clone(),
        ));
        let response = self.admin.send_write(
            CoordinatorWriteRequest::RegisterStorageEngine(RegisterStorageEngineRequest {
                address,
            }),
        )?;
        match response {
            CoordinatorWriteResponse::RegisterStorageEngine(true) => Ok(address),
            CoordinatorWriteResponse::RegisterStorageEngine(false) => Err(
                TesseraError::Conflict(format!("storage engine {address} already registered")),
            ),
            _ => Err(TesseraError::Corruption(
                "coordinator answered the wrong write variant".into(),
            )),
        }
    }

    /// The authoritative shard map.
    pub fn shard_map(&mut self) -> Result<ShardMap> {
        let request = CoordinatorReadRequest::GetShardMap(GetShardMapRequest {});
        match self.admin.send_read(request)? {
            CoordinatorReadResponse::GetShardMap(response) => Ok(response.shard_map),
            CoordinatorReadResponse::Hlc(_) => Err(TesseraError::Corruption(
                "coordinator answered the wrong read variant".into(),
            )),
        }
    }

    /// Splits a shard: publishes the map change through the coordinator,
    /// then drives the data move (the parent extracts the bundle, the child
    /// installs it). Readers keep running against the parent until the
    /// installation lands.
    pub fn split_shard(&mut self, label_name: &str, split_key: PrimaryKey) -> Result<()> {
        let map = self.shard_map()?;
        let label = map
            .get_label_id(label_name)
            .ok_or_else(|| TesseraError::NotFound(format!("label {label_name:?}")))?;
        let parent = map.shard_for_key(label, &split_key)?;

        let response = self
            .admin
            .send_write(CoordinatorWriteRequest::SplitShard(SplitShardRequest {
                previous_shard_map_version: map.version,
                label,
                split_key: split_key.clone(),
            }))?;
        let new_map = match response {
            CoordinatorWriteResponse::SplitShard(Ok(new_map)) => new_map,
            CoordinatorWriteResponse::SplitShard(Err(err)) => return Err(err.into()),
            _ => {
                return Err(TesseraError::Corruption(
                    "coordinator answered the wrong write variant".into(),
                ))
            }
        };
        let child = new_map.shard_for_key(label, &split_key)?;

        let data = match self
            .shard_admin_client(&parent)
            .send_write(ShardWriteRequest::PerformSplit(PerformSplitRequest {
                split_key: split_key.clone(),
            }))? {
            ShardWriteResponse::PerformSplit(Ok(data)) => data,
            ShardWriteResponse::PerformSplit(Err(err)) => return Err(err.into()),
            _ => {
                return Err(TesseraError::Corruption(
                    "shard answered the wrong write variant".into(),
                ))
            }
        };
        match self
            .shard_admin_client(&child)
            .send_write(ShardWriteRequest::InstallSplit(InstallSplitRequest { data }))?
        {
            ShardWriteResponse::InstallSplit(Ok(())) => {}
            ShardWriteResponse::InstallSplit(Err(err)) => return Err(err.into()),
            _ => {
                return Err(TesseraError::Corruption(
                    "shard answered the wrong write variant".into(),
                ))
            }
        }
        info!(label = label_name, split_key = %split_key, "shard split completed");
        Ok(())
    }

    fn shard_admin_client(&self, shard: &Shard) -> ShardClient {
        let servers: Vec<Address> = shard.peers.iter().map(|p| p.address).collect();
        ShardClient::new(self.network.clone(), servers, &self.config)
    }

    /// Address the admin client currently believes is the coordinator
    /// leader (valid after any successful admin round-trip).
    pub fn coordinator_leader_hint(&self) -> Address {
        self.admin.leader_hint()
    }

    /// Stops one coordinator replica, indistinguishable from a crash.
    pub fn stop_coordinator(&mut self, address: Address) {
        for replica in &mut self.coordinator_replicas {
            if replica.address == address {
                replica.stop();
            }
        }
    }

    /// Stops every replica in the cluster.
    pub fn shutdown(&mut self) {
        for replica in &mut self.coordinator_replicas {
            replica.stop();
        }
        for replica in &mut self.shard_replicas {
            replica.stop();
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
