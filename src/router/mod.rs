//! Request router.
//!
//! Client-side orchestrator embedded in the query executor: owns the
//! transaction lifecycle, resolves graph keys to shards through its cached
//! shard map, fans requests out to the leader replica of every target
//! shard, tracks paginated responses, and commits atomically across every
//! touched shard. Locally recoverable failures (stale map, redirection,
//! deadline) are absorbed here; everything else surfaces as a transaction
//! abort.

use std::collections::{BTreeMap, HashMap};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::coordinator::{
    CoordinatorClient, CoordinatorReadRequest, CoordinatorReadResponse, GetShardMapRequest,
    HlcRequest, HlcResponse,
};
use crate::error::{Result, ShardError, ShardErrorKind, TesseraError};
use crate::hlc::Hlc;
use crate::msgs::{
    CommitRequest, CreateExpandRequest, CreateVerticesRequest, DeleteEdgesRequest,
    DeleteVerticesRequest, DeletionType, ExpandOneRequest, ExpandOneResultRow,
    GetPropertiesRequest, GetPropertiesResultRow, NewExpand, NewVertex, OrderBy,
    PropertiesTarget, ScanResultRow, ScanVerticesRequest, ShardClient, ShardReadRequest,
    ShardReadResponse, ShardWriteRequest, ShardWriteResponse, StorageView, UpdateEdgeProp,
    UpdateVertex, UpdateVerticesRequest,
};
use crate::rsm::{Address, Network};
use crate::shard_map::{NameIdMapper, Shard, ShardMap};
use crate::types::{EdgeTypeId, LabelId, PropertyId};
use crate::value::{PrimaryKey, VertexId};

mod execution;

pub use execution::{ExecutionState, ExecutionStatus, PaginatedResponseState};

/// How many times a single operation re-plans after stale-map errors before
/// giving up.
const MAX_REPLANS: usize = 4;

/// Pool of per-shard storage clients, keyed by shard identity and purged
/// whenever the shard map changes.
struct RsmStorageClientManager {
    cli_cache: BTreeMap<Shard, ShardClient>,
}

impl RsmStorageClientManager {
    fn new() -> Self {
        Self {
            cli_cache: BTreeMap::new(),
        }
    }

    fn exists(&self, shard: &Shard) -> bool {
        self.cli_cache.contains_key(shard)
    }

    fn add_client(&mut self, shard: Shard, client: ShardClient) {
        self.cli_cache.insert(shard, client);
    }

    fn get_client(&mut self, shard: &Shard) -> Option<&mut ShardClient> {
        self.cli_cache.get_mut(shard)
    }

    fn drop_client(&mut self, shard: &Shard) {
        self.cli_cache.remove(shard);
    }

    fn purge_cache(&mut self) {
        self.cli_cache.clear();
    }
}

pub struct RequestRouter {
    network: Network,
    config: ClusterConfig,
    shard_map: ShardMap,
    labels: NameIdMapper,
    properties: NameIdMapper,
    edge_types: NameIdMapper,
    coord_client: CoordinatorClient,
    storage_clients: RsmStorageClientManager,
    transaction_id: Hlc,
}

impl RequestRouter {
    pub fn new(network: Network, coordinator: Vec<Address>, config: ClusterConfig) -> Self {
        let coord_client = CoordinatorClient::new(network.clone(), coordinator, &config);
        Self {
            network,
            config,
            shard_map: ShardMap::new(),
            labels: NameIdMapper::default(),
            properties: NameIdMapper::default(),
            edge_types: NameIdMapper::default(),
            coord_client,
            storage_clients: RsmStorageClientManager::new(),
            transaction_id: Hlc::default(),
        }
    }

    pub fn transaction_id(&self) -> Hlc {
        self.transaction_id
    }

    pub fn shard_map(&self) -> &ShardMap {
        &self.shard_map
    }

    // ------------------------------------------------------------------
    // Name ↔ id registries
    // ------------------------------------------------------------------

    pub fn name_to_label(&self, name: &str) -> Result<LabelId> {
        self.shard_map
            .get_label_id(name)
            .ok_or_else(|| TesseraError::NotFound(format!("label {name:?}")))
    }

    pub fn name_to_property(&self, name: &str) -> Result<PropertyId> {
        self.shard_map
            .get_property_id(name)
            .ok_or_else(|| TesseraError::NotFound(format!("property {name:?}")))
    }

    pub fn name_to_edge_type(&self, name: &str) -> Result<EdgeTypeId> {
        self.shard_map
            .get_edge_type_id(name)
            .ok_or_else(|| TesseraError::NotFound(format!("edge type {name:?}")))
    }

    pub fn label_to_name(&self, label: LabelId) -> Option<&str> {
        self.labels.id_to_name(label.0 as u64)
    }

    pub fn property_to_name(&self, property: PropertyId) -> Option<&str> {
        self.properties.id_to_name(property.0 as u64)
    }

    pub fn edge_type_to_name(&self, edge_type: EdgeTypeId) -> Option<&str> {
        self.edge_types.id_to_name(edge_type.0 as u64)
    }

    pub fn is_primary_label(&self, label: LabelId) -> bool {
        self.shard_map.is_primary_label(label)
    }

    pub fn is_primary_key(&self, label: LabelId, property: PropertyId) -> bool {
        self.shard_map.is_primary_key_property(label, property)
    }

    fn set_up_name_id_mappers(&mut self) {
        let mut id_to_name: HashMap<u64, String> = HashMap::new();
        for (name, id) in self.shard_map.label_registry() {
            id_to_name.insert(id.0 as u64, name.clone());
        }
        self.labels.store_mapping(std::mem::take(&mut id_to_name));
        for (name, id) in self.shard_map.property_registry() {
            id_to_name.insert(id.0 as u64, name.clone());
        }
        self.properties.store_mapping(std::mem::take(&mut id_to_name));
        for (name, id) in self.shard_map.edge_type_registry() {
            id_to_name.insert(id.0 as u64, name.clone());
        }
        self.edge_types.store_mapping(id_to_name);
    }

    fn install_shard_map(&mut self, map: ShardMap) {
        debug!(version = map.version.logical_id, "installing fresher shard map");
        self.shard_map = map;
        self.set_up_name_id_mappers();
        self.storage_clients.purge_cache();
    }

    // ------------------------------------------------------------------
    // Transaction lifecycle
    // ------------------------------------------------------------------

    /// Opens a transaction: asks the coordinator for the transaction HLC,
    /// replacing the cached shard map when a fresher one rides along.
    pub fn start_transaction(&mut self) -> Result<()> {
        let hlc = self.request_hlc()?;
        self.transaction_id = hlc;
        debug!(txn = self.transaction_id.logical_id, "transaction started");
        Ok(())
    }

    /// Commits: fetches the commit timestamp, then broadcasts an idempotent
    /// commit to every shard in the current map (a split may have rehomed
    /// deltas onto shards this router never addressed). Any shard error
    /// aborts the commit report.
    pub fn commit(&mut self) -> Result<()> {
        if self.transaction_id == Hlc::default() {
            return Err(TesseraError::InvalidArgument(
                "no transaction in progress".into(),
            ));
        }
        let commit_timestamp = self.request_hlc()?;
        let commit_req = CommitRequest {
            transaction_id: self.transaction_id,
            commit_timestamp,
        };
        for shard in self.shard_map.all_shards() {
            let client = self.storage_client_for_shard(&shard)?;
            let response = client.send_write(ShardWriteRequest::Commit(commit_req.clone()))?;
            if let Err(err) = write_result(response) {
                warn!(
                    txn = commit_req.transaction_id.logical_id,
                    error = %err.message,
                    "commit failed on a shard, transaction aborted"
                );
                return Err(TesseraError::Aborted(err.message));
            }
        }
        info!(
            txn = commit_req.transaction_id.logical_id,
            commit = commit_timestamp.logical_id,
            "transaction committed"
        );
        self.transaction_id = Hlc::default();
        Ok(())
    }

    /// One coordinator HLC round-trip, absorbing `Unavailable` (a fresh
    /// coordinator leader whose batch is still in the log) within the
    /// request deadline.
    fn request_hlc(&mut self) -> Result<Hlc> {
        let give_up = Instant::now() + self.config.request_deadline;
        loop {
            let request = CoordinatorReadRequest::Hlc(HlcRequest {
                last_shard_map_version: self.shard_map.version,
            });
            let response = self.coord_client.send_read(request)?;
            match response {
                CoordinatorReadResponse::Hlc(HlcResponse::Allocated {
                    new_hlc,
                    fresher_shard_map,
                }) => {
                    if let Some(map) = fresher_shard_map {
                        self.install_shard_map(*map);
                    }
                    return Ok(new_hlc);
                }
                CoordinatorReadResponse::Hlc(HlcResponse::Unavailable) => {
                    if Instant::now() >= give_up {
                        return Err(TesseraError::TimedOut(
                            "coordinator has no allocatable HLC window".into(),
                        ));
                    }
                    thread::sleep(Duration::from_millis(2));
                }
                CoordinatorReadResponse::GetShardMap(_) => {
                    return Err(TesseraError::Corruption(
                        "coordinator answered the wrong read variant".into(),
                    ))
                }
            }
        }
    }

    /// Replaces the cached map with the authoritative one.
    pub fn refresh_shard_map(&mut self) -> Result<()> {
        let request = CoordinatorReadRequest::GetShardMap(GetShardMapRequest {});
        match self.coord_client.send_read(request)? {
            CoordinatorReadResponse::GetShardMap(response) => {
                self.install_shard_map(response.shard_map);
                Ok(())
            }
            CoordinatorReadResponse::Hlc(_) => Err(TesseraError::Corruption(
                "coordinator answered the wrong read variant".into(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Shard clients
    // ------------------------------------------------------------------

    fn storage_client_for_shard(&mut self, shard: &Shard) -> Result<&mut ShardClient> {
        if !self.storage_clients.exists(shard) {
            if shard.peers.is_empty() {
                return Err(TesseraError::Corruption(format!(
                    "shard at {} has an empty replica set",
                    shard.low_key
                )));
            }
            let servers: Vec<Address> = shard.peers.iter().map(|p| p.address).collect();
            let client = ShardClient::new(self.network.clone(), servers, &self.config);
            self.storage_clients.add_client(shard.clone(), client);
        }
        self.storage_clients
            .get_client(shard)
            .ok_or_else(|| TesseraError::Corruption("client cache lost an entry".into()))
    }

    // ------------------------------------------------------------------
    // ScanVertices
    // ------------------------------------------------------------------

    /// Drives one pagination round of a multi-shard vertex scan: every
    /// still-active shard contributes its next batch. Re-enter until the
    /// state reports completion.
    pub fn scan_vertices(
        &mut self,
        state: &mut ExecutionState<ScanVerticesRequest>,
    ) -> Result<Vec<ScanResultRow>> {
        self.initialize_scan_state(state)?;
        let mut responses = Vec::new();
        let mut tracker: BTreeMap<Shard, PaginatedResponseState> = state
            .shard_cache
            .iter()
            .map(|shard| (shard.clone(), PaginatedResponseState::Pending))
            .collect();

        let mut replans = 0usize;
        loop {
            match self.await_paginated_round(state, &mut responses, &mut tracker) {
                Ok(()) => {}
                Err(RoundTrip::Stale) => {
                    replans += 1;
                    if replans > MAX_REPLANS {
                        return Err(TesseraError::Stale(
                            "shard map kept moving during a scan".into(),
                        ));
                    }
                    self.replan_scan(state, &mut tracker)?;
                    continue;
                }
                Err(RoundTrip::Failed(err)) => return Err(err.into()),
            }
            let all_gathered = tracker
                .values()
                .all(|s| *s == PaginatedResponseState::PartiallyFinished);
            if state.shard_cache.is_empty() || all_gathered {
                break;
            }
        }
        if state.shard_cache.is_empty() {
            state.status = ExecutionStatus::Completed;
        }
        Ok(responses)
    }

    fn initialize_scan_state(
        &mut self,
        state: &mut ExecutionState<ScanVerticesRequest>,
    ) -> Result<()> {
        state.check_not_exhausted()?;
        if state.status != ExecutionStatus::Initializing {
            return Ok(());
        }
        state.transaction_id = self.transaction_id;
        let label_name = state
            .label
            .clone()
            .ok_or_else(|| TesseraError::InvalidArgument("scan requires a label".into()))?;
        let label = self.name_to_label(&label_name)?;
        if !self.is_primary_label(label) {
            return Err(TesseraError::InvalidArgument(format!(
                "{label_name:?} is not a primary label"
            )));
        }
        let template = state.template.clone().unwrap_or(ScanVerticesRequest {
            transaction_id: self.transaction_id,
            start_id: VertexId::new(label, PrimaryKey::default()),
            props_to_return: None,
            filter_expressions: None,
            batch_limit: Some(self.config.scan_batch_limit),
            storage_view: StorageView::New,
        });
        for shard in self.shard_map.shards_for_label(label)? {
            let mut request = template.clone();
            request.transaction_id = self.transaction_id;
            request.start_id = VertexId::new(label, shard.low_key.clone());
            state.shard_cache.push(shard);
            state.requests.push(request);
        }
        state.status = ExecutionStatus::Executing;
        Ok(())
    }

    /// One await pass over all pending shards, mirroring the 1-to-1 pairing
    /// of `shard_cache` and `requests`.
    fn await_paginated_round(
        &mut self,
        state: &mut ExecutionState<ScanVerticesRequest>,
        responses: &mut Vec<ScanResultRow>,
        tracker: &mut BTreeMap<Shard, PaginatedResponseState>,
    ) -> std::result::Result<(), RoundTrip> {
        // Send the next batch for every shard still pending. A shard whose
        // previous request is still in flight (a redirect landed mid-round)
        // is awaited as-is.
        for (ix, shard) in state.shard_cache.iter().enumerate() {
            if tracker.get(shard) != Some(&PaginatedResponseState::Pending) {
                continue;
            }
            let request = state.requests[ix].clone();
            let shard = shard.clone();
            let client = self
                .storage_client_for_shard(&shard)
                .map_err(RoundTrip::from_error)?;
            if client.has_read_in_flight() {
                continue;
            }
            client
                .send_async_read(ShardReadRequest::ScanVertices(request))
                .map_err(RoundTrip::from_error)?;
        }

        let mut ix = 0usize;
        while ix < state.shard_cache.len() {
            let shard = state.shard_cache[ix].clone();
            if tracker.get(&shard) != Some(&PaginatedResponseState::Pending) {
                ix += 1;
                continue;
            }
            let client = self
                .storage_client_for_shard(&shard)
                .map_err(RoundTrip::from_error)?;
            let Some(outcome) = client.await_async_read() else {
                // Redirection occurred; try this shard again on the next
                // pass.
                ix += 1;
                continue;
            };
            let response = outcome.map_err(RoundTrip::from_error)?;
            let ShardReadResponse::ScanVertices(result) = response else {
                return Err(RoundTrip::from_error(TesseraError::Corruption(
                    "scan answered with the wrong response variant".into(),
                )));
            };
            match result {
                Err(err) if err.kind == ShardErrorKind::NotOwned => {
                    debug!(low_key = %shard.low_key, "scan hit a shard that no longer owns the range");
                    return Err(RoundTrip::Stale);
                }
                Err(err) => return Err(RoundTrip::Failed(err)),
                Ok(mut page) => {
                    responses.append(&mut page.results);
                    let drained = match &page.next_start_id {
                        None => true,
                        Some(next) => {
                            // A cursor that leaves this shard's range under
                            // the current map belongs to a neighbour scan.
                            match self.shard_map.shard_for_key(next.label, &next.primary_key) {
                                Ok(owner) => owner != shard,
                                Err(_) => true,
                            }
                        }
                    };
                    if drained {
                        tracker.remove(&shard);
                        state.shard_cache.remove(ix);
                        state.requests.remove(ix);
                    } else {
                        if let Some(next) = page.next_start_id {
                            state.requests[ix].start_id = next;
                        }
                        tracker.insert(shard, PaginatedResponseState::PartiallyFinished);
                        ix += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Stale-map recovery for a scan: refresh, then re-home every remaining
    /// cursor onto the shard owning it under the new map. Finished shards
    /// are not re-issued.
    fn replan_scan(
        &mut self,
        state: &mut ExecutionState<ScanVerticesRequest>,
        tracker: &mut BTreeMap<Shard, PaginatedResponseState>,
    ) -> Result<()> {
        self.refresh_shard_map()?;
        let requests = std::mem::take(&mut state.requests);
        state.shard_cache.clear();
        tracker.clear();
        let mut per_shard: BTreeMap<Shard, ScanVerticesRequest> = BTreeMap::new();
        for request in requests {
            let shard = self
                .shard_map
                .shard_for_key(request.start_id.label, &request.start_id.primary_key)?;
            // One cursor per shard suffices; keep the lowest.
            match per_shard.get(&shard) {
                Some(existing)
                    if existing.start_id.primary_key <= request.start_id.primary_key => {}
                _ => {
                    per_shard.insert(shard, request);
                }
            }
        }
        for (shard, request) in per_shard {
            tracker.insert(shard.clone(), PaginatedResponseState::Pending);
            state.shard_cache.push(shard);
            state.requests.push(request);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub fn create_vertices(
        &mut self,
        state: &mut ExecutionState<CreateVerticesRequest>,
        new_vertices: Vec<NewVertex>,
    ) -> Result<()> {
        state.check_not_exhausted()?;
        if new_vertices.is_empty() {
            return Err(TesseraError::InvalidArgument(
                "create_vertices requires at least one vertex".into(),
            ));
        }
        let mut items = new_vertices;
        let mut replans = 0usize;
        loop {
            if state.status == ExecutionStatus::Initializing {
                state.transaction_id = self.transaction_id;
                let mut per_shard: BTreeMap<Shard, CreateVerticesRequest> = BTreeMap::new();
                for new_vertex in items.drain(..) {
                    self.shard_map
                        .check_primary_key(new_vertex.primary_label, &new_vertex.primary_key)?;
                    let shard = self
                        .shard_map
                        .shard_for_key(new_vertex.primary_label, &new_vertex.primary_key)?;
                    per_shard
                        .entry(shard)
                        .or_insert_with(|| CreateVerticesRequest {
                            transaction_id: self.transaction_id,
                            new_vertices: Vec::new(),
                        })
                        .new_vertices
                        .push(new_vertex);
                }
                for (shard, request) in per_shard {
                    state.shard_cache.push(shard);
                    state.requests.push(request);
                }
                state.status = ExecutionStatus::Executing;
            }
            match self.drive_writes(
                state,
                |request| ShardWriteRequest::CreateVertices(request.clone()),
            ) {
                Ok(()) => {
                    state.status = ExecutionStatus::Completed;
                    return Ok(());
                }
                Err(RoundTrip::Stale) => {
                    replans += 1;
                    if replans > MAX_REPLANS {
                        return Err(TesseraError::Stale(
                            "shard map kept moving during create_vertices".into(),
                        ));
                    }
                    self.refresh_shard_map()?;
                    items = state
                        .requests
                        .drain(..)
                        .flat_map(|r| r.new_vertices)
                        .collect();
                    state.shard_cache.clear();
                    state.status = ExecutionStatus::Initializing;
                }
                Err(RoundTrip::Failed(err)) => return Err(err.into()),
            }
        }
    }

    pub fn create_expand(
        &mut self,
        state: &mut ExecutionState<CreateExpandRequest>,
        new_expands: Vec<NewExpand>,
    ) -> Result<()> {
        state.check_not_exhausted()?;
        if new_expands.is_empty() {
            return Err(TesseraError::InvalidArgument(
                "create_expand requires at least one edge".into(),
            ));
        }
        let mut items = new_expands;
        let mut replans = 0usize;
        loop {
            if state.status == ExecutionStatus::Initializing {
                state.transaction_id = self.transaction_id;
                let transaction_id = self.transaction_id;
                let mut per_shard: BTreeMap<Shard, CreateExpandRequest> = BTreeMap::new();
                for expand in items.drain(..) {
                    let src_shard = self
                        .shard_map
                        .shard_for_key(expand.src_vertex.label, &expand.src_vertex.primary_key)?;
                    let dst_shard = self
                        .shard_map
                        .shard_for_key(expand.dest_vertex.label, &expand.dest_vertex.primary_key)?;
                    let ensure = |per_shard: &mut BTreeMap<Shard, CreateExpandRequest>,
                                  shard: &Shard| {
                        if !per_shard.contains_key(shard) {
                            per_shard.insert(
                                shard.clone(),
                                CreateExpandRequest {
                                    transaction_id,
                                    new_expands: Vec::new(),
                                },
                            );
                        }
                    };
                    ensure(&mut per_shard, &src_shard);
                    if dst_shard != src_shard {
                        // A cross-shard edge records an entry on both
                        // endpoint shards.
                        ensure(&mut per_shard, &dst_shard);
                        if let Some(request) = per_shard.get_mut(&dst_shard) {
                            request.new_expands.push(expand.clone());
                        }
                    }
                    if let Some(request) = per_shard.get_mut(&src_shard) {
                        request.new_expands.push(expand);
                    }
                }
                for (shard, request) in per_shard {
                    state.shard_cache.push(shard);
                    state.requests.push(request);
                }
                state.status = ExecutionStatus::Executing;
            }
            match self.drive_writes(
                state,
                |request| ShardWriteRequest::CreateExpand(request.clone()),
            ) {
                Ok(()) => {
                    state.status = ExecutionStatus::Completed;
                    return Ok(());
                }
                Err(RoundTrip::Stale) => {
                    replans += 1;
                    if replans > MAX_REPLANS {
                        return Err(TesseraError::Stale(
                            "shard map kept moving during create_expand".into(),
                        ));
                    }
                    self.refresh_shard_map()?;
                    let mut seen = Vec::new();
                    items = state
                        .requests
                        .drain(..)
                        .flat_map(|r| r.new_expands)
                        .filter(|e| {
                            if seen.contains(&e.gid) {
                                false
                            } else {
                                seen.push(e.gid);
                                true
                            }
                        })
                        .collect();
                    state.shard_cache.clear();
                    state.status = ExecutionStatus::Initializing;
                }
                Err(RoundTrip::Failed(err)) => return Err(err.into()),
            }
        }
    }

    pub fn update_vertices(
        &mut self,
        state: &mut ExecutionState<UpdateVerticesRequest>,
        updates: Vec<UpdateVertex>,
    ) -> Result<()> {
        state.check_not_exhausted()?;
        let label_name = state
            .label
            .clone()
            .ok_or_else(|| TesseraError::InvalidArgument("update requires a label".into()))?;
        let label = self.name_to_label(&label_name)?;
        let mut items = updates;
        let mut replans = 0usize;
        loop {
            if state.status == ExecutionStatus::Initializing {
                state.transaction_id = self.transaction_id;
                let mut per_shard: BTreeMap<Shard, UpdateVerticesRequest> = BTreeMap::new();
                for update in items.drain(..) {
                    let shard = self.shard_map.shard_for_key(label, &update.primary_key)?;
                    per_shard
                        .entry(shard)
                        .or_insert_with(|| UpdateVerticesRequest {
                            transaction_id: self.transaction_id,
                            update_vertices: Vec::new(),
                        })
                        .update_vertices
                        .push(update);
                }
                for (shard, request) in per_shard {
                    state.shard_cache.push(shard);
                    state.requests.push(request);
                }
                state.status = ExecutionStatus::Executing;
            }
            match self.drive_writes(
                state,
                |request| ShardWriteRequest::UpdateVertices(request.clone()),
            ) {
                Ok(()) => {
                    state.status = ExecutionStatus::Completed;
                    return Ok(());
                }
                Err(RoundTrip::Stale) => {
                    replans += 1;
                    if replans > MAX_REPLANS {
                        return Err(TesseraError::Stale(
                            "shard map kept moving during update_vertices".into(),
                        ));
                    }
                    self.refresh_shard_map()?;
                    items = state
                        .requests
                        .drain(..)
                        .flat_map(|r| r.update_vertices)
                        .collect();
                    state.shard_cache.clear();
                    state.status = ExecutionStatus::Initializing;
                }
                Err(RoundTrip::Failed(err)) => return Err(err.into()),
            }
        }
    }

    pub fn delete_vertices(
        &mut self,
        state: &mut ExecutionState<DeleteVerticesRequest>,
        label_name: &str,
        primary_keys: Vec<PrimaryKey>,
        deletion_type: DeletionType,
    ) -> Result<()> {
        state.check_not_exhausted()?;
        let label = self.name_to_label(label_name)?;
        let mut items = primary_keys;
        let mut replans = 0usize;
        loop {
            if state.status == ExecutionStatus::Initializing {
                state.transaction_id = self.transaction_id;
                let mut per_shard: BTreeMap<Shard, DeleteVerticesRequest> = BTreeMap::new();
                for pk in items.drain(..) {
                    let shard = self.shard_map.shard_for_key(label, &pk)?;
                    per_shard
                        .entry(shard)
                        .or_insert_with(|| DeleteVerticesRequest {
                            transaction_id: self.transaction_id,
                            primary_keys: Vec::new(),
                            deletion_type,
                        })
                        .primary_keys
                        .push(pk);
                }
                for (shard, request) in per_shard {
                    state.shard_cache.push(shard);
                    state.requests.push(request);
                }
                state.status = ExecutionStatus::Executing;
            }
            match self.drive_writes(
                state,
                |request| ShardWriteRequest::DeleteVertices(request.clone()),
            ) {
                Ok(()) => {
                    state.status = ExecutionStatus::Completed;
                    return Ok(());
                }
                Err(RoundTrip::Stale) => {
                    replans += 1;
                    if replans > MAX_REPLANS {
                        return Err(TesseraError::Stale(
                            "shard map kept moving during delete_vertices".into(),
                        ));
                    }
                    self.refresh_shard_map()?;
                    items = state
                        .requests
                        .drain(..)
                        .flat_map(|r| r.primary_keys)
                        .collect();
                    state.shard_cache.clear();
                    state.status = ExecutionStatus::Initializing;
                }
                Err(RoundTrip::Failed(err)) => return Err(err.into()),
            }
        }
    }

    pub fn update_edges(
        &mut self,
        state: &mut ExecutionState<crate::msgs::UpdateEdgesRequest>,
        updates: Vec<UpdateEdgeProp>,
    ) -> Result<()> {
        state.check_not_exhausted()?;
        let mut items = updates;
        let mut replans = 0usize;
        loop {
            if state.status == ExecutionStatus::Initializing {
                state.transaction_id = self.transaction_id;
                let mut per_shard: BTreeMap<Shard, crate::msgs::UpdateEdgesRequest> =
                    BTreeMap::new();
                for update in items.drain(..) {
                    let shard = self
                        .shard_map
                        .shard_for_key(update.edge.src.label, &update.edge.src.primary_key)?;
                    per_shard
                        .entry(shard)
                        .or_insert_with(|| crate::msgs::UpdateEdgesRequest {
                            transaction_id: self.transaction_id,
                            new_properties: Vec::new(),
                        })
                        .new_properties
                        .push(update);
                }
                for (shard, request) in per_shard {
                    state.shard_cache.push(shard);
                    state.requests.push(request);
                }
                state.status = ExecutionStatus::Executing;
            }
            match self.drive_writes(
                state,
                |request| ShardWriteRequest::UpdateEdges(request.clone()),
            ) {
                Ok(()) => {
                    state.status = ExecutionStatus::Completed;
                    return Ok(());
                }
                Err(RoundTrip::Stale) => {
                    replans += 1;
                    if replans > MAX_REPLANS {
                        return Err(TesseraError::Stale(
                            "shard map kept moving during update_edges".into(),
                        ));
                    }
                    self.refresh_shard_map()?;
                    items = state
                        .requests
                        .drain(..)
                        .flat_map(|r| r.new_properties)
                        .collect();
                    state.shard_cache.clear();
                    state.status = ExecutionStatus::Initializing;
                }
                Err(RoundTrip::Failed(err)) => return Err(err.into()),
            }
        }
    }

    pub fn delete_edges(
        &mut self,
        state: &mut ExecutionState<DeleteEdgesRequest>,
        edges: Vec<crate::value::EdgeId>,
    ) -> Result<()> {
        state.check_not_exhausted()?;
        let mut items = edges;
        let mut replans = 0usize;
        loop {
            if state.status == ExecutionStatus::Initializing {
                state.transaction_id = self.transaction_id;
                let mut per_shard: BTreeMap<Shard, DeleteEdgesRequest> = BTreeMap::new();
                for edge in items.drain(..) {
                    let src_shard = self
                        .shard_map
                        .shard_for_key(edge.src.label, &edge.src.primary_key)?;
                    let dst_shard = self
                        .shard_map
                        .shard_for_key(edge.dst.label, &edge.dst.primary_key)?;
                    for shard in [&src_shard, &dst_shard] {
                        let request = per_shard.entry(shard.clone()).or_insert_with(|| {
                            DeleteEdgesRequest {
                                transaction_id: self.transaction_id,
                                edges: Vec::new(),
                            }
                        });
                        if !request.edges.iter().any(|e| e.gid == edge.gid) {
                            request.edges.push(edge.clone());
                        }
                        if src_shard == dst_shard {
                            break;
                        }
                    }
                }
                for (shard, request) in per_shard {
                    state.shard_cache.push(shard);
                    state.requests.push(request);
                }
                state.status = ExecutionStatus::Executing;
            }
            match self.drive_writes(
                state,
                |request| ShardWriteRequest::DeleteEdges(request.clone()),
            ) {
                Ok(()) => {
                    state.status = ExecutionStatus::Completed;
                    return Ok(());
                }
                Err(RoundTrip::Stale) => {
                    replans += 1;
                    if replans > MAX_REPLANS {
                        return Err(TesseraError::Stale(
                            "shard map kept moving during delete_edges".into(),
                        ));
                    }
                    self.refresh_shard_map()?;
                    let mut seen = Vec::new();
                    items = state
                        .requests
                        .drain(..)
                        .flat_map(|r| r.edges)
                        .filter(|e| {
                            if seen.contains(&e.gid) {
                                false
                            } else {
                                seen.push(e.gid);
                                true
                            }
                        })
                        .collect();
                    state.shard_cache.clear();
                    state.status = ExecutionStatus::Initializing;
                }
                Err(RoundTrip::Failed(err)) => return Err(err.into()),
            }
        }
    }

    /// Dispatches every pending per-shard write in parallel, then awaits
    /// them, erasing each finished pair to keep `shard_cache` and
    /// `requests` one-to-one.
    fn drive_writes<Req, F>(
        &mut self,
        state: &mut ExecutionState<Req>,
        to_wire: F,
    ) -> std::result::Result<(), RoundTrip>
    where
        Req: Clone,
        F: Fn(&Req) -> ShardWriteRequest,
    {
        for (ix, shard) in state.shard_cache.iter().enumerate() {
            let request = to_wire(&state.requests[ix]);
            let shard = shard.clone();
            let client = self
                .storage_client_for_shard(&shard)
                .map_err(RoundTrip::from_error)?;
            client
                .send_async_write(request)
                .map_err(RoundTrip::from_error)?;
        }
        while !state.shard_cache.is_empty() {
            let mut ix = 0usize;
            while ix < state.shard_cache.len() {
                let shard = state.shard_cache[ix].clone();
                let client = self
                    .storage_client_for_shard(&shard)
                    .map_err(RoundTrip::from_error)?;
                let Some(outcome) = client.await_async_write() else {
                    ix += 1;
                    continue;
                };
                let response = outcome.map_err(RoundTrip::from_error)?;
                match write_result(response) {
                    Ok(()) => {
                        state.shard_cache.remove(ix);
                        state.requests.remove(ix);
                    }
                    Err(err) if err.kind == ShardErrorKind::NotOwned => {
                        // Abandon what is still in flight; the re-planned
                        // requests are idempotent.
                        for stale in &state.shard_cache {
                            self.storage_clients.drop_client(stale);
                        }
                        return Err(RoundTrip::Stale);
                    }
                    Err(err) => return Err(RoundTrip::Failed(err)),
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // ExpandOne / GetProperties
    // ------------------------------------------------------------------

    /// Fans an expand out per source-vertex shard and flattens the rows.
    /// Destination-vertex properties are not fetched; expand again on the
    /// destination shard if they are needed.
    pub fn expand_one(
        &mut self,
        state: &mut ExecutionState<ExpandOneRequest>,
        request: ExpandOneRequest,
    ) -> Result<Vec<ExpandOneResultRow>> {
        state.check_not_exhausted()?;
        let mut sources = request.src_vertices.clone();
        let mut template = request;
        template.src_vertices.clear();
        let mut rows = Vec::new();
        let mut replans = 0usize;
        loop {
            if state.status == ExecutionStatus::Initializing {
                state.transaction_id = self.transaction_id;
                template.transaction_id = self.transaction_id;
                let mut per_shard: BTreeMap<Shard, ExpandOneRequest> = BTreeMap::new();
                for src in sources.drain(..) {
                    let shard = self.shard_map.shard_for_key(src.label, &src.primary_key)?;
                    per_shard
                        .entry(shard)
                        .or_insert_with(|| template.clone())
                        .src_vertices
                        .push(src);
                }
                for (shard, request) in per_shard {
                    state.shard_cache.push(shard);
                    state.requests.push(request);
                }
                state.status = ExecutionStatus::Executing;
            }
            match self.drive_expand(state, &mut rows) {
                Ok(()) => {
                    state.status = ExecutionStatus::Completed;
                    return Ok(rows);
                }
                Err(RoundTrip::Stale) => {
                    replans += 1;
                    if replans > MAX_REPLANS {
                        return Err(TesseraError::Stale(
                            "shard map kept moving during expand_one".into(),
                        ));
                    }
                    self.refresh_shard_map()?;
                    sources = state
                        .requests
                        .drain(..)
                        .flat_map(|r| r.src_vertices)
                        .collect();
                    state.shard_cache.clear();
                    state.status = ExecutionStatus::Initializing;
                }
                Err(RoundTrip::Failed(err)) => return Err(err.into()),
            }
        }
    }

    fn drive_expand(
        &mut self,
        state: &mut ExecutionState<ExpandOneRequest>,
        rows: &mut Vec<ExpandOneResultRow>,
    ) -> std::result::Result<(), RoundTrip> {
        for (ix, shard) in state.shard_cache.iter().enumerate() {
            let request = ShardReadRequest::ExpandOne(state.requests[ix].clone());
            let shard = shard.clone();
            let client = self
                .storage_client_for_shard(&shard)
                .map_err(RoundTrip::from_error)?;
            client.send_async_read(request).map_err(RoundTrip::from_error)?;
        }
        while !state.shard_cache.is_empty() {
            let mut ix = 0usize;
            let mut progressed = false;
            while ix < state.shard_cache.len() {
                let shard = state.shard_cache[ix].clone();
                let client = self
                    .storage_client_for_shard(&shard)
                    .map_err(RoundTrip::from_error)?;
                let Some(outcome) = client.poll_async_read() else {
                    ix += 1;
                    continue;
                };
                progressed = true;
                let response = outcome.map_err(RoundTrip::from_error)?;
                let ShardReadResponse::ExpandOne(result) = response else {
                    return Err(RoundTrip::from_error(TesseraError::Corruption(
                        "expand answered with the wrong response variant".into(),
                    )));
                };
                match result {
                    Err(err) if err.kind == ShardErrorKind::NotOwned => {
                        for stale in &state.shard_cache {
                            self.storage_clients.drop_client(stale);
                        }
                        return Err(RoundTrip::Stale);
                    }
                    Err(err) => return Err(RoundTrip::Failed(err)),
                    Ok(mut response) => {
                        rows.append(&mut response.result);
                        state.shard_cache.remove(ix);
                        state.requests.remove(ix);
                    }
                }
            }
            if !progressed {
                thread::yield_now();
            }
        }
        Ok(())
    }

    /// Property fetch across shards; ordering, uniqueness and the limit are
    /// re-applied to the merged row set so the result matches a single-shard
    /// execution.
    pub fn get_properties(
        &mut self,
        state: &mut ExecutionState<GetPropertiesRequest>,
        request: GetPropertiesRequest,
    ) -> Result<Vec<GetPropertiesResultRow>> {
        state.check_not_exhausted()?;
        let order_by = request.order_by.clone();
        let limit = request.limit;
        let mut rows = Vec::new();
        let mut replans = 0usize;
        let mut pending_request = request;
        loop {
            if state.status == ExecutionStatus::Initializing {
                state.transaction_id = self.transaction_id;
                pending_request.transaction_id = self.transaction_id;
                let mut per_shard: BTreeMap<Shard, GetPropertiesRequest> = BTreeMap::new();
                match &pending_request.target {
                    PropertiesTarget::Vertices(ids) => {
                        for id in ids {
                            let shard =
                                self.shard_map.shard_for_key(id.label, &id.primary_key)?;
                            let entry =
                                per_shard.entry(shard).or_insert_with(|| GetPropertiesRequest {
                                    target: PropertiesTarget::Vertices(Vec::new()),
                                    ..pending_request.clone()
                                });
                            if let PropertiesTarget::Vertices(list) = &mut entry.target {
                                list.push(id.clone());
                            }
                        }
                    }
                    PropertiesTarget::Edges(ids) => {
                        for id in ids {
                            let shard = self
                                .shard_map
                                .shard_for_key(id.src.label, &id.src.primary_key)?;
                            let entry =
                                per_shard.entry(shard).or_insert_with(|| GetPropertiesRequest {
                                    target: PropertiesTarget::Edges(Vec::new()),
                                    ..pending_request.clone()
                                });
                            if let PropertiesTarget::Edges(list) = &mut entry.target {
                                list.push(id.clone());
                            }
                        }
                    }
                }
                for (shard, request) in per_shard {
                    state.shard_cache.push(shard);
                    state.requests.push(request);
                }
                state.status = ExecutionStatus::Executing;
            }
            match self.drive_get_properties(state, &mut rows) {
                Ok(()) => {
                    state.status = ExecutionStatus::Completed;
                    if let Some(order_by) = &order_by {
                        sort_merged_rows(&mut rows, order_by);
                    }
                    if let Some(limit) = limit {
                        rows.truncate(limit);
                    }
                    return Ok(rows);
                }
                Err(RoundTrip::Stale) => {
                    replans += 1;
                    if replans > MAX_REPLANS {
                        return Err(TesseraError::Stale(
                            "shard map kept moving during get_properties".into(),
                        ));
                    }
                    self.refresh_shard_map()?;
                    let mut vertices = Vec::new();
                    let mut edges = Vec::new();
                    for request in state.requests.drain(..) {
                        match request.target {
                            PropertiesTarget::Vertices(mut ids) => vertices.append(&mut ids),
                            PropertiesTarget::Edges(mut ids) => edges.append(&mut ids),
                        }
                    }
                    pending_request.target = if edges.is_empty() {
                        PropertiesTarget::Vertices(vertices)
                    } else {
                        PropertiesTarget::Edges(edges)
                    };
                    state.shard_cache.clear();
                    state.status = ExecutionStatus::Initializing;
                }
                Err(RoundTrip::Failed(err)) => return Err(err.into()),
            }
        }
    }

    fn drive_get_properties(
        &mut self,
        state: &mut ExecutionState<GetPropertiesRequest>,
        rows: &mut Vec<GetPropertiesResultRow>,
    ) -> std::result::Result<(), RoundTrip> {
        for (ix, shard) in state.shard_cache.iter().enumerate() {
            let request = ShardReadRequest::GetProperties(state.requests[ix].clone());
            let shard = shard.clone();
            let client = self
                .storage_client_for_shard(&shard)
                .map_err(RoundTrip::from_error)?;
            client.send_async_read(request).map_err(RoundTrip::from_error)?;
        }
        while !state.shard_cache.is_empty() {
            let mut ix = 0usize;
            while ix < state.shard_cache.len() {
                let shard = state.shard_cache[ix].clone();
                let client = self
                    .storage_client_for_shard(&shard)
                    .map_err(RoundTrip::from_error)?;
                let Some(outcome) = client.await_async_read() else {
                    ix += 1;
                    continue;
                };
                let response = outcome.map_err(RoundTrip::from_error)?;
                let ShardReadResponse::GetProperties(result) = response else {
                    return Err(RoundTrip::from_error(TesseraError::Corruption(
                        "get_properties answered with the wrong response variant".into(),
                    )));
                };
                match result {
                    Err(err) if err.kind == ShardErrorKind::NotOwned => {
                        for stale in &state.shard_cache {
                            self.storage_clients.drop_client(stale);
                        }
                        return Err(RoundTrip::Stale);
                    }
                    Err(err) => return Err(RoundTrip::Failed(err)),
                    Ok(mut response) => {
                        rows.append(&mut response.result_row);
                        state.shard_cache.remove(ix);
                        state.requests.remove(ix);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Locally recoverable vs. surfaced outcomes of one fan-out round.
enum RoundTrip {
    /// A shard no longer owns the addressed range; refresh and re-plan.
    Stale,
    /// Non-recoverable per-shard failure.
    Failed(ShardError),
}

impl RoundTrip {
    fn from_error(err: TesseraError) -> Self {
        match err {
            TesseraError::Stale(message) => {
                debug!(%message, "treating client error as stale");
                RoundTrip::Stale
            }
            other => RoundTrip::Failed(ShardError::new(
                ShardErrorKind::Aborted,
                other.to_string(),
            )),
        }
    }
}

impl From<RoundTrip> for TesseraError {
    fn from(round_trip: RoundTrip) -> Self {
        match round_trip {
            RoundTrip::Stale => TesseraError::Stale("shard map changed mid-operation".into()),
            RoundTrip::Failed(err) => err.into(),
        }
    }
}

fn write_result(response: ShardWriteResponse) -> std::result::Result<(), ShardError> {
    match response {
        ShardWriteResponse::CreateVertices(result)
        | ShardWriteResponse::CreateExpand(result)
        | ShardWriteResponse::DeleteVertices(result)
        | ShardWriteResponse::UpdateVertices(result)
        | ShardWriteResponse::UpdateEdges(result)
        | ShardWriteResponse::DeleteEdges(result)
        | ShardWriteResponse::Commit(result)
        | ShardWriteResponse::InstallSplit(result) => result,
        ShardWriteResponse::PerformSplit(result) => result.map(|_| ()),
    }
}

fn sort_merged_rows(rows: &mut [GetPropertiesResultRow], order_by: &[OrderBy]) {
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
                crate::msgs::OrderingDirection::Ascending => ordering,
                crate::msgs::OrderingDirection::Descending => ordering.reverse(),
            };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
}
