//! Leader-based replicated-state-machine runtime.
//!
//! One [`Replica`] per cluster member runs a server loop on its own thread:
//! it votes in elections, replicates a log of write requests, applies
//! committed entries to the hosted [`StateMachine`], serves reads from the
//! leader's applied state and redirects clients that reached a follower.
//!
//! Guarantees relied on by the rest of the core: at most one leader per
//! term, committed entries are never overwritten, and writes are delivered
//! at-least-once (payloads must be idempotent).

pub mod client;
pub mod transport;

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::config::ClusterConfig;

pub use client::RsmClient;
pub use transport::{decode_payload, encode_payload, Address, Envelope, Network};

/// A deterministic state machine hosted by a replica group.
///
/// `read` takes `&mut self` so leader-volatile state (such as the
/// coordinator's HLC allocation cursor) can live inside the machine without
/// going through the log; replicated state must only change in `apply`.
pub trait StateMachine: Send + 'static {
    type ReadRequest: Serialize + DeserializeOwned + Clone + Debug + Send + 'static;
    type ReadResponse: Serialize + DeserializeOwned + Clone + Debug + Send + 'static;
    type WriteRequest: Serialize + DeserializeOwned + Clone + Debug + Send + 'static;
    type WriteResponse: Serialize + DeserializeOwned + Clone + Debug + Send + 'static;

    fn read(&mut self, request: Self::ReadRequest) -> Self::ReadResponse;

    fn apply(&mut self, request: Self::WriteRequest) -> Self::WriteResponse;

    /// Proposal a fresh leader must commit before it serves traffic.
    fn on_leader_start(&mut self) -> Option<Self::WriteRequest> {
        None
    }

    /// Housekeeping proposal checked after every applied entry and served
    /// read on the leader.
    fn maintenance(&mut self) -> Option<Self::WriteRequest> {
        None
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound(serialize = "W: Serialize", deserialize = "W: DeserializeOwned"))]
pub struct LogEntry<W> {
    pub term: u64,
    pub request: W,
}

/// Every message exchanged between replicas and clients of one RSM group.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound(
    serialize = "W: Serialize, R: Serialize, WR: Serialize, RR: Serialize",
    deserialize = "W: DeserializeOwned, R: DeserializeOwned, WR: DeserializeOwned, RR: DeserializeOwned"
))]
pub enum RsmMessage<W, R, WR, RR> {
    AppendEntries {
        term: u64,
        leader: Address,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry<W>>,
        leader_commit: u64,
    },
    AppendEntriesReply {
        term: u64,
        success: bool,
        match_index: u64,
    },
    RequestVote {
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    },
    RequestVoteReply {
        term: u64,
        granted: bool,
    },
    ClientRead(R),
    ClientWrite(W),
    ReadResponse(RR),
    WriteResponse(WR),
    Redirect {
        leader_hint: Option<Address>,
    },
}

type MessageOf<SM> = RsmMessage<
    <SM as StateMachine>::WriteRequest,
    <SM as StateMachine>::ReadRequest,
    <SM as StateMachine>::WriteResponse,
    <SM as StateMachine>::ReadResponse,
>;

/// Control handle for a spawned replica thread.
pub struct ReplicaHandle {
    pub address: Address,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ReplicaHandle {
    /// Stops the replica. From the rest of the cluster's point of view this
    /// is indistinguishable from a crash: the inbox disappears and in-flight
    /// messages are dropped.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ReplicaHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawns a replica server loop hosting `sm` at `address`. `members` lists
/// every replica of the group, including this one; the inbox must already be
/// registered under `address` so peers can reach the replica before the
/// thread starts.
pub fn spawn_replica<SM: StateMachine>(
    network: Network,
    address: Address,
    inbox: Receiver<Envelope>,
    members: Vec<Address>,
    sm: SM,
    config: ClusterConfig,
) -> ReplicaHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    let join = thread::Builder::new()
        .name(format!("rsm-{}", address.0))
        .spawn(move || {
            let mut replica = Replica::new(network, address, inbox, members, sm, config);
            replica.run(flag.as_ref());
        })
        .expect("spawning a replica thread");
    ReplicaHandle {
        address,
        shutdown,
        join: Some(join),
    }
}

struct Replica<SM: StateMachine> {
    address: Address,
    members: Vec<Address>,
    network: Network,
    inbox: Receiver<Envelope>,
    sm: SM,
    config: ClusterConfig,

    term: u64,
    voted_for: Option<Address>,
    role: Role,
    leader_hint: Option<Address>,
    log: Vec<LogEntry<SM::WriteRequest>>,
    committed: u64,
    applied: u64,

    next_index: HashMap<Address, u64>,
    match_index: HashMap<Address, u64>,
    votes: HashSet<Address>,
    /// Log index → (client, msg_id) awaiting the apply result.
    pending_replies: HashMap<u64, (Address, u64)>,

    election_deadline: Instant,
    next_heartbeat: Instant,
    next_msg_id: u64,
}

impl<SM: StateMachine> Replica<SM> {
    fn new(
        network: Network,
        address: Address,
        inbox: Receiver<Envelope>,
        members: Vec<Address>,
        sm: SM,
        config: ClusterConfig,
    ) -> Self {
        let now = Instant::now();
        let mut replica = Self {
            address,
            members,
            network,
            inbox,
            sm,
            config,
            term: 0,
            voted_for: None,
            role: Role::Follower,
            leader_hint: None,
            log: Vec::new(),
            committed: 0,
            applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes: HashSet::new(),
            pending_replies: HashMap::new(),
            election_deadline: now,
            next_heartbeat: now,
            next_msg_id: 1,
        };
        replica.election_deadline = now + replica.jittered_election_timeout();
        replica
    }

    fn run(&mut self, shutdown: &AtomicBool) {
        debug!(address = %self.address, members = self.members.len(), "replica started");
        while !shutdown.load(Ordering::SeqCst) {
            let now = Instant::now();
            if self.role == Role::Leader && now >= self.next_heartbeat {
                self.send_heartbeats();
                self.next_heartbeat = now + self.config.heartbeat_interval;
            }
            if self.role != Role::Leader && now >= self.election_deadline {
                self.start_election();
            }
            let wakeup = match self.role {
                Role::Leader => self.next_heartbeat,
                _ => self.election_deadline,
            };
            let timeout = wakeup
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(1));
            match self.inbox.recv_timeout(timeout) {
                Ok(envelope) => self.handle(envelope),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.network.deregister(self.address);
        debug!(address = %self.address, "replica stopped");
    }

    fn jittered_election_timeout(&self) -> Duration {
        let base = self.config.election_timeout;
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=base.as_millis() as u64))
    }

    fn majority(&self) -> usize {
        self.members.len() / 2 + 1
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    fn send_message(&mut self, to: Address, msg_id: u64, message: &MessageOf<SM>) {
        let payload = match encode_payload(message) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%to, "failed to encode message: {err}");
                return;
            }
        };
        self.network.send(Envelope {
            msg_id,
            from: self.address,
            to,
            payload,
        });
    }

    fn send_internal(&mut self, to: Address, message: MessageOf<SM>) {
        let msg_id = self.next_msg_id;
        self.next_msg_id += 1;
        self.send_message(to, msg_id, &message);
    }

    fn handle(&mut self, envelope: Envelope) {
        let message: MessageOf<SM> = match decode_payload(&envelope.payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(from = %envelope.from, "undecodable message: {err}");
                return;
            }
        };
        match message {
            RsmMessage::AppendEntries {
                term,
                leader,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.on_append_entries(
                envelope.from,
                term,
                leader,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            ),
            RsmMessage::AppendEntriesReply {
                term,
                success,
                match_index,
            } => self.on_append_reply(envelope.from, term, success, match_index),
            RsmMessage::RequestVote {
                term,
                last_log_index,
                last_log_term,
            } => self.on_request_vote(envelope.from, term, last_log_index, last_log_term),
            RsmMessage::RequestVoteReply { term, granted } => {
                self.on_vote_reply(envelope.from, term, granted)
            }
            RsmMessage::ClientRead(request) => self.on_client_read(envelope, request),
            RsmMessage::ClientWrite(request) => self.on_client_write(envelope, request),
            RsmMessage::ReadResponse(_)
            | RsmMessage::WriteResponse(_)
            | RsmMessage::Redirect { .. } => {
                trace!(from = %envelope.from, "ignoring client-bound message");
            }
        }
    }

    fn step_down(&mut self, term: u64) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
        }
        if self.role == Role::Leader {
            info!(address = %self.address, term = self.term, "stepping down");
        }
        self.role = Role::Follower;
        self.votes.clear();
        self.election_deadline = Instant::now() + self.jittered_election_timeout();
    }

    #[allow(clippy::too_many_arguments)]
    fn on_append_entries(
        &mut self,
        from: Address,
        term: u64,
        leader: Address,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry<SM::WriteRequest>>,
        leader_commit: u64,
    ) {
        if term < self.term {
            let reply = RsmMessage::AppendEntriesReply {
                term: self.term,
                success: false,
                match_index: 0,
            };
            self.send_internal(from, reply);
            return;
        }
        self.step_down(term);
        self.leader_hint = Some(leader);

        let consistent = prev_log_index == 0
            || (self.log.len() as u64 >= prev_log_index
                && self.log[prev_log_index as usize - 1].term == prev_log_term);
        if !consistent {
            let reply = RsmMessage::AppendEntriesReply {
                term: self.term,
                success: false,
                match_index: 0,
            };
            self.send_internal(from, reply);
            return;
        }

        let mut pos = prev_log_index;
        for entry in entries {
            pos += 1;
            if (self.log.len() as u64) >= pos {
                if self.log[pos as usize - 1].term != entry.term {
                    // Uncommitted divergence from a deposed leader.
                    self.log.truncate(pos as usize - 1);
                    self.log.push(entry);
                }
            } else {
                self.log.push(entry);
            }
        }

        let match_index = pos;
        if leader_commit > self.committed {
            self.committed = leader_commit.min(self.log.len() as u64);
            self.apply_committed();
        }
        let reply = RsmMessage::AppendEntriesReply {
            term: self.term,
            success: true,
            match_index,
        };
        self.send_internal(from, reply);
    }

    fn on_append_reply(&mut self, from: Address, term: u64, success: bool, match_index: u64) {
        if term > self.term {
            self.step_down(term);
            return;
        }
        if self.role != Role::Leader || term != self.term {
            return;
        }
        if success {
            let entry = self.match_index.entry(from).or_insert(0);
            *entry = (*entry).max(match_index);
            self.next_index.insert(from, match_index + 1);
            self.advance_commit();
        } else {
            let next = self.next_index.entry(from).or_insert(1);
            *next = (*next).saturating_sub(1).max(1);
            self.send_append_to(from);
        }
    }

    fn advance_commit(&mut self) {
        let mut candidate = self.log.len() as u64;
        while candidate > self.committed {
            if self.log[candidate as usize - 1].term == self.term {
                let replicated = 1 + self
                    .members
                    .iter()
                    .filter(|peer| {
                        **peer != self.address
                            && self.match_index.get(peer).copied().unwrap_or(0) >= candidate
                    })
                    .count();
                if replicated >= self.majority() {
                    self.committed = candidate;
                    self.apply_committed();
                    return;
                }
            }
            candidate -= 1;
        }
    }

    fn apply_committed(&mut self) {
        while self.applied < self.committed {
            self.applied += 1;
            let request = self.log[self.applied as usize - 1].request.clone();
            let response = self.sm.apply(request);
            if self.role == Role::Leader {
                if let Some((client, msg_id)) = self.pending_replies.remove(&self.applied) {
                    let reply = RsmMessage::WriteResponse(response);
                    self.send_message(client, msg_id, &reply);
                }
            }
        }
        if self.role == Role::Leader {
            self.maybe_propose_maintenance();
        }
    }

    fn on_request_vote(&mut self, from: Address, term: u64, last_log_index: u64, last_log_term: u64) {
        if term > self.term {
            self.step_down(term);
        }
        let log_ok = last_log_term > self.last_log_term()
            || (last_log_term == self.last_log_term() && last_log_index >= self.log.len() as u64);
        let granted = term == self.term
            && log_ok
            && (self.voted_for.is_none() || self.voted_for == Some(from));
        if granted {
            self.voted_for = Some(from);
            self.election_deadline = Instant::now() + self.jittered_election_timeout();
        }
        let reply = RsmMessage::RequestVoteReply {
            term: self.term,
            granted,
        };
        self.send_internal(from, reply);
    }

    fn on_vote_reply(&mut self, from: Address, term: u64, granted: bool) {
        if term > self.term {
            self.step_down(term);
            return;
        }
        if self.role != Role::Candidate || term != self.term || !granted {
            return;
        }
        self.votes.insert(from);
        if self.votes.len() >= self.majority() {
            self.become_leader();
        }
    }

    fn start_election(&mut self) {
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.address);
        self.leader_hint = None;
        self.votes = HashSet::from([self.address]);
        self.election_deadline = Instant::now() + self.jittered_election_timeout();
        debug!(address = %self.address, term = self.term, "starting election");
        if self.votes.len() >= self.majority() {
            self.become_leader();
            return;
        }
        let request = RsmMessage::RequestVote {
            term: self.term,
            last_log_index: self.log.len() as u64,
            last_log_term: self.last_log_term(),
        };
        for peer in self.members.clone() {
            if peer != self.address {
                self.send_internal(peer, request.clone());
            }
        }
    }

    fn become_leader(&mut self) {
        info!(address = %self.address, term = self.term, "elected leader");
        self.role = Role::Leader;
        self.leader_hint = Some(self.address);
        let next = self.log.len() as u64 + 1;
        self.next_index = self
            .members
            .iter()
            .filter(|peer| **peer != self.address)
            .map(|peer| (*peer, next))
            .collect();
        self.match_index = self
            .members
            .iter()
            .filter(|peer| **peer != self.address)
            .map(|peer| (*peer, 0))
            .collect();
        if let Some(request) = self.sm.on_leader_start() {
            self.append_local(request, None);
        }
        self.send_heartbeats();
        self.next_heartbeat = Instant::now() + self.config.heartbeat_interval;
        self.advance_commit();
    }

    fn append_local(&mut self, request: SM::WriteRequest, reply_to: Option<(Address, u64)>) {
        self.log.push(LogEntry {
            term: self.term,
            request,
        });
        let index = self.log.len() as u64;
        if let Some(client) = reply_to {
            self.pending_replies.insert(index, client);
        }
        for peer in self.members.clone() {
            if peer != self.address {
                self.send_append_to(peer);
            }
        }
        self.advance_commit();
    }

    fn maybe_propose_maintenance(&mut self) {
        if let Some(request) = self.sm.maintenance() {
            debug!(address = %self.address, "proposing maintenance entry");
            self.append_local(request, None);
        }
    }

    fn send_heartbeats(&mut self) {
        for peer in self.members.clone() {
            if peer != self.address {
                self.send_append_to(peer);
            }
        }
    }

    fn send_append_to(&mut self, peer: Address) {
        let next = self.next_index.get(&peer).copied().unwrap_or(1);
        let prev_log_index = next - 1;
        let prev_log_term = if prev_log_index == 0 {
            0
        } else {
            self.log[prev_log_index as usize - 1].term
        };
        let entries: Vec<LogEntry<SM::WriteRequest>> =
            self.log[prev_log_index as usize..].to_vec();
        let message = RsmMessage::AppendEntries {
            term: self.term,
            leader: self.address,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.committed,
        };
        self.send_internal(peer, message);
    }

    fn on_client_read(&mut self, envelope: Envelope, request: SM::ReadRequest) {
        if self.role != Role::Leader {
            let reply = RsmMessage::Redirect {
                leader_hint: self.leader_hint,
            };
            self.send_message(envelope.from, envelope.msg_id, &reply);
            return;
        }
        let response = self.sm.read(request);
        let reply = RsmMessage::ReadResponse(response);
        self.send_message(envelope.from, envelope.msg_id, &reply);
        self.maybe_propose_maintenance();
    }

    fn on_client_write(&mut self, envelope: Envelope, request: SM::WriteRequest) {
        if self.role != Role::Leader {
            let reply = RsmMessage::Redirect {
                leader_hint: self.leader_hint,
            };
            self.send_message(envelope.from, envelope.msg_id, &reply);
            return;
        }
        self.append_local(request, Some((envelope.from, envelope.msg_id)));
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;

    /// Idempotent register machine: writes set a keyed slot, reads fetch
    /// it. Idempotence matters because the client delivers at-least-once.
    #[derive(Default)]
    struct RegisterSm {
        entries: BTreeMap<u64, i64>,
    }

    impl StateMachine for RegisterSm {
        type ReadRequest = u64;
        type ReadResponse = Option<i64>;
        type WriteRequest = (u64, i64);
        type WriteResponse = i64;

        fn read(&mut self, key: u64) -> Option<i64> {
            self.entries.get(&key).copied()
        }

        fn apply(&mut self, (key, value): (u64, i64)) -> i64 {
            self.entries.insert(key, value);
            value
        }
    }

    fn test_config() -> ClusterConfig {
        ClusterConfig {
            heartbeat_interval: Duration::from_millis(10),
            election_timeout: Duration::from_millis(50),
            request_deadline: Duration::from_millis(500),
            ..ClusterConfig::default()
        }
    }

    fn spawn_group(
        network: &Network,
        count: usize,
        config: &ClusterConfig,
    ) -> (Vec<Address>, Vec<ReplicaHandle>) {
        let mut addrs = Vec::new();
        let mut inboxes = Vec::new();
        for _ in 0..count {
            let (address, inbox) = network.register();
            addrs.push(address);
            inboxes.push(inbox);
        }
        let handles = addrs
            .iter()
            .zip(inboxes)
            .map(|(address, inbox)| {
                spawn_replica(
                    network.clone(),
                    *address,
                    inbox,
                    addrs.clone(),
                    RegisterSm::default(),
                    config.clone(),
                )
            })
            .collect();
        (addrs, handles)
    }

    type RegisterClient = RsmClient<(u64, i64), u64, i64, Option<i64>>;

    fn write_with_retry(client: &mut RegisterClient, key: u64, value: i64) {
        for _ in 0..20 {
            match client.send_write((key, value)) {
                Ok(applied) => {
                    assert_eq!(applied, value);
                    return;
                }
                Err(crate::error::TesseraError::TimedOut(_)) => continue,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        panic!("write never succeeded");
    }

    #[test]
    fn single_replica_group_serves_reads_and_writes() {
        let network = Network::new();
        let config = test_config();
        let (addrs, _handles) = spawn_group(&network, 1, &config);
        let mut client: RegisterClient = RsmClient::new(network, addrs, &config);
        write_with_retry(&mut client, 1, 10);
        write_with_retry(&mut client, 2, 20);
        assert_eq!(client.send_read(1).unwrap(), Some(10));
        assert_eq!(client.send_read(3).unwrap(), None);
    }

    #[test]
    fn followers_redirect_to_the_leader() {
        let network = Network::new();
        let config = test_config();
        let (addrs, _handles) = spawn_group(&network, 3, &config);
        let mut client: RegisterClient = RsmClient::new(network, addrs, &config);
        write_with_retry(&mut client, 7, 70);
        assert_eq!(client.send_read(7).unwrap(), Some(70));
    }

    #[test]
    fn writes_survive_a_leader_crash() {
        let network = Network::new();
        let config = test_config();
        let (addrs, mut handles) = spawn_group(&network, 3, &config);
        let mut client: RegisterClient = RsmClient::new(network.clone(), addrs, &config);
        write_with_retry(&mut client, 1, 11);
        let leader = client.leader_hint();
        for handle in &mut handles {
            if handle.address == leader {
                handle.stop();
            }
        }
        write_with_retry(&mut client, 2, 22);
        assert_eq!(client.send_read(1).unwrap(), Some(11));
        assert_eq!(client.send_read(2).unwrap(), Some(22));
    }
}
