//! Client side of the RSM runtime.
//!
//! A client addresses a replica group through its leader hint, transparently
//! follows redirections from followers (bounded), retries once across a
//! deadline expiry, and otherwise surfaces `TimedOut`. Reads and writes can
//! be started asynchronously (`send_async_*`), then either polled
//! (non-blocking) or awaited (blocking up to the deadline).

use std::fmt::Debug;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use crate::config::ClusterConfig;
use crate::error::{Result, TesseraError};
use crate::rsm::transport::{decode_payload, encode_payload, Address, Envelope, Network};
use crate::rsm::RsmMessage;

struct InFlight {
    msg_id: u64,
    payload: Vec<u8>,
    deadline: Instant,
    redirects: usize,
    retried_after_timeout: bool,
}

/// Client for one replica group, generic over the group's request and
/// response types.
pub struct RsmClient<W, R, WR, RR> {
    network: Network,
    address: Address,
    inbox: Receiver<Envelope>,
    servers: Vec<Address>,
    leader_ix: usize,
    next_msg_id: u64,
    deadline: Duration,
    max_redirects: usize,
    read_in_flight: Option<InFlight>,
    write_in_flight: Option<InFlight>,
    /// Responses received while driving the sibling request.
    stash: Vec<Envelope>,
    _marker: PhantomData<(W, R, WR, RR)>,
}

impl<W, R, WR, RR> RsmClient<W, R, WR, RR>
where
    W: Serialize + DeserializeOwned + Clone + Debug,
    R: Serialize + DeserializeOwned + Clone + Debug,
    WR: Serialize + DeserializeOwned + Clone + Debug,
    RR: Serialize + DeserializeOwned + Clone + Debug,
{
    pub fn new(network: Network, servers: Vec<Address>, config: &ClusterConfig) -> Self {
        let (address, inbox) = network.register();
        Self {
            network,
            address,
            inbox,
            servers,
            leader_ix: 0,
            next_msg_id: 1,
            deadline: config.request_deadline,
            max_redirects: config.max_redirects,
            read_in_flight: None,
            write_in_flight: None,
            stash: Vec::new(),
            _marker: PhantomData,
        }
    }

    pub fn leader_hint(&self) -> Address {
        self.servers[self.leader_ix]
    }

    pub fn has_read_in_flight(&self) -> bool {
        self.read_in_flight.is_some()
    }

    pub fn has_write_in_flight(&self) -> bool {
        self.write_in_flight.is_some()
    }

    /// Synchronous write: send, then await until a result or an error.
    pub fn send_write(&mut self, request: W) -> Result<WR> {
        self.send_async_write(request)?;
        loop {
            if let Some(result) = self.await_async_write() {
                return result;
            }
        }
    }

    /// Synchronous read.
    pub fn send_read(&mut self, request: R) -> Result<RR> {
        self.send_async_read(request)?;
        loop {
            if let Some(result) = self.await_async_read() {
                return result;
            }
        }
    }

    pub fn send_async_write(&mut self, request: W) -> Result<()> {
        if self.write_in_flight.is_some() {
            return Err(TesseraError::InvalidArgument(
                "a write request is already in flight".into(),
            ));
        }
        let message: RsmMessage<W, R, WR, RR> = RsmMessage::ClientWrite(request);
        let payload = encode_payload(&message)?;
        self.write_in_flight = Some(self.dispatch(payload));
        Ok(())
    }

    pub fn send_async_read(&mut self, request: R) -> Result<()> {
        if self.read_in_flight.is_some() {
            return Err(TesseraError::InvalidArgument(
                "a read request is already in flight".into(),
            ));
        }
        let message: RsmMessage<W, R, WR, RR> = RsmMessage::ClientRead(request);
        let payload = encode_payload(&message)?;
        self.read_in_flight = Some(self.dispatch(payload));
        Ok(())
    }

    /// Non-blocking completion check for the in-flight write. `None` means
    /// not ready (possibly after transparently following a redirect).
    pub fn poll_async_write(&mut self) -> Option<Result<WR>> {
        let mut in_flight = self.write_in_flight.take()?;
        match self.step(&mut in_flight, false) {
            Step::NotReady | Step::Redirected => {
                self.write_in_flight = Some(in_flight);
                None
            }
            Step::TimedOut => Some(Err(self.timed_out())),
            Step::Resolved(RsmMessage::WriteResponse(response)) => Some(Ok(response)),
            Step::Resolved(_) => Some(Err(self.wrong_variant())),
        }
    }

    /// Non-blocking completion check for the in-flight read.
    pub fn poll_async_read(&mut self) -> Option<Result<RR>> {
        let mut in_flight = self.read_in_flight.take()?;
        match self.step(&mut in_flight, false) {
            Step::NotReady | Step::Redirected => {
                self.read_in_flight = Some(in_flight);
                None
            }
            Step::TimedOut => Some(Err(self.timed_out())),
            Step::Resolved(RsmMessage::ReadResponse(response)) => Some(Ok(response)),
            Step::Resolved(_) => Some(Err(self.wrong_variant())),
        }
    }

    /// Blocks until the in-flight write resolves, redirects (returning
    /// `None` so the caller can interleave other work), or times out.
    pub fn await_async_write(&mut self) -> Option<Result<WR>> {
        let mut in_flight = self.write_in_flight.take()?;
        match self.step(&mut in_flight, true) {
            Step::NotReady | Step::Redirected => {
                self.write_in_flight = Some(in_flight);
                None
            }
            Step::TimedOut => Some(Err(self.timed_out())),
            Step::Resolved(RsmMessage::WriteResponse(response)) => Some(Ok(response)),
            Step::Resolved(_) => Some(Err(self.wrong_variant())),
        }
    }

    /// Blocking variant for reads; same contract as [`Self::await_async_write`].
    pub fn await_async_read(&mut self) -> Option<Result<RR>> {
        let mut in_flight = self.read_in_flight.take()?;
        match self.step(&mut in_flight, true) {
            Step::NotReady | Step::Redirected => {
                self.read_in_flight = Some(in_flight);
                None
            }
            Step::TimedOut => Some(Err(self.timed_out())),
            Step::Resolved(RsmMessage::ReadResponse(response)) => Some(Ok(response)),
            Step::Resolved(_) => Some(Err(self.wrong_variant())),
        }
    }

    fn timed_out(&self) -> TesseraError {
        TesseraError::TimedOut(format!(
            "no response from {} within the deadline",
            self.servers[self.leader_ix]
        ))
    }

    fn wrong_variant(&self) -> TesseraError {
        TesseraError::Corruption("response variant does not match the request kind".into())
    }

    fn dispatch(&mut self, payload: Vec<u8>) -> InFlight {
        let msg_id = self.next_msg_id;
        self.next_msg_id += 1;
        let to = self.servers[self.leader_ix];
        self.network.send(Envelope {
            msg_id,
            from: self.address,
            to,
            payload: payload.clone(),
        });
        InFlight {
            msg_id,
            payload,
            deadline: Instant::now() + self.deadline,
            redirects: 0,
            retried_after_timeout: false,
        }
    }

    fn resend(&mut self, in_flight: &mut InFlight) {
        let msg_id = self.next_msg_id;
        self.next_msg_id += 1;
        in_flight.msg_id = msg_id;
        // Anything stashed for a superseded message id is now unclaimable.
        let keep: Vec<u64> = self
            .read_in_flight
            .iter()
            .map(|f| f.msg_id)
            .chain(self.write_in_flight.iter().map(|f| f.msg_id))
            .collect();
        self.stash
            .retain(|e| e.msg_id == msg_id || keep.contains(&e.msg_id));
        let to = self.servers[self.leader_ix];
        self.network.send(Envelope {
            msg_id,
            from: self.address,
            to,
            payload: in_flight.payload.clone(),
        });
    }

    fn rotate_leader(&mut self) {
        self.leader_ix = (self.leader_ix + 1) % self.servers.len();
    }

    fn follow_hint(&mut self, hint: Option<Address>) {
        match hint.and_then(|h| self.servers.iter().position(|s| *s == h)) {
            Some(ix) => self.leader_ix = ix,
            None => self.rotate_leader(),
        }
    }
}

enum Step<W, R, WR, RR> {
    NotReady,
    Resolved(RsmMessage<W, R, WR, RR>),
    Redirected,
    TimedOut,
}

impl<W, R, WR, RR> RsmClient<W, R, WR, RR>
where
    W: Serialize + DeserializeOwned + Clone + Debug,
    R: Serialize + DeserializeOwned + Clone + Debug,
    WR: Serialize + DeserializeOwned + Clone + Debug,
    RR: Serialize + DeserializeOwned + Clone + Debug,
{
    /// Advances one in-flight request: consumes envelopes addressed to it,
    /// follows redirects, retries once across a deadline expiry.
    fn step(&mut self, in_flight: &mut InFlight, block: bool) -> Step<W, R, WR, RR> {
        loop {
            let now = Instant::now();
            if now >= in_flight.deadline {
                if in_flight.retried_after_timeout {
                    return Step::TimedOut;
                }
                debug!(to = %self.servers[self.leader_ix], "deadline expired, retrying once");
                in_flight.retried_after_timeout = true;
                in_flight.deadline = now + self.deadline;
                self.rotate_leader();
                self.resend(in_flight);
            }
            let envelope = if let Some(pos) = self
                .stash
                .iter()
                .position(|e| e.msg_id == in_flight.msg_id)
            {
                self.stash.remove(pos)
            } else if block {
                let timeout = in_flight.deadline.saturating_duration_since(Instant::now());
                match self.inbox.recv_timeout(timeout) {
                    Ok(envelope) => envelope,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => return Step::TimedOut,
                }
            } else {
                match self.inbox.try_recv() {
                    Ok(envelope) => envelope,
                    Err(_) => return Step::NotReady,
                }
            };
            if envelope.msg_id != in_flight.msg_id {
                // It may belong to the sibling request still in flight.
                let sibling = self
                    .read_in_flight
                    .as_ref()
                    .map(|f| f.msg_id)
                    .into_iter()
                    .chain(self.write_in_flight.as_ref().map(|f| f.msg_id))
                    .any(|id| id == envelope.msg_id);
                if sibling {
                    self.stash.push(envelope);
                } else {
                    trace!(msg_id = envelope.msg_id, "discarding stale response");
                }
                continue;
            }
            let message: RsmMessage<W, R, WR, RR> = match decode_payload(&envelope.payload) {
                Ok(message) => message,
                Err(err) => {
                    debug!("undecodable response: {err}");
                    continue;
                }
            };
            match message {
                RsmMessage::Redirect { leader_hint } => {
                    if leader_hint.is_some() {
                        in_flight.redirects += 1;
                        if in_flight.redirects > self.max_redirects {
                            return Step::TimedOut;
                        }
                    } else {
                        // No leader yet (an election is running); the
                        // deadline bounds how long we keep knocking.
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    trace!(hint = ?leader_hint, "following redirect");
                    self.follow_hint(leader_hint);
                    self.resend(in_flight);
                    if !block {
                        return Step::Redirected;
                    }
                }
                other => return Step::Resolved(other),
            }
        }
    }
}

impl<W, R, WR, RR> Drop for RsmClient<W, R, WR, RR> {
    fn drop(&mut self) {
        self.network.deregister(self.address);
    }
}
