//! In-process message transport.
//!
//! Every node and every client registers an inbox under an [`Address`];
//! senders serialize their payload into an [`Envelope`] and hand it to the
//! shared registry. The envelope payload is an opaque byte string so one
//! transport serves state machines with different message types; payloads
//! round-trip through serde including every nested `Value`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Result, TesseraError};
use crate::primitives::SpinLock;

/// Node identity on the in-process network.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize, Default,
)]
pub struct Address(pub u64);

impl Address {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Minimal wire envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_id: u64,
    pub from: Address,
    pub to: Address,
    pub payload: Vec<u8>,
}

pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    bincode::serialize(payload)
        .map_err(|e| TesseraError::Corruption(format!("payload encode failed: {e}")))
}

pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| TesseraError::Corruption(format!("payload decode failed: {e}")))
}

struct Registry {
    inboxes: SpinLock<HashMap<Address, Sender<Envelope>>>,
    next_address: AtomicU64,
}

/// Cloneable handle to the shared inbox registry.
#[derive(Clone)]
pub struct Network {
    registry: Arc<Registry>,
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                inboxes: SpinLock::new(HashMap::new()),
                next_address: AtomicU64::new(1),
            }),
        }
    }

    /// Allocates a fresh address with its inbox.
    pub fn register(&self) -> (Address, Receiver<Envelope>) {
        let address = Address(self.registry.next_address.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = unbounded();
        self.registry.inboxes.lock().insert(address, tx);
        (address, rx)
    }

    /// Re-registers an inbox for a known address (a restarted node keeps its
    /// identity).
    pub fn register_address(&self, address: Address) -> Receiver<Envelope> {
        let (tx, rx) = unbounded();
        self.registry.inboxes.lock().insert(address, tx);
        rx
    }

    pub fn deregister(&self, address: Address) {
        self.registry.inboxes.lock().remove(&address);
    }

    /// Delivers an envelope. A missing or closed destination inbox drops the
    /// message silently, exactly like a dead host would.
    pub fn send(&self, envelope: Envelope) {
        let sender = {
            let inboxes = self.registry.inboxes.lock();
            inboxes.get(&envelope.to).cloned()
        };
        match sender {
            Some(tx) => {
                trace!(
                    msg_id = envelope.msg_id,
                    from = %envelope.from,
                    to = %envelope.to,
                    "deliver"
                );
                let _ = tx.send(envelope);
            }
            None => {
                trace!(to = %envelope.to, msg_id = envelope.msg_id, "dropped: unknown address");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_reach_registered_inboxes() {
        let network = Network::new();
        let (a, _rx_a) = network.register();
        let (b, rx_b) = network.register();
        network.send(Envelope {
            msg_id: 1,
            from: a,
            to: b,
            payload: encode_payload(&"ping").unwrap(),
        });
        let env = rx_b.recv().unwrap();
        assert_eq!(env.from, a);
        let body: String = decode_payload(&env.payload).unwrap();
        assert_eq!(body, "ping");
    }

    #[test]
    fn send_to_deregistered_address_is_dropped() {
        let network = Network::new();
        let (a, _rx) = network.register();
        let (b, rx_b) = network.register();
        network.deregister(b);
        network.send(Envelope {
            msg_id: 2,
            from: a,
            to: b,
            payload: Vec::new(),
        });
        assert!(rx_b.try_recv().is_err());
    }
}
