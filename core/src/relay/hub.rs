//! In-process loopback relay
//!
//! Routes envelopes between nodes registered in the same process over
//! unbounded channels. Used to wire several nodes together locally and
//! throughout the test suite; it shows the same best-effort semantics
//! as a remote relay (messages to unknown peers vanish silently).

use super::{Inbound, RelayMessage, SignalingRelay};
use crate::identity::PeerId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Shared routing table of an in-process relay.
#[derive(Clone, Default)]
pub struct MemoryHub {
    routes: Arc<RwLock<HashMap<PeerId, mpsc::UnboundedSender<Inbound>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer and return its outbound handle plus the channel
    /// on which its inbound messages arrive. Re-registering a peer id
    /// replaces the previous delivery channel.
    pub fn register(&self, peer: &PeerId) -> (MemoryRelay, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.write().insert(peer.clone(), tx);
        (
            MemoryRelay {
                routes: Arc::clone(&self.routes),
                me: peer.clone(),
            },
            rx,
        )
    }

    /// Drop a peer from the routing table.
    pub fn unregister(&self, peer: &PeerId) {
        self.routes.write().remove(peer);
    }

    /// Number of registered peers.
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

/// Outbound handle of one registered peer.
#[derive(Clone)]
pub struct MemoryRelay {
    routes: Arc<RwLock<HashMap<PeerId, mpsc::UnboundedSender<Inbound>>>>,
    me: PeerId,
}

impl SignalingRelay for MemoryRelay {
    fn broadcast(&self, to: &PeerId, message: RelayMessage) {
        let routes = self.routes.read();
        match routes.get(to) {
            Some(tx) => {
                let _ = tx.send(Inbound {
                    from: self.me.clone(),
                    message,
                });
            }
            None => {
                trace!("dropping {} for unregistered peer {}", message.message_type(), to);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ConnId;

    fn ping(id: u64) -> RelayMessage {
        RelayMessage::Ping {
            your_conn_id: ConnId::from("c"),
            id,
        }
    }

    #[tokio::test]
    async fn test_delivers_between_registered_peers() {
        let hub = MemoryHub::new();
        let alice = PeerId::from("alice");
        let bob = PeerId::from("bob");

        let (alice_out, _alice_in) = hub.register(&alice);
        let (_bob_out, mut bob_in) = hub.register(&bob);

        alice_out.broadcast(&bob, ping(1));

        let delivered = bob_in.recv().await.unwrap();
        assert_eq!(delivered.from, alice);
        match delivered.message {
            RelayMessage::Ping { id, .. } => assert_eq!(id, 1),
            other => panic!("wrong message type: {}", other.message_type()),
        }
    }

    #[tokio::test]
    async fn test_unknown_target_is_dropped_silently() {
        let hub = MemoryHub::new();
        let alice = PeerId::from("alice");
        let (alice_out, _alice_in) = hub.register(&alice);

        // No panic, no error — the message just vanishes.
        alice_out.broadcast(&PeerId::from("nobody"), ping(2));
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_stops_delivery() {
        let hub = MemoryHub::new();
        let alice = PeerId::from("alice");
        let bob = PeerId::from("bob");

        let (alice_out, _alice_in) = hub.register(&alice);
        let (_bob_out, mut bob_in) = hub.register(&bob);

        hub.unregister(&bob);
        alice_out.broadcast(&bob, ping(3));

        // Channel was replaced by nothing; receiver sees end of stream.
        assert!(bob_in.recv().await.is_none());
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn test_reregister_replaces_channel() {
        let hub = MemoryHub::new();
        let alice = PeerId::from("alice");
        let bob = PeerId::from("bob");

        let (alice_out, _alice_in) = hub.register(&alice);
        let (_bob_out, mut stale_in) = hub.register(&bob);
        let (_bob_out2, mut fresh_in) = hub.register(&bob);

        alice_out.broadcast(&bob, ping(4));

        assert!(stale_in.recv().await.is_none());
        assert!(fresh_in.recv().await.is_some());
    }
}
