//! Signaling relay seam
//!
//! The relay is an external best-effort broadcast service addressed by
//! peer identity. The core only ever calls `broadcast`; delivery back
//! into a node arrives as `Inbound` values on a channel owned by the
//! node's event loop. Loss and reordering are expected — the
//! negotiation protocol is built to tolerate both.

pub mod hub;
pub mod protocol;

pub use hub::{MemoryHub, MemoryRelay};
pub use protocol::{RelayError, RelayMessage, SignalData, StateSnapshot};

use crate::identity::PeerId;

/// Outbound half of the relay. Best-effort: implementations log and
/// drop on delivery failure rather than surfacing errors to callers.
pub trait SignalingRelay: Send + Sync {
    /// Send `message` to the peer identified by `to`.
    fn broadcast(&self, to: &PeerId, message: RelayMessage);
}

/// One message delivered by the relay, attributed to its sender.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: PeerId,
    pub message: RelayMessage,
}
