//! Transport capability seam
//!
//! The point-to-point transport itself lives outside this crate. What
//! the mesh consumes is narrow: given a role and a set of local
//! streams, produce negotiation payloads, accept the remote's payloads,
//! surface connectivity/data/stream events, and support destruction
//! that is safe to call more than once. One instance is created per
//! negotiation attempt and is exclusively owned by its connection.

pub mod instance;

pub use instance::InstanceSlot;

use crate::identity::{InstanceId, PeerId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tokio::sync::mpsc;

/// Role of a transport instance in a negotiation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// This side produces the opening negotiation payload
    Initiator,
    /// This side answers the remote's opening payload
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}

/// ICE-style connectivity states reported by a transport instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// Connected-or-completed counts as an established path
    pub fn is_established(&self) -> bool {
        matches!(self, IceConnectionState::Connected | IceConnectionState::Completed)
    }
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Closed => "closed",
        };
        write!(f, "{label}")
    }
}

/// A locally configured outgoing stream. The transport-level id is what
/// the remote side sees; the name is what peers address it by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalStream {
    pub name: String,
    pub stream_id: String,
}

impl LocalStream {
    pub fn new(name: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stream_id: stream_id.into(),
        }
    }
}

/// Opaque transport configuration, handed through to the factory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub options: Value,
}

/// Events a transport instance surfaces to the mesh
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local negotiation payload is ready to be signaled to the remote
    LocalSignal(Map<String, Value>),
    /// The transport reports itself connected
    Connected,
    /// ICE connectivity state changed
    IceState(IceConnectionState),
    /// Application data received from the remote
    Data(Vec<u8>),
    /// A remote stream surfaced, identified by its transport-level id
    RemoteStream { stream_id: String },
    /// Non-fatal transport error
    Error(String),
    /// The transport closed
    Closed,
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::LocalSignal(_) => write!(f, "local-signal"),
            TransportEvent::Connected => write!(f, "connected"),
            TransportEvent::IceState(s) => write!(f, "ice-state({s})"),
            TransportEvent::Data(d) => write!(f, "data({} bytes)", d.len()),
            TransportEvent::RemoteStream { stream_id } => {
                write!(f, "remote-stream({stream_id})")
            }
            TransportEvent::Error(e) => write!(f, "error({e})"),
            TransportEvent::Closed => write!(f, "closed"),
        }
    }
}

/// A transport event tagged with the connection and instance it came
/// from, so the mesh can discard anything from a superseded attempt.
#[derive(Debug, Clone)]
pub struct InstanceEvent {
    pub peer_id: PeerId,
    pub instance_id: InstanceId,
    pub event: TransportEvent,
}

/// Pre-tagged event sender handed to a transport instance at creation.
/// Every event it emits carries the owning (peer, instance) pair.
#[derive(Clone)]
pub struct InstanceEvents {
    peer_id: PeerId,
    instance_id: InstanceId,
    tx: mpsc::UnboundedSender<InstanceEvent>,
}

impl InstanceEvents {
    pub fn new(
        peer_id: PeerId,
        instance_id: InstanceId,
        tx: mpsc::UnboundedSender<InstanceEvent>,
    ) -> Self {
        Self {
            peer_id,
            instance_id,
            tx,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(InstanceEvent {
            peer_id: self.peer_id.clone(),
            instance_id: self.instance_id.clone(),
            event,
        });
    }

    pub fn local_signal(&self, body: Map<String, Value>) {
        self.emit(TransportEvent::LocalSignal(body));
    }

    pub fn connected(&self) {
        self.emit(TransportEvent::Connected);
    }

    pub fn ice_state(&self, state: IceConnectionState) {
        self.emit(TransportEvent::IceState(state));
    }

    pub fn data(&self, payload: Vec<u8>) {
        self.emit(TransportEvent::Data(payload));
    }

    pub fn remote_stream(&self, stream_id: impl Into<String>) {
        self.emit(TransportEvent::RemoteStream {
            stream_id: stream_id.into(),
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(TransportEvent::Error(message.into()));
    }

    pub fn closed(&self) {
        self.emit(TransportEvent::Closed);
    }
}

/// One point-to-point transport instance, owned by a single connection
/// attempt.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send {
    /// Feed an inbound negotiation payload into the transport
    fn signal(&mut self, payload: &Map<String, Value>);

    /// Tear the transport down. Must be safe to call more than once.
    fn destroy(&mut self);
}

/// Builds one transport instance per negotiation attempt.
pub trait TransportFactory: Send + 'static {
    fn create(
        &mut self,
        role: Role,
        streams: &[LocalStream],
        config: &TransportConfig,
        events: InstanceEvents,
    ) -> Box<dyn Transport>;
}
