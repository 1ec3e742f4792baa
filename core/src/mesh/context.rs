//! Swarm context — identity, configuration and shared collections
//!
//! Everything a node's reactive loop reads about "us": who we are, the
//! streams we offer, the transport configuration, and the shared
//! application-state snapshot that rides on the first signal of every
//! attempt. Also owns the peer-indexed collection of remote streams
//! that the application reads from.

use crate::identity::{EndpointId, PeerId};
use crate::relay::StateSnapshot;
use crate::transport::{LocalStream, TransportConfig};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Timing constants of the negotiation protocol. The defaults are part
/// of the protocol's recovery expectations and interoperate with other
/// implementations; change them only for all participants at once.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Deadline armed when a connection attempt starts
    pub connect_timeout: Duration,
    /// Deadline armed when ICE reports `disconnected`
    pub ice_disconnect_timeout: Duration,
    /// Minimum remaining time after each processed signal
    pub signal_extension: Duration,
    /// Continuous failure duration after which a connection is terminal
    pub max_failure_duration: Duration,
    /// How long a liveness probe waits for its pong
    pub probe_timeout: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(6000),
            ice_disconnect_timeout: Duration::from_millis(2000),
            signal_extension: Duration::from_millis(2000),
            max_failure_duration: Duration::from_millis(20000),
            probe_timeout: Duration::from_millis(5000),
        }
    }
}

/// Shared application-state snapshot, readable from the loop and
/// writable by the application at any time.
#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<RwLock<Option<StateSnapshot>>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the shared payload, stamping the current wall-clock time.
    pub fn update(&self, payload: Value) {
        let updated_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        *self.inner.write() = Some(StateSnapshot {
            payload,
            updated_at,
        });
    }

    /// Current snapshot, if any has been set.
    pub fn snapshot(&self) -> Option<StateSnapshot> {
        self.inner.read().clone()
    }
}

/// A remote stream surfaced by an established transport, addressed by
/// (peer, advertised name).
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStream {
    pub peer_id: PeerId,
    pub name: String,
    pub stream_id: String,
}

/// Peer-indexed collection of remote streams, shared with the
/// application.
#[derive(Clone, Default)]
pub struct RemoteStreams {
    inner: Arc<RwLock<HashMap<(PeerId, String), RemoteStream>>>,
}

impl RemoteStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the stream known under (peer, name).
    pub fn upsert(&self, stream: RemoteStream) {
        self.inner
            .write()
            .insert((stream.peer_id.clone(), stream.name.clone()), stream);
    }

    pub fn get(&self, peer_id: &PeerId, name: &str) -> Option<RemoteStream> {
        self.inner
            .read()
            .get(&(peer_id.clone(), name.to_string()))
            .cloned()
    }

    /// Drop every stream of a peer (on connection removal).
    pub fn remove_peer(&self, peer_id: &PeerId) {
        self.inner.write().retain(|(peer, _), _| peer != peer_id);
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Read-mostly context of one mesh node.
#[derive(Clone)]
pub struct MeshContext {
    /// Our own (peer, attempt) identity
    pub local: EndpointId,
    /// Streams offered to every peer, snapshotted per instance creation
    pub local_streams: Vec<LocalStream>,
    /// Opaque configuration handed to the transport factory
    pub transport_config: TransportConfig,
    /// Shared application-state snapshot
    pub shared_state: SharedState,
    /// Remote streams, shared with the application
    pub remote_streams: RemoteStreams,
    pub config: MeshConfig,
}

impl MeshContext {
    /// Context for one swarm session under the given local identity.
    pub fn new(local: EndpointId) -> Self {
        Self {
            local,
            local_streams: Vec::new(),
            transport_config: TransportConfig::default(),
            shared_state: SharedState::new(),
            remote_streams: RemoteStreams::new(),
            config: MeshConfig::default(),
        }
    }

    pub fn with_streams(mut self, streams: Vec<LocalStream>) -> Self {
        self.local_streams = streams;
        self
    }

    pub fn with_transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    pub fn with_config(mut self, config: MeshConfig) -> Self {
        self.config = config;
        self
    }
}
