//! Peer and attempt identifiers
//!
//! Every participant in the mesh is addressed by a `PeerId`, and every
//! swarm session carries a `ConnId` (attempt id) so that two sessions of
//! the same peer never collide. The pair forms an `EndpointId`, whose
//! total order is what both sides of a connection race use to agree on
//! an initiator without any coordination.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a mesh participant. Opaque, totally ordered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an externally assigned peer identity
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Attempt identifier — one per swarm session. A retry of the whole
/// session (not of a single connection) mints a new one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnId(String);

impl ConnId {
    /// Wrap an externally assigned attempt id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh attempt id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The raw identifier string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConnId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifier of one transport instance. Carried as `from` on every
/// outgoing signal so the receiver can reject cross-attempt bleed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A (peer, attempt) pair. The derived `Ord` is lexicographic: peer id
/// first, attempt id as the tie breaker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointId {
    pub peer: PeerId,
    pub conn: ConnId,
}

impl EndpointId {
    pub fn new(peer: PeerId, conn: ConnId) -> Self {
        Self { peer, conn }
    }

    /// Initiator tie-break. The side whose endpoint outranks the other
    /// self-selects as initiator for the attempt pair; computed from
    /// locally known values only, so both sides reach the same verdict
    /// on their own. For any two distinct endpoints exactly one side
    /// outranks the other.
    pub fn outranks(&self, other: &EndpointId) -> bool {
        self > other
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.peer, self.conn)
    }
}
