//! Mesh core — connection lifecycle and negotiation
//!
//! The pieces that make two independent peers converge on one working
//! point-to-point link: the connection records with their deadline
//! supervision, the liveness prober, and the negotiation protocol
//! itself with its retry/failure escalation.

pub mod connection;
pub mod context;
pub mod liveness;
pub mod node;

pub use connection::{
    Connection, DeadlineState, DeadlineUpdate, FailureDisposition, REASON_CONNECT_TIMEOUT,
    REASON_ICE_DISCONNECT,
};
pub use context::{MeshConfig, MeshContext, RemoteStream, RemoteStreams, SharedState};
pub use liveness::{PendingProbe, ProbeRegistry};
pub use node::{
    start_mesh, ConnectionSnapshot, MeshCommand, MeshError, MeshEvent, MeshHandle,
};
