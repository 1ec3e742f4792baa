// Swarmlink Core — mesh connection negotiation
//
// Keeps a mesh of peers connected over an out-of-band signaling relay:
// deterministic initiator tie-breaking, timeout supervision, liveness
// probing, and retry/failure escalation. The point-to-point transport
// and the relay delivery service live behind traits; this crate owns
// the protocol between them.

pub mod identity;
pub mod mesh;
pub mod relay;
pub mod transport;

pub use identity::{ConnId, EndpointId, InstanceId, PeerId};
pub use mesh::{
    start_mesh, ConnectionSnapshot, MeshConfig, MeshContext, MeshError, MeshEvent, MeshHandle,
    RemoteStream, RemoteStreams, SharedState,
};
pub use relay::{Inbound, MemoryHub, RelayMessage, SignalData, SignalingRelay, StateSnapshot};
pub use transport::{
    IceConnectionState, InstanceEvent, InstanceEvents, LocalStream, Role, Transport,
    TransportConfig, TransportEvent, TransportFactory,
};

/// Initialize tracing from the environment (idempotent).
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
