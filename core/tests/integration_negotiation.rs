//! End-to-end negotiation over an in-process relay
//!
//! Two real mesh nodes wired through `MemoryHub`, with scripted
//! transports standing in for the point-to-point engine. Exercises the
//! simultaneous-connect race, first-signal receiver creation, stream
//! advertisement, and liveness probe resolution.

mod common;

use common::{next_matching, obj, wait_for, ScriptedFactory};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use swarmlink_core::{
    start_mesh, ConnId, EndpointId, LocalStream, MemoryHub, MeshContext, MeshEvent, MeshHandle,
    PeerId, Role,
};
use tokio::sync::mpsc;

struct TestPeer {
    handle: MeshHandle,
    factory: ScriptedFactory,
    events: mpsc::UnboundedReceiver<MeshEvent>,
}

fn spawn_peer(hub: &MemoryHub, peer: &str, conn: &str, streams: Vec<LocalStream>) -> TestPeer {
    let peer_id = PeerId::from(peer);
    let (relay, inbound) = hub.register(&peer_id);
    let factory = ScriptedFactory::default();
    let (events_tx, events) = mpsc::unbounded_channel();
    let ctx = MeshContext::new(EndpointId::new(peer_id, ConnId::from(conn)))
        .with_streams(streams);
    let handle = start_mesh(ctx, factory.clone(), Arc::new(relay), inbound, events_tx);
    TestPeer {
        handle,
        factory,
        events,
    }
}

#[tokio::test(start_paused = true)]
async fn test_simultaneous_connect_resolves_one_initiator() {
    let hub = MemoryHub::new();
    // "bob" outranks "alice": bob self-selects as initiator.
    let mut alice = spawn_peer(&hub, "alice", "ca", vec![]);
    let mut bob = spawn_peer(
        &hub,
        "bob",
        "cb",
        vec![LocalStream::new("cam", "bs-1")],
    );

    // Both sides attempt the connection before either has heard a
    // negotiation signal from the other.
    bob.handle
        .connect(PeerId::from("alice"), ConnId::from("ca"))
        .await
        .unwrap();
    wait_for(|| bob.factory.count() == 1).await;
    alice
        .handle
        .connect(PeerId::from("bob"), ConnId::from("cb"))
        .await
        .unwrap();
    // Round-trip a query so alice's connect has been processed (her
    // start request is in flight) before bob's transport speaks.
    let _ = alice.handle.connection_states().await.unwrap();

    // Bob created an initiator instance immediately; alice created
    // nothing and asked bob to start (which bob ignores: he already
    // has an instance from his own attempt).
    assert_eq!(bob.factory.instance(0).role, Role::Initiator);
    assert_eq!(alice.factory.count(), 0);

    // Bob's transport produces the opening payload; its relayed signal
    // makes alice create a receiver instance and feed the offer in.
    bob.factory.instance(0).events.local_signal(obj(json!({"sdp": "offer"})));
    wait_for(|| alice.factory.count() == 1).await;
    assert_eq!(alice.factory.instance(0).role, Role::Receiver);
    wait_for(|| alice.factory.instance(0).signals().len() == 1).await;
    assert_eq!(alice.factory.instance(0).signals()[0]["sdp"], "offer");

    // Bob never grew a second instance out of the race.
    assert_eq!(bob.factory.count(), 1);

    // Alice answers; the payload lands in bob's transport.
    alice
        .factory
        .instance(0)
        .events
        .local_signal(obj(json!({"sdp": "answer"})));
    wait_for(|| bob.factory.instance(0).signals().len() == 1).await;
    assert_eq!(bob.factory.instance(0).signals()[0]["sdp"], "answer");

    // Both transports report connected; each side surfaces the peer.
    alice.factory.instance(0).events.connected();
    bob.factory.instance(0).events.connected();
    next_matching(
        &mut alice.events,
        |e| matches!(e, MeshEvent::PeerConnected { peer_id } if peer_id == &PeerId::from("bob")),
        Duration::from_secs(2),
    )
    .await;
    next_matching(
        &mut bob.events,
        |e| matches!(e, MeshEvent::PeerConnected { peer_id } if peer_id == &PeerId::from("alice")),
        Duration::from_secs(2),
    )
    .await;

    // Bob advertised his "cam" stream in the signal metadata; when the
    // matching transport-level stream surfaces on alice's side it is
    // resolved by name.
    alice.factory.instance(0).events.remote_stream("bs-1");
    next_matching(
        &mut alice.events,
        |e| matches!(e, MeshEvent::StreamAdded { peer_id, name }
            if peer_id == &PeerId::from("bob") && name == "cam"),
        Duration::from_secs(2),
    )
    .await;

    // Connection state reflects all of it.
    let states = alice.handle.connection_states().await.unwrap();
    assert_eq!(states.len(), 1);
    assert!(states[0].connected);
    assert_eq!(states[0].role, Some(Role::Receiver));
    assert!(states[0].failing_for.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_data_flows_unscoped_to_the_application() -> anyhow::Result<()> {
    let hub = MemoryHub::new();
    let mut alice = spawn_peer(&hub, "alice", "ca", vec![]);
    let bob = spawn_peer(&hub, "bob", "cb", vec![]);

    alice
        .handle
        .connect(PeerId::from("bob"), ConnId::from("cb"))
        .await?;

    // Alice is passive; bob's node reacts to her start request.
    wait_for(|| bob.factory.count() == 1).await;
    bob.factory.instance(0).events.local_signal(obj(json!({"sdp": "offer"})));
    wait_for(|| alice.factory.count() == 1).await;

    alice.factory.instance(0).events.data(b"hello".to_vec());
    let event = next_matching(
        &mut alice.events,
        |e| matches!(e, MeshEvent::Data(_)),
        Duration::from_secs(2),
    )
    .await;
    match event {
        MeshEvent::Data(payload) => assert_eq!(payload, b"hello".to_vec()),
        _ => unreachable!(),
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_shared_state_rides_first_signal_to_the_peer() -> anyhow::Result<()> {
    let hub = MemoryHub::new();
    let alice = spawn_peer(&hub, "alice", "ca", vec![]);
    let mut bob = spawn_peer(&hub, "bob", "cb", vec![]);

    alice
        .handle
        .update_shared_state(json!({"room": "lobby"}))
        .await?;
    alice
        .handle
        .connect(PeerId::from("bob"), ConnId::from("cb"))
        .await?;

    // Alice is passive, so her start request carries the snapshot.
    let event = next_matching(
        &mut bob.events,
        |e| matches!(e, MeshEvent::PeerState { .. }),
        Duration::from_secs(2),
    )
    .await;
    match event {
        MeshEvent::PeerState { peer_id, state } => {
            assert_eq!(peer_id, PeerId::from("alice"));
            assert_eq!(state.payload["room"], "lobby");
        }
        _ => unreachable!(),
    }
    Ok(())
}
