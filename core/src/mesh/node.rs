//! Mesh node — negotiation protocol and the reactive loop
//!
//! One spawned task owns every `Connection` and reacts to exactly four
//! things: handle commands, inbound relay messages, transport instance
//! events, and timer fires. Two nodes racing to connect never
//! coordinate; each side computes the initiator tie-break from its own
//! identity and the remote attempt id, and everything late or stale is
//! rejected by instance-identity checks rather than locks.

use crate::identity::{ConnId, InstanceId, PeerId};
use crate::mesh::connection::{
    Connection, DeadlineUpdate, FailureDisposition, REASON_CONNECT_TIMEOUT, REASON_ICE_DISCONNECT,
};
use crate::mesh::context::{MeshContext, RemoteStream};
use crate::mesh::liveness::ProbeRegistry;
use crate::relay::{Inbound, RelayMessage, SignalData, SignalingRelay, StateSnapshot};
use crate::transport::{
    IceConnectionState, InstanceEvent, InstanceEvents, InstanceSlot, Role, TransportEvent,
    TransportFactory,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Commands accepted by the mesh task
#[derive(Debug)]
pub enum MeshCommand {
    /// Establish (or retry) the connection to a discovered peer attempt
    Connect { peer_id: PeerId, conn_id: ConnId },
    /// Tear down and forget the connection to a peer
    Disconnect { peer_id: PeerId },
    /// Replace the shared application-state snapshot
    UpdateSharedState { payload: Value },
    /// Snapshot every connection's state
    ConnectionStates {
        reply: mpsc::Sender<Vec<ConnectionSnapshot>>,
    },
    /// Stop the mesh task
    Shutdown,
}

/// Events emitted by the mesh to the application layer
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// Application data received over any connection
    Data(Vec<u8>),
    /// A remote stream became available under its advertised name
    StreamAdded { peer_id: PeerId, name: String },
    /// A connection reported itself established
    PeerConnected { peer_id: PeerId },
    /// A peer's shared-state snapshot arrived with its first signal
    PeerState {
        peer_id: PeerId,
        state: StateSnapshot,
    },
    /// Terminal failure; the caller owns removing the connection
    ConnectionFailed { peer_id: PeerId, reason: String },
}

/// Point-in-time view of one connection
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub peer_id: PeerId,
    pub conn_id: ConnId,
    pub role: Option<Role>,
    pub connected: bool,
    /// How long the current continuous failure window has been running
    pub failing_for: Option<Duration>,
}

/// Mesh handle error types
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Mesh task not running")]
    NotRunning,
    #[error("No reply from mesh task")]
    NoReply,
}

/// Scheduled work arriving back at the loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    Deadline { peer_id: PeerId, epoch: u64 },
    ProbeTimeout { id: u64 },
}

/// State owned by the mesh task.
pub(crate) struct MeshNode<F: TransportFactory> {
    pub(crate) ctx: MeshContext,
    factory: F,
    relay: Arc<dyn SignalingRelay>,
    pub(crate) connections: HashMap<PeerId, Connection>,
    probes: ProbeRegistry,
    events: mpsc::UnboundedSender<MeshEvent>,
    transport_tx: mpsc::UnboundedSender<InstanceEvent>,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
}

impl<F: TransportFactory> MeshNode<F> {
    pub(crate) fn new(
        ctx: MeshContext,
        factory: F,
        relay: Arc<dyn SignalingRelay>,
        events: mpsc::UnboundedSender<MeshEvent>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<InstanceEvent>,
        mpsc::UnboundedReceiver<TimerEvent>,
    ) {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        (
            Self {
                ctx,
                factory,
                relay,
                connections: HashMap::new(),
                probes: ProbeRegistry::new(),
                events,
                transport_tx,
                timer_tx,
            },
            transport_rx,
            timer_rx,
        )
    }

    /// Caller-driven connect: record (or supersede) the remote attempt
    /// and run the negotiation entry point.
    pub(crate) fn add_peer(&mut self, peer_id: PeerId, conn_id: ConnId) {
        let conn = self
            .connections
            .entry(peer_id.clone())
            .or_insert_with(|| Connection::new(peer_id.clone(), conn_id.clone()));
        if conn.conn_id != conn_id {
            debug!(
                "{}: remote attempt superseded by caller ({} -> {})",
                peer_id, conn.conn_id, conn_id
            );
            conn.conn_id = conn_id;
        }
        self.connect_peer(&peer_id);
    }

    /// Caller-driven removal (the cleanup duty after a terminal failure).
    pub(crate) fn remove_peer(&mut self, peer_id: &PeerId) {
        if let Some(mut conn) = self.connections.remove(peer_id) {
            conn.deadline.clear();
            conn.retire_slot();
            self.ctx.remote_streams.remove_peer(peer_id);
            debug!("{}: connection removed", peer_id);
        }
    }

    /// Negotiation entry point, used for fresh attempts and retries.
    /// Safe to call with the connection in any state.
    pub(crate) fn connect_peer(&mut self, peer_id: &PeerId) {
        if !self.connections.contains_key(peer_id) {
            debug!("{}: connect for unknown connection ignored", peer_id);
            return;
        }
        let now = Instant::now();
        self.send_probe(peer_id, now);

        let connect_timeout = self.ctx.config.connect_timeout;
        let (update, active) = {
            let Some(conn) = self.connections.get_mut(peer_id) else {
                return;
            };
            let update = conn
                .deadline
                .arm(now, connect_timeout, Some(REASON_CONNECT_TIMEOUT));
            let active = self.ctx.local.outranks(&conn.remote_endpoint());
            (update, active)
        };
        self.apply_deadline_update(peer_id, update);

        if active {
            if let Some(conn) = self.connections.get_mut(peer_id) {
                conn.retire_slot();
            }
            let slot = self.new_slot(peer_id, Role::Initiator, now);
            debug!(
                "{}: active side, created initiator instance {}",
                peer_id,
                slot.instance_id()
            );
            if let Some(conn) = self.connections.get_mut(peer_id) {
                conn.slot = Some(slot);
            }
        } else {
            debug!("{}: passive side, requesting remote start", peer_id);
            self.relay.broadcast(
                peer_id,
                RelayMessage::Signal {
                    your_conn_id: self.ctx.local.conn.clone(),
                    data: SignalData::you_start(),
                    meta: None,
                    state: self.ctx.shared_state.snapshot(),
                },
            );
            if let Some(conn) = self.connections.get_mut(peer_id) {
                conn.retire_slot();
            }
        }
    }

    /// One inbound relay message.
    pub(crate) fn handle_inbound(&mut self, from: PeerId, message: RelayMessage) {
        match message {
            RelayMessage::Ping { id, .. } => {
                trace!("ping {} from {}", id, from);
                self.relay.broadcast(
                    &from,
                    RelayMessage::Pong {
                        your_conn_id: self.ctx.local.conn.clone(),
                        id,
                    },
                );
            }
            RelayMessage::Pong { id, .. } => match self.probes.resolve(id, &from, Instant::now()) {
                Some((peer_id, rtt)) => {
                    debug!("{}: probe {} resolved in {:?}", peer_id, id, rtt);
                }
                None => trace!("stray pong {} from {}", id, from),
            },
            RelayMessage::Signal {
                your_conn_id,
                data,
                meta,
                state,
            } => {
                let conn = self.connections.entry(from.clone()).or_insert_with(|| {
                    debug!("{}: connection created by inbound signal", from);
                    Connection::new(from.clone(), your_conn_id.clone())
                });
                if conn.conn_id != your_conn_id {
                    debug!(
                        "{}: remote attempt superseded ({} -> {})",
                        from, conn.conn_id, your_conn_id
                    );
                    conn.conn_id = your_conn_id;
                }
                self.handle_signal(&from, data, meta, state);
            }
        }
    }

    fn handle_signal(
        &mut self,
        peer_id: &PeerId,
        data: SignalData,
        meta: Option<HashMap<String, String>>,
        state: Option<StateSnapshot>,
    ) {
        let now = Instant::now();
        if let Some(state) = state {
            let _ = self.events.send(MeshEvent::PeerState {
                peer_id: peer_id.clone(),
                state,
            });
        }

        if data.you_start {
            // A start request can only arrive after our own connect
            // request, at which point we cannot yet have an instance.
            // One that exists came from the remote's competing attempt
            // and must be left untouched.
            let has_instance = self
                .connections
                .get(peer_id)
                .map(|conn| conn.slot.is_some())
                .unwrap_or(false);
            if has_instance {
                trace!("{}: start request ignored, instance already exists", peer_id);
                return;
            }
            let slot = self.new_slot(peer_id, Role::Initiator, now);
            debug!(
                "{}: remote requested start, created initiator instance {}",
                peer_id,
                slot.instance_id()
            );
            if let Some(conn) = self.connections.get_mut(peer_id) {
                conn.slot = Some(slot);
            }
            return;
        }

        let active = match self.connections.get(peer_id) {
            Some(conn) => self.ctx.local.outranks(&conn.remote_endpoint()),
            None => return,
        };

        let mut created_receiver = false;
        if data.first && !active {
            // The only point at which the non-active side creates an
            // instance: the active side's opening signal.
            if let Some(conn) = self.connections.get_mut(peer_id) {
                conn.retire_slot();
            }
            let mut slot = self.new_slot(peer_id, Role::Receiver, now);
            slot.remote_from = data.from.clone();
            debug!(
                "{}: created receiver instance {} paired with remote {:?}",
                peer_id,
                slot.instance_id(),
                data.from
            );
            if let Some(conn) = self.connections.get_mut(peer_id) {
                conn.slot = Some(slot);
            }
            created_receiver = true;
        }

        let signal_extension = self.ctx.config.signal_extension;
        let Some(conn) = self.connections.get_mut(peer_id) else {
            return;
        };
        let Some(slot) = conn.live_slot() else {
            // Local state is inconsistent with the signal received:
            // restart negotiation rather than recovering in place.
            warn!(
                "{}: signal with no usable transport instance, restarting negotiation",
                peer_id
            );
            self.connect_peer(peer_id);
            return;
        };

        if slot.remote_from.is_none() && data.from.is_some() {
            // Expected once, on the active side's first receipt.
            slot.remote_from = data.from.clone();
        }
        if slot.remote_from != data.from {
            trace!(
                "{}: signal from superseded instance {:?} discarded",
                peer_id,
                data.from
            );
            return;
        }
        if let Some(meta) = &meta {
            slot.apply_meta(meta);
        }
        slot.signal(&data.body);

        if !created_receiver {
            let update = conn.deadline.extend(now, signal_extension);
            self.apply_deadline_update(peer_id, update);
        }
    }

    /// One event from a transport instance. Anything not from the
    /// current, live instance of its connection is ignored.
    pub(crate) fn handle_transport_event(&mut self, event: InstanceEvent) {
        let InstanceEvent {
            peer_id,
            instance_id,
            event,
        } = event;
        let now = Instant::now();

        let current = self
            .connections
            .get_mut(&peer_id)
            .and_then(|conn| conn.live_slot())
            .map(|slot| slot.instance_id().clone());
        if current.as_ref() != Some(&instance_id) {
            trace!(
                "{}: {} from superseded instance {} ignored",
                peer_id,
                event,
                instance_id
            );
            return;
        }

        match event {
            TransportEvent::LocalSignal(body) => self.broadcast_local_signal(&peer_id, body),
            TransportEvent::Connected => self.report_success(&peer_id),
            TransportEvent::IceState(state) if state.is_established() => {
                self.report_success(&peer_id)
            }
            TransportEvent::IceState(IceConnectionState::Disconnected) => {
                debug!("{}: ICE disconnected, probing", peer_id);
                self.send_probe(&peer_id, now);
                let ice_timeout = self.ctx.config.ice_disconnect_timeout;
                let update = self
                    .connections
                    .get_mut(&peer_id)
                    .map(|conn| conn.deadline.arm(now, ice_timeout, Some(REASON_ICE_DISCONNECT)));
                if let Some(update) = update {
                    self.apply_deadline_update(&peer_id, update);
                }
            }
            TransportEvent::IceState(state) => {
                trace!("{}: ICE state {}", peer_id, state);
            }
            TransportEvent::Data(payload) => {
                let _ = self.events.send(MeshEvent::Data(payload));
            }
            TransportEvent::RemoteStream { stream_id } => {
                self.handle_remote_stream(&peer_id, &stream_id);
            }
            TransportEvent::Error(error) => {
                // Non-fatal by itself; close or timeout decides.
                warn!("{}: transport error: {}", peer_id, error);
            }
            TransportEvent::Closed => {
                debug!("{}: transport closed", peer_id);
                self.report_failure(&peer_id, false, "transport closed");
            }
        }
    }

    pub(crate) fn handle_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::Deadline { peer_id, epoch } => self.handle_deadline_fired(&peer_id, epoch),
            TimerEvent::ProbeTimeout { id } => self.handle_probe_timeout(id),
        }
    }

    fn handle_deadline_fired(&mut self, peer_id: &PeerId, epoch: u64) {
        let reason = {
            let Some(conn) = self.connections.get_mut(peer_id) else {
                return;
            };
            if !conn.deadline.accepts(epoch) {
                trace!("{}: stale deadline fire ignored", peer_id);
                return;
            }
            conn.deadline.reason().unwrap_or("timeout")
        };
        self.report_failure(peer_id, false, reason);
    }

    fn handle_probe_timeout(&mut self, id: u64) {
        if let Some(peer_id) = self.probes.expire(id) {
            warn!("{}: liveness probe {} timed out", peer_id, id);
            self.report_failure(&peer_id, true, "liveness probe timed out");
        }
    }

    /// Failure path: retry in place while the continuous failure window
    /// allows it, terminal otherwise. Forced failures skip the window.
    fn report_failure(&mut self, peer_id: &PeerId, forced: bool, reason: &str) {
        let max_failure_duration = self.ctx.config.max_failure_duration;
        let now = Instant::now();
        let disposition = {
            let Some(conn) = self.connections.get_mut(peer_id) else {
                return;
            };
            conn.deadline.clear();
            conn.connected = false;
            let elapsed = conn.failure_elapsed(now);
            debug!(
                "{}: failure ({}), forced={}, window={:?}",
                peer_id, reason, forced, elapsed
            );
            FailureDisposition::decide(forced, elapsed, max_failure_duration)
        };
        match disposition {
            FailureDisposition::Retry => self.connect_peer(peer_id),
            FailureDisposition::Terminal => {
                warn!("{}: connection failed ({})", peer_id, reason);
                let _ = self.events.send(MeshEvent::ConnectionFailed {
                    peer_id: peer_id.clone(),
                    reason: reason.to_string(),
                });
            }
        }
    }

    fn report_success(&mut self, peer_id: &PeerId) {
        let Some(conn) = self.connections.get_mut(peer_id) else {
            return;
        };
        conn.clear_failure();
        conn.deadline.clear();
        if !conn.connected {
            conn.connected = true;
            info!("{}: connection established", peer_id);
            let _ = self.events.send(MeshEvent::PeerConnected {
                peer_id: peer_id.clone(),
            });
        }
    }

    /// Relay a locally produced negotiation payload, tagging `from`
    /// always and `first` (plus the shared-state snapshot) exactly once
    /// per instance.
    fn broadcast_local_signal(&mut self, peer_id: &PeerId, body: Map<String, Value>) {
        let your_conn_id = self.ctx.local.conn.clone();
        let meta = if self.ctx.local_streams.is_empty() {
            None
        } else {
            Some(
                self.ctx
                    .local_streams
                    .iter()
                    .map(|stream| (stream.name.clone(), stream.stream_id.clone()))
                    .collect::<HashMap<_, _>>(),
            )
        };
        let snapshot = self.ctx.shared_state.snapshot();

        let Some(slot) = self
            .connections
            .get_mut(peer_id)
            .and_then(|conn| conn.live_slot())
        else {
            return;
        };
        let first = !slot.first_sent;
        if first {
            slot.first_sent = true;
        }
        let data = SignalData {
            you_start: false,
            first,
            from: Some(slot.instance_id().clone()),
            body,
        };
        self.relay.broadcast(
            peer_id,
            RelayMessage::Signal {
                your_conn_id,
                data,
                meta,
                state: if first { snapshot } else { None },
            },
        );
    }

    fn handle_remote_stream(&mut self, peer_id: &PeerId, stream_id: &str) {
        let name = self
            .connections
            .get_mut(peer_id)
            .and_then(|conn| conn.live_slot())
            .and_then(|slot| slot.stream_name_for(stream_id).map(str::to_string));
        match name {
            Some(name) => {
                self.ctx.remote_streams.upsert(RemoteStream {
                    peer_id: peer_id.clone(),
                    name: name.clone(),
                    stream_id: stream_id.to_string(),
                });
                debug!("{}: remote stream '{}' added", peer_id, name);
                let _ = self.events.send(MeshEvent::StreamAdded {
                    peer_id: peer_id.clone(),
                    name,
                });
            }
            None => debug!(
                "{}: remote stream {} has no advertised name, ignored",
                peer_id, stream_id
            ),
        }
    }

    fn send_probe(&mut self, peer_id: &PeerId, now: Instant) {
        let id = self.probes.begin(peer_id.clone(), now);
        trace!("{}: probe {} sent", peer_id, id);
        self.relay.broadcast(
            peer_id,
            RelayMessage::Ping {
                your_conn_id: self.ctx.local.conn.clone(),
                id,
            },
        );
        self.schedule(
            now + self.ctx.config.probe_timeout,
            TimerEvent::ProbeTimeout { id },
        );
    }

    fn new_slot(&mut self, peer_id: &PeerId, role: Role, now: Instant) -> InstanceSlot {
        let instance_id = InstanceId::generate();
        let events = InstanceEvents::new(
            peer_id.clone(),
            instance_id.clone(),
            self.transport_tx.clone(),
        );
        let transport = self.factory.create(
            role,
            &self.ctx.local_streams,
            &self.ctx.transport_config,
            events,
        );
        InstanceSlot::new(transport, instance_id, role, now)
    }

    fn apply_deadline_update(&self, peer_id: &PeerId, update: DeadlineUpdate) {
        if let DeadlineUpdate::Schedule { fire_at, epoch } = update {
            self.schedule(
                fire_at,
                TimerEvent::Deadline {
                    peer_id: peer_id.clone(),
                    epoch,
                },
            );
        }
    }

    fn schedule(&self, fire_at: Instant, event: TimerEvent) {
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(fire_at).await;
            let _ = tx.send(event);
        });
    }

    pub(crate) fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        let now = Instant::now();
        self.connections
            .values()
            .map(|conn| ConnectionSnapshot {
                peer_id: conn.peer_id.clone(),
                conn_id: conn.conn_id.clone(),
                role: conn.slot.as_ref().map(|slot| slot.role()),
                connected: conn.connected,
                failing_for: conn
                    .last_failure_at
                    .map(|at| now.saturating_duration_since(at)),
            })
            .collect()
    }
}

/// Handle to a running mesh task.
#[derive(Clone)]
pub struct MeshHandle {
    command_tx: mpsc::Sender<MeshCommand>,
}

impl MeshHandle {
    /// Establish (or retry) the connection to a discovered peer attempt.
    pub async fn connect(&self, peer_id: PeerId, conn_id: ConnId) -> Result<(), MeshError> {
        self.command_tx
            .send(MeshCommand::Connect { peer_id, conn_id })
            .await
            .map_err(|_| MeshError::NotRunning)
    }

    /// Tear down and forget the connection to a peer. This is the
    /// caller's cleanup duty after a `ConnectionFailed` event.
    pub async fn disconnect(&self, peer_id: PeerId) -> Result<(), MeshError> {
        self.command_tx
            .send(MeshCommand::Disconnect { peer_id })
            .await
            .map_err(|_| MeshError::NotRunning)
    }

    /// Replace the shared application-state snapshot attached to the
    /// first signal of future attempts.
    pub async fn update_shared_state(&self, payload: Value) -> Result<(), MeshError> {
        self.command_tx
            .send(MeshCommand::UpdateSharedState { payload })
            .await
            .map_err(|_| MeshError::NotRunning)
    }

    /// Snapshot the state of every connection.
    pub async fn connection_states(&self) -> Result<Vec<ConnectionSnapshot>, MeshError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.command_tx
            .send(MeshCommand::ConnectionStates { reply: reply_tx })
            .await
            .map_err(|_| MeshError::NotRunning)?;
        reply_rx.recv().await.ok_or(MeshError::NoReply)
    }

    /// Stop the mesh task.
    pub async fn shutdown(&self) -> Result<(), MeshError> {
        self.command_tx
            .send(MeshCommand::Shutdown)
            .await
            .map_err(|_| MeshError::NotRunning)
    }
}

/// Build and start a mesh node, returning a handle for communication.
///
/// Spawns a tokio task that runs the reactive loop; `inbound` is the
/// delivery channel of the signaling relay, `events` receives the
/// node's outward events.
pub fn start_mesh<F: TransportFactory>(
    ctx: MeshContext,
    factory: F,
    relay: Arc<dyn SignalingRelay>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    events: mpsc::UnboundedSender<MeshEvent>,
) -> MeshHandle {
    crate::init_tracing();

    let (command_tx, mut command_rx) = mpsc::channel::<MeshCommand>(256);
    let (mut node, mut transport_rx, mut timer_rx) = MeshNode::new(ctx, factory, relay, events);

    tokio::spawn(async move {
        info!("mesh node {} started", node.ctx.local);
        loop {
            tokio::select! {
                Some(command) = command_rx.recv() => {
                    match command {
                        MeshCommand::Connect { peer_id, conn_id } => node.add_peer(peer_id, conn_id),
                        MeshCommand::Disconnect { peer_id } => node.remove_peer(&peer_id),
                        MeshCommand::UpdateSharedState { payload } => node.ctx.shared_state.update(payload),
                        MeshCommand::ConnectionStates { reply } => {
                            let _ = reply.send(node.snapshots()).await;
                        }
                        MeshCommand::Shutdown => break,
                    }
                }
                Some(delivery) = inbound.recv() => {
                    node.handle_inbound(delivery.from, delivery.message);
                }
                Some(event) = transport_rx.recv() => {
                    node.handle_transport_event(event);
                }
                Some(timer) = timer_rx.recv() => {
                    node.handle_timer(timer);
                }
                else => break,
            }
        }
        info!("mesh node stopped");
    });

    MeshHandle { command_tx }
}
