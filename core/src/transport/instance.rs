//! Per-attempt transport instance slot
//!
//! Wraps the external transport object together with the bookkeeping
//! the negotiation protocol needs: the instance's own identifier (sent
//! as `from` on every outgoing signal), the remote instance identifier
//! it is paired with, the first-signal flag, and the garbage marker.
//!
//! Retirement order is mark-garbage-then-destroy: any callback already
//! in flight from the old instance observes the marker (or fails the
//! instance-id match) and is ignored.

use super::{Role, Transport};
use crate::identity::InstanceId;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::trace;

pub struct InstanceSlot {
    transport: Box<dyn Transport>,
    instance_id: InstanceId,
    role: Role,
    /// Remote instance identifier this slot is paired with. Recorded
    /// from the first signal carrying `from`; signals from any other
    /// instance are cross-attempt bleed and get discarded.
    pub remote_from: Option<InstanceId>,
    /// Whether this instance has produced its first outgoing signal
    pub first_sent: bool,
    pub started_at: Instant,
    /// Remote stream name -> transport-level stream id, as advertised
    /// in received signal metadata
    remote_stream_names: HashMap<String, String>,
    garbage: bool,
}

impl InstanceSlot {
    pub fn new(
        transport: Box<dyn Transport>,
        instance_id: InstanceId,
        role: Role,
        now: Instant,
    ) -> Self {
        Self {
            transport,
            instance_id,
            role,
            remote_from: None,
            first_sent: false,
            started_at: now,
            remote_stream_names: HashMap::new(),
            garbage: false,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_garbage(&self) -> bool {
        self.garbage
    }

    /// Mark garbage, then destroy. Idempotent.
    pub fn retire(&mut self) {
        if self.garbage {
            return;
        }
        self.garbage = true;
        self.transport.destroy();
        trace!("transport instance {} retired", self.instance_id);
    }

    /// Forward an inbound negotiation payload. Dropped once retired.
    pub fn signal(&mut self, payload: &Map<String, Value>) {
        if self.garbage {
            trace!("signal for garbage instance {} dropped", self.instance_id);
            return;
        }
        self.transport.signal(payload);
    }

    /// Merge a received stream name -> id advertisement.
    pub fn apply_meta(&mut self, meta: &HashMap<String, String>) {
        for (name, stream_id) in meta {
            self.remote_stream_names
                .insert(name.clone(), stream_id.clone());
        }
    }

    /// Resolve a transport-level stream id to its advertised name.
    pub fn stream_name_for(&self, stream_id: &str) -> Option<&str> {
        self.remote_stream_names
            .iter()
            .find(|(_, id)| id.as_str() == stream_id)
            .map(|(name, _)| name.as_str())
    }
}

impl Drop for InstanceSlot {
    fn drop(&mut self) {
        self.retire();
    }
}
