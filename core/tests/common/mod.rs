//! Shared test harness — scripted transports and event helpers
//!
//! The scripted transport records everything the mesh feeds into it
//! and hands the test its pre-tagged event sender, so a test plays the
//! role of the real point-to-point engine: emit an offer, emit
//! connected, emit a close, and watch the protocol react.
#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swarmlink_core::{
    InstanceEvents, LocalStream, MeshEvent, Role, Transport, TransportConfig, TransportFactory,
};
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct ScriptedInstance {
    pub role: Role,
    pub events: InstanceEvents,
    signals: Arc<Mutex<Vec<Map<String, Value>>>>,
    destroyed: Arc<AtomicBool>,
}

impl ScriptedInstance {
    pub fn signals(&self) -> Vec<Map<String, Value>> {
        self.signals.lock().clone()
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

struct ScriptedTransport {
    signals: Arc<Mutex<Vec<Map<String, Value>>>>,
    destroyed: Arc<AtomicBool>,
}

impl Transport for ScriptedTransport {
    fn signal(&mut self, payload: &Map<String, Value>) {
        self.signals.lock().push(payload.clone());
    }

    fn destroy(&mut self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub struct ScriptedFactory {
    created: Arc<Mutex<Vec<ScriptedInstance>>>,
}

impl ScriptedFactory {
    pub fn count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn instance(&self, index: usize) -> ScriptedInstance {
        self.created.lock()[index].clone()
    }
}

impl TransportFactory for ScriptedFactory {
    fn create(
        &mut self,
        role: Role,
        _streams: &[LocalStream],
        _config: &TransportConfig,
        events: InstanceEvents,
    ) -> Box<dyn Transport> {
        let signals = Arc::new(Mutex::new(Vec::new()));
        let destroyed = Arc::new(AtomicBool::new(false));
        self.created.lock().push(ScriptedInstance {
            role,
            events,
            signals: Arc::clone(&signals),
            destroyed: Arc::clone(&destroyed),
        });
        Box::new(ScriptedTransport { signals, destroyed })
    }
}

/// JSON object literal shorthand for negotiation payloads.
pub fn obj(value: Value) -> Map<String, Value> {
    value.as_object().expect("payload must be an object").clone()
}

/// Poll until `cond` holds, letting the node tasks run in between.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

/// Receive events until one matches, failing after a (virtual) grace
/// period.
pub async fn next_matching(
    rx: &mut mpsc::UnboundedReceiver<MeshEvent>,
    mut pred: impl FnMut(&MeshEvent) -> bool,
    grace: Duration,
) -> MeshEvent {
    tokio::time::timeout(grace, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event not observed")
}
