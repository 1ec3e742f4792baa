//! Signaling relay protocol — messages and serialization
//!
//! Wire format is JSON. Field names are part of the protocol and must
//! not change: every envelope carries the sender's attempt id as
//! `yourConnId`, and negotiation payloads may be tagged with `first`,
//! `from` and `youStart` alongside the opaque body.

use crate::identity::{ConnId, InstanceId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Relay protocol error types
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Opaque application-state snapshot attached to the first outgoing
/// signal of an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    /// Opaque application payload
    pub payload: Value,
    /// Unix timestamp in milliseconds at which the payload was last set
    pub updated_at: u64,
}

/// The `data` field of a `signal` message: an opaque negotiation body
/// (flattened), optionally tagged with start-request / first-signal /
/// sender-instance markers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalData {
    /// Start request: the non-active side asks the remote to initiate
    #[serde(default, skip_serializing_if = "is_false")]
    pub you_start: bool,
    /// Set on the first signal produced by a transport instance
    #[serde(default, skip_serializing_if = "is_false")]
    pub first: bool,
    /// Identifier of the transport instance that produced this signal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<InstanceId>,
    /// Opaque negotiation payload (offer/answer/candidate data)
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl SignalData {
    /// A bare start request
    pub fn you_start() -> Self {
        Self {
            you_start: true,
            ..Self::default()
        }
    }

    /// A negotiation payload as produced by a transport instance
    pub fn negotiation(body: Map<String, Value>) -> Self {
        Self {
            body,
            ..Self::default()
        }
    }
}

/// A message carried by the signaling relay, addressed by target peer
/// identity. `your_conn_id` is always the *sender's* attempt id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelayMessage {
    /// Negotiation step or start-request
    #[serde(rename_all = "camelCase")]
    Signal {
        your_conn_id: ConnId,
        data: SignalData,
        /// Local stream name -> transport-level stream id advertisement
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<HashMap<String, String>>,
        /// Shared application-state snapshot (first signal of an attempt only)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<StateSnapshot>,
    },
    /// Liveness probe
    #[serde(rename_all = "camelCase")]
    Ping { your_conn_id: ConnId, id: u64 },
    /// Liveness probe reply (id echoed)
    #[serde(rename_all = "camelCase")]
    Pong { your_conn_id: ConnId, id: u64 },
}

impl RelayMessage {
    /// Serialize for the wire
    pub fn to_json(&self) -> Result<String, RelayError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from the wire
    pub fn from_json(raw: &str) -> Result<Self, RelayError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Message type label, for logging
    pub fn message_type(&self) -> &'static str {
        match self {
            RelayMessage::Signal { .. } => "signal",
            RelayMessage::Ping { .. } => "ping",
            RelayMessage::Pong { .. } => "pong",
        }
    }

    /// The sender's attempt id carried on every envelope
    pub fn sender_conn_id(&self) -> &ConnId {
        match self {
            RelayMessage::Signal { your_conn_id, .. }
            | RelayMessage::Ping { your_conn_id, .. }
            | RelayMessage::Pong { your_conn_id, .. } => your_conn_id,
        }
    }
}
