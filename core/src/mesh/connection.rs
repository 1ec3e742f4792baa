//! Connection record, deadline supervision and failure accounting
//!
//! A `Connection` is the single shared mutable resource of the
//! protocol: one per remote peer, owned by the reactive loop, retried
//! in place. It carries at most one live transport instance, at most
//! one armed deadline, and the start of the continuous failure window.

use crate::identity::{ConnId, EndpointId, PeerId};
use crate::transport::InstanceSlot;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Deadline label used when an attempt makes no progress at all
pub const REASON_CONNECT_TIMEOUT: &str = "connect timeout";
/// Deadline label used after ICE reports `disconnected`
pub const REASON_ICE_DISCONNECT: &str = "timed out after ICE disconnect";

/// What a timer task needs to do after a deadline mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineUpdate {
    /// The effective firing time did not move; any scheduled timer stands
    Unchanged,
    /// Schedule a fire at `fire_at` carrying `epoch`
    Schedule { fire_at: Instant, epoch: u64 },
}

/// At most one active deadline per connection. Arming merges with any
/// remaining time by taking the maximum, so the effective firing time
/// only ever moves later. Every move bumps the epoch; a fire whose
/// epoch is stale is ignored by the loop.
#[derive(Debug, Default)]
pub struct DeadlineState {
    fire_at: Option<Instant>,
    reason: Option<&'static str>,
    epoch: u64,
}

impl DeadlineState {
    /// Arm (or push) the deadline. The effective delay is
    /// `max(0, remaining, delay)`; the reason is overwritten only when
    /// one is supplied.
    pub fn arm(
        &mut self,
        now: Instant,
        delay: Duration,
        reason: Option<&'static str>,
    ) -> DeadlineUpdate {
        if let Some(reason) = reason {
            self.reason = Some(reason);
        }
        let remaining = self
            .fire_at
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        let fire_at = now + remaining.max(delay);
        match self.fire_at {
            // Never pull an armed deadline earlier.
            Some(current) if current >= fire_at => DeadlineUpdate::Unchanged,
            _ => {
                self.epoch += 1;
                self.fire_at = Some(fire_at);
                DeadlineUpdate::Schedule {
                    fire_at,
                    epoch: self.epoch,
                }
            }
        }
    }

    /// Push an already-armed deadline to at least `delay` out. No-op
    /// when nothing is armed: minor progress signals never create a
    /// deadline where none exists.
    pub fn extend(&mut self, now: Instant, delay: Duration) -> DeadlineUpdate {
        if self.fire_at.is_none() {
            return DeadlineUpdate::Unchanged;
        }
        self.arm(now, delay, None)
    }

    /// Cancel any pending firing and zero the remaining-time bookkeeping.
    pub fn clear(&mut self) {
        if self.fire_at.is_some() {
            self.epoch += 1;
        }
        self.fire_at = None;
        self.reason = None;
    }

    /// Whether a fire carrying `epoch` is still current.
    pub fn accepts(&self, epoch: u64) -> bool {
        self.fire_at.is_some() && self.epoch == epoch
    }

    pub fn is_armed(&self) -> bool {
        self.fire_at.is_some()
    }

    pub fn fire_at(&self) -> Option<Instant> {
        self.fire_at
    }

    pub fn reason(&self) -> Option<&'static str> {
        self.reason
    }
}

/// Verdict of the failure policy for one reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Re-run the connection attempt in place
    Retry,
    /// Surface a terminal failure; the caller owns removal
    Terminal,
}

impl FailureDisposition {
    /// Terminal when forced, or when the continuous failure window has
    /// been exceeded.
    pub fn decide(forced: bool, elapsed: Duration, max_failure_duration: Duration) -> Self {
        if forced || elapsed > max_failure_duration {
            FailureDisposition::Terminal
        } else {
            FailureDisposition::Retry
        }
    }
}

/// One attempted or established link to a remote peer.
pub struct Connection {
    pub peer_id: PeerId,
    /// The remote session's attempt id; superseded in place when the
    /// remote presents a new one.
    pub conn_id: ConnId,
    pub slot: Option<InstanceSlot>,
    /// Start of the continuous failure window; cleared on success only
    pub last_failure_at: Option<Instant>,
    pub deadline: DeadlineState,
    /// Whether a success has been reported for the current instance
    pub connected: bool,
}

impl Connection {
    pub fn new(peer_id: PeerId, conn_id: ConnId) -> Self {
        Self {
            peer_id,
            conn_id,
            slot: None,
            last_failure_at: None,
            deadline: DeadlineState::default(),
            connected: false,
        }
    }

    pub fn remote_endpoint(&self) -> EndpointId {
        EndpointId::new(self.peer_id.clone(), self.conn_id.clone())
    }

    /// Mark-garbage-then-destroy the current instance, if any.
    pub fn retire_slot(&mut self) {
        if let Some(mut slot) = self.slot.take() {
            trace!("superseding transport instance {} for {}", slot.instance_id(), self.peer_id);
            slot.retire();
        }
        self.connected = false;
    }

    /// Elapsed continuous failure time, starting the window at `now`
    /// if it is not already running.
    pub fn failure_elapsed(&mut self, now: Instant) -> Duration {
        let started = *self.last_failure_at.get_or_insert(now);
        now.saturating_duration_since(started)
    }

    /// Forget the failure window (on success).
    pub fn clear_failure(&mut self) {
        self.last_failure_at = None;
    }

    /// A usable instance: present and not mid-teardown.
    pub fn live_slot(&mut self) -> Option<&mut InstanceSlot> {
        self.slot.as_mut().filter(|slot| !slot.is_garbage())
    }
}
