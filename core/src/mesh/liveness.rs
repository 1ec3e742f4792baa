//! Liveness prober
//!
//! Round-trip probes over the signaling relay, independent of any
//! transport-level signal. Each probe gets a fresh monotonically
//! increasing id and lives in the registry until resolved exactly once:
//! either a matching pong arrives (round-trip time measured) or the
//! probe timer fires first. A timed-out probe is how the mesh notices a
//! relay that is unreachable or a peer that vanished without ever
//! sending a close.

use crate::identity::PeerId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// One in-flight probe.
#[derive(Debug, Clone)]
pub struct PendingProbe {
    pub peer_id: PeerId,
    pub started_at: Instant,
}

/// Registry of in-flight probes, keyed by probe id.
#[derive(Debug, Default)]
pub struct ProbeRegistry {
    next_id: u64,
    pending: HashMap<u64, PendingProbe>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a probe towards `peer_id`, returning its id.
    pub fn begin(&mut self, peer_id: PeerId, now: Instant) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.insert(
            id,
            PendingProbe {
                peer_id,
                started_at: now,
            },
        );
        id
    }

    /// Resolve a probe with a pong from `from`. Returns the probed peer
    /// and the measured round-trip time, or `None` if the id is unknown,
    /// already resolved, or answered by the wrong peer.
    pub fn resolve(&mut self, id: u64, from: &PeerId, now: Instant) -> Option<(PeerId, Duration)> {
        if self.pending.get(&id).map(|probe| &probe.peer_id) != Some(from) {
            return None;
        }
        let probe = self.pending.remove(&id)?;
        let rtt = now.saturating_duration_since(probe.started_at);
        Some((probe.peer_id, rtt))
    }

    /// Resolve a probe as timed out. Returns the probed peer, or `None`
    /// if a pong already won the race.
    pub fn expire(&mut self, id: u64) -> Option<PeerId> {
        self.pending.remove(&id).map(|probe| probe.peer_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_ids_are_monotonic() {
        let mut registry = ProbeRegistry::new();
        let now = Instant::now();
        let first = registry.begin(PeerId::from("alice"), now);
        let second = registry.begin(PeerId::from("bob"), now);
        assert!(second > first);
        assert_eq!(registry.pending_count(), 2);
    }

    #[test]
    fn test_pong_resolves_with_rtt() {
        let mut registry = ProbeRegistry::new();
        let sent = Instant::now();
        let alice = PeerId::from("alice");
        let id = registry.begin(alice.clone(), sent);

        let (peer, rtt) = registry.resolve(id, &alice, sent + 40 * MS).unwrap();
        assert_eq!(peer, alice);
        assert_eq!(rtt, 40 * MS);
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_single_resolution() {
        let mut registry = ProbeRegistry::new();
        let now = Instant::now();
        let alice = PeerId::from("alice");
        let id = registry.begin(alice.clone(), now);

        assert!(registry.resolve(id, &alice, now).is_some());
        // Whichever of pong/timeout loses the race is a no-op.
        assert!(registry.expire(id).is_none());
        assert!(registry.resolve(id, &alice, now).is_none());
    }

    #[test]
    fn test_expire_wins_over_late_pong() {
        let mut registry = ProbeRegistry::new();
        let now = Instant::now();
        let alice = PeerId::from("alice");
        let id = registry.begin(alice.clone(), now);

        assert_eq!(registry.expire(id), Some(alice.clone()));
        assert!(registry.resolve(id, &alice, now).is_none());
    }

    #[test]
    fn test_pong_from_wrong_peer_is_ignored() {
        let mut registry = ProbeRegistry::new();
        let now = Instant::now();
        let alice = PeerId::from("alice");
        let id = registry.begin(alice.clone(), now);

        assert!(registry.resolve(id, &PeerId::from("mallory"), now).is_none());
        // The probe is still pending for the real peer.
        assert!(registry.resolve(id, &alice, now).is_some());
    }

    #[test]
    fn test_unknown_id_is_ignored() {
        let mut registry = ProbeRegistry::new();
        assert!(registry.expire(99).is_none());
        assert!(registry
            .resolve(99, &PeerId::from("alice"), Instant::now())
            .is_none());
    }
}
