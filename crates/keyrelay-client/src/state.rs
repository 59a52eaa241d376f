//! Known connection sets.
//!
//! Every peer's status is derived from four collections:
//!
//! - `with_key`: peers whose document key we hold
//! - `without_key`: peers who granted us access but whose key we lack
//! - `granted_to`: peers we have granted access to
//! - `requested`: pending key requests addressed to us
//!
//! `with_key` and `without_key` are kept disjoint: every mutation that adds
//! to one removes from the other.

use std::collections::{HashMap, HashSet};

use keyrelay_core::Identity;
use keyrelay_vault::{KeyFingerprint, SessionPublicKey};

/// A `RequestKey` we received and have not answered yet.
#[derive(Debug, Clone)]
pub struct PendingKeyRequest {
    /// The requester's session public key.
    pub key: SessionPublicKey,
    /// Free text the requester attached.
    pub context: Option<String>,
}

impl PendingKeyRequest {
    pub fn fingerprint(&self) -> KeyFingerprint {
        self.key.fingerprint()
    }
}

/// What we know about one peer's document key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// Neither entitled nor holding a key.
    Unknown,
    /// Entitled to request the peer's key, not holding it.
    WithoutKey,
    /// Holding the peer's key.
    WithKey,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectionSets {
    with_key: HashSet<Identity>,
    without_key: HashSet<Identity>,
    granted_to: HashSet<Identity>,
    requested: HashMap<Identity, PendingKeyRequest>,
}

impl ConnectionSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, peer: &Identity) -> PeerStatus {
        if self.with_key.contains(peer) {
            PeerStatus::WithKey
        } else if self.without_key.contains(peer) {
            PeerStatus::WithoutKey
        } else {
            PeerStatus::Unknown
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────

    /// We now hold `peer`'s key.
    pub fn mark_with_key(&mut self, peer: &Identity) {
        self.without_key.remove(peer);
        self.with_key.insert(peer.clone());
    }

    /// We are entitled to `peer`'s key but do not hold it.
    pub fn mark_without_key(&mut self, peer: &Identity) {
        self.with_key.remove(peer);
        self.without_key.insert(peer.clone());
    }

    /// `peer` told us we were granted access. A key we already hold stays.
    pub fn note_entitled(&mut self, peer: &Identity) {
        if !self.with_key.contains(peer) {
            self.without_key.insert(peer.clone());
        }
    }

    /// We asked `peer` for their key. It leaves `without_key` until the key
    /// arrives or reconciliation puts it back.
    pub fn note_requested(&mut self, peer: &Identity) {
        self.without_key.remove(peer);
    }

    /// Drop `peer` from `with_key`. Returns whether it was there.
    pub fn drop_key(&mut self, peer: &Identity) -> bool {
        self.with_key.remove(peer)
    }

    /// Drop `peer` from both key sets.
    pub fn forget_key_status(&mut self, peer: &Identity) {
        self.with_key.remove(peer);
        self.without_key.remove(peer);
    }

    pub fn add_granted(&mut self, peer: &Identity) {
        self.granted_to.insert(peer.clone());
    }

    /// Returns whether `peer` was in `granted_to`.
    pub fn remove_granted(&mut self, peer: &Identity) -> bool {
        self.granted_to.remove(peer)
    }

    /// Record a request, replacing any earlier one from the same peer.
    pub fn record_request(&mut self, peer: &Identity, request: PendingKeyRequest) {
        self.requested.insert(peer.clone(), request);
    }

    pub fn take_request(&mut self, peer: &Identity) -> Option<PendingKeyRequest> {
        self.requested.remove(peer)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    pub fn pending(&self, peer: &Identity) -> Option<&PendingKeyRequest> {
        self.requested.get(peer)
    }

    pub fn has_key(&self, peer: &Identity) -> bool {
        self.with_key.contains(peer)
    }

    pub fn lacks_key(&self, peer: &Identity) -> bool {
        self.without_key.contains(peer)
    }

    pub fn is_granted_to(&self, peer: &Identity) -> bool {
        self.granted_to.contains(peer)
    }

    pub fn with_key(&self) -> impl Iterator<Item = &Identity> {
        self.with_key.iter()
    }

    pub fn without_key(&self) -> impl Iterator<Item = &Identity> {
        self.without_key.iter()
    }

    pub fn granted_to(&self) -> impl Iterator<Item = &Identity> {
        self.granted_to.iter()
    }

    pub fn pending_requests(&self) -> impl Iterator<Item = (&Identity, &PendingKeyRequest)> {
        self.requested.iter()
    }

    /// Whether the key sets are disjoint.
    pub fn is_consistent(&self) -> bool {
        self.with_key.is_disjoint(&self.without_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(name: &str) -> Identity {
        Identity::new(name)
    }

    #[test]
    fn test_import_moves_peer_between_sets() {
        let mut sets = ConnectionSets::new();
        let bob = id("bob");

        sets.note_entitled(&bob);
        assert_eq!(sets.status(&bob), PeerStatus::WithoutKey);

        sets.mark_with_key(&bob);
        assert_eq!(sets.status(&bob), PeerStatus::WithKey);
        assert!(!sets.lacks_key(&bob));

        // A late NotifyGranted does not demote a held key.
        sets.note_entitled(&bob);
        assert_eq!(sets.status(&bob), PeerStatus::WithKey);

        sets.mark_without_key(&bob);
        assert_eq!(sets.status(&bob), PeerStatus::WithoutKey);
        assert!(sets.is_consistent());
    }

    #[test]
    fn test_repeated_transitions_are_idempotent() {
        let mut sets = ConnectionSets::new();
        let bob = id("bob");

        sets.mark_with_key(&bob);
        sets.mark_with_key(&bob);
        assert_eq!(sets.with_key().count(), 1);

        assert!(sets.drop_key(&bob));
        assert!(!sets.drop_key(&bob));
        assert_eq!(sets.status(&bob), PeerStatus::Unknown);

        sets.add_granted(&bob);
        sets.add_granted(&bob);
        assert_eq!(sets.granted_to().count(), 1);
        assert!(sets.remove_granted(&bob));
        assert!(!sets.remove_granted(&bob));
    }

    #[derive(Debug, Clone)]
    enum Event {
        Import(u8),
        Revoke(u8),
        Granted(u8),
        Reencrypt(u8),
        AccessGone(u8),
    }

    fn event() -> impl Strategy<Value = Event> {
        prop_oneof![
            (0u8..4).prop_map(Event::Import),
            (0u8..4).prop_map(Event::Revoke),
            (0u8..4).prop_map(Event::Granted),
            (0u8..4).prop_map(Event::Reencrypt),
            (0u8..4).prop_map(Event::AccessGone),
        ]
    }

    proptest! {
        #[test]
        fn test_key_sets_stay_disjoint(events in prop::collection::vec(event(), 0..64)) {
            let mut sets = ConnectionSets::new();
            for event in events {
                match event {
                    Event::Import(n) => sets.mark_with_key(&id(&format!("p{n}"))),
                    Event::Revoke(n) => { sets.drop_key(&id(&format!("p{n}"))); }
                    Event::Granted(n) => sets.note_entitled(&id(&format!("p{n}"))),
                    Event::Reencrypt(n) => sets.mark_without_key(&id(&format!("p{n}"))),
                    Event::AccessGone(n) => sets.forget_key_status(&id(&format!("p{n}"))),
                }
                prop_assert!(sets.is_consistent());
            }
        }
    }
}
