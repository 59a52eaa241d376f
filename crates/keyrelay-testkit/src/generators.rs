//! Proptest generators for property-based testing.

use proptest::prelude::*;

use keyrelay_core::{ClientMessage, Identity, Keypair, RelayMessage};
use keyrelay_vault::{DocumentKey, SessionPublicKey};

/// Generate a random keypair.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed))
}

/// Generate an account name.
pub fn identity() -> impl Strategy<Value = Identity> {
    "[a-z][a-z0-9._-]{0,15}".prop_map(Identity::from)
}

/// Generate an optional request context.
pub fn context() -> impl Strategy<Value = Option<String>> {
    prop::option::of("[ -~]{0,40}".prop_map(String::from))
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}

/// Generate any client message addressed to `to`.
///
/// `RequestKey` carries a well-formed signature by a random keypair over a
/// placeholder PEM; it will not verify against any ledger account.
pub fn client_message_to(to: Identity) -> impl Strategy<Value = ClientMessage> {
    let send_key = (payload(256), context()).prop_map({
        let to = to.clone();
        move |(key, context)| ClientMessage::SendKey {
            to: to.clone(),
            key,
            context,
        }
    });
    let request_key = (keypair(), "[A-Za-z0-9+/]{16,64}", context()).prop_map({
        let to = to.clone();
        move |(signer, body, context)| {
            let key = format!("-----BEGIN PUBLIC KEY-----\n{body}\n-----END PUBLIC KEY-----\n");
            ClientMessage::RequestKey {
                to: to.clone(),
                signature: signer.sign(key.as_bytes()),
                ledger_key: signer.public_key(),
                key,
                context,
            }
        }
    });

    prop_oneof![
        send_key,
        Just(ClientMessage::RevokeKey { to: to.clone() }),
        request_key,
        Just(ClientMessage::NotifyGranted { to }),
        Just(ClientMessage::Reencrypt),
        Just(ClientMessage::NewUpload),
    ]
}

/// Generate any client message to a random recipient.
pub fn client_message() -> impl Strategy<Value = ClientMessage> {
    identity().prop_flat_map(client_message_to)
}

/// Something a peer can do to us, as seen through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// The peer sent us its key.
    Import(u8),
    /// The peer revoked our access.
    Revoke(u8),
    /// The peer granted us access.
    Notify(u8),
    /// The peer changed its key.
    Reencrypt(u8),
}

impl PeerEvent {
    pub fn peer(&self) -> Identity {
        let index = match self {
            PeerEvent::Import(i)
            | PeerEvent::Revoke(i)
            | PeerEvent::Notify(i)
            | PeerEvent::Reencrypt(i) => i,
        };
        Identity::new(format!("peer{index}"))
    }

    /// The message the relay would deliver. `Import` wraps a fresh key for
    /// `session`.
    pub fn to_relay_message(&self, session: &SessionPublicKey) -> RelayMessage {
        let from = self.peer();
        match self {
            PeerEvent::Import(_) => RelayMessage::ImportKey {
                display_name: from.to_string(),
                from,
                key: session
                    .wrap(&DocumentKey::generate())
                    .expect("wrap under a valid session key"),
                context: None,
            },
            PeerEvent::Revoke(_) => RelayMessage::RevokeKey { from },
            PeerEvent::Notify(_) => RelayMessage::NotifyGranted {
                display_name: from.to_string(),
                from,
            },
            PeerEvent::Reencrypt(_) => RelayMessage::Reencrypt { from },
        }
    }
}

/// Generate an event from one of `peers` peers.
pub fn peer_event(peers: u8) -> impl Strategy<Value = PeerEvent> {
    let peers = peers.max(1);
    prop_oneof![
        (0..peers).prop_map(PeerEvent::Import),
        (0..peers).prop_map(PeerEvent::Revoke),
        (0..peers).prop_map(PeerEvent::Notify),
        (0..peers).prop_map(PeerEvent::Reencrypt),
    ]
}
