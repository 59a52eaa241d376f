//! Protocol relay: what the server does with each inbound message.
//!
//! Every authenticated message is turned into at most a handful of outbound
//! [`RelayMessage`]s and handed to the [`Hub`] for delivery.
//!
//! | Inbound        | Outbound                                 | Recipient                          |
//! |----------------|------------------------------------------|------------------------------------|
//! | SendKey        | ImportKey{from, displayName, key, ctx}   | `to`                               |
//! | RevokeKey      | RevokeKey{from}                          | `to`                               |
//! | RequestKey     | RequestKey{from, displayName, key, ...}  | `to` (signature must verify)       |
//! | NotifyGranted  | NotifyGranted{from, displayName}         | `to`                               |
//! | Reencrypt      | Reencrypt{from}                          | everyone the sender granted        |
//! | NewUpload      | NewUpload{user}                          | everyone the sender granted        |
//!
//! A recipient that does not exist on the ledger gets nothing and the sender
//! hears nothing about it. A `RequestKey` whose signature does not verify is
//! answered with a generic `Error` to the sender alone.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use keyrelay_core::{ClientMessage, Identity, LedgerPublicKey, LedgerSignature, RelayMessage};
use keyrelay_ledger::Ledger;

use crate::directory::NameDirectory;
use crate::error::Result;
use crate::hub::{Delivery, Hub};

/// Reason sent back for a rejected key request. Deliberately uninformative.
pub const REQUEST_REJECTED: &str = "request rejected";

/// What became of one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to the hub for this many recipients.
    Forwarded(usize),
    /// Recipient unknown to the ledger; silently discarded.
    Dropped,
    /// Verification failed; the sender was sent an `Error`.
    Rejected,
}

/// Server-side routing of authenticated messages.
pub struct Relay {
    hub: Hub,
    ledger: Arc<dyn Ledger>,
    directory: Arc<NameDirectory>,
}

impl Relay {
    pub fn new(hub: Hub, ledger: Arc<dyn Ledger>, directory: Arc<NameDirectory>) -> Self {
        Self {
            hub,
            ledger,
            directory,
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Decode and route one frame from `sender`.
    pub async fn handle_frame(&self, sender: &Identity, bytes: &[u8]) -> Result<RouteOutcome> {
        let message = ClientMessage::decode(bytes)?;
        self.handle(sender, message).await
    }

    /// Route one typed message from an authenticated `sender`.
    pub async fn handle(&self, sender: &Identity, message: ClientMessage) -> Result<RouteOutcome> {
        debug!(%sender, name = message.name().as_str(), "inbound");

        match message {
            ClientMessage::SendKey { to, key, context } => {
                let out = RelayMessage::ImportKey {
                    from: sender.clone(),
                    display_name: self.directory.display_name(sender),
                    key,
                    context,
                };
                self.forward(to, out).await
            }

            ClientMessage::RevokeKey { to } => {
                let out = RelayMessage::RevokeKey {
                    from: sender.clone(),
                };
                self.forward(to, out).await
            }

            ClientMessage::RequestKey {
                to,
                key,
                signature,
                ledger_key,
                context,
            } => {
                if !self
                    .verify_request(sender, &key, &signature, &ledger_key)
                    .await?
                {
                    warn!(%sender, %to, "rejected key request with bad signature");
                    let notice = RelayMessage::Error {
                        reason: REQUEST_REJECTED.to_string(),
                    };
                    self.send(sender.clone(), &notice).await?;
                    return Ok(RouteOutcome::Rejected);
                }
                let out = RelayMessage::RequestKey {
                    from: sender.clone(),
                    display_name: self.directory.display_name(sender),
                    key,
                    signature,
                    ledger_key,
                    context,
                };
                self.forward(to, out).await
            }

            ClientMessage::NotifyGranted { to } => {
                let out = RelayMessage::NotifyGranted {
                    from: sender.clone(),
                    display_name: self.directory.display_name(sender),
                };
                self.forward(to, out).await
            }

            ClientMessage::Reencrypt => {
                let out = RelayMessage::Reencrypt {
                    from: sender.clone(),
                };
                let recipients = self.ledger.list_connected(sender).await?;
                self.broadcast(recipients, &out).await
            }

            ClientMessage::NewUpload => self.announce_upload(sender).await,
        }
    }

    /// Tell everyone `owner` has granted that a new document is available.
    ///
    /// Also the entry point for the upload handler, which learns about
    /// uploads outside the socket protocol.
    pub async fn announce_upload(&self, owner: &Identity) -> Result<RouteOutcome> {
        let out = RelayMessage::NewUpload {
            user: owner.clone(),
        };
        let recipients: Vec<Identity> = self
            .ledger
            .list_connected(owner)
            .await?
            .into_iter()
            .filter(|r| r != owner)
            .collect();
        self.broadcast(recipients, &out).await
    }

    /// The requester's ledger key must be the one registered for it, and it
    /// must have signed the presented session key.
    async fn verify_request(
        &self,
        sender: &Identity,
        key_pem: &str,
        signature: &LedgerSignature,
        ledger_key: &LedgerPublicKey,
    ) -> Result<bool> {
        if !self.ledger.check_account_key(sender, ledger_key).await? {
            return Ok(false);
        }
        Ok(ledger_key.verify(key_pem.as_bytes(), signature).is_ok())
    }

    async fn forward(&self, to: Identity, out: RelayMessage) -> Result<RouteOutcome> {
        if !self.ledger.check_account_exists(&to).await? {
            debug!(%to, name = out.name().as_str(), "dropping for unknown recipient");
            return Ok(RouteOutcome::Dropped);
        }
        self.send(to, &out).await?;
        Ok(RouteOutcome::Forwarded(1))
    }

    async fn broadcast(&self, recipients: Vec<Identity>, out: &RelayMessage) -> Result<RouteOutcome> {
        let bytes = Bytes::from(out.encode()?);
        let count = recipients.len();
        for to in recipients {
            self.hub.deliver(to, bytes.clone()).await?;
        }
        Ok(RouteOutcome::Forwarded(count))
    }

    async fn send(&self, to: Identity, out: &RelayMessage) -> Result<Delivery> {
        let bytes = Bytes::from(out.encode()?);
        self.hub.deliver(to, bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::memory::ChannelSink;
    use keyrelay_core::Keypair;
    use keyrelay_ledger::MemoryLedger;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_util::sync::CancellationToken;

    const PEM: &str = "-----BEGIN PUBLIC KEY-----\nsession\n-----END PUBLIC KEY-----\n";

    struct Fixture {
        relay: Relay,
        ledger: Arc<MemoryLedger>,
        alice: Keypair,
        bob: Keypair,
    }

    fn id(name: &str) -> Identity {
        Identity::new(name)
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(MemoryLedger::new());
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        ledger.register_account(id("alice"), alice.public_key());
        ledger.register_account(id("bob"), bob.public_key());
        ledger.register_account(id("carol"), Keypair::generate().public_key());

        let directory = Arc::new(NameDirectory::new());
        directory.set(id("bob"), "Dr. Bob");

        let (hub, _) = Hub::spawn(16, CancellationToken::new());
        let relay = Relay::new(hub, ledger.clone(), directory);
        Fixture {
            relay,
            ledger,
            alice,
            bob,
        }
    }

    async fn connect(relay: &Relay, name: &str) -> UnboundedReceiver<Bytes> {
        let (sink, rx) = ChannelSink::new();
        let hub = relay.hub();
        hub.register(id(name), hub.new_connection(sink)).await.unwrap();
        rx
    }

    fn next(rx: &mut UnboundedReceiver<Bytes>) -> RelayMessage {
        RelayMessage::decode(&rx.try_recv().expect("no frame")).unwrap()
    }

    #[tokio::test]
    async fn test_send_key_becomes_import_key() {
        let f = fixture();
        let mut bob_rx = connect(&f.relay, "bob").await;

        let outcome = f
            .relay
            .handle(
                &id("alice"),
                ClientMessage::SendKey {
                    to: id("bob"),
                    key: vec![7; 256],
                    context: Some("qr".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Forwarded(1));

        assert_eq!(
            next(&mut bob_rx),
            RelayMessage::ImportKey {
                from: id("alice"),
                display_name: "alice".into(),
                key: vec![7; 256],
                context: Some("qr".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_recipient_is_dropped() {
        let f = fixture();
        let outcome = f
            .relay
            .handle(&id("alice"), ClientMessage::RevokeKey { to: id("ghost") })
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Dropped);
        assert_eq!(f.relay.hub().mailbox_len(id("ghost")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_recipient_is_mailed() {
        let f = fixture();
        f.relay
            .handle(&id("alice"), ClientMessage::NotifyGranted { to: id("bob") })
            .await
            .unwrap();
        assert_eq!(f.relay.hub().mailbox_len(id("bob")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_valid_request_key_is_forwarded() {
        let f = fixture();
        let mut alice_rx = connect(&f.relay, "alice").await;

        let msg = ClientMessage::RequestKey {
            to: id("alice"),
            key: PEM.into(),
            signature: f.bob.sign(PEM.as_bytes()),
            ledger_key: f.bob.public_key(),
            context: None,
        };
        let outcome = f.relay.handle(&id("bob"), msg).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Forwarded(1));

        match next(&mut alice_rx) {
            RelayMessage::RequestKey {
                from,
                display_name,
                key,
                ledger_key,
                ..
            } => {
                assert_eq!(from, id("bob"));
                assert_eq!(display_name, "Dr. Bob");
                assert_eq!(key, PEM);
                assert_eq!(ledger_key, f.bob.public_key());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected_to_sender_only() {
        let f = fixture();
        let mut alice_rx = connect(&f.relay, "alice").await;
        let mut bob_rx = connect(&f.relay, "bob").await;

        // Signed with alice's key but claiming to be bob.
        let msg = ClientMessage::RequestKey {
            to: id("alice"),
            key: PEM.into(),
            signature: f.alice.sign(PEM.as_bytes()),
            ledger_key: f.alice.public_key(),
            context: None,
        };
        let outcome = f.relay.handle(&id("bob"), msg).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Rejected);

        assert_eq!(
            next(&mut bob_rx),
            RelayMessage::Error {
                reason: REQUEST_REJECTED.into()
            }
        );
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_signature_over_other_key_is_rejected() {
        let f = fixture();
        let msg = ClientMessage::RequestKey {
            to: id("alice"),
            key: PEM.into(),
            signature: f.bob.sign(b"a different key"),
            ledger_key: f.bob.public_key(),
            context: None,
        };
        let outcome = f.relay.handle(&id("bob"), msg).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Rejected);
        assert_eq!(f.relay.hub().mailbox_len(id("alice")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reencrypt_goes_to_every_grantee() {
        let f = fixture();
        f.ledger.grant_access(&id("alice"), &id("bob")).await.unwrap();
        f.ledger.grant_access(&id("alice"), &id("carol")).await.unwrap();
        let mut bob_rx = connect(&f.relay, "bob").await;

        let outcome = f
            .relay
            .handle(&id("alice"), ClientMessage::Reencrypt)
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Forwarded(2));
        assert_eq!(next(&mut bob_rx), RelayMessage::Reencrypt { from: id("alice") });
        assert_eq!(f.relay.hub().mailbox_len(id("carol")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_new_upload_skips_uploader() {
        let f = fixture();
        f.ledger.grant_access(&id("alice"), &id("bob")).await.unwrap();
        let mut bob_rx = connect(&f.relay, "bob").await;
        let mut alice_rx = connect(&f.relay, "alice").await;

        let outcome = f.relay.announce_upload(&id("alice")).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Forwarded(1));
        assert_eq!(next(&mut bob_rx), RelayMessage::NewUpload { user: id("alice") });
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_an_error() {
        let f = fixture();
        assert!(f.relay.handle_frame(&id("alice"), b"{").await.is_err());
        let import = br#"{"Name":"ImportKey","Fields":{}}"#;
        assert!(f.relay.handle_frame(&id("alice"), import).await.is_err());
    }
}
