//! Multi-party key-exchange scenarios through a real relay and hub.
//!
//! Each party is a `KeyExchange` attached to the hub by an in-memory sink;
//! frames move only when the test pumps them.

use proptest::prelude::*;

use keyrelay_client::{ClientError, ClientEvent};
use keyrelay_core::{ClientMessage, Identity, Keypair, RelayMessage};
use keyrelay_ledger::Ledger;
use keyrelay_relay::{RouteOutcome, REQUEST_REJECTED};
use keyrelay_testkit::generators::{client_message_to, peer_event, PeerEvent};
use keyrelay_testkit::{init_tracing, shared_session, Party, TestNetwork};

/// Alice and Bob, both online, with nothing granted yet.
async fn pair(net: &TestNetwork) -> (Party, Party) {
    let mut alice = net.party("alice");
    let mut bob = net.party("bob");
    net.connect(&mut alice).await;
    net.connect(&mut bob).await;
    (alice, bob)
}

/// Each side grants the other and fetches the other's key.
async fn exchange_keys(net: &TestNetwork, alice: &mut Party, bob: &mut Party) {
    let grant = alice.exchange.grant_access(bob.id()).await.unwrap();
    net.send(alice, grant).await;
    let grant = bob.exchange.grant_access(alice.id()).await.unwrap();
    net.send(bob, grant).await;

    let request = bob.exchange.request_access(alice.id(), None).unwrap();
    net.send(bob, request).await;
    let request = alice.exchange.request_access(bob.id(), None).unwrap();
    net.send(alice, request).await;

    net.settle(&mut [&mut *alice, &mut *bob]).await;
    alice.take_events();
    bob.take_events();
}

#[tokio::test]
async fn test_granted_request_is_answered_without_user_action() {
    init_tracing();
    let net = TestNetwork::new();
    let (mut alice, mut bob) = pair(&net).await;
    net.ledger.grant_access(alice.id(), bob.id()).await.unwrap();

    let request = bob
        .exchange
        .request_access(alice.id(), Some("tax return".into()))
        .unwrap();
    assert_eq!(
        net.send(&bob, request).await,
        vec![RouteOutcome::Forwarded(1)]
    );
    net.settle(&mut [&mut alice, &mut bob]).await;

    // Alice answered from the ledger alone.
    assert!(matches!(
        alice.events[..],
        [ClientEvent::KeyRequested { answered: true, .. }]
    ));
    assert!(alice.exchange.connections().pending(bob.id()).is_none());
    assert!(alice.exchange.connections().is_granted_to(bob.id()));

    assert_eq!(
        bob.events,
        vec![ClientEvent::KeyImported {
            from: alice.id().clone(),
            context: Some("tax return".into()),
        }]
    );
    assert!(bob.exchange.connections().has_key(alice.id()));
    assert_eq!(
        bob.exchange.document_key(alice.id()),
        alice.exchange.document_key(alice.id())
    );
    assert_eq!(bob.exchange.peer_name(alice.id()), Some("Alice"));
}

#[tokio::test]
async fn test_ungranted_request_waits_for_the_owner() {
    let net = TestNetwork::new();
    let (mut alice, mut bob) = pair(&net).await;

    let request = bob.exchange.request_access(alice.id(), None).unwrap();
    net.send(&bob, request).await;
    net.settle(&mut [&mut alice, &mut bob]).await;

    assert!(matches!(
        alice.take_events()[..],
        [ClientEvent::KeyRequested {
            answered: false,
            ..
        }]
    ));
    assert!(alice.exchange.connections().pending(bob.id()).is_some());
    assert!(bob.exchange.document_key(alice.id()).is_none());

    let answer = alice.exchange.grant_access(bob.id()).await.unwrap();
    assert!(matches!(answer[..], [ClientMessage::SendKey { .. }]));
    net.send(&alice, answer).await;
    net.settle(&mut [&mut alice, &mut bob]).await;

    assert!(alice.exchange.connections().pending(bob.id()).is_none());
    assert!(bob.exchange.connections().has_key(alice.id()));
}

#[tokio::test]
async fn test_revoke_tears_down_both_sides() {
    let net = TestNetwork::new();
    let (mut alice, mut bob) = pair(&net).await;
    exchange_keys(&net, &mut alice, &mut bob).await;

    // One document each, fetched by the other side.
    let (alice_doc, announce) = alice
        .exchange
        .save_and_upload(&alice.id().clone(), b"alice's will")
        .await
        .unwrap();
    net.send(&alice, announce).await;
    let (bob_doc, announce) = bob
        .exchange
        .save_and_upload(&bob.id().clone(), b"bob's deed")
        .await
        .unwrap();
    net.send(&bob, announce).await;
    net.settle(&mut [&mut alice, &mut bob]).await;
    assert!(bob.exchange.vault().exists(alice.id(), &alice_doc));
    assert!(alice.exchange.vault().exists(bob.id(), &bob_doc));

    let revoke = alice.exchange.revoke_access(bob.id()).await.unwrap();
    assert_eq!(
        net.send(&alice, revoke).await,
        vec![RouteOutcome::Forwarded(1)]
    );
    net.settle(&mut [&mut alice, &mut bob]).await;

    // Alice dropped what she held of Bob's.
    assert!(!alice.exchange.connections().has_key(bob.id()));
    assert!(!alice.exchange.connections().is_granted_to(bob.id()));
    assert!(alice.exchange.document_key(bob.id()).is_none());
    assert!(alice.exchange.vault().list_ids(bob.id()).is_empty());

    // Bob dropped what he held of Alice's.
    assert!(bob.events.contains(&ClientEvent::KeyRevoked {
        from: alice.id().clone()
    }));
    assert!(!bob.exchange.connections().has_key(alice.id()));
    assert!(bob.exchange.document_key(alice.id()).is_none());
    assert!(bob.exchange.vault().list_ids(alice.id()).is_empty());

    // The ledger agrees, and only Alice's grant is gone.
    assert!(!net.ledger.access_granted(alice.id(), bob.id()).await.unwrap());
    assert!(net.ledger.access_granted(bob.id(), alice.id()).await.unwrap());
    assert!(matches!(
        bob.exchange.update(alice.id()).await,
        Err(ClientError::AccessDenied(_))
    ));
}

#[tokio::test]
async fn test_key_reaches_offline_requester_on_reconnect() {
    let net = TestNetwork::new();
    let (mut alice, mut bob) = pair(&net).await;

    let request = bob.exchange.request_access(alice.id(), None).unwrap();
    net.send(&bob, request).await;
    net.pump(&mut alice).await;
    net.disconnect(&mut bob).await;

    let answer = alice.exchange.grant_access(bob.id()).await.unwrap();
    assert_eq!(
        net.send(&alice, answer).await,
        vec![RouteOutcome::Forwarded(1)]
    );
    assert_eq!(net.mailbox_len(bob.id()).await, 1);

    net.connect(&mut bob).await;
    assert_eq!(net.mailbox_len(bob.id()).await, 0);
    assert_eq!(net.pump(&mut bob).await, 1);
    assert!(bob.exchange.connections().has_key(alice.id()));
}

#[tokio::test]
async fn test_forged_request_is_rejected_to_sender() {
    let net = TestNetwork::new();
    let (mut alice, mut bob) = pair(&net).await;
    net.ledger.grant_access(alice.id(), bob.id()).await.unwrap();
    let mallory = Keypair::generate();

    // Bob's session key, signed by a key the ledger does not know for Bob.
    let mut forged = bob.exchange.request_access(alice.id(), None).unwrap();
    if let ClientMessage::RequestKey {
        key,
        signature,
        ledger_key,
        ..
    } = &mut forged[0]
    {
        *signature = mallory.sign(key.as_bytes());
        *ledger_key = mallory.public_key();
    }
    assert_eq!(
        net.send(&bob, forged).await,
        vec![RouteOutcome::Rejected]
    );

    // Bob's registered key, but over a different session key.
    let mut tampered = bob.exchange.request_access(alice.id(), None).unwrap();
    if let ClientMessage::RequestKey { signature, .. } = &mut tampered[0] {
        *signature = bob.keypair.sign(b"some other session key");
    }
    assert_eq!(
        net.send(&bob, tampered).await,
        vec![RouteOutcome::Rejected]
    );

    assert!(net.inbound(&mut alice).is_empty());
    assert!(alice.exchange.connections().pending(bob.id()).is_none());

    net.pump(&mut bob).await;
    let rejected = ClientEvent::Rejected {
        reason: REQUEST_REJECTED.to_string(),
    };
    assert_eq!(bob.take_events(), vec![rejected.clone(), rejected]);
    assert!(bob.exchange.document_key(alice.id()).is_none());
}

#[tokio::test]
async fn test_mailbox_preserves_arrival_order() {
    let net = TestNetwork::new();
    let mut alice = net.party("alice");
    let mut bob = net.party("bob");
    let mut carol = net.party("carol");
    net.connect(&mut alice).await;
    net.connect(&mut carol).await;

    let to_bob = || bob.id().clone();
    net.send(&alice, vec![ClientMessage::NotifyGranted { to: to_bob() }])
        .await;
    net.send(&carol, vec![ClientMessage::NotifyGranted { to: to_bob() }])
        .await;
    net.send(&alice, vec![ClientMessage::RevokeKey { to: to_bob() }])
        .await;
    net.send(&carol, vec![ClientMessage::RevokeKey { to: to_bob() }])
        .await;
    assert_eq!(net.mailbox_len(bob.id()).await, 4);

    net.connect(&mut bob).await;
    assert_eq!(
        net.inbound(&mut bob),
        vec![
            RelayMessage::NotifyGranted {
                from: alice.id().clone(),
                display_name: "Alice".into(),
            },
            RelayMessage::NotifyGranted {
                from: carol.id().clone(),
                display_name: "Carol".into(),
            },
            RelayMessage::RevokeKey {
                from: alice.id().clone()
            },
            RelayMessage::RevokeKey {
                from: carol.id().clone()
            },
        ]
    );
}

#[tokio::test]
async fn test_reencrypt_rotates_every_grantee() {
    let net = TestNetwork::new();
    let (mut alice, mut bob) = pair(&net).await;
    exchange_keys(&net, &mut alice, &mut bob).await;

    let (doc, announce) = alice
        .exchange
        .save_and_upload(&alice.id().clone(), b"ledger export")
        .await
        .unwrap();
    net.send(&alice, announce).await;
    net.settle(&mut [&mut alice, &mut bob]).await;
    bob.take_events();
    let old_key = alice.exchange.document_key(alice.id()).cloned().unwrap();

    let rotate = alice.exchange.reencrypt().await.unwrap();
    assert_eq!(
        net.send(&alice, rotate).await,
        vec![RouteOutcome::Forwarded(1)]
    );
    net.settle(&mut [&mut alice, &mut bob]).await;

    let new_key = alice.exchange.document_key(alice.id()).cloned().unwrap();
    assert_ne!(new_key, old_key);

    // Bob dropped the stale copy, re-requested and was answered.
    let events = bob.take_events();
    assert_eq!(
        events[0],
        ClientEvent::PeerReencrypted {
            from: alice.id().clone()
        }
    );
    assert!(matches!(events[1], ClientEvent::KeyImported { .. }));
    assert_eq!(bob.exchange.document_key(alice.id()), Some(&new_key));
    assert!(bob.exchange.connections().has_key(alice.id()));
    assert!(!bob.exchange.vault().exists(alice.id(), &doc));

    // The server copy was replaced, so a fresh download opens under the new key.
    assert_eq!(bob.exchange.update(alice.id()).await.unwrap(), 1);
    assert_eq!(
        bob.exchange.open_document(alice.id(), &doc).unwrap(),
        b"ledger export"
    );
}

#[tokio::test]
async fn test_upload_notifies_only_grantees() {
    let net = TestNetwork::new();
    let (mut alice, mut bob) = pair(&net).await;
    let mut carol = net.party("carol");
    net.connect(&mut carol).await;
    exchange_keys(&net, &mut alice, &mut bob).await;

    let (doc, announce) = alice
        .exchange
        .save_and_upload(&alice.id().clone(), b"minutes")
        .await
        .unwrap();
    assert_eq!(
        net.send(&alice, announce).await,
        vec![RouteOutcome::Forwarded(1)]
    );
    net.settle(&mut [&mut alice, &mut bob, &mut carol]).await;

    assert_eq!(
        bob.take_events(),
        vec![ClientEvent::NewUpload {
            user: alice.id().clone(),
            downloaded: 1,
        }]
    );
    assert_eq!(
        bob.exchange.open_document(alice.id(), &doc).unwrap(),
        b"minutes"
    );
    assert!(carol.take_events().is_empty());
    assert!(alice.take_events().is_empty());
}

#[tokio::test]
async fn test_ledger_revocation_is_reconciled() {
    let net = TestNetwork::new();
    let (mut alice, mut bob) = pair(&net).await;
    exchange_keys(&net, &mut alice, &mut bob).await;

    // Revoked on the ledger directly; Bob never hears about it.
    net.ledger.revoke_access(alice.id(), bob.id()).await.unwrap();
    assert!(bob.exchange.connections().has_key(alice.id()));

    let status = bob.exchange.check_granted_status(alice.id()).await.unwrap();
    assert!(!status.granted);
    assert!(!bob.exchange.connections().has_key(alice.id()));
    assert!(!bob.exchange.connections().lacks_key(alice.id()));
    assert!(bob.exchange.document_key(alice.id()).is_none());
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_unknown_recipients_never_collect_mail(
        message in client_message_to(Identity::new("ghost"))
    ) {
        runtime().block_on(async {
            let net = TestNetwork::new();
            let mut alice = net.party("alice");
            net.connect(&mut alice).await;

            let outcome = net.send(&alice, vec![message]).await.remove(0);
            prop_assert!(!matches!(outcome, RouteOutcome::Forwarded(n) if n > 0));
            prop_assert_eq!(net.mailbox_len(&Identity::new("ghost")).await, 0);
            Ok(())
        })?;
    }

    #[test]
    fn test_key_sets_stay_disjoint(events in prop::collection::vec(peer_event(3), 1..24)) {
        runtime().block_on(async {
            let net = TestNetwork::new();
            let mut me = net.party("me");
            let session = shared_session();
            let public = session.public_key().clone();
            me.exchange = me.exchange.with_session(session);

            for event in events {
                let peer = event.peer();
                let had_key = me.exchange.connections().has_key(&peer);
                let reaction = me.exchange.apply(event.to_relay_message(&public)).await;
                let sets = me.exchange.connections();

                prop_assert!(sets.is_consistent());
                match event {
                    PeerEvent::Import(_) => {
                        prop_assert!(sets.has_key(&peer));
                        prop_assert!(me.exchange.document_key(&peer).is_some());
                    }
                    PeerEvent::Revoke(_) => {
                        prop_assert!(!sets.has_key(&peer));
                        prop_assert!(me.exchange.document_key(&peer).is_none());
                    }
                    PeerEvent::Notify(_) => {
                        prop_assert_eq!(sets.has_key(&peer), had_key);
                        prop_assert!(sets.has_key(&peer) || sets.lacks_key(&peer));
                    }
                    PeerEvent::Reencrypt(_) => {
                        prop_assert!(sets.lacks_key(&peer));
                        prop_assert!(me.exchange.document_key(&peer).is_none());
                        let re_requested = matches!(
                            reaction.outbound[..],
                            [ClientMessage::RequestKey { ref to, .. }] if *to == peer
                        );
                        prop_assert!(re_requested);
                    }
                }
            }
            Ok(())
        })?;
    }
}
