//! Multi-party fixtures.
//!
//! [`TestNetwork`] wires a real [`Relay`] and [`Hub`] to a [`MemoryLedger`],
//! with each [`Party`] connected through a [`ChannelSink`]. Nothing runs on
//! its own: tests move messages with [`TestNetwork::send`] and
//! [`TestNetwork::pump`], which keeps every interleaving deterministic.
//!
//! [`RunningRelay`] is the other extreme: the full server on a localhost
//! socket, for tests that go through WebSocket clients.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use keyrelay_client::{ClientConfig, ClientEvent, KeyExchange, MemoryTransfer, Services};
use keyrelay_core::{ClientMessage, Identity, Keypair, RelayMessage};
use keyrelay_ledger::MemoryLedger;
use keyrelay_relay::{
    ChannelSink, ConnectionId, Hub, NameDirectory, Relay, RelayConfig, RelayServer, RouteOutcome,
};
use keyrelay_vault::{DocumentVault, SessionKeyPair, MIN_RSA_BITS};

/// Rounds [`TestNetwork::settle`] allows before declaring a livelock.
const MAX_SETTLE_ROUNDS: usize = 64;

/// One RSA session keypair shared by every caller in the process.
///
/// Key generation dominates test time; use this where distinct session
/// keys do not matter.
pub fn shared_session() -> SessionKeyPair {
    static SESSION: OnceLock<SessionKeyPair> = OnceLock::new();
    SESSION
        .get_or_init(|| SessionKeyPair::generate(MIN_RSA_BITS).expect("RSA key generation"))
        .clone()
}

/// "alice" -> "Alice".
fn display_name_for(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Register `name` on `ledger` and `directory` and build its state machine.
fn make_party(
    ledger: &Arc<MemoryLedger>,
    directory: &NameDirectory,
    transfer: &Arc<MemoryTransfer>,
    name: &str,
) -> (KeyExchange, Arc<Keypair>) {
    let identity = Identity::new(name);
    let keypair = Arc::new(Keypair::generate());
    let display_name = display_name_for(name);

    ledger.register_account(identity.clone(), keypair.public_key());
    directory.set(identity.clone(), display_name.clone());

    let services = Services {
        ledger: ledger.clone(),
        signer: keypair.clone(),
        vault: Arc::new(DocumentVault::new()),
        transfer: transfer.clone(),
    };
    (
        KeyExchange::new(identity, display_name, services, MIN_RSA_BITS),
        keypair,
    )
}

// ============================================================
// In-memory network
// ============================================================

/// A participant: its state machine plus its end of the hub.
pub struct Party {
    pub exchange: KeyExchange,
    pub keypair: Arc<Keypair>,
    /// Every event `pump` produced, oldest first.
    pub events: Vec<ClientEvent>,
    link: Option<PartyLink>,
}

struct PartyLink {
    id: ConnectionId,
    inbox: mpsc::UnboundedReceiver<Bytes>,
}

impl Party {
    pub fn id(&self) -> &Identity {
        self.exchange.identity()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// Drain the events collected so far.
    pub fn take_events(&mut self) -> Vec<ClientEvent> {
        std::mem::take(&mut self.events)
    }
}

/// Relay, hub, ledger and document store, all in memory.
pub struct TestNetwork {
    pub ledger: Arc<MemoryLedger>,
    pub directory: Arc<NameDirectory>,
    pub transfer: Arc<MemoryTransfer>,
    relay: Relay,
    cancel: CancellationToken,
}

impl TestNetwork {
    /// Start the hub. Must be called inside a Tokio runtime.
    pub fn new() -> Self {
        let cancel = CancellationToken::new();
        let (hub, _task) = Hub::spawn(64, cancel.child_token());
        let ledger = Arc::new(MemoryLedger::new());
        let directory = Arc::new(NameDirectory::new());
        let relay = Relay::new(hub, ledger.clone(), Arc::clone(&directory));

        Self {
            ledger,
            directory,
            transfer: Arc::new(MemoryTransfer::new()),
            relay,
            cancel,
        }
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub fn hub(&self) -> &Hub {
        self.relay.hub()
    }

    /// Register an account called `name` and build its client. The party
    /// starts disconnected.
    pub fn party(&self, name: &str) -> Party {
        let (exchange, keypair) = make_party(&self.ledger, &self.directory, &self.transfer, name);
        Party {
            exchange,
            keypair,
            events: Vec::new(),
            link: None,
        }
    }

    /// Attach `party` to the hub, flushing its mailbox into its inbox.
    pub async fn connect(&self, party: &mut Party) {
        let (sink, inbox) = ChannelSink::new();
        let conn = self.hub().new_connection(sink);
        let id = conn.id;
        self.hub()
            .register(party.id().clone(), conn)
            .await
            .expect("hub running");
        party.link = Some(PartyLink { id, inbox });
    }

    /// Detach `party`. Anything still in its inbox is lost.
    pub async fn disconnect(&self, party: &mut Party) {
        if let Some(link) = party.link.take() {
            self.hub()
                .unregister(party.id().clone(), link.id)
                .await
                .expect("hub running");
        }
    }

    /// Route `messages` from `from` through the relay, as encoded frames.
    pub async fn send(&self, from: &Party, messages: Vec<ClientMessage>) -> Vec<RouteOutcome> {
        let mut outcomes = Vec::with_capacity(messages.len());
        for message in messages {
            let bytes = message.encode().expect("encodable message");
            let outcome = self
                .relay
                .handle_frame(from.id(), &bytes)
                .await
                .expect("relay accepts well-formed frames");
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Take every frame waiting in `party`'s inbox without applying it.
    pub fn inbound(&self, party: &mut Party) -> Vec<RelayMessage> {
        let Some(link) = party.link.as_mut() else {
            return Vec::new();
        };
        let mut messages = Vec::new();
        while let Ok(bytes) = link.inbox.try_recv() {
            messages.push(RelayMessage::decode(&bytes).expect("relay sends decodable frames"));
        }
        messages
    }

    /// Apply everything in `party`'s inbox and send what it answers.
    /// Returns how many messages were applied.
    pub async fn pump(&self, party: &mut Party) -> usize {
        let messages = self.inbound(party);
        let applied = messages.len();
        for message in messages {
            let reaction = party.exchange.apply(message).await;
            party.events.extend(reaction.events);
            self.send(party, reaction.outbound).await;
        }
        if applied > 0 {
            debug!(party = %party.id(), applied, "pumped");
        }
        applied
    }

    /// Pump every party until a full round moves nothing.
    pub async fn settle(&self, parties: &mut [&mut Party]) {
        for _ in 0..MAX_SETTLE_ROUNDS {
            let mut moved = 0;
            for party in parties.iter_mut() {
                moved += self.pump(party).await;
            }
            if moved == 0 {
                return;
            }
        }
        panic!("network did not settle after {MAX_SETTLE_ROUNDS} rounds");
    }

    pub async fn mailbox_len(&self, identity: &Identity) -> usize {
        self.hub()
            .mailbox_len(identity.clone())
            .await
            .expect("hub running")
    }
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestNetwork {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ============================================================
// Live relay
// ============================================================

/// The relay server listening on an ephemeral localhost port.
pub struct RunningRelay {
    pub addr: SocketAddr,
    pub ledger: Arc<MemoryLedger>,
    pub directory: Arc<NameDirectory>,
    pub transfer: Arc<MemoryTransfer>,
    shutdown: CancellationToken,
    task: JoinHandle<keyrelay_relay::Result<()>>,
}

impl RunningRelay {
    /// Bind 127.0.0.1:0 and start serving.
    pub async fn start(auth_timeout: Duration) -> Self {
        let config = RelayConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            auth_timeout,
            ..RelayConfig::default()
        };
        let ledger = Arc::new(MemoryLedger::new());
        let directory = Arc::new(NameDirectory::new());
        let server = RelayServer::bind(config, ledger.clone(), Arc::clone(&directory))
            .await
            .expect("bind localhost");
        let addr = server.local_addr().expect("bound address");
        let shutdown = server.shutdown_token();
        let task = tokio::spawn(server.run());

        Self {
            addr,
            ledger,
            directory,
            transfer: Arc::new(MemoryTransfer::new()),
            shutdown,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Client configuration pointing at this relay.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            relay_url: self.url(),
            auth_timeout: Duration::from_secs(2),
            reconnect_delay: Duration::from_millis(50),
            reconnect_attempts: 2,
            ..ClientConfig::default()
        }
    }

    /// Register an account called `name` and build its client.
    pub fn party(&self, name: &str) -> (KeyExchange, Arc<Keypair>) {
        make_party(&self.ledger, &self.directory, &self.transfer, name)
    }

    /// Stop accepting, close every connection and wait for the server.
    pub async fn stop(self) {
        self.shutdown.cancel();
        self.task
            .await
            .expect("server task")
            .expect("server shut down cleanly");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_for() {
        assert_eq!(display_name_for("alice"), "Alice");
        assert_eq!(display_name_for(""), "");
    }

    #[tokio::test]
    async fn test_party_is_registered() {
        let net = TestNetwork::new();
        let alice = net.party("alice");

        assert_eq!(net.ledger.account_count(), 1);
        assert_eq!(net.directory.display_name(alice.id()), "Alice");
        assert!(!alice.is_connected());
    }

    #[tokio::test]
    async fn test_offline_party_collects_mail() {
        let net = TestNetwork::new();
        let mut alice = net.party("alice");
        let mut bob = net.party("bob");
        net.connect(&mut alice).await;

        let notify = ClientMessage::NotifyGranted {
            to: bob.id().clone(),
        };
        let outcomes = net.send(&alice, vec![notify]).await;
        assert_eq!(outcomes, vec![RouteOutcome::Forwarded(1)]);
        assert_eq!(net.mailbox_len(bob.id()).await, 1);

        net.connect(&mut bob).await;
        assert_eq!(net.mailbox_len(bob.id()).await, 0);
        assert_eq!(net.pump(&mut bob).await, 1);
        assert_eq!(
            bob.take_events(),
            vec![ClientEvent::AccessGranted {
                from: alice.id().clone()
            }]
        );
    }
}
