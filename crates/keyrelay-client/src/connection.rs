//! Connection lifecycle manager.
//!
//! ```text
//! Disconnected ──dial──▶ Authenticating ──"Authorized"──▶ Subscribed
//!      ▲                                                     │
//!      └───────── abnormal close: redial (fixed delay, ──────┘
//!                 bounded attempts) or ConnectionLost
//! ```
//!
//! [`ClientHandle::connect`] dials and authenticates before returning, so a
//! refused or silent relay is reported to the caller directly. After that a
//! single event-loop task owns the [`KeyExchange`] and the link: it applies
//! every inbound message, runs the user actions sent through the handle and
//! writes whatever they produce. A close with code 1000, from either side,
//! ends the loop without reconnecting.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use keyrelay_core::{
    auth_challenge_message, Authenticate, ClientMessage, Identity, RelayMessage, AUTHORIZED,
};
use keyrelay_ledger::LedgerSigner;
use keyrelay_vault::DocumentId;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::event::ClientEvent;
use crate::exchange::{GrantedStatus, KeyExchange};
use crate::state::ConnectionSets;
use crate::transport::{Dialer, Frame, Link, WebSocketDialer};

const EVENT_CAPACITY: usize = 64;

/// Where the link to the relay stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Authenticating,
    Subscribed,
}

/// Answer the link's challenge and wait for `Authorized`.
pub async fn authenticate(
    link: &mut dyn Link,
    user: &Identity,
    signer: &dyn LedgerSigner,
    timeout: Duration,
) -> Result<()> {
    let message = auth_challenge_message(link.challenge());
    let auth = Authenticate {
        user: user.clone(),
        ledger_key: signer.public_key().map_err(ClientError::SigningError)?,
        signature: signer.sign(&message).map_err(ClientError::SigningError)?,
    };
    link.send(auth.encode()?).await?;

    match tokio::time::timeout(timeout, link.recv()).await {
        Err(_) => Err(ClientError::AuthTimeout),
        Ok(Ok(Frame::Text(text))) if text == AUTHORIZED => Ok(()),
        Ok(Ok(Frame::Closed { reason, .. })) => Err(ClientError::AuthRejected(reason)),
        Ok(Ok(other)) => Err(ClientError::AuthRejected(format!(
            "unexpected reply {other:?}"
        ))),
        Ok(Err(e)) => Err(e),
    }
}

/// Dial and authenticate a new link.
async fn establish(
    dialer: &dyn Dialer,
    exchange: &KeyExchange,
    timeout: Duration,
) -> Result<Box<dyn Link>> {
    let mut link = dialer.dial().await?;
    authenticate(
        link.as_mut(),
        exchange.identity(),
        exchange.signer().as_ref(),
        timeout,
    )
    .await?;
    Ok(link)
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    GrantAccess { to: Identity, reply: Reply<()> },
    RevokeAccess { peer: Identity, reply: Reply<()> },
    RequestAccess { to: Identity, context: Option<String>, reply: Reply<()> },
    DenyRequest { from: Identity, reply: Reply<()> },
    Reencrypt { reply: Reply<()> },
    Update { owner: Identity, reply: Reply<usize> },
    CheckGrantedStatus { peer: Identity, reply: Reply<GrantedStatus> },
    SaveAndUpload { owner: Identity, data: Vec<u8>, reply: Reply<DocumentId> },
    OpenDocument { owner: Identity, id: DocumentId, reply: Reply<Vec<u8>> },
    Connections { reply: Reply<ConnectionSets> },
    Introduction { context: Option<String>, reply: Reply<String> },
    Close { reply: Reply<()> },
}

/// The application's side of a running client.
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<LinkState>,
    events: broadcast::Sender<ClientEvent>,
    task: JoinHandle<Result<()>>,
}

impl ClientHandle {
    /// Connect over WebSocket to `config.relay_url`.
    pub async fn connect_websocket(config: ClientConfig, exchange: KeyExchange) -> Result<Self> {
        let dialer = Arc::new(WebSocketDialer::new(config.relay_url.clone()));
        Self::connect(config, exchange, dialer).await
    }

    /// Dial, authenticate, then start the event loop.
    pub async fn connect(
        config: ClientConfig,
        exchange: KeyExchange,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self> {
        let (state_tx, state) = watch::channel(LinkState::Authenticating);
        let link = establish(dialer.as_ref(), &exchange, config.auth_timeout).await?;
        state_tx.send_replace(LinkState::Subscribed);
        info!(user = %exchange.identity(), "subscribed");

        let (commands, command_rx) = mpsc::channel(config.command_capacity);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let event_loop = EventLoop {
            config,
            exchange,
            dialer,
            link,
            commands: command_rx,
            state: state_tx,
            events: events.clone(),
        };
        let task = tokio::spawn(event_loop.run());

        Ok(Self {
            commands,
            state,
            events,
            task,
        })
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    pub async fn grant_access(&self, to: Identity) -> Result<()> {
        self.request(|reply| Command::GrantAccess { to, reply }).await
    }

    pub async fn revoke_access(&self, peer: Identity) -> Result<()> {
        self.request(|reply| Command::RevokeAccess { peer, reply }).await
    }

    pub async fn request_access(&self, to: Identity, context: Option<String>) -> Result<()> {
        self.request(|reply| Command::RequestAccess { to, context, reply })
            .await
    }

    pub async fn deny_request(&self, from: Identity) -> Result<()> {
        self.request(|reply| Command::DenyRequest { from, reply }).await
    }

    pub async fn reencrypt(&self) -> Result<()> {
        self.request(|reply| Command::Reencrypt { reply }).await
    }

    pub async fn update(&self, owner: Identity) -> Result<usize> {
        self.request(|reply| Command::Update { owner, reply }).await
    }

    pub async fn check_granted_status(&self, peer: Identity) -> Result<GrantedStatus> {
        self.request(|reply| Command::CheckGrantedStatus { peer, reply })
            .await
    }

    pub async fn save_and_upload(&self, owner: Identity, data: Vec<u8>) -> Result<DocumentId> {
        self.request(|reply| Command::SaveAndUpload { owner, data, reply })
            .await
    }

    pub async fn open_document(&self, owner: Identity, id: DocumentId) -> Result<Vec<u8>> {
        self.request(|reply| Command::OpenDocument { owner, id, reply })
            .await
    }

    /// A copy of the current connection sets.
    pub async fn connections(&self) -> Result<ConnectionSets> {
        self.request(|reply| Command::Connections { reply }).await
    }

    pub async fn introduction(&self, context: Option<String>) -> Result<String> {
        self.request(|reply| Command::Introduction { context, reply })
            .await
    }

    /// Close the link cleanly and wait for the event loop to finish.
    pub async fn close(self) -> Result<()> {
        let closed = self.request(|reply| Command::Close { reply }).await;
        let finished = self.join().await;
        closed.and(finished)
    }

    /// Wait for the event loop to end on its own: a clean close from the
    /// relay, or `ConnectionLost`.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| ClientError::Transport(format!("event loop failed: {e}")))?
    }
}

struct EventLoop {
    config: ClientConfig,
    exchange: KeyExchange,
    dialer: Arc<dyn Dialer>,
    link: Box<dyn Link>,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<LinkState>,
    events: broadcast::Sender<ClientEvent>,
}

impl EventLoop {
    async fn run(mut self) -> Result<()> {
        let result = self.drive().await;
        self.state.send_replace(LinkState::Disconnected);
        if let Err(ClientError::ConnectionLost { attempts }) = &result {
            let _ = self.events.send(ClientEvent::ConnectionLost {
                attempts: *attempts,
            });
        }
        result
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Close { reply }) => {
                        let _ = reply.send(self.link.close().await);
                        info!(user = %self.exchange.identity(), "closed");
                        return Ok(());
                    }
                    Some(command) => self.execute(command).await,
                    None => {
                        debug!("every handle dropped; closing");
                        return self.link.close().await;
                    }
                },
                frame = self.link.recv() => match frame {
                    Ok(Frame::Binary(bytes)) => self.dispatch(&bytes).await,
                    Ok(Frame::Text(text)) => self.dispatch(text.as_bytes()).await,
                    Ok(frame) if frame.is_normal_close() => {
                        info!("relay closed the connection");
                        return Ok(());
                    }
                    Ok(frame) => {
                        warn!(?frame, "connection closed abnormally");
                        self.reconnect().await?;
                    }
                    Err(e) => {
                        warn!(error = %e, "connection failed");
                        self.reconnect().await?;
                    }
                },
            }
        }
    }

    async fn dispatch(&mut self, bytes: &[u8]) {
        let message = match RelayMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "dropping malformed envelope");
                return;
            }
        };
        debug!(name = message.name().as_str(), "received");

        let reaction = self.exchange.apply(message).await;
        if let Err(e) = self.send_all(reaction.outbound).await {
            warn!(error = %e, "could not send reply");
        }
        for event in reaction.events {
            let _ = self.events.send(event);
        }
    }

    async fn send_all(&mut self, messages: Vec<ClientMessage>) -> Result<()> {
        for message in messages {
            debug!(name = message.name().as_str(), "sending");
            self.link.send(message.encode()?).await?;
        }
        Ok(())
    }

    /// Run one user action. Local state changes stay even when sending the
    /// resulting messages fails.
    async fn execute(&mut self, command: Command) {
        match command {
            Command::GrantAccess { to, reply } => {
                let result = self.exchange.grant_access(&to).await;
                let _ = reply.send(self.finish(result).await);
            }
            Command::RevokeAccess { peer, reply } => {
                let result = self.exchange.revoke_access(&peer).await;
                let _ = reply.send(self.finish(result).await);
            }
            Command::RequestAccess { to, context, reply } => {
                let result = self.exchange.request_access(&to, context);
                let _ = reply.send(self.finish(result).await);
            }
            Command::DenyRequest { from, reply } => {
                let _ = reply.send(self.exchange.deny_request(&from));
            }
            Command::Reencrypt { reply } => {
                let result = self.exchange.reencrypt().await;
                let _ = reply.send(self.finish(result).await);
            }
            Command::Update { owner, reply } => {
                let _ = reply.send(self.exchange.update(&owner).await);
            }
            Command::CheckGrantedStatus { peer, reply } => {
                let _ = reply.send(self.exchange.check_granted_status(&peer).await);
            }
            Command::SaveAndUpload { owner, data, reply } => {
                let result = match self.exchange.save_and_upload(&owner, &data).await {
                    Ok((id, outbound)) => self.send_all(outbound).await.map(|()| id),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::OpenDocument { owner, id, reply } => {
                let _ = reply.send(self.exchange.open_document(&owner, &id));
            }
            Command::Connections { reply } => {
                let _ = reply.send(Ok(self.exchange.connections().clone()));
            }
            Command::Introduction { context, reply } => {
                let _ = reply.send(Ok(self.exchange.introduction(context.as_deref())));
            }
            Command::Close { reply } => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn finish(&mut self, result: Result<Vec<ClientMessage>>) -> Result<()> {
        self.send_all(result?).await
    }

    /// Redial with a fixed delay between attempts. Fails with
    /// `ConnectionLost` once every attempt has failed.
    async fn reconnect(&mut self) -> Result<()> {
        let attempts = self.config.reconnect_attempts;
        for attempt in 1..=attempts {
            self.state.send_replace(LinkState::Disconnected);
            tokio::time::sleep(self.config.reconnect_delay).await;
            self.state.send_replace(LinkState::Authenticating);

            match establish(self.dialer.as_ref(), &self.exchange, self.config.auth_timeout).await {
                Ok(link) => {
                    self.link = link;
                    self.state.send_replace(LinkState::Subscribed);
                    info!(attempt, "reconnected");
                    return Ok(());
                }
                Err(e) => warn!(attempt, error = %e, "reconnect failed"),
            }
        }
        Err(ClientError::ConnectionLost { attempts })
    }
}
