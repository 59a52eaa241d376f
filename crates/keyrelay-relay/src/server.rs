//! WebSocket server.
//!
//! One supervised task per connection. Each task authenticates, registers
//! with the hub, then reads frames and hands them to the [`Relay`] until the
//! peer closes, the socket fails or the server shuts down. Whatever the exit
//! path, the connection is unregistered before the task ends.
//!
//! Writes after authentication go through a per-connection writer task fed
//! by a bounded queue; the task ends once the hub closes the sink.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keyrelay_core::{Authenticate, Identity, AUTHORIZED};
use keyrelay_ledger::Ledger;

use crate::auth::{self, CHALLENGE_HEADER, REASON_NO_AUTH, REASON_UNAUTHORIZED};
use crate::config::RelayConfig;
use crate::directory::NameDirectory;
use crate::error::{RelayError, Result};
use crate::hub::Hub;
use crate::protocol::Relay;
use crate::sink::{self, PeerSink, QueuedSink};

type WsStream = WebSocketStream<TcpStream>;

/// A bound, not yet running, relay server.
pub struct RelayServer {
    listener: TcpListener,
    relay: Arc<Relay>,
    ledger: Arc<dyn Ledger>,
    auth_timeout: Duration,
    send_queue: usize,
    cancel: CancellationToken,
    hub_task: JoinHandle<()>,
}

#[derive(Clone)]
struct ConnectionContext {
    relay: Arc<Relay>,
    ledger: Arc<dyn Ledger>,
    auth_timeout: Duration,
    send_queue: usize,
    cancel: CancellationToken,
}

impl RelayServer {
    /// Bind the listener and start the hub.
    pub async fn bind(
        config: RelayConfig,
        ledger: Arc<dyn Ledger>,
        directory: Arc<NameDirectory>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let cancel = CancellationToken::new();
        let (hub, hub_task) = Hub::spawn(config.hub_capacity, cancel.child_token());
        let relay = Arc::new(Relay::new(hub, Arc::clone(&ledger), directory));

        Ok(Self {
            listener,
            relay,
            ledger,
            auth_timeout: config.auth_timeout,
            send_queue: config.send_queue,
            cancel,
            hub_task,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The relay, for callers outside the socket protocol (e.g. an upload
    /// handler calling [`Relay::announce_upload`]).
    pub fn relay(&self) -> Arc<Relay> {
        Arc::clone(&self.relay)
    }

    /// Cancelling this token stops the server.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accept connections until shut down, then wait for every connection
    /// task and the hub to finish.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.listener.local_addr()?, "relay listening");
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let ctx = ConnectionContext {
                            relay: Arc::clone(&self.relay),
                            ledger: Arc::clone(&self.ledger),
                            auth_timeout: self.auth_timeout,
                            send_queue: self.send_queue,
                            cancel: self.cancel.child_token(),
                        };
                        tasks.spawn(serve_connection(stream, addr, ctx));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "connection task panicked");
                    }
                }
            }
        }

        info!(open = tasks.len(), "relay shutting down");
        while tasks.join_next().await.is_some() {}
        let _ = self.hub_task.await;
        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, addr: SocketAddr, ctx: ConnectionContext) {
    match serve(stream, &ctx).await {
        Ok(()) => debug!(%addr, "connection closed"),
        Err(e) => debug!(%addr, error = %e, "connection ended"),
    }
}

async fn serve(stream: TcpStream, ctx: &ConnectionContext) -> Result<()> {
    let challenge = auth::new_challenge();
    let header = challenge.clone();
    let ws = accept_hdr_async(
        stream,
        move |_request: &Request, mut response: Response| -> std::result::Result<Response, ErrorResponse> {
            if let Ok(value) = HeaderValue::from_str(&header) {
                response.headers_mut().insert(CHALLENGE_HEADER, value);
            }
            Ok(response)
        },
    )
    .await?;
    let (mut write, mut read) = ws.split();

    let identity = match authenticate(&mut read, &challenge, ctx).await {
        Ok(identity) => identity,
        Err(reason) => {
            close_with_policy(&mut write, reason).await;
            return Err(RelayError::AuthFailed(reason));
        }
    };
    write.send(Message::Text(AUTHORIZED.to_string())).await?;

    let hub = ctx.relay.hub();
    let (queued, queue) = QueuedSink::new(ctx.send_queue);
    let writer = tokio::spawn(sink::write_websocket(write, queue));
    let sink: Arc<dyn PeerSink> = queued;
    let conn = hub.new_connection(sink);
    let conn_id = conn.id;
    if let Err(e) = hub.register(identity.clone(), conn).await {
        writer.abort();
        return Err(e);
    }

    let result = read_loop(&mut read, &identity, ctx).await;

    if let Err(e) = hub.unregister(identity.clone(), conn_id).await {
        debug!(%identity, error = %e, "unregister after disconnect failed");
    }
    if let Err(e) = writer.await {
        warn!(%identity, error = %e, "writer task failed");
    }
    result
}

/// Wait for the `Authenticate` frame and check it. The error is the close
/// reason to send.
async fn authenticate(
    read: &mut SplitStream<WsStream>,
    challenge: &str,
    ctx: &ConnectionContext,
) -> std::result::Result<Identity, &'static str> {
    let frame = match tokio::time::timeout(ctx.auth_timeout, next_data_frame(read)).await {
        Ok(Some(frame)) => frame,
        Ok(None) | Err(_) => return Err(REASON_NO_AUTH),
    };
    let auth = Authenticate::decode(&frame).map_err(|_| REASON_UNAUTHORIZED)?;

    match auth::verify(ctx.ledger.as_ref(), challenge, &auth).await {
        Ok(true) => {
            debug!(user = %auth.user, "authenticated");
            Ok(auth.user)
        }
        Ok(false) => {
            warn!(user = %auth.user, "authentication rejected");
            Err(REASON_UNAUTHORIZED)
        }
        Err(e) => {
            warn!(user = %auth.user, error = %e, "ledger check failed during authentication");
            Err(REASON_UNAUTHORIZED)
        }
    }
}

async fn next_data_frame(read: &mut SplitStream<WsStream>) -> Option<Vec<u8>> {
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Binary(bytes)) => return Some(bytes),
            Ok(Message::Text(text)) => return Some(text.into_bytes()),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return None,
        }
    }
    None
}

async fn read_loop(
    read: &mut SplitStream<WsStream>,
    identity: &Identity,
    ctx: &ConnectionContext,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(()),
            frame = read.next() => frame,
        };
        let bytes = match frame {
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };

        match ctx.relay.handle_frame(identity, &bytes).await {
            Ok(outcome) => debug!(%identity, ?outcome, "routed"),
            Err(RelayError::Core(e)) => warn!(%identity, error = %e, "dropping malformed envelope"),
            Err(e) => warn!(%identity, error = %e, "routing failed"),
        }
    }
}

async fn close_with_policy(write: &mut SplitSink<WsStream, Message>, reason: &'static str) {
    let frame = CloseFrame {
        code: CloseCode::Policy,
        reason: reason.into(),
    };
    let _ = write.send(Message::Close(Some(frame))).await;
    let _ = write.close().await;
}
