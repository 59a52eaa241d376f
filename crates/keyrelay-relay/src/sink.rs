//! The write half of a peer connection, as seen by the hub.
//!
//! The hub never reads from a connection and never waits on one: it hands
//! frames to a per-connection queue and moves on. A writer task drains that
//! queue into the socket, so a peer that stops reading only fills its own
//! queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::error::{RelayError, Result};

/// How long a writer waits for the peer to take the close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why the relay is closing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Replaced by a newer connection or unregistered. Clients stop.
    Normal,
    /// The relay is going down. Clients reconnect.
    GoingAway,
}

impl CloseKind {
    pub fn code(self) -> CloseCode {
        match self {
            CloseKind::Normal => CloseCode::Normal,
            CloseKind::GoingAway => CloseCode::Away,
        }
    }
}

/// Writable side of a live connection. Neither method blocks.
pub trait PeerSink: Send + Sync {
    /// Queue one binary frame. Fails if the connection is closed or its
    /// queue is full.
    fn try_send(&self, bytes: Bytes) -> Result<()>;

    /// Ask for the connection to be closed. Later calls are ignored.
    fn close(&self, kind: CloseKind);
}

/// Sink backed by a bounded queue. The other end is a [`SinkQueue`].
pub struct QueuedSink {
    frames: mpsc::Sender<Bytes>,
    close: Mutex<Option<oneshot::Sender<CloseKind>>>,
    closed: AtomicBool,
}

/// What a writer task drains.
pub struct SinkQueue {
    pub frames: mpsc::Receiver<Bytes>,
    pub close: oneshot::Receiver<CloseKind>,
}

impl QueuedSink {
    pub fn new(capacity: usize) -> (Arc<Self>, SinkQueue) {
        let (frames_tx, frames) = mpsc::channel(capacity.max(1));
        let (close_tx, close) = oneshot::channel();
        let sink = Arc::new(Self {
            frames: frames_tx,
            close: Mutex::new(Some(close_tx)),
            closed: AtomicBool::new(false),
        });
        (sink, SinkQueue { frames, close })
    }
}

impl PeerSink for QueuedSink {
    fn try_send(&self, bytes: Bytes) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Transport("connection closed".into()));
        }
        self.frames.try_send(bytes).map_err(|e| match e {
            TrySendError::Full(_) => RelayError::Transport("send queue full".into()),
            TrySendError::Closed(_) => RelayError::Transport("writer stopped".into()),
        })
    }

    fn close(&self, kind: CloseKind) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut slot) = self.close.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(kind);
            }
        }
    }
}

/// Drain `queue` into a WebSocket until the sink is closed or dropped, then
/// send the close frame.
///
/// A close request interrupts a write that the peer is not taking.
pub async fn write_websocket<S>(mut write: SplitSink<WebSocketStream<S>, Message>, queue: SinkQueue)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let SinkQueue { mut frames, mut close } = queue;
    let kind = loop {
        tokio::select! {
            biased;
            kind = &mut close => break kind.unwrap_or(CloseKind::GoingAway),
            frame = frames.recv() => {
                let Some(bytes) = frame else {
                    break CloseKind::GoingAway;
                };
                tokio::select! {
                    kind = &mut close => break kind.unwrap_or(CloseKind::GoingAway),
                    sent = write.send(Message::Binary(bytes.to_vec())) => {
                        if let Err(e) = sent {
                            debug!(error = %e, "write failed; stopping writer");
                            return;
                        }
                    }
                }
            }
        }
    };

    let frame = CloseFrame {
        code: kind.code(),
        reason: "".into(),
    };
    let closing = async {
        write.send(Message::Close(Some(frame))).await?;
        write.close().await
    };
    match tokio::time::timeout(CLOSE_TIMEOUT, closing).await {
        Ok(Ok(())) => debug!(?kind, "closed"),
        Ok(Err(e)) => debug!(?kind, error = %e, "close failed"),
        Err(_) => debug!(?kind, "peer did not take the close frame"),
    }
}

/// In-memory sinks for tests and embedding.
pub mod memory {
    use super::*;
    use std::sync::atomic::AtomicU8;

    const OPEN: u8 = 0;
    const CLOSED_NORMAL: u8 = 1;
    const CLOSED_AWAY: u8 = 2;

    /// Sink that forwards every frame into an unbounded channel.
    ///
    /// Can be switched into a failing mode to exercise write errors.
    pub struct ChannelSink {
        tx: mpsc::UnboundedSender<Bytes>,
        failing: AtomicBool,
        closed: AtomicU8,
    }

    impl ChannelSink {
        /// Create a sink and the receiver its frames arrive on.
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let sink = Arc::new(Self {
                tx,
                failing: AtomicBool::new(false),
                closed: AtomicU8::new(OPEN),
            });
            (sink, rx)
        }

        /// Make every subsequent write fail (or succeed again).
        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn is_closed(&self) -> bool {
            self.close_kind().is_some()
        }

        /// How the sink was closed, if it was.
        pub fn close_kind(&self) -> Option<CloseKind> {
            match self.closed.load(Ordering::SeqCst) {
                CLOSED_NORMAL => Some(CloseKind::Normal),
                CLOSED_AWAY => Some(CloseKind::GoingAway),
                _ => None,
            }
        }
    }

    impl PeerSink for ChannelSink {
        fn try_send(&self, bytes: Bytes) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) || self.is_closed() {
                return Err(RelayError::Transport("sink unavailable".into()));
            }
            self.tx
                .send(bytes)
                .map_err(|_| RelayError::Transport("receiver dropped".into()))
        }

        fn close(&self, kind: CloseKind) {
            let code = match kind {
                CloseKind::Normal => CLOSED_NORMAL,
                CloseKind::GoingAway => CLOSED_AWAY,
            };
            let _ = self
                .closed
                .compare_exchange(OPEN, code, Ordering::SeqCst, Ordering::SeqCst);
        }
    }
}
