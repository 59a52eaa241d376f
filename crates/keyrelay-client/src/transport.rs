//! Links to the relay.
//!
//! A [`Link`] is one authenticated-or-not duplex connection; a [`Dialer`]
//! opens new ones (the lifecycle manager redials after an abnormal close).
//! [`WebSocketDialer`] is the production implementation; [`memory`] holds a
//! channel-backed pair for tests.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use keyrelay_core::CHALLENGE_HEADER;

use crate::error::{ClientError, Result};

/// Close code of an intentional disconnect.
pub const NORMAL_CLOSURE: u16 = 1000;

/// One inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
    /// The peer closed the link. `code` is absent when the stream simply
    /// ended.
    Closed { code: Option<u16>, reason: String },
}

impl Frame {
    /// Whether this is a clean close that must not trigger a reconnect.
    pub fn is_normal_close(&self) -> bool {
        matches!(self, Frame::Closed { code: Some(NORMAL_CLOSURE), .. })
    }
}

#[async_trait]
pub trait Link: Send {
    /// The challenge the relay issued for this connection.
    fn challenge(&self) -> &str;

    async fn send(&mut self, bytes: Vec<u8>) -> Result<()>;

    /// Next data or close frame. Cancel-safe.
    async fn recv(&mut self) -> Result<Frame>;

    /// Close cleanly with code 1000.
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<Box<dyn Link>>;
}

// ─────────────────────────────────────────────────────────────────────────
// WebSocket
// ─────────────────────────────────────────────────────────────────────────

pub struct WebSocketDialer {
    url: String,
}

impl WebSocketDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self) -> Result<Box<dyn Link>> {
        let (stream, response) = connect_async(self.url.as_str()).await?;
        let challenge = response
            .headers()
            .get(CHALLENGE_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ClientError::AuthRejected("relay sent no challenge".into()))?;
        debug!(url = %self.url, "connected");
        Ok(Box::new(WebSocketLink { stream, challenge }))
    }
}

pub struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    challenge: String,
}

#[async_trait]
impl Link for WebSocketLink {
    fn challenge(&self) -> &str {
        &self.challenge
    }

    async fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.stream.send(Message::Binary(bytes)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Frame> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(bytes))) => return Ok(Frame::Binary(bytes)),
                Some(Ok(Message::Text(text))) => return Ok(Frame::Text(text)),
                Some(Ok(Message::Close(frame))) => {
                    return Ok(match frame {
                        Some(frame) => Frame::Closed {
                            code: Some(u16::from(frame.code)),
                            reason: frame.reason.into_owned(),
                        },
                        None => Frame::Closed {
                            code: None,
                            reason: String::new(),
                        },
                    })
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Ok(Frame::Closed {
                        code: None,
                        reason: String::new(),
                    })
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        self.stream.close(Some(frame)).await?;
        Ok(())
    }
}

/// Channel-backed links for tests.
pub mod memory {
    use super::*;
    use std::collections::VecDeque;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    /// Client end of an in-memory link.
    pub struct MemoryLink {
        challenge: String,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        inbound: mpsc::UnboundedReceiver<Frame>,
        closed: bool,
    }

    /// Relay end of an in-memory link: sees what the client sent, feeds it
    /// frames.
    pub struct LinkPeer {
        pub sent: mpsc::UnboundedReceiver<Vec<u8>>,
        frames: mpsc::UnboundedSender<Frame>,
    }

    impl LinkPeer {
        /// Queue a frame for the client. Returns false once the client end
        /// is gone.
        pub fn push(&self, frame: Frame) -> bool {
            self.frames.send(frame).is_ok()
        }
    }

    impl MemoryLink {
        pub fn pair(challenge: impl Into<String>) -> (Self, LinkPeer) {
            let (outbound, sent) = mpsc::unbounded_channel();
            let (frames, inbound) = mpsc::unbounded_channel();
            (
                Self {
                    challenge: challenge.into(),
                    outbound,
                    inbound,
                    closed: false,
                },
                LinkPeer { sent, frames },
            )
        }
    }

    #[async_trait]
    impl Link for MemoryLink {
        fn challenge(&self) -> &str {
            &self.challenge
        }

        async fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
            if self.closed {
                return Err(ClientError::Transport("link closed".into()));
            }
            self.outbound
                .send(bytes)
                .map_err(|_| ClientError::Transport("peer gone".into()))
        }

        async fn recv(&mut self) -> Result<Frame> {
            match self.inbound.recv().await {
                Some(frame) => Ok(frame),
                None => Err(ClientError::Transport("peer gone".into())),
            }
        }

        async fn close(&mut self) -> Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    /// Hands out prepared links in order; fails once they run out.
    #[derive(Default)]
    pub struct QueueDialer {
        links: Mutex<VecDeque<MemoryLink>>,
    }

    impl QueueDialer {
        pub fn new() -> Self {
            Self::default()
        }

        /// Prepare the next link and return its relay end.
        pub fn prepare(&self, challenge: &str) -> LinkPeer {
            let (link, peer) = MemoryLink::pair(challenge);
            self.links.lock().push_back(link);
            peer
        }

        pub fn remaining(&self) -> usize {
            self.links.lock().len()
        }
    }

    #[async_trait]
    impl Dialer for QueueDialer {
        async fn dial(&self) -> Result<Box<dyn Link>> {
            let link = self.links.lock().pop_front();
            match link {
                Some(link) => Ok(Box::new(link)),
                None => Err(ClientError::Transport("connection refused".into())),
            }
        }
    }
}
