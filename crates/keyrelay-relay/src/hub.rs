//! The connection hub.
//!
//! One task owns the identity → connection table and the offline mailbox.
//! Everything else talks to it through [`Hub`], a cheap cloneable handle that
//! sends commands over a channel and awaits the reply. Commands are handled
//! strictly one at a time, so register, unregister and deliver are
//! linearizable with respect to the mailbox flush that happens on register.
//!
//! The actor never awaits a socket. Writes go to the connection's
//! [`PeerSink`], which queues them for its own writer task; a full queue
//! counts as a failed write.
//!
//! ## Delivery
//!
//! ```text
//! deliver(bob, bytes)
//!   bob connected?  ── yes ──▶ queue now (error: logged, NOT mailed)
//!        │
//!        no ──▶ mailbox[bob].push_back(bytes)
//!
//! register(bob, conn)
//!   for bytes in mailbox[bob] (FIFO):
//!       queued ok  ──▶ pop
//!       queue err  ──▶ stop, keep the rest for next time
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use keyrelay_core::Identity;

use crate::error::{RelayError, Result};
use crate::sink::{CloseKind, PeerSink};

/// Distinguishes successive connections of the same identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A live connection as stored in the hub.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub sink: Arc<dyn PeerSink>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// What happened to a delivered envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the recipient's live connection.
    Live,
    /// Recipient offline; appended to its mailbox.
    Queued,
    /// Recipient online but its queue was full or closed. The envelope is
    /// gone.
    Failed,
}

enum HubCommand {
    Register {
        identity: Identity,
        conn: ConnectionHandle,
        done: oneshot::Sender<()>,
    },
    Unregister {
        identity: Identity,
        id: ConnectionId,
        done: oneshot::Sender<bool>,
    },
    IsConnected {
        identity: Identity,
        reply: oneshot::Sender<bool>,
    },
    GetConnection {
        identity: Identity,
        reply: oneshot::Sender<Option<ConnectionHandle>>,
    },
    Deliver {
        identity: Identity,
        bytes: Bytes,
        reply: oneshot::Sender<Delivery>,
    },
    MailboxLen {
        identity: Identity,
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to the hub task.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::Sender<HubCommand>,
    next_id: Arc<AtomicU64>,
}

impl Hub {
    /// Spawn the hub task. It stops when `cancel` fires or every handle is
    /// dropped, closing all live connections as going away.
    pub fn spawn(capacity: usize, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let actor = HubActor {
            rx,
            connections: HashMap::new(),
            mailbox: HashMap::new(),
        };
        let task = tokio::spawn(actor.run(cancel));
        let hub = Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (hub, task)
    }

    /// Wrap a sink as a connection with a fresh id.
    pub fn new_connection(&self, sink: Arc<dyn PeerSink>) -> ConnectionHandle {
        ConnectionHandle {
            id: ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            sink,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> HubCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| RelayError::HubClosed)?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }

    /// Insert or replace the connection for `identity`, then flush its
    /// mailbox over it. Returns once the flush is done.
    pub async fn register(&self, identity: Identity, conn: ConnectionHandle) -> Result<()> {
        self.request(|done| HubCommand::Register {
            identity,
            conn,
            done,
        })
        .await
    }

    /// Remove the connection for `identity` if it is still `id`, and close it
    /// normally.
    ///
    /// Returns whether anything was removed. A stale unregister from an
    /// older connection is a no-op.
    pub async fn unregister(&self, identity: Identity, id: ConnectionId) -> Result<bool> {
        self.request(|done| HubCommand::Unregister { identity, id, done })
            .await
    }

    pub async fn is_connected(&self, identity: Identity) -> Result<bool> {
        self.request(|reply| HubCommand::IsConnected { identity, reply })
            .await
    }

    /// The live connection for `identity`, or [`RelayError::NotConnected`].
    pub async fn get_connection(&self, identity: Identity) -> Result<ConnectionHandle> {
        let name = identity.to_string();
        self.request(|reply| HubCommand::GetConnection { identity, reply })
            .await?
            .ok_or(RelayError::NotConnected(name))
    }

    /// Write now if connected, otherwise mail it. Fire and forget.
    pub async fn deliver(&self, identity: Identity, bytes: Bytes) -> Result<Delivery> {
        self.request(|reply| HubCommand::Deliver {
            identity,
            bytes,
            reply,
        })
        .await
    }

    /// Number of envelopes waiting for `identity`.
    pub async fn mailbox_len(&self, identity: Identity) -> Result<usize> {
        self.request(|reply| HubCommand::MailboxLen { identity, reply })
            .await
    }
}

struct HubActor {
    rx: mpsc::Receiver<HubCommand>,
    connections: HashMap<Identity, ConnectionHandle>,
    mailbox: HashMap<Identity, VecDeque<Bytes>>,
}

impl HubActor {
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            let command = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };
            self.handle(command);
        }

        for (identity, conn) in self.connections.drain() {
            debug!(%identity, id = %conn.id, "closing on hub shutdown");
            conn.sink.close(CloseKind::GoingAway);
        }
        info!("hub stopped");
    }

    fn handle(&mut self, command: HubCommand) {
        // Reply errors mean the caller gave up waiting; nothing to do.
        match command {
            HubCommand::Register {
                identity,
                conn,
                done,
            } => {
                self.register(identity, conn);
                let _ = done.send(());
            }
            HubCommand::Unregister { identity, id, done } => {
                let removed = self.unregister(&identity, id);
                let _ = done.send(removed);
            }
            HubCommand::IsConnected { identity, reply } => {
                let _ = reply.send(self.connections.contains_key(&identity));
            }
            HubCommand::GetConnection { identity, reply } => {
                let _ = reply.send(self.connections.get(&identity).cloned());
            }
            HubCommand::Deliver {
                identity,
                bytes,
                reply,
            } => {
                let outcome = self.deliver(identity, bytes);
                let _ = reply.send(outcome);
            }
            HubCommand::MailboxLen { identity, reply } => {
                let _ = reply.send(self.mailbox.get(&identity).map_or(0, VecDeque::len));
            }
        }
    }

    fn register(&mut self, identity: Identity, conn: ConnectionHandle) {
        let sink = Arc::clone(&conn.sink);
        if let Some(previous) = self.connections.insert(identity.clone(), conn.clone()) {
            if previous.id != conn.id {
                debug!(%identity, old = %previous.id, new = %conn.id, "replacing connection");
                previous.sink.close(CloseKind::Normal);
            }
        }
        info!(%identity, id = %conn.id, "registered");

        let Some(queue) = self.mailbox.get_mut(&identity) else {
            return;
        };
        let mut flushed = 0usize;
        while let Some(bytes) = queue.front() {
            match sink.try_send(bytes.clone()) {
                Ok(()) => {
                    queue.pop_front();
                    flushed += 1;
                }
                Err(e) => {
                    warn!(%identity, error = %e, remaining = queue.len(), "mailbox flush interrupted");
                    break;
                }
            }
        }
        if queue.is_empty() {
            self.mailbox.remove(&identity);
        }
        if flushed > 0 {
            debug!(%identity, flushed, "flushed mailbox");
        }
    }

    fn unregister(&mut self, identity: &Identity, id: ConnectionId) -> bool {
        match self.connections.get(identity) {
            Some(current) if current.id == id => {}
            _ => {
                debug!(%identity, %id, "ignoring stale unregister");
                return false;
            }
        }
        if let Some(conn) = self.connections.remove(identity) {
            conn.sink.close(CloseKind::Normal);
        }
        info!(%identity, %id, "unregistered");
        true
    }

    fn deliver(&mut self, identity: Identity, bytes: Bytes) -> Delivery {
        match self.connections.get(&identity) {
            Some(conn) => match conn.sink.try_send(bytes) {
                Ok(()) => Delivery::Live,
                Err(e) => {
                    warn!(%identity, id = %conn.id, error = %e, "live delivery failed");
                    Delivery::Failed
                }
            },
            None => {
                debug!(%identity, "recipient offline, mailing");
                self.mailbox.entry(identity).or_default().push_back(bytes);
                Delivery::Queued
            }
        }
    }
}
