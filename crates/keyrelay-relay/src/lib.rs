//! # keyrelay Relay
//!
//! The always-on server side: a connection hub with offline mailboxes, the
//! routing rules for every client message, and a WebSocket front end.
//!
//! ## Overview
//!
//! ```text
//! client ──ws──▶ server (one task per connection)
//!                  │ authenticate (challenge header + Authenticate frame)
//!                  │ register with Hub, flush mailbox
//!                  ▼
//!               Relay::handle ──▶ Hub::deliver ──▶ live write | mailbox
//!                  │
//!                  └─ Ledger (account exists? key registered? who is granted?)
//! ```
//!
//! ## Key Types
//!
//! - [`Hub`] - Actor owning the connection table and mailboxes
//! - [`Relay`] - Routing of typed client messages
//! - [`RelayServer`] - WebSocket accept loop with supervised connection tasks
//! - [`NameDirectory`] - Display names for outbound `displayName` fields
//! - [`PeerSink`] - The non-blocking write half of a connection, as the hub sees it

pub mod auth;
pub mod config;
pub mod directory;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod sink;

pub use config::RelayConfig;
pub use directory::NameDirectory;
pub use error::{RelayError, Result};
pub use hub::{ConnectionHandle, ConnectionId, Delivery, Hub};
pub use protocol::{Relay, RouteOutcome, REQUEST_REJECTED};
pub use server::RelayServer;
pub use sink::{memory::ChannelSink, CloseKind, PeerSink, QueuedSink, SinkQueue};
