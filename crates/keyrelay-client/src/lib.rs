//! # keyrelay Client
//!
//! The client half of the key exchange: what a device does with the messages
//! the relay delivers, how it builds its own, and how it stays connected.
//!
//! ## Overview
//!
//! ```text
//! ClientHandle ──commands──▶ event loop task ◀──frames── Link (WebSocket)
//!                               │
//!                               ▼
//!                          KeyExchange ── ConnectionSets, document keys
//!                               │
//!             Ledger ◀──────────┼──────────▶ DocumentVault / DocumentTransfer
//! ```
//!
//! ## Key Types
//!
//! - [`KeyExchange`] - State machine over inbound messages, plus user actions
//! - [`ConnectionSets`] - Which peers we hold keys for, granted, or owe an answer
//! - [`RequestBuilder`] - Builds and signs outbound messages
//! - [`ClientHandle`] - Running client: commands in, [`ClientEvent`]s out
//! - [`Dialer`] / [`Link`] - Connection abstraction, WebSocket by default
//! - [`DocumentTransfer`] - Listing, downloading and uploading sealed documents

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod exchange;
pub mod requests;
pub mod state;
pub mod transfer;
pub mod transport;

pub use config::ClientConfig;
pub use connection::{authenticate, ClientHandle, LinkState};
pub use error::{ClientError, Result};
pub use event::ClientEvent;
pub use exchange::{GrantedStatus, KeyExchange, Reaction, Services};
pub use requests::RequestBuilder;
pub use state::{ConnectionSets, PeerStatus, PendingKeyRequest};
pub use transfer::{memory::MemoryTransfer, DocumentTransfer};
pub use transport::{Dialer, Frame, Link, WebSocketDialer, WebSocketLink, NORMAL_CLOSURE};
