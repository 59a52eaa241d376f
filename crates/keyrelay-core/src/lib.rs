//! # keyrelay Core
//!
//! Pure primitives shared by the relay and its clients: identities, ledger
//! signing keys, the wire envelope and the typed messages decoded from it.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`Identity`] - Stable ledger account name, the universal addressing key
//! - [`Envelope`] - The single wire message: a name plus a flat string map
//! - [`ClientMessage`] - What a client sends to the relay
//! - [`RelayMessage`] - What the relay delivers to a client
//! - [`Keypair`] - A local ledger signing key
//!
//! ## Wire Format
//!
//! ```text
//! {"Name": "RequestKey", "Fields": {"to": "alice", "key": "-----BEGIN PUBLIC KEY-----...", ...}}
//! ```
//!
//! Binary payloads (wrapped keys, signatures) are base64-encoded into string
//! fields. See [`envelope`] for the structural codec and [`message`] for the
//! typed layer on top of it.

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod message;

pub use crypto::{
    auth_challenge_message, Keypair, LedgerPublicKey, LedgerSignature, CHALLENGE_HEADER,
};
pub use envelope::{Envelope, EnvelopeName};
pub use error::{CoreError, Result};
pub use identity::Identity;
pub use message::{Authenticate, ClientMessage, RelayMessage, AUTHORIZED};
