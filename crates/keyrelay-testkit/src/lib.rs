//! # keyrelay Testkit
//!
//! Testing utilities for keyrelay.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a relay, hub and ledger wired together in memory, with
//!   one [`KeyExchange`](keyrelay_client::KeyExchange) per party
//! - **Generators**: Proptest strategies for identities, messages and peer
//!   events
//! - **A live relay**: [`fixtures::RunningRelay`] binds a real socket on
//!   localhost for end-to-end tests
//!
//! ## Test Fixtures
//!
//! ```rust,ignore
//! use keyrelay_testkit::fixtures::TestNetwork;
//!
//! let net = TestNetwork::new();
//! let mut alice = net.party("alice");
//! let mut bob = net.party("bob");
//! net.connect(&mut alice).await;
//! net.connect(&mut bob).await;
//!
//! let request = bob.exchange.request_access(alice.id(), None)?;
//! net.send(&bob, request).await;
//! net.settle(&mut [&mut alice, &mut bob]).await;
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use keyrelay_testkit::generators::client_message;
//!
//! proptest! {
//!     #[test]
//!     fn client_messages_survive_the_wire(message in client_message()) {
//!         let bytes = message.encode().unwrap();
//!         prop_assert_eq!(ClientMessage::decode(&bytes).unwrap(), message);
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{shared_session, Party, RunningRelay, TestNetwork};

use tracing_subscriber::EnvFilter;

/// Install a test-friendly tracing subscriber once; later calls are no-ops.
///
/// Filtered by `RUST_LOG`, silent by default.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
