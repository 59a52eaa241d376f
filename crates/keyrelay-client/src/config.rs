//! Client configuration.

use std::time::Duration;

use keyrelay_vault::MIN_RSA_BITS;

/// Configuration for a client connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the relay.
    pub relay_url: String,

    /// How long to wait for `Authorized` after sending `Authenticate`.
    pub auth_timeout: Duration,

    /// Fixed delay before each reconnect attempt.
    pub reconnect_delay: Duration,

    /// Reconnect attempts before giving up with `ConnectionLost`.
    pub reconnect_attempts: u32,

    /// Modulus size of the session RSA keypair.
    pub rsa_bits: usize,

    /// Capacity of the command queue into the event loop.
    pub command_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080".to_string(),
            auth_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(2),
            reconnect_attempts: 5,
            rsa_bits: MIN_RSA_BITS,
            command_capacity: 64,
        }
    }
}
