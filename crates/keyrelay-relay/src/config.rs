//! Relay configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the relay server.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to listen on.
    pub bind_addr: SocketAddr,
    /// How long a new connection has to send `Authenticate`.
    pub auth_timeout: Duration,
    /// Capacity of the hub command channel.
    pub hub_capacity: usize,
    /// Frames queued per connection before further writes to it fail.
    pub send_queue: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            auth_timeout: Duration::from_secs(5),
            hub_capacity: 1024,
            send_queue: 256,
        }
    }
}
