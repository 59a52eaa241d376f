//! Error types for the relay.

use thiserror::Error;

/// Errors that can occur while routing or serving connections.
#[derive(Debug, Error)]
pub enum RelayError {
    /// No live connection for the identity.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// The hub task has stopped.
    #[error("hub is shut down")]
    HubClosed,

    /// Writing to a peer failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection did not authenticate.
    #[error("authentication failed: {0}")]
    AuthFailed(&'static str),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("ledger error: {0}")]
    Ledger(#[from] keyrelay_ledger::LedgerError),

    #[error("core error: {0}")]
    Core(#[from] keyrelay_core::CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
