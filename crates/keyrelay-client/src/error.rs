//! Error types for the client.

use thiserror::Error;

use keyrelay_core::Identity;

/// Errors returned by client operations.
///
/// The `Display` text is the human-readable string handed to the user when an
/// action fails.
#[derive(Debug, Error)]
pub enum ClientError {
    /// `SendKey` was asked for a peer with no pending key request.
    #[error("no pending key request from {0}")]
    NoSuchPendingRequest(Identity),

    /// The local ledger key could not be used.
    #[error("cannot sign with the ledger key: {0}")]
    SigningError(#[source] keyrelay_ledger::LedgerError),

    /// We hold no document key for this owner.
    #[error("no document key for {0}")]
    NoKey(Identity),

    /// The ledger says we may not read this owner's documents.
    #[error("access to {0}'s documents has not been granted")]
    AccessDenied(Identity),

    /// The account does not exist on the ledger.
    #[error("account {0} does not exist")]
    UnknownAccount(Identity),

    /// The relay did not answer `Authorized` in time.
    #[error("relay did not authorize the connection in time")]
    AuthTimeout,

    /// The relay refused the handshake.
    #[error("relay refused the connection: {0}")]
    AuthRejected(String),

    /// Reconnecting failed on every attempt.
    #[error("connection lost after {attempts} reconnect attempts")]
    ConnectionLost { attempts: u32 },

    /// The client event loop has stopped.
    #[error("client is closed")]
    Closed,

    #[error("transport error: {0}")]
    Transport(String),

    /// The document-transfer collaborator failed.
    #[error("document transfer failed: {0}")]
    Transfer(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("vault error: {0}")]
    Vault(#[from] keyrelay_vault::VaultError),

    #[error("ledger error: {0}")]
    Ledger(#[from] keyrelay_ledger::LedgerError),

    #[error("core error: {0}")]
    Core(#[from] keyrelay_core::CoreError),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
