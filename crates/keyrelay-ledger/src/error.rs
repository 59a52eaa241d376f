//! Error types for ledger access.

use thiserror::Error;

/// Errors that can occur when talking to the ledger or signing with a
/// ledger key.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The account is not registered.
    #[error("unknown account: {0}")]
    UnknownAccount(String),

    /// The ledger could not be reached or refused the call.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// No local ledger key to sign with.
    #[error("signing key unavailable")]
    SigningUnavailable,

    /// A seed file is malformed.
    #[error("invalid ledger seed: {0}")]
    InvalidSeed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("core error: {0}")]
    Core(#[from] keyrelay_core::CoreError),
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
