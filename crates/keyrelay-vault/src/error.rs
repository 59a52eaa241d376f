//! Error types for the vault.

use thiserror::Error;

/// Errors that can occur during document or key operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// No such document in the owner's bucket.
    #[error("document not found: {owner}/{id}")]
    NotFound { owner: String, id: String },

    /// AEAD tag verification failed: wrong key or corrupted data.
    #[error("authentication failed")]
    AuthFailure,

    /// Malformed key material (wrong length, unusable parameters).
    #[error("crypto error: {0}")]
    CryptoError(String),

    /// A session public key could not be parsed or is too weak.
    #[error("invalid session key: {0}")]
    InvalidSessionKey(String),

    /// RSA-OAEP wrapping or unwrapping failed.
    #[error("key wrap error: {0}")]
    KeyWrap(String),
}

impl VaultError {
    pub(crate) fn not_found(owner: &impl ToString, id: &impl ToString) -> Self {
        VaultError::NotFound {
            owner: owner.to_string(),
            id: id.to_string(),
        }
    }
}

/// Result type for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;
