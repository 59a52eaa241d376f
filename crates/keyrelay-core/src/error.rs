//! Error types for keyrelay core.

use thiserror::Error;

use crate::envelope::EnvelopeName;

/// Errors raised while decoding envelopes or handling ledger keys.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bytes are not a well-formed envelope.
    #[error("decode error: {0}")]
    Decode(String),

    /// Envelope could not be serialized.
    #[error("encode error: {0}")]
    Encode(String),

    /// An expected field is absent (distinct from an empty value).
    #[error("missing field `{0}`")]
    MissingField(String),

    /// A field is present but its value cannot be interpreted.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: String, reason: String },

    /// The envelope name is valid on the wire but not in this direction.
    #[error("unexpected envelope {0:?}")]
    UnexpectedName(EnvelopeName),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,
}

impl CoreError {
    pub(crate) fn invalid_field(field: &str, reason: impl ToString) -> Self {
        CoreError::InvalidField {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
