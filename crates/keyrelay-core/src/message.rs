//! Typed protocol messages.
//!
//! The same envelope name travels in both directions with different fields
//! (a `RequestKey` sent *to* the relay names its recipient; the one the relay
//! delivers names its sender). Each direction therefore gets its own closed
//! sum type, decoded once from an [`Envelope`] at the transport boundary.
//!
//! ## Field conventions
//!
//! - Identities travel as plain strings (`to`, `from`, `user`)
//! - Wrapped document keys are base64 (`key` on SendKey/ImportKey)
//! - Session RSA public keys are PEM text (`key` on RequestKey)
//! - Ledger keys are hex, ledger signatures are base64
//! - `context` is optional and omitted when absent

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::crypto::{LedgerPublicKey, LedgerSignature};
use crate::envelope::{Envelope, EnvelopeName};
use crate::error::{CoreError, Result};
use crate::identity::Identity;

/// Literal text the relay sends once a connection is authenticated.
pub const AUTHORIZED: &str = "Authorized";

/// Wire field keys.
pub mod fields {
    pub const TO: &str = "to";
    pub const FROM: &str = "from";
    pub const KEY: &str = "key";
    pub const DISPLAY_NAME: &str = "displayName";
    pub const CONTEXT: &str = "context";
    pub const SIGNATURE: &str = "signature";
    pub const LEDGER_KEY: &str = "ledgerKey";
    pub const USER: &str = "user";
    pub const REASON: &str = "reason";
}

/// Messages a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Deliver a wrapped document key to a requester.
    SendKey {
        to: Identity,
        /// The document key sealed under the requester's session RSA key.
        key: Vec<u8>,
        context: Option<String>,
    },

    /// Tell a peer their copy of our key is no longer valid.
    RevokeKey { to: Identity },

    /// Ask an owner for their document key.
    RequestKey {
        to: Identity,
        /// PEM-encoded session RSA public key.
        key: String,
        /// Ledger signature over the PEM bytes.
        signature: LedgerSignature,
        /// The ledger key the signature was made with.
        ledger_key: LedgerPublicKey,
        context: Option<String>,
    },

    /// Tell a peer we have granted them access on the ledger.
    NotifyGranted { to: Identity },

    /// Our document key changed; every connected peer must re-request it.
    Reencrypt,

    /// We uploaded a document.
    NewUpload,
}

/// Messages the relay delivers to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    ImportKey {
        from: Identity,
        display_name: String,
        key: Vec<u8>,
        context: Option<String>,
    },
    RevokeKey {
        from: Identity,
    },
    RequestKey {
        from: Identity,
        display_name: String,
        key: String,
        signature: LedgerSignature,
        ledger_key: LedgerPublicKey,
        context: Option<String>,
    },
    NotifyGranted {
        from: Identity,
        display_name: String,
    },
    Reencrypt {
        from: Identity,
    },
    NewUpload {
        user: Identity,
    },
    /// The relay refused something we sent. The reason is deliberately vague.
    Error {
        reason: String,
    },
}

/// Handshake message answering the relay's connection challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticate {
    pub user: Identity,
    pub ledger_key: LedgerPublicKey,
    /// Signature over [`crate::auth_challenge_message`].
    pub signature: LedgerSignature,
}

// ============================================================
// Field helpers
// ============================================================

fn identity_field(env: &Envelope, key: &str) -> Result<Identity> {
    Ok(Identity::new(env.get_field(key)?))
}

fn base64_field(env: &Envelope, key: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(env.get_field(key)?)
        .map_err(|e| CoreError::invalid_field(key, e))
}

fn signature_field(env: &Envelope) -> Result<LedgerSignature> {
    LedgerSignature::from_base64(env.get_field(fields::SIGNATURE)?)
        .map_err(|e| CoreError::invalid_field(fields::SIGNATURE, e))
}

fn ledger_key_field(env: &Envelope) -> Result<LedgerPublicKey> {
    LedgerPublicKey::from_hex(env.get_field(fields::LEDGER_KEY)?)
        .map_err(|e| CoreError::invalid_field(fields::LEDGER_KEY, e))
}

fn context_field(env: &Envelope) -> Option<String> {
    env.optional_field(fields::CONTEXT).map(str::to_string)
}

// ============================================================
// ClientMessage
// ============================================================

impl ClientMessage {
    pub fn name(&self) -> EnvelopeName {
        match self {
            ClientMessage::SendKey { .. } => EnvelopeName::SendKey,
            ClientMessage::RevokeKey { .. } => EnvelopeName::RevokeKey,
            ClientMessage::RequestKey { .. } => EnvelopeName::RequestKey,
            ClientMessage::NotifyGranted { .. } => EnvelopeName::NotifyGranted,
            ClientMessage::Reencrypt => EnvelopeName::Reencrypt,
            ClientMessage::NewUpload => EnvelopeName::NewUpload,
        }
    }

    /// The single recipient this message is addressed to, if any.
    pub fn recipient(&self) -> Option<&Identity> {
        match self {
            ClientMessage::SendKey { to, .. }
            | ClientMessage::RevokeKey { to }
            | ClientMessage::RequestKey { to, .. }
            | ClientMessage::NotifyGranted { to } => Some(to),
            ClientMessage::Reencrypt | ClientMessage::NewUpload => None,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let env = Envelope::new(self.name());
        match self {
            ClientMessage::SendKey { to, key, context } => env
                .with_field(fields::TO, to.as_str())
                .with_field(fields::KEY, BASE64.encode(key))
                .with_optional_field(fields::CONTEXT, context.clone()),
            ClientMessage::RevokeKey { to } | ClientMessage::NotifyGranted { to } => {
                env.with_field(fields::TO, to.as_str())
            }
            ClientMessage::RequestKey {
                to,
                key,
                signature,
                ledger_key,
                context,
            } => env
                .with_field(fields::TO, to.as_str())
                .with_field(fields::KEY, key.clone())
                .with_field(fields::SIGNATURE, signature.to_base64())
                .with_field(fields::LEDGER_KEY, ledger_key.to_hex())
                .with_optional_field(fields::CONTEXT, context.clone()),
            ClientMessage::Reencrypt | ClientMessage::NewUpload => env,
        }
    }

    pub fn from_envelope(env: &Envelope) -> Result<Self> {
        Ok(match env.name {
            EnvelopeName::SendKey => ClientMessage::SendKey {
                to: identity_field(env, fields::TO)?,
                key: base64_field(env, fields::KEY)?,
                context: context_field(env),
            },
            EnvelopeName::RevokeKey => ClientMessage::RevokeKey {
                to: identity_field(env, fields::TO)?,
            },
            EnvelopeName::RequestKey => ClientMessage::RequestKey {
                to: identity_field(env, fields::TO)?,
                key: env.get_field(fields::KEY)?.to_string(),
                signature: signature_field(env)?,
                ledger_key: ledger_key_field(env)?,
                context: context_field(env),
            },
            EnvelopeName::NotifyGranted => ClientMessage::NotifyGranted {
                to: identity_field(env, fields::TO)?,
            },
            EnvelopeName::Reencrypt => ClientMessage::Reencrypt,
            EnvelopeName::NewUpload => ClientMessage::NewUpload,
            other => return Err(CoreError::UnexpectedName(other)),
        })
    }

    /// Encode straight to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.to_envelope().encode()
    }

    /// Decode wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::from_envelope(&Envelope::decode(bytes)?)
    }
}

// ============================================================
// RelayMessage
// ============================================================

impl RelayMessage {
    pub fn name(&self) -> EnvelopeName {
        match self {
            RelayMessage::ImportKey { .. } => EnvelopeName::ImportKey,
            RelayMessage::RevokeKey { .. } => EnvelopeName::RevokeKey,
            RelayMessage::RequestKey { .. } => EnvelopeName::RequestKey,
            RelayMessage::NotifyGranted { .. } => EnvelopeName::NotifyGranted,
            RelayMessage::Reencrypt { .. } => EnvelopeName::Reencrypt,
            RelayMessage::NewUpload { .. } => EnvelopeName::NewUpload,
            RelayMessage::Error { .. } => EnvelopeName::Error,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let env = Envelope::new(self.name());
        match self {
            RelayMessage::ImportKey {
                from,
                display_name,
                key,
                context,
            } => env
                .with_field(fields::FROM, from.as_str())
                .with_field(fields::DISPLAY_NAME, display_name.clone())
                .with_field(fields::KEY, BASE64.encode(key))
                .with_optional_field(fields::CONTEXT, context.clone()),
            RelayMessage::RevokeKey { from } | RelayMessage::Reencrypt { from } => {
                env.with_field(fields::FROM, from.as_str())
            }
            RelayMessage::RequestKey {
                from,
                display_name,
                key,
                signature,
                ledger_key,
                context,
            } => env
                .with_field(fields::FROM, from.as_str())
                .with_field(fields::DISPLAY_NAME, display_name.clone())
                .with_field(fields::KEY, key.clone())
                .with_field(fields::SIGNATURE, signature.to_base64())
                .with_field(fields::LEDGER_KEY, ledger_key.to_hex())
                .with_optional_field(fields::CONTEXT, context.clone()),
            RelayMessage::NotifyGranted { from, display_name } => env
                .with_field(fields::FROM, from.as_str())
                .with_field(fields::DISPLAY_NAME, display_name.clone()),
            RelayMessage::NewUpload { user } => env.with_field(fields::USER, user.as_str()),
            RelayMessage::Error { reason } => env.with_field(fields::REASON, reason.clone()),
        }
    }

    pub fn from_envelope(env: &Envelope) -> Result<Self> {
        Ok(match env.name {
            EnvelopeName::ImportKey => RelayMessage::ImportKey {
                from: identity_field(env, fields::FROM)?,
                display_name: env.get_field(fields::DISPLAY_NAME)?.to_string(),
                key: base64_field(env, fields::KEY)?,
                context: context_field(env),
            },
            EnvelopeName::RevokeKey => RelayMessage::RevokeKey {
                from: identity_field(env, fields::FROM)?,
            },
            EnvelopeName::RequestKey => RelayMessage::RequestKey {
                from: identity_field(env, fields::FROM)?,
                display_name: env.get_field(fields::DISPLAY_NAME)?.to_string(),
                key: env.get_field(fields::KEY)?.to_string(),
                signature: signature_field(env)?,
                ledger_key: ledger_key_field(env)?,
                context: context_field(env),
            },
            EnvelopeName::NotifyGranted => RelayMessage::NotifyGranted {
                from: identity_field(env, fields::FROM)?,
                display_name: env.get_field(fields::DISPLAY_NAME)?.to_string(),
            },
            EnvelopeName::Reencrypt => RelayMessage::Reencrypt {
                from: identity_field(env, fields::FROM)?,
            },
            EnvelopeName::NewUpload => RelayMessage::NewUpload {
                user: identity_field(env, fields::USER)?,
            },
            EnvelopeName::Error => RelayMessage::Error {
                reason: env.get_field(fields::REASON)?.to_string(),
            },
            other => return Err(CoreError::UnexpectedName(other)),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        self.to_envelope().encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::from_envelope(&Envelope::decode(bytes)?)
    }
}

// ============================================================
// Authenticate
// ============================================================

impl Authenticate {
    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(EnvelopeName::Authenticate)
            .with_field(fields::USER, self.user.as_str())
            .with_field(fields::LEDGER_KEY, self.ledger_key.to_hex())
            .with_field(fields::SIGNATURE, self.signature.to_base64())
    }

    pub fn from_envelope(env: &Envelope) -> Result<Self> {
        if env.name != EnvelopeName::Authenticate {
            return Err(CoreError::UnexpectedName(env.name));
        }
        Ok(Self {
            user: identity_field(env, fields::USER)?,
            ledger_key: ledger_key_field(env)?,
            signature: signature_field(env)?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        self.to_envelope().encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Self::from_envelope(&Envelope::decode(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{auth_challenge_message, Keypair};

    const PEM: &str = "-----BEGIN PUBLIC KEY-----\nMIIBIjANBg\n-----END PUBLIC KEY-----\n";

    #[test]
    fn test_send_key_wire_fields() {
        let msg = ClientMessage::SendKey {
            to: Identity::new("bob"),
            key: vec![1, 2, 3],
            context: None,
        };
        let env = msg.to_envelope();
        assert_eq!(env.name, EnvelopeName::SendKey);
        assert_eq!(env.get_field("to").unwrap(), "bob");
        assert_eq!(env.get_field("key").unwrap(), "AQID");
        assert!(env.optional_field("context").is_none());
        assert_eq!(ClientMessage::from_envelope(&env).unwrap(), msg);
    }

    #[test]
    fn test_request_key_roundtrip() {
        let kp = Keypair::generate();
        let msg = ClientMessage::RequestKey {
            to: Identity::new("alice"),
            key: PEM.to_string(),
            signature: kp.sign(PEM.as_bytes()),
            ledger_key: kp.public_key(),
            context: Some("met at clinic".into()),
        };
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_relay_request_key_fields() {
        let kp = Keypair::generate();
        let msg = RelayMessage::RequestKey {
            from: Identity::new("bob"),
            display_name: "Dr. Bob".into(),
            key: PEM.to_string(),
            signature: kp.sign(PEM.as_bytes()),
            ledger_key: kp.public_key(),
            context: None,
        };
        let env = msg.to_envelope();
        assert_eq!(env.get_field("from").unwrap(), "bob");
        assert_eq!(env.get_field("displayName").unwrap(), "Dr. Bob");
        assert_eq!(env.get_field("ledgerKey").unwrap(), kp.public_key().to_hex());
        assert_eq!(RelayMessage::from_envelope(&env).unwrap(), msg);
    }

    #[test]
    fn test_missing_field_is_reported() {
        let env = Envelope::new(EnvelopeName::ImportKey).with_field("from", "alice");
        let err = RelayMessage::from_envelope(&env).unwrap_err();
        assert!(matches!(err, CoreError::MissingField(f) if f == "displayName"));
    }

    #[test]
    fn test_bad_base64_is_invalid_field() {
        let env = Envelope::new(EnvelopeName::SendKey)
            .with_field("to", "bob")
            .with_field("key", "%%%");
        let err = ClientMessage::from_envelope(&env).unwrap_err();
        assert!(matches!(err, CoreError::InvalidField { field, .. } if field == "key"));
    }

    #[test]
    fn test_direction_is_enforced() {
        let import = Envelope::new(EnvelopeName::ImportKey);
        assert!(matches!(
            ClientMessage::from_envelope(&import),
            Err(CoreError::UnexpectedName(EnvelopeName::ImportKey))
        ));
        let send = Envelope::new(EnvelopeName::SendKey);
        assert!(matches!(
            RelayMessage::from_envelope(&send),
            Err(CoreError::UnexpectedName(EnvelopeName::SendKey))
        ));
    }

    #[test]
    fn test_fieldless_client_messages() {
        let env = ClientMessage::Reencrypt.to_envelope();
        assert!(env.fields.is_empty());
        assert_eq!(ClientMessage::from_envelope(&env).unwrap(), ClientMessage::Reencrypt);
        assert_eq!(ClientMessage::NewUpload.recipient(), None);
    }

    #[test]
    fn test_authenticate_roundtrip() {
        let kp = Keypair::generate();
        let auth = Authenticate {
            user: Identity::new("alice"),
            ledger_key: kp.public_key(),
            signature: kp.sign(&auth_challenge_message("challenge")),
        };
        let decoded = Authenticate::decode(&auth.encode().unwrap()).unwrap();
        assert_eq!(decoded, auth);

        let wrong = Envelope::new(EnvelopeName::SendKey);
        assert!(Authenticate::from_envelope(&wrong).is_err());
    }
}
