//! # keyrelay Vault
//!
//! Envelope encryption for documents at rest and for key transport.
//!
//! ## Overview
//!
//! Each owner has one 256-bit [`DocumentKey`]. Documents are sealed with
//! AES-256-GCM under that key and stored in the [`DocumentVault`] as
//! `nonce ‖ ciphertext`. To share the key, the owner wraps it under the
//! requester's session RSA public key ([`SessionPublicKey::wrap`]) using
//! RSA-OAEP with SHA-512; the requester unwraps it with its
//! [`SessionKeyPair`].
//!
//! ```text
//! owner                                   requester
//!   DocumentKey ──wrap(SessionPublicKey)──▶ wrapped ──unwrap(SessionKeyPair)──▶ DocumentKey
//!   vault.encrypt(owner, doc, key)                     vault.decrypt(owner, id, key)
//! ```

pub mod crypto;
pub mod error;
pub mod keywrap;
pub mod vault;

pub use crypto::DocumentKey;
pub use error::{Result, VaultError};
pub use keywrap::{KeyFingerprint, SessionKeyPair, SessionPublicKey, MIN_RSA_BITS};
pub use vault::{DocumentId, DocumentVault};
