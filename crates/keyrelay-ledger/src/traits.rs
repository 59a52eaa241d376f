//! Ledger and signer traits: the external systems of record.
//!
//! The ledger decides who may hold whose key. Neither the relay nor the
//! client keeps authoritative access state of its own; both ask the ledger.
//! Mutations are assumed eventually consistent, so callers must not rely on
//! seeing a grant immediately after making it.

use async_trait::async_trait;

use keyrelay_core::{Identity, Keypair, LedgerPublicKey, LedgerSignature};

use crate::error::Result;

/// The access-control ledger.
///
/// An owner grants requesters access; `list_connected(owner)` is exactly the
/// set of requesters the owner has granted.
#[async_trait]
pub trait Ledger: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Whether `owner` has granted `requester` access.
    ///
    /// Every account trivially has access to itself.
    async fn access_granted(&self, owner: &Identity, requester: &Identity) -> Result<bool>;

    /// Whether the account exists.
    async fn check_account_exists(&self, identity: &Identity) -> Result<bool>;

    /// Whether `key` is the ledger key registered for `identity`.
    async fn check_account_key(&self, identity: &Identity, key: &LedgerPublicKey)
        -> Result<bool>;

    /// Every requester `owner` has granted access to.
    async fn list_connected(&self, owner: &Identity) -> Result<Vec<Identity>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────────────────────

    /// Record that `owner` grants `to` access.
    async fn grant_access(&self, owner: &Identity, to: &Identity) -> Result<()>;

    /// Remove a grant from `owner` to `from`.
    async fn revoke_access(&self, owner: &Identity, from: &Identity) -> Result<()>;
}

/// The local identity's ledger signing key.
pub trait LedgerSigner: Send + Sync {
    /// Sign bytes with the ledger private key.
    fn sign(&self, message: &[u8]) -> Result<LedgerSignature>;

    /// The ledger public key registered for this account.
    fn public_key(&self) -> Result<LedgerPublicKey>;
}

impl LedgerSigner for Keypair {
    fn sign(&self, message: &[u8]) -> Result<LedgerSignature> {
        Ok(Keypair::sign(self, message))
    }

    fn public_key(&self) -> Result<LedgerPublicKey> {
        Ok(Keypair::public_key(self))
    }
}

/// A signer for an account whose private key is not loaded.
///
/// Every call fails with [`crate::LedgerError::SigningUnavailable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSigner;

impl LedgerSigner for NoSigner {
    fn sign(&self, _message: &[u8]) -> Result<LedgerSignature> {
        Err(crate::LedgerError::SigningUnavailable)
    }

    fn public_key(&self) -> Result<LedgerPublicKey> {
        Err(crate::LedgerError::SigningUnavailable)
    }
}
