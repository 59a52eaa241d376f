//! Symmetric document keys.
//!
//! AES-256-GCM with a fresh random 96-bit nonce per seal. Sealed output is
//! `nonce(12) ‖ ciphertext+tag`, which is exactly what the vault stores.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use std::fmt;

use crate::error::{Result, VaultError};

/// Length of the GCM nonce prefix.
pub const NONCE_LEN: usize = 12;

/// Length of a document key.
pub const KEY_LEN: usize = 32;

/// A 256-bit symmetric document key.
///
/// One per owner identity. It only ever leaves the process wrapped under a
/// requester's session RSA key.
#[derive(Clone, PartialEq, Eq)]
pub struct DocumentKey([u8; KEY_LEN]);

impl DocumentKey {
    /// Generate a new random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, failing unless it is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            VaultError::CryptoError(format!(
                "invalid key length: expected {KEY_LEN}, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Seal plaintext under this key.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        seal_with(&self.0, plaintext)
    }

    /// Open `nonce ‖ ciphertext` sealed under this key.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        open_with(&self.0, sealed)
    }
}

impl fmt::Debug for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DocumentKey(..)")
    }
}

impl AsRef<[u8]> for DocumentKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key).map_err(|_| {
        VaultError::CryptoError(format!(
            "invalid key length: expected {KEY_LEN}, got {}",
            key.len()
        ))
    })
}

/// Seal with a raw key, which must be exactly 32 bytes.
pub fn seal_with(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher(key)?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| VaultError::CryptoError(e.to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open with a raw key, which must be exactly 32 bytes.
pub fn open_with(key: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher(key)?;

    // Too short to hold a nonce is indistinguishable from corruption.
    if sealed.len() < NONCE_LEN {
        return Err(VaultError::AuthFailure);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| VaultError::AuthFailure)
}
