//! Key wrapping under session RSA keys.
//!
//! A requester generates one RSA keypair per session and sends the public
//! half (PEM, SPKI) in its `RequestKey`. The owner wraps its document key
//! under that public key with RSA-OAEP(SHA-512); only the requester's session
//! private key can unwrap it.

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha512;
use std::fmt;

use crate::crypto::DocumentKey;
use crate::error::{Result, VaultError};

/// Smallest modulus accepted. OAEP-SHA512 needs 130 bytes of overhead, so a
/// 1024-bit key could not carry a 32-byte document key.
pub const MIN_RSA_BITS: usize = 2048;

/// Short Blake3 digest of a session public key, shown to users for
/// out-of-band comparison.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyFingerprint([u8; 32]);

impl KeyFingerprint {
    fn of(der: &[u8]) -> Self {
        Self(*blake3::hash(der).as_bytes())
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 bytes as colon-separated hex pairs.
    pub fn short(&self) -> String {
        self.0[..8]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl fmt::Debug for KeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyFingerprint({})", self.to_hex())
    }
}

impl fmt::Display for KeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short())
    }
}

/// The public half of a session keypair, as presented in a `RequestKey`.
#[derive(Clone, PartialEq)]
pub struct SessionPublicKey {
    inner: RsaPublicKey,
    pem: String,
    fingerprint: KeyFingerprint,
}

impl SessionPublicKey {
    fn from_rsa(inner: RsaPublicKey) -> Result<Self> {
        if inner.size() * 8 < MIN_RSA_BITS {
            return Err(VaultError::InvalidSessionKey(format!(
                "modulus is {} bits, need at least {MIN_RSA_BITS}",
                inner.size() * 8
            )));
        }
        let der = inner
            .to_public_key_der()
            .map_err(|e| VaultError::InvalidSessionKey(e.to_string()))?;
        let pem = inner
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| VaultError::InvalidSessionKey(e.to_string()))?;
        Ok(Self {
            fingerprint: KeyFingerprint::of(der.as_bytes()),
            inner,
            pem,
        })
    }

    /// Parse a PEM `PUBLIC KEY` block.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let inner = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| VaultError::InvalidSessionKey(e.to_string()))?;
        Self::from_rsa(inner)
    }

    /// Canonical PEM text; this is what gets signed and sent.
    pub fn to_pem(&self) -> &str {
        &self.pem
    }

    pub fn fingerprint(&self) -> KeyFingerprint {
        self.fingerprint
    }

    /// Wrap a document key for the holder of the matching private key.
    pub fn wrap(&self, key: &DocumentKey) -> Result<Vec<u8>> {
        self.inner
            .encrypt(&mut OsRng, Oaep::new::<Sha512>(), key.as_bytes())
            .map_err(|e| VaultError::KeyWrap(e.to_string()))
    }
}

impl fmt::Debug for SessionPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionPublicKey({})", self.fingerprint.short())
    }
}

/// A session RSA keypair, generated once per client session.
#[derive(Clone)]
pub struct SessionKeyPair {
    private: RsaPrivateKey,
    public: SessionPublicKey,
}

impl SessionKeyPair {
    /// Generate a fresh keypair with a modulus of `bits` bits.
    pub fn generate(bits: usize) -> Result<Self> {
        if bits < MIN_RSA_BITS {
            return Err(VaultError::CryptoError(format!(
                "RSA modulus of {bits} bits is below {MIN_RSA_BITS}"
            )));
        }
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| VaultError::CryptoError(e.to_string()))?;
        let public = SessionPublicKey::from_rsa(RsaPublicKey::from(&private))?;
        Ok(Self { private, public })
    }

    pub fn public_key(&self) -> &SessionPublicKey {
        &self.public
    }

    /// Unwrap a document key sealed under our public key.
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<DocumentKey> {
        let bytes = self
            .private
            .decrypt(Oaep::new::<Sha512>(), wrapped)
            .map_err(|e| VaultError::KeyWrap(e.to_string()))?;
        DocumentKey::from_slice(&bytes)
    }
}

impl fmt::Debug for SessionKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
