//! The Document Vault.
//!
//! Per-owner buckets of sealed documents, keyed by document id. The vault
//! knows nothing about who is allowed to hold which key; it only seals, opens
//! and stores.
//!
//! ## Concurrency
//!
//! The whole vault sits behind one `RwLock`. Every operation, including
//! [`DocumentVault::reencrypt`] and [`DocumentVault::remove_owner`], runs
//! under a single acquisition, so a purge racing an encrypt either sees the
//! new document and removes it, or runs first and the document lands in a
//! fresh bucket. Nothing is ever half-written.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use keyrelay_core::Identity;

use crate::crypto::{open_with, seal_with};
use crate::error::{Result, VaultError};

/// Document identifier.
///
/// Generated locally as a ULID on first encryption; a server may later assign
/// its own canonical id (see [`DocumentVault::rename_id`]), so any string is
/// accepted.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// A fresh, time-ordered id.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentId({})", self.0)
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

type Bucket = HashMap<DocumentId, Vec<u8>>;

/// Encrypted blob store keyed by `(owner, document id)`.
#[derive(Default)]
pub struct DocumentVault {
    buckets: RwLock<HashMap<Identity, Bucket>>,
}

impl DocumentVault {
    pub fn new() -> Self {
        Self::default()
    }

    // ============================================================
    // Sealed operations
    // ============================================================

    /// Seal `plaintext` under `key` and store it under a fresh id.
    ///
    /// Fails with [`VaultError::CryptoError`] unless `key` is exactly 32 bytes.
    pub fn encrypt(&self, owner: &Identity, plaintext: &[u8], key: &[u8]) -> Result<DocumentId> {
        let sealed = seal_with(key, plaintext)?;
        let id = DocumentId::generate();

        self.buckets
            .write()
            .entry(owner.clone())
            .or_default()
            .insert(id.clone(), sealed);

        debug!(%owner, %id, "sealed document");
        Ok(id)
    }

    /// Open a stored document.
    pub fn decrypt(&self, owner: &Identity, id: &DocumentId, key: &[u8]) -> Result<Vec<u8>> {
        let buckets = self.buckets.read();
        let sealed = buckets
            .get(owner)
            .and_then(|bucket| bucket.get(id))
            .ok_or_else(|| VaultError::not_found(owner, id))?;
        open_with(key, sealed)
    }

    /// Re-seal every document of `owner` under `new_key`, keeping ids.
    ///
    /// All documents are opened before any is replaced; if one fails to open
    /// the bucket is left untouched. Returns the number of documents re-sealed.
    pub fn reencrypt(&self, owner: &Identity, old_key: &[u8], new_key: &[u8]) -> Result<usize> {
        let mut buckets = self.buckets.write();
        let Some(bucket) = buckets.get_mut(owner) else {
            return Ok(0);
        };

        let mut resealed = Vec::with_capacity(bucket.len());
        for (id, sealed) in bucket.iter() {
            let plaintext = open_with(old_key, sealed)?;
            resealed.push((id.clone(), seal_with(new_key, &plaintext)?));
        }

        let count = resealed.len();
        bucket.extend(resealed);
        debug!(%owner, count, "re-sealed bucket");
        Ok(count)
    }

    // ============================================================
    // Raw operations
    // ============================================================

    /// Store already-sealed bytes as-is, replacing any previous value.
    pub fn save(&self, owner: &Identity, id: &DocumentId, raw: Vec<u8>) {
        self.buckets
            .write()
            .entry(owner.clone())
            .or_default()
            .insert(id.clone(), raw);
    }

    /// Fetch the sealed bytes of a document.
    pub fn get(&self, owner: &Identity, id: &DocumentId) -> Result<Vec<u8>> {
        self.buckets
            .read()
            .get(owner)
            .and_then(|bucket| bucket.get(id))
            .cloned()
            .ok_or_else(|| VaultError::not_found(owner, id))
    }

    pub fn exists(&self, owner: &Identity, id: &DocumentId) -> bool {
        self.buckets
            .read()
            .get(owner)
            .is_some_and(|bucket| bucket.contains_key(id))
    }

    /// Ids in the owner's bucket, in no particular order.
    pub fn list_ids(&self, owner: &Identity) -> Vec<DocumentId> {
        self.buckets
            .read()
            .get(owner)
            .map(|bucket| bucket.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove one document. Returns whether it existed.
    pub fn remove(&self, owner: &Identity, id: &DocumentId) -> bool {
        let mut buckets = self.buckets.write();
        let Some(bucket) = buckets.get_mut(owner) else {
            return false;
        };
        let removed = bucket.remove(id).is_some();
        if bucket.is_empty() {
            buckets.remove(owner);
        }
        removed
    }

    /// Purge every document of `owner`. Returns how many were removed.
    pub fn remove_owner(&self, owner: &Identity) -> usize {
        let removed = self
            .buckets
            .write()
            .remove(owner)
            .map(|bucket| bucket.len())
            .unwrap_or(0);
        if removed > 0 {
            debug!(%owner, removed, "purged bucket");
        }
        removed
    }

    /// Move a document to a new id, replacing whatever was stored there.
    pub fn rename_id(&self, owner: &Identity, old: &DocumentId, new: &DocumentId) -> Result<()> {
        let mut buckets = self.buckets.write();
        let bucket = buckets
            .get_mut(owner)
            .ok_or_else(|| VaultError::not_found(owner, old))?;
        let sealed = bucket
            .remove(old)
            .ok_or_else(|| VaultError::not_found(owner, old))?;
        bucket.insert(new.clone(), sealed);
        Ok(())
    }

    /// Owners that currently have at least one document.
    pub fn owners(&self) -> Vec<Identity> {
        self.buckets.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DocumentKey;
    use proptest::prelude::*;

    fn alice() -> Identity {
        Identity::new("alice")
    }

    #[test]
    fn test_encrypt_decrypt() {
        let vault = DocumentVault::new();
        let key = DocumentKey::generate();

        let id = vault.encrypt(&alice(), b"x-ray", key.as_ref()).unwrap();
        assert!(vault.exists(&alice(), &id));
        assert_eq!(vault.decrypt(&alice(), &id, key.as_ref()).unwrap(), b"x-ray");
    }

    #[test]
    fn test_encrypt_rejects_short_key() {
        let vault = DocumentVault::new();
        let result = vault.encrypt(&alice(), b"x", &[0u8; 16]);
        assert!(matches!(result, Err(VaultError::CryptoError(_))));
        assert!(vault.list_ids(&alice()).is_empty());
    }

    #[test]
    fn test_decrypt_not_found() {
        let vault = DocumentVault::new();
        let key = DocumentKey::generate();
        let result = vault.decrypt(&alice(), &DocumentId::new("nope"), key.as_ref());
        assert!(matches!(result, Err(VaultError::NotFound { .. })));
    }

    #[test]
    fn test_ids_are_fresh() {
        let vault = DocumentVault::new();
        let key = DocumentKey::generate();
        let a = vault.encrypt(&alice(), b"same", key.as_ref()).unwrap();
        let b = vault.encrypt(&alice(), b"same", key.as_ref()).unwrap();
        assert_ne!(a, b);
        assert_eq!(vault.list_ids(&alice()).len(), 2);
    }

    #[test]
    fn test_raw_save_get() {
        let vault = DocumentVault::new();
        let id = DocumentId::new("remote-1");
        vault.save(&alice(), &id, vec![9, 9, 9]);
        assert_eq!(vault.get(&alice(), &id).unwrap(), vec![9, 9, 9]);
        assert!(vault.get(&Identity::new("bob"), &id).is_err());
    }

    #[test]
    fn test_remove_and_remove_owner() {
        let vault = DocumentVault::new();
        let key = DocumentKey::generate();
        let bob = Identity::new("bob");

        let a1 = vault.encrypt(&alice(), b"1", key.as_ref()).unwrap();
        vault.encrypt(&alice(), b"2", key.as_ref()).unwrap();
        vault.encrypt(&bob, b"3", key.as_ref()).unwrap();

        assert!(vault.remove(&alice(), &a1));
        assert!(!vault.remove(&alice(), &a1));
        assert_eq!(vault.list_ids(&alice()).len(), 1);

        assert_eq!(vault.remove_owner(&alice()), 1);
        assert!(vault.list_ids(&alice()).is_empty());
        assert_eq!(vault.list_ids(&bob).len(), 1);
        assert_eq!(vault.owners(), vec![bob]);
    }

    #[test]
    fn test_rename_id() {
        let vault = DocumentVault::new();
        let key = DocumentKey::generate();
        let local = vault.encrypt(&alice(), b"scan", key.as_ref()).unwrap();
        let canonical = DocumentId::new("srv-42");

        vault.rename_id(&alice(), &local, &canonical).unwrap();
        assert!(!vault.exists(&alice(), &local));
        assert_eq!(
            vault.decrypt(&alice(), &canonical, key.as_ref()).unwrap(),
            b"scan"
        );
        assert!(matches!(
            vault.rename_id(&alice(), &local, &canonical),
            Err(VaultError::NotFound { .. })
        ));
    }

    #[test]
    fn test_reencrypt_keeps_ids() {
        let vault = DocumentVault::new();
        let old = DocumentKey::generate();
        let new = DocumentKey::generate();
        let id = vault.encrypt(&alice(), b"report", old.as_ref()).unwrap();

        assert_eq!(vault.reencrypt(&alice(), old.as_ref(), new.as_ref()).unwrap(), 1);
        assert_eq!(vault.decrypt(&alice(), &id, new.as_ref()).unwrap(), b"report");
        assert!(matches!(
            vault.decrypt(&alice(), &id, old.as_ref()),
            Err(VaultError::AuthFailure)
        ));
    }

    #[test]
    fn test_reencrypt_wrong_old_key_leaves_bucket() {
        let vault = DocumentVault::new();
        let key = DocumentKey::generate();
        let id = vault.encrypt(&alice(), b"report", key.as_ref()).unwrap();
        let before = vault.get(&alice(), &id).unwrap();

        let wrong = DocumentKey::generate();
        let result = vault.reencrypt(&alice(), wrong.as_ref(), DocumentKey::generate().as_ref());
        assert!(matches!(result, Err(VaultError::AuthFailure)));
        assert_eq!(vault.get(&alice(), &id).unwrap(), before);
    }

    proptest! {
        #[test]
        fn prop_decrypt_inverts_encrypt(
            key in any::<[u8; 32]>(),
            other in any::<[u8; 32]>(),
            plaintext in prop::collection::vec(any::<u8>(), 0..512),
        ) {
            let vault = DocumentVault::new();
            let id = vault.encrypt(&alice(), &plaintext, &key).unwrap();
            prop_assert_eq!(vault.decrypt(&alice(), &id, &key).unwrap(), plaintext);

            prop_assume!(other != key);
            prop_assert!(matches!(
                vault.decrypt(&alice(), &id, &other),
                Err(VaultError::AuthFailure)
            ));
        }
    }
}
