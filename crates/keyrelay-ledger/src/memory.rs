//! In-memory implementation of the Ledger trait.
//!
//! Used by tests and by the development relay. Grants are visible
//! immediately, which is stronger than a real ledger promises.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use keyrelay_core::{Identity, LedgerPublicKey};

use crate::error::{LedgerError, Result};
use crate::traits::Ledger;

/// In-memory ledger.
///
/// All data is lost when the ledger is dropped. Thread-safe via RwLock.
pub struct MemoryLedger {
    inner: RwLock<MemoryLedgerInner>,
}

#[derive(Default)]
struct MemoryLedgerInner {
    /// Registered accounts and their ledger keys.
    accounts: HashMap<Identity, LedgerPublicKey>,

    /// owner -> requesters granted access.
    grants: HashMap<Identity, BTreeSet<Identity>>,
}

impl MemoryLedger {
    /// Create a new empty ledger.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryLedgerInner::default()),
        }
    }

    /// Register an account, replacing any previous key.
    pub fn register_account(&self, identity: Identity, key: LedgerPublicKey) {
        debug!(%identity, "registered account");
        self.inner.write().accounts.insert(identity, key);
    }

    /// Number of registered accounts.
    pub fn account_count(&self) -> usize {
        self.inner.read().accounts.len()
    }

    fn require_account(inner: &MemoryLedgerInner, identity: &Identity) -> Result<()> {
        if inner.accounts.contains_key(identity) {
            Ok(())
        } else {
            Err(LedgerError::UnknownAccount(identity.to_string()))
        }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn access_granted(&self, owner: &Identity, requester: &Identity) -> Result<bool> {
        if owner == requester {
            return Ok(true);
        }
        let inner = self.inner.read();
        Ok(inner
            .grants
            .get(owner)
            .is_some_and(|granted| granted.contains(requester)))
    }

    async fn check_account_exists(&self, identity: &Identity) -> Result<bool> {
        Ok(self.inner.read().accounts.contains_key(identity))
    }

    async fn check_account_key(
        &self,
        identity: &Identity,
        key: &LedgerPublicKey,
    ) -> Result<bool> {
        Ok(self.inner.read().accounts.get(identity) == Some(key))
    }

    async fn list_connected(&self, owner: &Identity) -> Result<Vec<Identity>> {
        let inner = self.inner.read();
        Ok(inner
            .grants
            .get(owner)
            .map(|granted| granted.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn grant_access(&self, owner: &Identity, to: &Identity) -> Result<()> {
        let mut inner = self.inner.write();
        Self::require_account(&inner, owner)?;
        Self::require_account(&inner, to)?;

        inner.grants.entry(owner.clone()).or_default().insert(to.clone());
        debug!(%owner, %to, "granted access");
        Ok(())
    }

    async fn revoke_access(&self, owner: &Identity, from: &Identity) -> Result<()> {
        let mut inner = self.inner.write();
        Self::require_account(&inner, owner)?;

        if let Some(granted) = inner.grants.get_mut(owner) {
            granted.remove(from);
            if granted.is_empty() {
                inner.grants.remove(owner);
            }
        }
        debug!(%owner, %from, "revoked access");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrelay_core::Keypair;

    fn ledger_with(names: &[&str]) -> MemoryLedger {
        let ledger = MemoryLedger::new();
        for name in names {
            ledger.register_account(Identity::new(*name), Keypair::generate().public_key());
        }
        ledger
    }

    #[tokio::test]
    async fn test_grant_and_revoke() {
        let ledger = ledger_with(&["alice", "bob"]);
        let alice = Identity::new("alice");
        let bob = Identity::new("bob");

        assert!(!ledger.access_granted(&alice, &bob).await.unwrap());

        ledger.grant_access(&alice, &bob).await.unwrap();
        assert!(ledger.access_granted(&alice, &bob).await.unwrap());
        // Grants are directional.
        assert!(!ledger.access_granted(&bob, &alice).await.unwrap());
        assert_eq!(ledger.list_connected(&alice).await.unwrap(), vec![bob.clone()]);
        assert!(ledger.list_connected(&bob).await.unwrap().is_empty());

        ledger.revoke_access(&alice, &bob).await.unwrap();
        assert!(!ledger.access_granted(&alice, &bob).await.unwrap());
        assert!(ledger.list_connected(&alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_self_access() {
        let ledger = MemoryLedger::new();
        let carol = Identity::new("carol");
        assert!(ledger.access_granted(&carol, &carol).await.unwrap());
    }

    #[tokio::test]
    async fn test_grant_requires_accounts() {
        let ledger = ledger_with(&["alice"]);
        let result = ledger
            .grant_access(&Identity::new("alice"), &Identity::new("ghost"))
            .await;
        assert!(matches!(result, Err(LedgerError::UnknownAccount(name)) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_account_key_check() {
        let ledger = MemoryLedger::new();
        let alice = Identity::new("alice");
        let key = Keypair::generate().public_key();
        ledger.register_account(alice.clone(), key);

        assert!(ledger.check_account_exists(&alice).await.unwrap());
        assert!(!ledger.check_account_exists(&Identity::new("bob")).await.unwrap());
        assert!(ledger.check_account_key(&alice, &key).await.unwrap());
        assert!(!ledger
            .check_account_key(&alice, &Keypair::generate().public_key())
            .await
            .unwrap());
        assert!(!ledger
            .check_account_key(&Identity::new("bob"), &key)
            .await
            .unwrap());
    }
}
