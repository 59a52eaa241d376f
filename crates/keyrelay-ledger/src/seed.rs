//! Ledger seed files.
//!
//! A development relay has no real ledger behind it, so it starts from a JSON
//! file listing accounts, their ledger keys, display names and grants:
//!
//! ```json
//! {
//!   "accounts": [
//!     {"name": "alice", "ledgerKey": "3b6a27bc...", "displayName": "Alice A."},
//!     {"name": "bob", "ledgerKey": "8a88e3dd..."}
//!   ],
//!   "grants": [{"owner": "alice", "to": "bob"}]
//! }
//! ```

use std::path::Path;

use serde::Deserialize;

use keyrelay_core::{Identity, LedgerPublicKey};

use crate::error::{LedgerError, Result};
use crate::memory::MemoryLedger;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedAccount {
    pub name: Identity,
    /// Hex-encoded Ed25519 public key.
    pub ledger_key: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedGrant {
    pub owner: Identity,
    pub to: Identity,
}

/// Parsed contents of a seed file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgerSeed {
    #[serde(default)]
    pub accounts: Vec<SeedAccount>,
    #[serde(default)]
    pub grants: Vec<SeedGrant>,
}

impl LedgerSeed {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| LedgerError::InvalidSeed(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// `(identity, display name)` for every account that declares one.
    pub fn display_names(&self) -> impl Iterator<Item = (Identity, String)> + '_ {
        self.accounts.iter().filter_map(|account| {
            account
                .display_name
                .clone()
                .map(|name| (account.name.clone(), name))
        })
    }

    /// Build an in-memory ledger holding every account and grant.
    pub async fn into_ledger(self) -> Result<MemoryLedger> {
        use crate::traits::Ledger;

        let ledger = MemoryLedger::new();
        for account in self.accounts {
            let key = LedgerPublicKey::from_hex(&account.ledger_key)?;
            ledger.register_account(account.name, key);
        }
        for grant in &self.grants {
            ledger.grant_access(&grant.owner, &grant.to).await?;
        }
        Ok(ledger)
    }
}
