//! Identities.
//!
//! An identity is the ledger account name of a party. It is opaque, stable
//! and never reused, so it is the primary key for connections, mailboxes,
//! vault buckets and document keys alike.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Stable ledger account name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Create from an account name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the account name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the account name is empty (never a valid ledger account).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.0)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Identity {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl Borrow<str> for Identity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_identity_display() {
        let id = Identity::new("alice");
        assert_eq!(id.to_string(), "alice");
        assert_eq!(format!("{:?}", id), "Identity(alice)");
    }

    #[test]
    fn test_identity_borrow_lookup() {
        let mut set = HashSet::new();
        set.insert(Identity::new("bob"));
        assert!(set.contains("bob"));
        assert!(!set.contains("alice"));
    }

    #[test]
    fn test_identity_serde_transparent() {
        let id = Identity::new("carol");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"carol\"");
    }
}
