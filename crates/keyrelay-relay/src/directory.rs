//! Display names for identities.

use std::collections::HashMap;

use parking_lot::RwLock;

use keyrelay_core::Identity;

/// Identity to display-name lookup used to fill `displayName` fields.
///
/// Unknown identities are shown by their account name.
#[derive(Default)]
pub struct NameDirectory {
    names: RwLock<HashMap<Identity, String>>,
}

impl NameDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, identity: Identity, name: impl Into<String>) {
        self.names.write().insert(identity, name.into());
    }

    pub fn display_name(&self, identity: &Identity) -> String {
        self.names
            .read()
            .get(identity)
            .cloned()
            .unwrap_or_else(|| identity.to_string())
    }
}

impl FromIterator<(Identity, String)> for NameDirectory {
    fn from_iter<I: IntoIterator<Item = (Identity, String)>>(iter: I) -> Self {
        Self {
            names: RwLock::new(iter.into_iter().collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_to_identity() {
        let directory: NameDirectory =
            [(Identity::new("alice"), "Alice A.".to_string())].into_iter().collect();

        assert_eq!(directory.display_name(&Identity::new("alice")), "Alice A.");
        assert_eq!(directory.display_name(&Identity::new("bob")), "bob");

        directory.set(Identity::new("bob"), "Dr. Bob");
        assert_eq!(directory.display_name(&Identity::new("bob")), "Dr. Bob");
    }
}
