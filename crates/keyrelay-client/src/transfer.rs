//! Document transfer collaborator.
//!
//! Moving encrypted documents to and from the document server is outside the
//! relay protocol. The state machine only needs to list, download and upload
//! sealed blobs; any HTTP or object-store client can implement this trait.

use async_trait::async_trait;

use keyrelay_core::Identity;
use keyrelay_vault::DocumentId;

use crate::error::Result;

#[async_trait]
pub trait DocumentTransfer: Send + Sync {
    /// Ids of every document the server holds for `owner`.
    async fn list(&self, owner: &Identity) -> Result<Vec<DocumentId>>;

    /// The sealed bytes of one document.
    async fn download(&self, owner: &Identity, id: &DocumentId) -> Result<Vec<u8>>;

    /// Upload a new document. Returns the canonical id the server assigned.
    async fn upload(&self, owner: &Identity, id: &DocumentId, sealed: Vec<u8>)
        -> Result<DocumentId>;

    /// Replace an existing document, keeping its id.
    async fn replace(&self, owner: &Identity, id: &DocumentId, sealed: Vec<u8>) -> Result<()>;
}

/// An in-process document server.
pub mod memory {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    use parking_lot::Mutex;

    use crate::error::ClientError;

    /// Holds sealed documents per owner. `upload` assigns fresh ids, as a
    /// real server would.
    #[derive(Default)]
    pub struct MemoryTransfer {
        documents: Mutex<HashMap<Identity, BTreeMap<DocumentId, Vec<u8>>>>,
    }

    impl MemoryTransfer {
        pub fn new() -> Self {
            Self::default()
        }

        /// Store a document directly, bypassing `upload`.
        pub fn put(&self, owner: &Identity, id: DocumentId, sealed: Vec<u8>) {
            self.documents
                .lock()
                .entry(owner.clone())
                .or_default()
                .insert(id, sealed);
        }

        pub fn get(&self, owner: &Identity, id: &DocumentId) -> Option<Vec<u8>> {
            self.documents.lock().get(owner)?.get(id).cloned()
        }

        pub fn count(&self, owner: &Identity) -> usize {
            self.documents.lock().get(owner).map_or(0, BTreeMap::len)
        }
    }

    fn missing(owner: &Identity, id: &DocumentId) -> ClientError {
        ClientError::Transfer(format!("no document {id} for {owner}"))
    }

    #[async_trait]
    impl DocumentTransfer for MemoryTransfer {
        async fn list(&self, owner: &Identity) -> Result<Vec<DocumentId>> {
            Ok(self
                .documents
                .lock()
                .get(owner)
                .map(|docs| docs.keys().cloned().collect())
                .unwrap_or_default())
        }

        async fn download(&self, owner: &Identity, id: &DocumentId) -> Result<Vec<u8>> {
            self.get(owner, id).ok_or_else(|| missing(owner, id))
        }

        async fn upload(
            &self,
            owner: &Identity,
            _id: &DocumentId,
            sealed: Vec<u8>,
        ) -> Result<DocumentId> {
            let canonical = DocumentId::generate();
            self.put(owner, canonical.clone(), sealed);
            Ok(canonical)
        }

        async fn replace(&self, owner: &Identity, id: &DocumentId, sealed: Vec<u8>) -> Result<()> {
            let mut documents = self.documents.lock();
            let slot = documents
                .get_mut(owner)
                .and_then(|docs| docs.get_mut(id))
                .ok_or_else(|| missing(owner, id))?;
            *slot = sealed;
            Ok(())
        }
    }
}
