//! Key-exchange state machine.
//!
//! [`KeyExchange`] owns everything a client knows about its peers: the
//! [`ConnectionSets`], the document keys it holds, the peers' display names
//! and the session keypair (through its [`RequestBuilder`]). It is mutated
//! only by the client event loop, so none of it is locked.
//!
//! ## Inbound messages
//!
//! [`KeyExchange::apply`] handles one [`RelayMessage`] and returns a
//! [`Reaction`]: the messages to send back and the events to publish.
//! Nothing in `apply` fails; a message that cannot be honoured is logged and
//! dropped.
//!
//! ## User actions
//!
//! `grant_access`, `revoke_access`, `request_access`, `reencrypt` and
//! `save_and_upload` update local state first and return the messages to
//! send. The ledger remains the ground truth; `check_granted_status` and
//! `update` reconcile against it.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use keyrelay_core::{ClientMessage, Identity, LedgerPublicKey, LedgerSignature, RelayMessage};
use keyrelay_ledger::{Ledger, LedgerSigner};
use keyrelay_vault::{DocumentId, DocumentKey, DocumentVault, SessionKeyPair, SessionPublicKey};

use crate::error::{ClientError, Result};
use crate::event::ClientEvent;
use crate::requests::RequestBuilder;
use crate::state::{ConnectionSets, PendingKeyRequest};
use crate::transfer::DocumentTransfer;

/// The collaborators a [`KeyExchange`] works with.
#[derive(Clone)]
pub struct Services {
    pub ledger: Arc<dyn Ledger>,
    pub signer: Arc<dyn LedgerSigner>,
    pub vault: Arc<DocumentVault>,
    pub transfer: Arc<dyn DocumentTransfer>,
}

/// What applying one inbound message produced.
#[derive(Debug, Default)]
pub struct Reaction {
    pub outbound: Vec<ClientMessage>,
    pub events: Vec<ClientEvent>,
}

impl Reaction {
    fn event(event: ClientEvent) -> Self {
        Self {
            outbound: Vec::new(),
            events: vec![event],
        }
    }
}

/// Result of [`KeyExchange::check_granted_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantedStatus {
    pub granted: bool,
    pub key_available: bool,
}

pub struct KeyExchange {
    identity: Identity,
    display_name: String,
    requests: RequestBuilder,
    sets: ConnectionSets,
    /// Document keys by owner, our own included.
    keys: HashMap<Identity, DocumentKey>,
    names: HashMap<Identity, String>,
    ledger: Arc<dyn Ledger>,
    vault: Arc<DocumentVault>,
    transfer: Arc<dyn DocumentTransfer>,
}

impl KeyExchange {
    /// A fresh state machine with a newly generated document key.
    pub fn new(
        identity: Identity,
        display_name: impl Into<String>,
        services: Services,
        rsa_bits: usize,
    ) -> Self {
        let mut keys = HashMap::new();
        keys.insert(identity.clone(), DocumentKey::generate());

        Self {
            identity,
            display_name: display_name.into(),
            requests: RequestBuilder::new(services.signer, rsa_bits),
            sets: ConnectionSets::new(),
            keys,
            names: HashMap::new(),
            ledger: services.ledger,
            vault: services.vault,
            transfer: services.transfer,
        }
    }

    /// Replace our document key.
    pub fn with_document_key(mut self, key: DocumentKey) -> Self {
        self.keys.insert(self.identity.clone(), key);
        self
    }

    /// Use an existing session keypair.
    pub fn with_session(mut self, session: SessionKeyPair) -> Self {
        self.requests = self.requests.with_session(session);
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn signer(&self) -> &Arc<dyn LedgerSigner> {
        self.requests.signer()
    }

    pub fn connections(&self) -> &ConnectionSets {
        &self.sets
    }

    pub fn vault(&self) -> &Arc<DocumentVault> {
        &self.vault
    }

    /// The key we hold for `owner`, if any.
    pub fn document_key(&self, owner: &Identity) -> Option<&DocumentKey> {
        self.keys.get(owner)
    }

    pub fn peer_name(&self, peer: &Identity) -> Option<&str> {
        self.names.get(peer).map(String::as_str)
    }

    fn own_key(&self) -> Result<&DocumentKey> {
        self.keys
            .get(&self.identity)
            .ok_or_else(|| ClientError::NoKey(self.identity.clone()))
    }

    /// Wrap our key for `to`'s pending request, consuming it.
    fn answer_request(&mut self, to: &Identity) -> Result<ClientMessage> {
        let key = self
            .keys
            .get(&self.identity)
            .ok_or_else(|| ClientError::NoKey(self.identity.clone()))?;
        self.requests.build_send_key(&mut self.sets, to, key)
    }

    /// Drop everything we hold for `peer`: documents and key.
    fn purge(&mut self, peer: &Identity) -> usize {
        self.keys.remove(peer);
        self.vault.remove_owner(peer)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────

    /// Handle one message delivered by the relay.
    pub async fn apply(&mut self, message: RelayMessage) -> Reaction {
        match message {
            RelayMessage::ImportKey {
                from,
                display_name,
                key,
                context,
            } => self.on_import_key(from, display_name, &key, context),
            RelayMessage::RevokeKey { from } => self.on_revoke_key(from),
            RelayMessage::RequestKey {
                from,
                display_name,
                key,
                signature,
                ledger_key,
                context,
            } => {
                self.on_request_key(from, display_name, key, &signature, &ledger_key, context)
                    .await
            }
            RelayMessage::NotifyGranted { from, display_name } => {
                self.names.insert(from.clone(), display_name);
                self.sets.note_entitled(&from);
                debug!(%from, "access granted to us");
                Reaction::event(ClientEvent::AccessGranted { from })
            }
            RelayMessage::Reencrypt { from } => self.on_reencrypt(from),
            RelayMessage::NewUpload { user } => match self.update(&user).await {
                Ok(downloaded) => Reaction::event(ClientEvent::NewUpload { user, downloaded }),
                Err(e) => {
                    warn!(%user, error = %e, "reconciliation after upload failed");
                    Reaction::default()
                }
            },
            RelayMessage::Error { reason } => {
                warn!(%reason, "relay rejected a request");
                Reaction::event(ClientEvent::Rejected { reason })
            }
        }
    }

    fn on_import_key(
        &mut self,
        from: Identity,
        display_name: String,
        wrapped: &[u8],
        context: Option<String>,
    ) -> Reaction {
        let Some(session) = self.requests.session() else {
            warn!(%from, "key delivered before we requested any");
            return Reaction::default();
        };
        let key = match session.unwrap_key(wrapped) {
            Ok(key) => key,
            Err(e) => {
                warn!(%from, error = %e, "could not unwrap delivered key");
                return Reaction::default();
            }
        };

        self.keys.insert(from.clone(), key);
        self.names.insert(from.clone(), display_name);
        self.sets.mark_with_key(&from);
        info!(%from, "imported document key");
        Reaction::event(ClientEvent::KeyImported { from, context })
    }

    fn on_revoke_key(&mut self, from: Identity) -> Reaction {
        if from == self.identity {
            warn!("ignoring revoke naming ourselves");
            return Reaction::default();
        }
        let purged = self.purge(&from);
        self.sets.drop_key(&from);
        info!(%from, purged, "access revoked");
        Reaction::event(ClientEvent::KeyRevoked { from })
    }

    async fn on_request_key(
        &mut self,
        from: Identity,
        display_name: String,
        pem: String,
        signature: &LedgerSignature,
        ledger_key: &LedgerPublicKey,
        context: Option<String>,
    ) -> Reaction {
        match self.verify_request(&from, &pem, signature, ledger_key).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(%from, "dropping key request that does not verify");
                return Reaction::default();
            }
            Err(e) => {
                warn!(%from, error = %e, "could not verify key request");
                return Reaction::default();
            }
        }
        let key = match SessionPublicKey::from_pem(&pem) {
            Ok(key) => key,
            Err(e) => {
                warn!(%from, error = %e, "dropping key request with unusable session key");
                return Reaction::default();
            }
        };
        let fingerprint = key.fingerprint();

        self.names.insert(from.clone(), display_name);
        self.sets.record_request(
            &from,
            PendingKeyRequest {
                key,
                context: context.clone(),
            },
        );

        // A grant already on the ledger is answered without asking the user.
        let granted = match self.ledger.access_granted(&self.identity, &from).await {
            Ok(granted) => granted,
            Err(e) => {
                warn!(%from, error = %e, "ledger check failed; leaving request pending");
                false
            }
        };

        let mut reaction = Reaction::default();
        let mut answered = false;
        if granted {
            match self.answer_request(&from) {
                Ok(message) => {
                    self.sets.add_granted(&from);
                    reaction.outbound.push(message);
                    answered = true;
                    info!(%from, "sent key to granted requester");
                }
                Err(e) => warn!(%from, error = %e, "could not answer key request"),
            }
        } else {
            debug!(%from, %fingerprint, "key request pending");
        }

        reaction.events.push(ClientEvent::KeyRequested {
            from,
            fingerprint,
            context,
            answered,
        });
        reaction
    }

    async fn verify_request(
        &self,
        from: &Identity,
        pem: &str,
        signature: &LedgerSignature,
        ledger_key: &LedgerPublicKey,
    ) -> Result<bool> {
        if ledger_key.verify(pem.as_bytes(), signature).is_err() {
            return Ok(false);
        }
        Ok(self.ledger.check_account_key(from, ledger_key).await?)
    }

    fn on_reencrypt(&mut self, from: Identity) -> Reaction {
        let purged = self.purge(&from);
        self.sets.mark_without_key(&from);
        debug!(%from, purged, "peer re-encrypted");

        let mut reaction = Reaction::event(ClientEvent::PeerReencrypted { from: from.clone() });
        match self.requests.build_request_key(&from, None) {
            Ok(message) => reaction.outbound.push(message),
            Err(e) => warn!(%from, error = %e, "could not re-request key"),
        }
        reaction
    }

    // ─────────────────────────────────────────────────────────────────────
    // User actions
    // ─────────────────────────────────────────────────────────────────────

    /// Grant `to` access on the ledger. A pending request from `to` is
    /// answered with our key; otherwise `to` is notified.
    pub async fn grant_access(&mut self, to: &Identity) -> Result<Vec<ClientMessage>> {
        if !self.ledger.check_account_exists(to).await? {
            return Err(ClientError::UnknownAccount(to.clone()));
        }

        let already = self.ledger.access_granted(&self.identity, to).await?;
        if already {
            debug!(%to, "access already granted");
        } else {
            self.ledger.grant_access(&self.identity, to).await?;
            info!(%to, "granted access");
        }

        let mut outbound = Vec::new();
        if self.sets.pending(to).is_some() {
            outbound.push(self.answer_request(to)?);
        } else if !already {
            outbound.push(self.requests.build_notify_granted(to)?);
        }
        self.sets.add_granted(to);
        Ok(outbound)
    }

    /// Revoke `peer`'s access and tear down what we hold of theirs.
    pub async fn revoke_access(&mut self, peer: &Identity) -> Result<Vec<ClientMessage>> {
        let message = self.requests.build_revoke_key(peer)?;
        self.ledger.revoke_access(&self.identity, peer).await?;

        let purged = self.purge(peer);
        self.sets.drop_key(peer);
        self.sets.take_request(peer);
        if !self.sets.remove_granted(peer) {
            debug!(%peer, "revoked a peer we had not granted");
        }
        info!(%peer, purged, "revoked access");
        Ok(vec![message])
    }

    /// Ask `to` for their key. `to` leaves `without_key` while we wait.
    pub fn request_access(
        &mut self,
        to: &Identity,
        context: Option<String>,
    ) -> Result<Vec<ClientMessage>> {
        let message = self.requests.build_request_key(to, context)?;
        self.sets.note_requested(to);
        Ok(vec![message])
    }

    /// Abandon `from`'s pending request.
    pub fn deny_request(&mut self, from: &Identity) -> Result<()> {
        self.sets
            .take_request(from)
            .map(|_| ())
            .ok_or_else(|| ClientError::NoSuchPendingRequest(from.clone()))
    }

    /// Move our documents to a new key and tell every connected peer.
    ///
    /// Documents on the server but not held locally are fetched first so
    /// that every one is re-sealed and replaced.
    pub async fn reencrypt(&mut self) -> Result<Vec<ClientMessage>> {
        let me = self.identity.clone();
        let message = self.requests.build_reencrypt()?;
        self.update(&me).await?;

        let new_key = DocumentKey::generate();
        let count = self
            .vault
            .reencrypt(&me, self.own_key()?.as_bytes(), new_key.as_bytes())?;
        self.keys.insert(me.clone(), new_key);
        info!(count, "re-encrypted documents");

        for id in self.vault.list_ids(&me) {
            let sealed = self.vault.get(&me, &id)?;
            if let Err(e) = self.transfer.replace(&me, &id, sealed).await {
                warn!(%id, error = %e, "re-upload failed");
            }
        }
        Ok(vec![message])
    }

    /// Fetch `owner`'s documents we do not hold yet. Returns how many were
    /// downloaded.
    ///
    /// For another owner this first asks the ledger; without access their
    /// documents and key are dropped, they leave both key sets and the call
    /// fails with `AccessDenied`.
    pub async fn update(&mut self, owner: &Identity) -> Result<usize> {
        if owner != &self.identity && !self.ledger.access_granted(owner, &self.identity).await? {
            let purged = self.purge(owner);
            self.sets.forget_key_status(owner);
            info!(%owner, purged, "access withdrawn on the ledger");
            return Err(ClientError::AccessDenied(owner.clone()));
        }

        let mut downloaded = 0;
        for id in self.transfer.list(owner).await? {
            if self.vault.exists(owner, &id) {
                continue;
            }
            let sealed = self.transfer.download(owner, &id).await?;
            self.vault.save(owner, &id, sealed);
            downloaded += 1;
        }
        debug!(%owner, downloaded, "updated documents");
        Ok(downloaded)
    }

    /// Reconcile what we know about `peer` against the ledger.
    ///
    /// If `peer` still grants us access, `peer` ends up in `with_key` or
    /// `without_key` depending on whether we hold their key. If not, their
    /// documents and key are dropped and they leave both sets.
    pub async fn check_granted_status(&mut self, peer: &Identity) -> Result<GrantedStatus> {
        let granted = self.ledger.access_granted(peer, &self.identity).await?;
        if !granted {
            self.purge(peer);
            self.sets.forget_key_status(peer);
            return Ok(GrantedStatus {
                granted: false,
                key_available: false,
            });
        }

        let key_available = self.keys.contains_key(peer);
        if key_available {
            self.sets.mark_with_key(peer);
        } else {
            self.sets.mark_without_key(peer);
        }
        Ok(GrantedStatus {
            granted: true,
            key_available,
        })
    }

    /// Seal `plaintext` for `owner`, upload it and adopt the server's id.
    ///
    /// Uploading to our own bucket also returns a `NewUpload` announcement.
    pub async fn save_and_upload(
        &mut self,
        owner: &Identity,
        plaintext: &[u8],
    ) -> Result<(DocumentId, Vec<ClientMessage>)> {
        let key = self
            .keys
            .get(owner)
            .ok_or_else(|| ClientError::NoKey(owner.clone()))?;
        let mut outbound = Vec::new();
        if owner == &self.identity {
            outbound.push(self.requests.build_new_upload()?);
        }

        let local = self.vault.encrypt(owner, plaintext, key.as_bytes())?;
        let sealed = self.vault.get(owner, &local)?;
        let canonical = self.transfer.upload(owner, &local, sealed).await?;
        if canonical != local {
            self.vault.rename_id(owner, &local, &canonical)?;
        }
        debug!(%owner, id = %canonical, "uploaded document");
        Ok((canonical, outbound))
    }

    /// Decrypt one of `owner`'s documents with the key we hold for them.
    pub fn open_document(&self, owner: &Identity, id: &DocumentId) -> Result<Vec<u8>> {
        let key = self
            .keys
            .get(owner)
            .ok_or_else(|| ClientError::NoKey(owner.clone()))?;
        Ok(self.vault.decrypt(owner, id, key.as_bytes())?)
    }

    /// Text for an in-person introduction, e.g. encoded in a QR code.
    pub fn introduction(&self, context: Option<&str>) -> String {
        match context {
            Some(context) => format!("{}\n{}\n{}", self.identity, self.display_name, context),
            None => format!("{}\n{}", self.identity, self.display_name),
        }
    }
}
