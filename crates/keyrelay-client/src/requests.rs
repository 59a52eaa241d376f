//! Outbound request builder.
//!
//! Builds the typed messages a client sends. Transport is the caller's job:
//! every builder returns a [`ClientMessage`] to be encoded and written to the
//! live link.
//!
//! Every builder first checks that the local ledger key is usable and fails
//! with [`ClientError::SigningError`] otherwise.

use std::sync::Arc;

use tracing::debug;

use keyrelay_core::{ClientMessage, Identity, LedgerPublicKey};
use keyrelay_ledger::LedgerSigner;
use keyrelay_vault::{DocumentKey, SessionKeyPair};

use crate::error::{ClientError, Result};
use crate::state::ConnectionSets;

pub struct RequestBuilder {
    signer: Arc<dyn LedgerSigner>,
    rsa_bits: usize,
    /// Generated on the first `RequestKey` of the session.
    session: Option<SessionKeyPair>,
}

impl RequestBuilder {
    pub fn new(signer: Arc<dyn LedgerSigner>, rsa_bits: usize) -> Self {
        Self {
            signer,
            rsa_bits,
            session: None,
        }
    }

    /// Use an existing session keypair instead of generating one.
    pub fn with_session(mut self, session: SessionKeyPair) -> Self {
        self.session = Some(session);
        self
    }

    pub fn signer(&self) -> &Arc<dyn LedgerSigner> {
        &self.signer
    }

    /// The session keypair, if one exists yet.
    pub fn session(&self) -> Option<&SessionKeyPair> {
        self.session.as_ref()
    }

    fn ledger_key(&self) -> Result<LedgerPublicKey> {
        self.signer.public_key().map_err(ClientError::SigningError)
    }

    fn session_or_generate(&mut self) -> Result<&SessionKeyPair> {
        let session = match self.session.take() {
            Some(session) => session,
            None => {
                debug!(bits = self.rsa_bits, "generating session keypair");
                SessionKeyPair::generate(self.rsa_bits)?
            }
        };
        Ok(self.session.insert(session))
    }

    /// Answer `to`'s pending key request with `key` wrapped under the
    /// session key they presented. The pending request is consumed.
    pub fn build_send_key(
        &self,
        sets: &mut ConnectionSets,
        to: &Identity,
        key: &DocumentKey,
    ) -> Result<ClientMessage> {
        self.ledger_key()?;
        let wrapped = match sets.pending(to) {
            Some(request) => request.key.wrap(key)?,
            None => return Err(ClientError::NoSuchPendingRequest(to.clone())),
        };
        let context = sets.take_request(to).and_then(|request| request.context);

        Ok(ClientMessage::SendKey {
            to: to.clone(),
            key: wrapped,
            context,
        })
    }

    /// Ask `to` for their document key, presenting our session public key
    /// signed with our ledger key.
    pub fn build_request_key(
        &mut self,
        to: &Identity,
        context: Option<String>,
    ) -> Result<ClientMessage> {
        let ledger_key = self.ledger_key()?;
        let pem = self.session_or_generate()?.public_key().to_pem().to_string();
        let signature = self
            .signer
            .sign(pem.as_bytes())
            .map_err(ClientError::SigningError)?;

        Ok(ClientMessage::RequestKey {
            to: to.clone(),
            key: pem,
            signature,
            ledger_key,
            context,
        })
    }

    pub fn build_revoke_key(&self, to: &Identity) -> Result<ClientMessage> {
        self.ledger_key()?;
        Ok(ClientMessage::RevokeKey { to: to.clone() })
    }

    pub fn build_notify_granted(&self, to: &Identity) -> Result<ClientMessage> {
        self.ledger_key()?;
        Ok(ClientMessage::NotifyGranted { to: to.clone() })
    }

    pub fn build_reencrypt(&self) -> Result<ClientMessage> {
        self.ledger_key()?;
        Ok(ClientMessage::Reencrypt)
    }

    pub fn build_new_upload(&self) -> Result<ClientMessage> {
        self.ledger_key()?;
        Ok(ClientMessage::NewUpload)
    }
}
