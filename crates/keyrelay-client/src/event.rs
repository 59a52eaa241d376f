//! Notifications for the application layer.

use keyrelay_core::Identity;
use keyrelay_vault::KeyFingerprint;

/// Something the application may want to show or react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// We now hold `from`'s document key.
    KeyImported {
        from: Identity,
        context: Option<String>,
    },

    /// `from` revoked our access; their documents and key are gone.
    KeyRevoked { from: Identity },

    /// `from` asked for our key. `answered` is set when the ledger already
    /// showed access granted and the key went out immediately.
    KeyRequested {
        from: Identity,
        fingerprint: KeyFingerprint,
        context: Option<String>,
        answered: bool,
    },

    /// `from` changed their key; a new request has been sent.
    PeerReencrypted { from: Identity },

    /// `from` granted us access.
    AccessGranted { from: Identity },

    /// `user` uploaded documents; `downloaded` of them were new to us.
    NewUpload { user: Identity, downloaded: usize },

    /// The relay refused something we sent.
    Rejected { reason: String },

    /// Reconnecting failed; the event loop has stopped.
    ConnectionLost { attempts: u32 },
}
