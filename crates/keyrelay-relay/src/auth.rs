//! Connection authentication.
//!
//! The relay picks a random challenge for every accepted WebSocket and sends
//! it in the upgrade response header [`CHALLENGE_HEADER`]. The client's first
//! frame must be an `Authenticate` envelope signing that challenge with the
//! ledger key registered for the claimed account.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;

use keyrelay_core::{auth_challenge_message, Authenticate};
use keyrelay_ledger::Ledger;

use crate::error::Result;

pub use keyrelay_core::CHALLENGE_HEADER;

/// Close reason when the signature or account check fails.
pub const REASON_UNAUTHORIZED: &str = "unauthorized";

/// Close reason when no `Authenticate` arrives in time.
pub const REASON_NO_AUTH: &str = "no authentication received";

/// A fresh base64 challenge of 32 random bytes.
pub fn new_challenge() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

/// Whether `auth` proves control of `auth.user`'s ledger key for this
/// challenge.
pub async fn verify(ledger: &dyn Ledger, challenge: &str, auth: &Authenticate) -> Result<bool> {
    if !ledger.check_account_key(&auth.user, &auth.ledger_key).await? {
        return Ok(false);
    }
    let message = auth_challenge_message(challenge);
    Ok(auth.ledger_key.verify(&message, &auth.signature).is_ok())
}
