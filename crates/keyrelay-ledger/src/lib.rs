//! # keyrelay Ledger
//!
//! Interfaces to the external access-control ledger and to the local ledger
//! signing key.
//!
//! ## Key Types
//!
//! - [`Ledger`] - Async trait: access checks, account checks, grants
//! - [`LedgerSigner`] - Signing with the local account's ledger key
//! - [`MemoryLedger`] - In-memory ledger for tests and development
//! - [`LedgerSeed`] - JSON seed file that populates a [`MemoryLedger`]

pub mod error;
pub mod memory;
pub mod seed;
pub mod traits;

pub use error::{LedgerError, Result};
pub use memory::MemoryLedger;
pub use seed::{LedgerSeed, SeedAccount, SeedGrant};
pub use traits::{Ledger, LedgerSigner, NoSigner};
