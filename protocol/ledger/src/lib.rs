//! Per-identity, hash-chained action ledger.
//!
//! Every identity owns an append-only chain of [`ActionRecord`]s. Each record
//! commits to its predecessor through `prev_hash`, so rewriting or reordering
//! any record is detectable by [`ActionLedger::verify_chain`].

mod error;
mod identity;
mod ledger;
mod registry;
mod store;
mod types;

pub use error::{LedgerError, LedgerResult};
pub use identity::{sign_bytes, verify_signature_bytes, IdentityProvider, InMemoryIdentityProvider};
pub use ledger::{verify_records, ActionLedger, LedgerConfig, LedgerStatistics};
pub use registry::{ActionTypeEntry, ActionTypeRegistry};
pub use store::{FileLedgerStore, InMemoryLedgerStore, LedgerStore};
pub use types::{
    compute_record_hash, hash_payload, short_hex, ActionRecord, ActionType, Hash, GENESIS_HASH,
};
