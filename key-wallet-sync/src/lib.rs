//! Key Wallet Sync Library
//!
//! This library keeps a BIP44 HD wallet synchronized against a chain
//! backend. It derives addresses on demand under a gap limit, ingests
//! transaction history idempotently into a SQLite-backed cache, tracks the
//! resulting UTXO set as consumable diffs, and reconciles balances from the
//! stored spend links. Scans are preemptible by priority so an interactive
//! request never waits behind a background sweep.

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

#[cfg(test)]
mod tests;

mod balance;
pub mod chain;
pub mod config;
mod derivation;
pub mod engine;
pub mod error;
pub mod events;
mod identity;
mod ingest;
pub mod key_source;
mod scan;
pub mod scheduler;
pub mod store;
pub mod types;
mod utxo_tracker;

pub use dashcore;

pub use chain::{
    AddressBalanceInfo, ChainQuery, ChainTransaction, ChainTxInput, ChainTxOutput, HistoryEntry,
};
pub use config::SyncConfig;
pub use derivation::{EXTERNAL_CHAIN, INTERNAL_CHAIN};
pub use engine::SyncEngine;
pub use error::{ChainError, DerivationError, StoreError, SyncError, SyncResult};
pub use events::WalletObserver;
pub use key_source::{KeySource, SoftwareKeySource};
pub use store::WalletStore;
pub use types::{
    Account, AccountId, AccountStatus, AddressEntry, AddressId, HdTree, Scope, TreeId, TxRecord,
    TxRowId, Utxo, UtxoDiff, UNCONFIRMED_BLOCK_HEIGHT,
};
