//! Error types for the wallet synchronization engine.

use thiserror::Error;

use dashcore::Txid;

/// Main error type for wallet synchronization.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Chain query error: {0}")]
    Chain(#[from] ChainError),

    #[error("Derivation error: {0}")]
    Derivation(#[from] DerivationError),

    /// The persisted address tree contradicts what the key source derives.
    /// The cache cannot be trusted past this point.
    #[error("Address cache inconsistency: {0}")]
    CacheInconsistency(String),

    /// The key source reported a different tree identity than the one the
    /// engine state is bound to.
    #[error("HD tree identity changed during operation")]
    IdentitySwitched,

    /// A higher-priority request asked for the scan slot. The interrupted
    /// operation stopped at a batch boundary and can be resubmitted.
    #[error("Scan interrupted by a higher-priority request")]
    ScanInterrupted,

    #[error("No key source attached")]
    NoKeySource,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// True for the cooperative-interrupt outcome, which callers are expected
    /// to treat as "try again later" rather than a failure.
    pub fn is_break(&self) -> bool {
        matches!(self, SyncError::ScanInterrupted)
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Store(StoreError::Sqlite(e))
    }
}

/// Storage-related errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Corrupt wallet data: {0}")]
    Corrupt(String),
}

/// Errors reported by the chain query backend.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transaction {0} not found")]
    TxNotFound(Txid),

    #[error("Invalid chain response: {0}")]
    InvalidResponse(String),
}

/// Key derivation errors.
#[derive(Debug, Error)]
pub enum DerivationError {
    #[error("BIP32 error: {0}")]
    Bip32(#[from] dashcore::bip32::Error),

    /// The key source could not produce the requested key, e.g. an
    /// external signer that stopped responding.
    #[error("Key source failed: {0}")]
    Source(String),
}

/// Convenience alias used throughout the crate.
pub type SyncResult<T> = Result<T, SyncError>;
