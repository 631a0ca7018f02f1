//! SQLite-backed wallet cache.

pub(crate) mod addresses;
mod schema;
pub(crate) mod transactions;

use std::path::Path;

use rusqlite::{Connection, Transaction};

use crate::error::StoreError;

/// Owns the SQLite connection holding the wallet cache.
///
/// All access is serialized behind the engine's state lock, so a single
/// connection is enough.
pub struct WalletStore {
    conn: Connection,
}

impl WalletStore {
    /// Opens a wallet cache at the given path, creating it if needed. The
    /// schema is applied on every open.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens a transient in-memory cache.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        schema::init(&conn)?;
        Ok(Self { conn })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Starts a write transaction covering one apply step.
    pub(crate) fn transaction(&mut self) -> Result<Transaction<'_>, StoreError> {
        Ok(self.conn.transaction()?)
    }
}
