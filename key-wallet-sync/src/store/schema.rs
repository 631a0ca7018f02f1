//! Wallet cache schema.
//!
//! The address tree is one self-referential table: account rows carry the
//! xpub and its hash and no parent, chain rows hang off accounts, leaf rows
//! hang off chains and carry the actual address. Transactions are split
//! across `tx`, `tx_out` and `tx_in`, with spend links resolved on `tx_out`.

use rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS hd_tree (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ident TEXT NOT NULL UNIQUE,
    label TEXT
);

CREATE TABLE IF NOT EXISTS address (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_id INTEGER,
    tree_id INTEGER,
    xpub_hash TEXT,
    xpub TEXT,
    address_index INTEGER,
    address TEXT,
    path TEXT,
    label TEXT,
    status INTEGER NOT NULL DEFAULT 1,
    balance INTEGER NOT NULL DEFAULT 0,
    received INTEGER NOT NULL DEFAULT 0,
    last_scan_block_height INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_address_parent_slot
    ON address (parent_id, address_index) WHERE parent_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_address_address
    ON address (address) WHERE address IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_address_xpub_hash
    ON address (xpub_hash) WHERE xpub_hash IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_address_tree
    ON address (tree_id) WHERE tree_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS tx (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    txid TEXT NOT NULL UNIQUE,
    block_height INTEGER NOT NULL,
    block_timestamp INTEGER NOT NULL DEFAULT 0,
    coinbase INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_tx_height ON tx (block_height);

CREATE TABLE IF NOT EXISTS tx_out (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_id INTEGER NOT NULL,
    output_index INTEGER NOT NULL,
    address_id INTEGER,
    address TEXT,
    satoshis INTEGER NOT NULL,
    spent_tx_id INTEGER,
    spent_input_index INTEGER,
    UNIQUE (tx_id, output_index)
);

CREATE INDEX IF NOT EXISTS idx_tx_out_address
    ON tx_out (address_id) WHERE address_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_tx_out_spent
    ON tx_out (spent_tx_id) WHERE spent_tx_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS tx_in (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tx_id INTEGER NOT NULL,
    input_index INTEGER NOT NULL,
    source_txid TEXT NOT NULL,
    source_vout INTEGER NOT NULL,
    UNIQUE (tx_id, input_index)
);

CREATE INDEX IF NOT EXISTS idx_tx_in_source ON tx_in (source_txid, source_vout);
";

/// Creates all tables and indexes. Safe to run on every open.
pub(crate) fn init(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA)
}
