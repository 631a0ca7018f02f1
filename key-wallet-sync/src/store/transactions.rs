//! Transaction, output and spend-link queries.

use std::str::FromStr;

use dashcore::{OutPoint, Txid};
use rusqlite::types::Type;
use rusqlite::{named_params, Connection, OptionalExtension};

use crate::types::{AccountId, AddressId, TreeId, TxRecord, TxRowId, Utxo};

const TX_SELECT: &str =
    "SELECT id, txid, block_height, block_timestamp, coinbase FROM tx";

const UTXO_SELECT: &str = "SELECT o.id, t.txid, o.output_index, o.address_id, c.parent_id, o.address,
            o.satoshis, t.block_height, t.coinbase
     FROM tx_out o
     JOIN tx t ON o.tx_id = t.id
     JOIN address a ON o.address_id = a.id
     JOIN address c ON a.parent_id = c.id";

fn txid_from_column(index: usize, raw: String) -> rusqlite::Result<Txid> {
    Txid::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}

fn tx_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TxRecord> {
    Ok(TxRecord {
        id: row.get(0)?,
        txid: txid_from_column(1, row.get(1)?)?,
        block_height: row.get::<_, i64>(2)? as u32,
        timestamp: row.get::<_, i64>(3)?.max(0) as u64,
        coinbase: row.get(4)?,
    })
}

fn utxo_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Utxo> {
    Ok(Utxo {
        id: row.get(0)?,
        outpoint: OutPoint {
            txid: txid_from_column(1, row.get(1)?)?,
            vout: row.get::<_, i64>(2)? as u32,
        },
        address_id: row.get(3)?,
        account_id: row.get(4)?,
        address: row.get(5)?,
        satoshis: row.get::<_, i64>(6)?.max(0) as u64,
        block_height: row.get::<_, i64>(7)? as u32,
        coinbase: row.get(8)?,
    })
}

pub(crate) fn tx_by_txid(
    conn: &Connection,
    txid: &Txid,
) -> rusqlite::Result<Option<TxRecord>> {
    let sql = format!("{TX_SELECT} WHERE txid = :txid");
    conn.prepare_cached(&sql)?
        .query_row(named_params![":txid": txid.to_string()], tx_from_row)
        .optional()
}

pub(crate) fn insert_tx(
    conn: &Connection,
    txid: &Txid,
    block_height: u32,
    timestamp: u64,
    coinbase: bool,
) -> rusqlite::Result<TxRowId> {
    conn.prepare_cached(
        "INSERT INTO tx (txid, block_height, block_timestamp, coinbase)
         VALUES (:txid, :block_height, :block_timestamp, :coinbase)",
    )?
    .execute(named_params![
        ":txid": txid.to_string(),
        ":block_height": block_height as i64,
        ":block_timestamp": timestamp as i64,
        ":coinbase": coinbase,
    ])?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn update_tx_height(
    conn: &Connection,
    tx_row_id: TxRowId,
    block_height: u32,
    timestamp: u64,
) -> rusqlite::Result<()> {
    conn.prepare_cached(
        "UPDATE tx SET block_height = :block_height, block_timestamp = :block_timestamp
         WHERE id = :id",
    )?
    .execute(named_params![
        ":block_height": block_height as i64,
        ":block_timestamp": timestamp as i64,
        ":id": tx_row_id,
    ])?;
    Ok(())
}

/// Removes a transaction row together with its outputs and inputs, and
/// releases any spend marker the transaction held on other outputs.
pub(crate) fn delete_tx(conn: &Connection, tx_row_id: TxRowId) -> rusqlite::Result<()> {
    conn.prepare_cached(
        "UPDATE tx_out SET spent_tx_id = NULL, spent_input_index = NULL
         WHERE spent_tx_id = :id",
    )?
    .execute(named_params![":id": tx_row_id])?;
    conn.prepare_cached("DELETE FROM tx_in WHERE tx_id = :id")?
        .execute(named_params![":id": tx_row_id])?;
    conn.prepare_cached("DELETE FROM tx_out WHERE tx_id = :id")?
        .execute(named_params![":id": tx_row_id])?;
    conn.prepare_cached("DELETE FROM tx WHERE id = :id")?
        .execute(named_params![":id": tx_row_id])?;
    Ok(())
}

/// Output row as stored, independent of spend state.
pub(crate) struct OutputRow {
    pub id: i64,
    pub tx_id: TxRowId,
    pub output_index: u32,
    pub address_id: Option<AddressId>,
    pub satoshis: i64,
    pub spent_tx_id: Option<TxRowId>,
}

fn output_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutputRow> {
    Ok(OutputRow {
        id: row.get(0)?,
        tx_id: row.get(1)?,
        output_index: row.get::<_, i64>(2)? as u32,
        address_id: row.get(3)?,
        satoshis: row.get(4)?,
        spent_tx_id: row.get(5)?,
    })
}

const OUTPUT_SELECT: &str =
    "SELECT id, tx_id, output_index, address_id, satoshis, spent_tx_id FROM tx_out";

pub(crate) fn insert_tx_out(
    conn: &Connection,
    tx_row_id: TxRowId,
    output_index: u32,
    address_id: Option<AddressId>,
    address: Option<&str>,
    satoshis: i64,
) -> rusqlite::Result<i64> {
    conn.prepare_cached(
        "INSERT INTO tx_out (tx_id, output_index, address_id, address, satoshis)
         VALUES (:tx_id, :output_index, :address_id, :address, :satoshis)",
    )?
    .execute(named_params![
        ":tx_id": tx_row_id,
        ":output_index": output_index as i64,
        ":address_id": address_id,
        ":address": address,
        ":satoshis": satoshis,
    ])?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn insert_tx_in(
    conn: &Connection,
    tx_row_id: TxRowId,
    input_index: u32,
    source_txid: &Txid,
    source_vout: u32,
) -> rusqlite::Result<i64> {
    conn.prepare_cached(
        "INSERT INTO tx_in (tx_id, input_index, source_txid, source_vout)
         VALUES (:tx_id, :input_index, :source_txid, :source_vout)",
    )?
    .execute(named_params![
        ":tx_id": tx_row_id,
        ":input_index": input_index as i64,
        ":source_txid": source_txid.to_string(),
        ":source_vout": source_vout as i64,
    ])?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn outputs_of_tx(
    conn: &Connection,
    tx_row_id: TxRowId,
) -> rusqlite::Result<Vec<OutputRow>> {
    let sql = format!("{OUTPUT_SELECT} WHERE tx_id = :tx_id ORDER BY output_index");
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(named_params![":tx_id": tx_row_id], output_from_row)?;
    rows.collect()
}

pub(crate) fn output_by_id(
    conn: &Connection,
    output_row_id: i64,
) -> rusqlite::Result<Option<OutputRow>> {
    let sql = format!("{OUTPUT_SELECT} WHERE id = :id");
    conn.prepare_cached(&sql)?
        .query_row(named_params![":id": output_row_id], output_from_row)
        .optional()
}

pub(crate) fn output_by_index(
    conn: &Connection,
    tx_row_id: TxRowId,
    output_index: u32,
) -> rusqlite::Result<Option<OutputRow>> {
    let sql = format!("{OUTPUT_SELECT} WHERE tx_id = :tx_id AND output_index = :output_index");
    conn.prepare_cached(&sql)?
        .query_row(
            named_params![":tx_id": tx_row_id, ":output_index": output_index as i64],
            output_from_row,
        )
        .optional()
}

pub(crate) fn mark_output_spent(
    conn: &Connection,
    output_row_id: i64,
    spending_tx_id: TxRowId,
    input_index: u32,
) -> rusqlite::Result<()> {
    conn.prepare_cached(
        "UPDATE tx_out SET spent_tx_id = :spent_tx_id, spent_input_index = :spent_input_index
         WHERE id = :id",
    )?
    .execute(named_params![
        ":spent_tx_id": spending_tx_id,
        ":spent_input_index": input_index as i64,
        ":id": output_row_id,
    ])?;
    Ok(())
}

/// Outputs currently marked as spent by the given transaction.
pub(crate) fn outputs_spent_by_tx(
    conn: &Connection,
    spending_tx_id: TxRowId,
) -> rusqlite::Result<Vec<OutputRow>> {
    let sql = format!("{OUTPUT_SELECT} WHERE spent_tx_id = :spent_tx_id ORDER BY id");
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(named_params![":spent_tx_id": spending_tx_id], output_from_row)?;
    rows.collect()
}

/// An input row waiting for its source transaction to appear.
pub(crate) struct PendingSpend {
    pub spending_tx_id: TxRowId,
    pub input_index: u32,
    pub source_vout: u32,
}

/// Inputs across the store that reference outputs of `txid`. Used to close
/// spend links when a transaction arrives after its spenders.
pub(crate) fn pending_spends_of(
    conn: &Connection,
    txid: &Txid,
) -> rusqlite::Result<Vec<PendingSpend>> {
    let mut stmt = conn.prepare_cached(
        "SELECT tx_id, input_index, source_vout FROM tx_in
         WHERE source_txid = :source_txid",
    )?;
    let rows = stmt.query_map(named_params![":source_txid": txid.to_string()], |row| {
        Ok(PendingSpend {
            spending_tx_id: row.get(0)?,
            input_index: row.get::<_, i64>(1)? as u32,
            source_vout: row.get::<_, i64>(2)? as u32,
        })
    })?;
    rows.collect()
}

/// Links stored outputs that pay `address` to its (new) row. Outputs can
/// land in the store before the address they pay is derived; this closes
/// that gap when the address row appears. Returns the linked output rows.
pub(crate) fn bind_outputs_to_address(
    conn: &Connection,
    address_id: AddressId,
    address: &str,
) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id FROM tx_out WHERE address = :address AND address_id IS NULL",
    )?;
    let ids: Vec<i64> = stmt
        .query_map(named_params![":address": address], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    if ids.is_empty() {
        return Ok(ids);
    }
    conn.prepare_cached(
        "UPDATE tx_out SET address_id = :address_id
         WHERE address = :address AND address_id IS NULL",
    )?
    .execute(named_params![":address_id": address_id, ":address": address])?;
    Ok(ids)
}

/// All transactions still carried at the unconfirmed sentinel height.
pub(crate) fn list_unconfirmed_txs(conn: &Connection) -> rusqlite::Result<Vec<TxRecord>> {
    let sql = format!("{TX_SELECT} WHERE block_height = :height ORDER BY id");
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(
        named_params![":height": crate::types::UNCONFIRMED_BLOCK_HEIGHT as i64],
        tx_from_row,
    )?;
    rows.collect()
}

/// Confirmed transactions linked to one address, either paying it or
/// spending one of its outputs.
pub(crate) fn confirmed_txs_for_address(
    conn: &Connection,
    address_id: AddressId,
) -> rusqlite::Result<Vec<TxRecord>> {
    let sql = format!(
        "{TX_SELECT}
         WHERE block_height != :unconfirmed
           AND (id IN (SELECT tx_id FROM tx_out WHERE address_id = :address_id)
                OR id IN (SELECT spent_tx_id FROM tx_out
                          WHERE address_id = :address_id AND spent_tx_id IS NOT NULL))
         ORDER BY id"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(
        named_params![
            ":unconfirmed": crate::types::UNCONFIRMED_BLOCK_HEIGHT as i64,
            ":address_id": address_id,
        ],
        tx_from_row,
    )?;
    rows.collect()
}

/// Lifetime satoshis received and spent through one address.
pub(crate) fn address_sums(
    conn: &Connection,
    address_id: AddressId,
) -> rusqlite::Result<(i64, i64)> {
    let received: i64 = conn
        .prepare_cached(
            "SELECT COALESCE(SUM(satoshis), 0) FROM tx_out WHERE address_id = :address_id",
        )?
        .query_row(named_params![":address_id": address_id], |row| row.get(0))?;
    let spent: i64 = conn
        .prepare_cached(
            "SELECT COALESCE(SUM(satoshis), 0) FROM tx_out
             WHERE address_id = :address_id AND spent_tx_id IS NOT NULL",
        )?
        .query_row(named_params![":address_id": address_id], |row| row.get(0))?;
    Ok((received, spent))
}

/// Whether any output has ever paid this address.
pub(crate) fn address_has_activity(
    conn: &Connection,
    address_id: AddressId,
) -> rusqlite::Result<bool> {
    let count: i64 = conn
        .prepare_cached("SELECT COUNT(*) FROM tx_out WHERE address_id = :address_id")?
        .query_row(named_params![":address_id": address_id], |row| row.get(0))?;
    Ok(count > 0)
}

pub(crate) fn utxo_by_output_id(
    conn: &Connection,
    output_row_id: i64,
) -> rusqlite::Result<Option<Utxo>> {
    let sql = format!("{UTXO_SELECT} WHERE o.id = :id");
    conn.prepare_cached(&sql)?
        .query_row(named_params![":id": output_row_id], utxo_from_row)
        .optional()
}

pub(crate) fn list_utxos_for_tree(
    conn: &Connection,
    tree_id: TreeId,
) -> rusqlite::Result<Vec<Utxo>> {
    let sql = format!(
        "{UTXO_SELECT}
         JOIN address acct ON c.parent_id = acct.id
         WHERE o.spent_tx_id IS NULL AND acct.tree_id = :tree_id
         ORDER BY t.block_height, o.tx_id, o.output_index"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(named_params![":tree_id": tree_id], utxo_from_row)?;
    rows.collect()
}

pub(crate) fn list_utxos_for_account(
    conn: &Connection,
    account_id: AccountId,
) -> rusqlite::Result<Vec<Utxo>> {
    let sql = format!(
        "{UTXO_SELECT}
         WHERE o.spent_tx_id IS NULL AND c.parent_id = :account_id
         ORDER BY t.block_height, o.tx_id, o.output_index"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(named_params![":account_id": account_id], utxo_from_row)?;
    rows.collect()
}

pub(crate) fn list_utxos_for_address(
    conn: &Connection,
    address_id: AddressId,
) -> rusqlite::Result<Vec<Utxo>> {
    let sql = format!(
        "{UTXO_SELECT}
         WHERE o.spent_tx_id IS NULL AND o.address_id = :address_id
         ORDER BY t.block_height, o.tx_id, o.output_index"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(named_params![":address_id": address_id], utxo_from_row)?;
    rows.collect()
}

fn list_txs(
    conn: &Connection,
    scope_subquery: &str,
    param_name: &'static str,
    param: i64,
) -> rusqlite::Result<Vec<TxRecord>> {
    let sql = format!(
        "SELECT DISTINCT t.id, t.txid, t.block_height, t.block_timestamp, t.coinbase
         FROM tx t
         WHERE t.id IN (SELECT o.tx_id FROM tx_out o {scope_subquery})
            OR t.id IN (SELECT o.spent_tx_id FROM tx_out o {scope_subquery}
                        AND o.spent_tx_id IS NOT NULL)
         ORDER BY t.block_height, t.id"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let params: &[(&str, &dyn rusqlite::ToSql)] = &[(param_name, &param)];
    let rows = stmt.query_map(params, tx_from_row)?;
    rows.collect()
}

pub(crate) fn list_txs_for_tree(
    conn: &Connection,
    tree_id: TreeId,
) -> rusqlite::Result<Vec<TxRecord>> {
    list_txs(
        conn,
        "JOIN address a ON o.address_id = a.id
         JOIN address c ON a.parent_id = c.id
         JOIN address acct ON c.parent_id = acct.id
         WHERE acct.tree_id = :scope",
        ":scope",
        tree_id,
    )
}

pub(crate) fn list_txs_for_account(
    conn: &Connection,
    account_id: AccountId,
) -> rusqlite::Result<Vec<TxRecord>> {
    list_txs(
        conn,
        "JOIN address a ON o.address_id = a.id
         WHERE a.parent_id IN (SELECT id FROM address WHERE parent_id = :scope)",
        ":scope",
        account_id,
    )
}

pub(crate) fn list_txs_for_address(
    conn: &Connection,
    address_id: AddressId,
) -> rusqlite::Result<Vec<TxRecord>> {
    list_txs(conn, "WHERE o.address_id = :scope", ":scope", address_id)
}
