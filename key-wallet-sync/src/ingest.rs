//! Transaction ingestion: history classification and idempotent upserts.
//!
//! A scan batch turns into three phases. History entries are classified
//! against what the store already holds, only the transactions that need
//! work are fetched in full, and the resulting upserts are applied in one
//! store transaction together with the batch's cursor advance. Applying the
//! same history twice is a no-op by construction: every entry classifies as
//! unchanged the second time around.

use std::collections::{BTreeSet, HashSet};

use dashcore::Txid;
use rusqlite::Connection;

use crate::chain::{ChainTransaction, HistoryEntry};
use crate::error::SyncResult;
use crate::store::{addresses, transactions};
use crate::types::{AddressEntry, AddressId, TreeId, TxRecord, TxRowId};
use crate::utxo_tracker::DiffOp;

/// Height range one batch asks the backend about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ScanWindow {
    pub(crate) from_height: u32,
    pub(crate) to_height: u32,
    pub(crate) include_mempool: bool,
}

impl ScanWindow {
    /// True when the response holds the complete history of every queried
    /// address, so a stored transaction absent from it is gone from the
    /// chain and not merely below the window.
    pub(crate) fn covers_full_history(&self) -> bool {
        self.from_height == 1 && self.to_height >= 1
    }
}

/// Window for a batch of addresses, starting one block past the least
/// advanced cursor in the batch. The window never starts past the tip, so a
/// fully caught up batch still covers the tip block and the mempool.
pub(crate) fn plan_window(batch: &[AddressEntry], tip_height: u32) -> Option<ScanWindow> {
    let min_scanned = batch.iter().map(|e| e.last_scan_block_height).min()?;
    let from_height = min_scanned.saturating_add(1).clamp(1, tip_height.max(1));
    Some(ScanWindow {
        from_height,
        to_height: tip_height,
        include_mempool: true,
    })
}

/// What ingestion has to do about one history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Not in the store yet.
    New,
    /// Stored unconfirmed, now seen in a block.
    Promote(TxRowId),
    /// Stored at a height the chain no longer agrees with.
    Orphan(TxRowId),
}

impl Disposition {
    /// Promotions and orphans must bypass any backend transaction cache,
    /// their cached detail predates the reorg or confirmation.
    pub(crate) fn wants_fresh_detail(&self) -> bool {
        !matches!(self, Disposition::New)
    }
}

/// Classifies one history entry against the stored row, `None` meaning the
/// store already agrees with the chain.
pub(crate) fn classify_one(
    existing: Option<&TxRecord>,
    entry: &HistoryEntry,
) -> Option<Disposition> {
    let Some(row) = existing else {
        return Some(Disposition::New);
    };
    match entry.block_height {
        None if row.is_confirmed() => Some(Disposition::Orphan(row.id)),
        None => None,
        Some(_) if !row.is_confirmed() => Some(Disposition::Promote(row.id)),
        Some(height) if row.block_height != height => Some(Disposition::Orphan(row.id)),
        Some(_) => None,
    }
}

/// Everything one applied batch produced, for the caller to fold into the
/// diff tracker, the balance pass and the scan summary.
#[derive(Default)]
pub(crate) struct ApplyOutcome {
    pub(crate) new_txs: usize,
    pub(crate) promoted_txs: usize,
    pub(crate) orphaned_txs: usize,
    pub(crate) dropped_txs: usize,
    pub(crate) diff_ops: Vec<DiffOp>,
    pub(crate) touched: BTreeSet<AddressId>,
}

/// Applies classified upserts for one batch and advances the batch cursor,
/// all against the same connection. Callers wrap this in a store
/// transaction so a failed batch leaves no partial state behind.
pub(crate) fn apply_batch(
    conn: &Connection,
    tree_id: TreeId,
    batch_ids: &[AddressId],
    cursor_height: u32,
    upserts: &[(Disposition, ChainTransaction)],
) -> SyncResult<ApplyOutcome> {
    let mut outcome = ApplyOutcome::default();
    for (disposition, tx) in upserts {
        match disposition {
            Disposition::New => {
                insert_chain_tx(conn, tree_id, tx, &mut outcome)?;
                outcome.new_txs += 1;
            }
            Disposition::Promote(row_id) => {
                promote_tx(conn, *row_id, tx, &mut outcome)?;
                outcome.promoted_txs += 1;
            }
            Disposition::Orphan(row_id) => {
                reorg_tx(conn, tree_id, *row_id, tx, &mut outcome)?;
                outcome.orphaned_txs += 1;
            }
        }
    }
    addresses::set_last_scan_height(conn, batch_ids, cursor_height)?;
    Ok(outcome)
}

/// Applies the outcome of a mempool reconciliation pass: transactions that
/// confirmed are promoted, transactions the backend dropped are removed.
pub(crate) fn apply_reconcile(
    conn: &Connection,
    promotes: &[(TxRowId, ChainTransaction)],
    drops: &[TxRowId],
) -> SyncResult<ApplyOutcome> {
    let mut outcome = ApplyOutcome::default();
    for (row_id, tx) in promotes {
        promote_tx(conn, *row_id, tx, &mut outcome)?;
        outcome.promoted_txs += 1;
    }
    for row_id in drops {
        remove_tx(conn, *row_id, &mut outcome)?;
    }
    Ok(outcome)
}

/// Drops stored confirmed transactions of the batch addresses that the
/// fetched history no longer mentions. Callers gate this on windows that
/// cover the whole history, absence from a partial window proves nothing.
/// Unconfirmed rows are left to the mempool reconciliation pass.
pub(crate) fn purge_missing_txs(
    conn: &Connection,
    batch_ids: &[AddressId],
    fetched: &HashSet<Txid>,
    outcome: &mut ApplyOutcome,
) -> SyncResult<()> {
    let mut checked = HashSet::new();
    for address_id in batch_ids {
        for record in transactions::confirmed_txs_for_address(conn, *address_id)? {
            if !checked.insert(record.id) || fetched.contains(&record.txid) {
                continue;
            }
            tracing::debug!(
                "confirmed transaction {} is gone from the chain, removing",
                record.txid
            );
            remove_tx(conn, record.id, outcome)?;
        }
    }
    Ok(())
}

/// Inserts a transaction the store has never seen, wiring spend links in
/// both directions. Outputs paying addresses outside the wallet are stored
/// with their address text only, so a later derivation can adopt them.
fn insert_chain_tx(
    conn: &Connection,
    tree_id: TreeId,
    tx: &ChainTransaction,
    outcome: &mut ApplyOutcome,
) -> SyncResult<TxRowId> {
    let tx_row_id = transactions::insert_tx(
        conn,
        &tx.txid,
        tx.store_height(),
        tx.timestamp.unwrap_or(0),
        tx.coinbase,
    )?;

    for output in &tx.outputs {
        let address_id = match &output.address {
            Some(address) => addresses::address_entry_by_string(conn, tree_id, address)?
                .map(|entry| entry.id),
            None => None,
        };
        transactions::insert_tx_out(
            conn,
            tx_row_id,
            output.index,
            address_id,
            output.address.as_deref(),
            output.satoshis as i64,
        )?;
        if let Some(address_id) = address_id {
            outcome.touched.insert(address_id);
        }
    }

    // spenders that arrived before this transaction now find their source
    for pending in transactions::pending_spends_of(conn, &tx.txid)? {
        let Some(output) = transactions::output_by_index(conn, tx_row_id, pending.source_vout)?
        else {
            continue;
        };
        transactions::mark_output_spent(
            conn,
            output.id,
            pending.spending_tx_id,
            pending.input_index,
        )?;
        if let Some(address_id) = output.address_id {
            outcome.touched.insert(address_id);
        }
    }

    for (input_index, input) in tx.inputs.iter().enumerate() {
        let input_index = input_index as u32;
        transactions::insert_tx_in(conn, tx_row_id, input_index, &input.source_txid, input.source_vout)?;
        let Some(source) = transactions::tx_by_txid(conn, &input.source_txid)? else {
            continue;
        };
        let Some(output) = transactions::output_by_index(conn, source.id, input.source_vout)?
        else {
            continue;
        };
        if output.spent_tx_id.is_some() {
            continue;
        }
        if output.address_id.is_some() {
            if let Some(utxo) = transactions::utxo_by_output_id(conn, output.id)? {
                outcome.diff_ops.push(DiffOp::Removed(utxo));
            }
        }
        transactions::mark_output_spent(conn, output.id, tx_row_id, input_index)?;
        if let Some(address_id) = output.address_id {
            outcome.touched.insert(address_id);
        }
    }

    // whatever survived unspent on our addresses enters the utxo set
    for output in transactions::outputs_of_tx(conn, tx_row_id)? {
        if output.address_id.is_none() || output.spent_tx_id.is_some() {
            continue;
        }
        if let Some(utxo) = transactions::utxo_by_output_id(conn, output.id)? {
            outcome.diff_ops.push(DiffOp::Added(utxo));
        }
    }

    Ok(tx_row_id)
}

/// Moves an unconfirmed row to its confirmed height. Balances do not move,
/// but consumers holding the utxo learn about the new height.
fn promote_tx(
    conn: &Connection,
    tx_row_id: TxRowId,
    tx: &ChainTransaction,
    outcome: &mut ApplyOutcome,
) -> SyncResult<()> {
    transactions::update_tx_height(conn, tx_row_id, tx.store_height(), tx.timestamp.unwrap_or(0))?;
    for output in transactions::outputs_of_tx(conn, tx_row_id)? {
        if output.address_id.is_none() || output.spent_tx_id.is_some() {
            continue;
        }
        if let Some(utxo) = transactions::utxo_by_output_id(conn, output.id)? {
            outcome.diff_ops.push(DiffOp::Modified(utxo));
        }
    }
    Ok(())
}

/// Replaces a row whose recorded height the chain disowned. The old
/// incarnation is deleted, which releases its spend markers, and the fresh
/// detail is inserted like a new transaction. Spenders of the old outputs
/// re-link through their recorded inputs.
fn reorg_tx(
    conn: &Connection,
    tree_id: TreeId,
    tx_row_id: TxRowId,
    tx: &ChainTransaction,
    outcome: &mut ApplyOutcome,
) -> SyncResult<()> {
    tracing::debug!(
        "transaction {} moved by a reorg, reingesting at height {:?}",
        tx.txid,
        tx.block_height
    );
    for output in transactions::outputs_of_tx(conn, tx_row_id)? {
        let Some(address_id) = output.address_id else {
            continue;
        };
        outcome.touched.insert(address_id);
        if output.spent_tx_id.is_none() {
            if let Some(utxo) = transactions::utxo_by_output_id(conn, output.id)? {
                outcome.diff_ops.push(DiffOp::Removed(utxo));
            }
        }
    }
    let released = transactions::outputs_spent_by_tx(conn, tx_row_id)?;
    transactions::delete_tx(conn, tx_row_id)?;
    for output in released {
        let Some(address_id) = output.address_id else {
            continue;
        };
        outcome.touched.insert(address_id);
        if let Some(utxo) = transactions::utxo_by_output_id(conn, output.id)? {
            outcome.diff_ops.push(DiffOp::Added(utxo));
        }
    }
    insert_chain_tx(conn, tree_id, tx, outcome)?;
    Ok(())
}

/// Removes a transaction the backend no longer knows about. Outputs it was
/// spending become unspent again.
fn remove_tx(conn: &Connection, tx_row_id: TxRowId, outcome: &mut ApplyOutcome) -> SyncResult<()> {
    for output in transactions::outputs_of_tx(conn, tx_row_id)? {
        let Some(address_id) = output.address_id else {
            continue;
        };
        outcome.touched.insert(address_id);
        if output.spent_tx_id.is_none() {
            if let Some(utxo) = transactions::utxo_by_output_id(conn, output.id)? {
                outcome.diff_ops.push(DiffOp::Removed(utxo));
            }
        }
    }
    let released = transactions::outputs_spent_by_tx(conn, tx_row_id)?;
    transactions::delete_tx(conn, tx_row_id)?;
    for output in released {
        let Some(address_id) = output.address_id else {
            continue;
        };
        outcome.touched.insert(address_id);
        if let Some(utxo) = transactions::utxo_by_output_id(conn, output.id)? {
            outcome.diff_ops.push(DiffOp::Added(utxo));
        }
    }
    outcome.dropped_txs += 1;
    Ok(())
}
