//! Scan orchestration: account discovery, batch sweeps, reconciliation.
//!
//! A scan holds its permit for the whole run but takes the state lock only
//! in short sections, always releasing it around network calls. Interrupt
//! checks sit at batch boundaries, so a preempting operation waits at most
//! one batch. Store writes for a batch land in a single transaction
//! together with the batch's cursor advance; observer events queue up under
//! the lock and go out after it is released.

use std::collections::HashSet;
use std::time::Instant;

use crate::balance;
use crate::chain::ChainQuery;
use crate::derivation::{self, EXTERNAL_CHAIN, INTERNAL_CHAIN};
use crate::engine::{EngineShared, EngineState};
use crate::error::{ChainError, SyncError, SyncResult};
use crate::ingest::{self, Disposition};
use crate::scheduler::ScanPermit;
use crate::store::transactions;
use crate::types::{Account, AddressId, TreeId, TxRecord};

/// Counters describing one finished scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub accounts_scanned: usize,
    pub addresses_scanned: usize,
    pub new_txs: usize,
    pub promoted_txs: usize,
    pub orphaned_txs: usize,
    pub dropped_txs: usize,
    pub balances_updated: usize,
}

/// Runs a full scan, or one account's when `target_account` is given.
/// Discovery walks accounts from zero and stops past the first one without
/// any transaction history.
pub(crate) fn run_wallet_scan<C: ChainQuery>(
    shared: &EngineShared<C>,
    permit: &ScanPermit,
    target_account: Option<u32>,
) -> SyncResult<ScanSummary> {
    let tip_height = shared.chain.block_height()?;
    let mut summary = ScanSummary::default();

    match target_account {
        Some(account_index) => {
            scan_account(shared, permit, tip_height, account_index, &mut summary)?;
            summary.accounts_scanned = 1;
        }
        None => {
            for account_index in 0..shared.config.max_bip44_accounts {
                let used = scan_account(shared, permit, tip_height, account_index, &mut summary)?;
                summary.accounts_scanned += 1;
                if !used {
                    break;
                }
            }
        }
    }

    reconcile_unconfirmed(shared, permit, &mut summary)?;
    network_balance_check(shared, permit)?;
    Ok(summary)
}

/// Scans both chains of one account, creating it first if the store has
/// never seen it. Returns whether any of its addresses has history.
fn scan_account<C: ChainQuery>(
    shared: &EngineShared<C>,
    permit: &ScanPermit,
    tip_height: u32,
    account_index: u32,
    summary: &mut ScanSummary,
) -> SyncResult<bool> {
    permit.checkpoint()?;
    let (tree_id, account) = {
        let mut state = shared.state.lock().unwrap();
        let EngineState {
            store,
            cache,
            key_source,
            pending_events,
            ..
        } = &mut *state;
        let key_source = key_source.as_deref().ok_or(SyncError::NoKeySource)?;
        let tree_id = cache.tree_id().ok_or(SyncError::NoKeySource)?;
        let account = derivation::account_by_index(
            store.conn(),
            cache,
            key_source,
            &shared.config,
            tree_id,
            account_index,
            pending_events,
        )?;
        (tree_id, account)
    };
    shared.drain_events();

    let mut any_used = false;
    for chain in [EXTERNAL_CHAIN, INTERNAL_CHAIN] {
        if scan_chain(shared, permit, tip_height, tree_id, &account, chain, summary)? {
            any_used = true;
        }
    }
    Ok(any_used)
}

/// Sweeps one chain of an account in batches until the gap limit or the
/// address ceiling stops it. A batch whose window covers the whole history
/// also drops stored confirmed transactions the backend stopped reporting.
fn scan_chain<C: ChainQuery>(
    shared: &EngineShared<C>,
    permit: &ScanPermit,
    tip_height: u32,
    tree_id: TreeId,
    account: &Account,
    chain: u32,
    summary: &mut ScanSummary,
) -> SyncResult<bool> {
    let gap_limit = shared.config.address_scan_gap_limit;
    let max_addresses = shared.config.max_addresses_to_scan;
    let mut consecutive_unused = 0u32;
    let mut next_index = 0u32;
    let mut any_used = false;

    while consecutive_unused < gap_limit && next_index < max_addresses {
        permit.checkpoint()?;
        let batch_size = shared.config.scan_batch_size.min(max_addresses - next_index);

        let batch = {
            let mut state = shared.state.lock().unwrap();
            let EngineState {
                store,
                cache,
                pending_events,
                diffs,
                subscriptions,
                ..
            } = &mut *state;
            let conn = store.conn();
            let mut diff_ops = Vec::new();
            let mut batch = Vec::with_capacity(batch_size as usize);
            for offset in 0..batch_size {
                let entry = derivation::child_address(
                    conn,
                    cache,
                    &shared.config,
                    account,
                    chain,
                    next_index + offset,
                    pending_events,
                    &mut diff_ops,
                )?;
                batch.push(entry);
            }
            diffs.apply_ops(subscriptions, diff_ops);
            batch
        };
        shared.drain_events();

        let Some(window) = ingest::plan_window(&batch, tip_height) else {
            break;
        };

        let address_strings: Vec<String> = batch.iter().map(|e| e.address.clone()).collect();
        let history = shared.chain.address_history(
            &address_strings,
            window.from_height,
            window.to_height,
            window.include_mempool,
        )?;

        let (to_fetch, fetched_txids) = {
            let state = shared.state.lock().unwrap();
            let conn = state.store.conn();
            let mut fetched_txids = HashSet::new();
            let mut to_fetch: Vec<(Disposition, dashcore::Txid)> = Vec::new();
            for entry in &history {
                if !fetched_txids.insert(entry.txid) {
                    continue;
                }
                let existing = transactions::tx_by_txid(conn, &entry.txid)?;
                if let Some(disposition) = ingest::classify_one(existing.as_ref(), entry) {
                    to_fetch.push((disposition, entry.txid));
                }
            }
            (to_fetch, fetched_txids)
        };

        let mut upserts = Vec::with_capacity(to_fetch.len());
        for (disposition, txid) in to_fetch {
            let tx = shared
                .chain
                .transaction(&txid, disposition.wants_fresh_detail())?;
            tx.validate()?;
            upserts.push((disposition, tx));
        }

        {
            let mut state = shared.state.lock().unwrap();
            let EngineState {
                store,
                diffs,
                subscriptions,
                pending_events,
                ..
            } = &mut *state;
            let batch_ids: Vec<AddressId> = batch.iter().map(|e| e.id).collect();
            let mut events = Vec::new();
            let store_tx = store.transaction()?;
            let mut outcome =
                ingest::apply_batch(&store_tx, tree_id, &batch_ids, window.to_height, &upserts)?;
            if window.covers_full_history() {
                ingest::purge_missing_txs(&store_tx, &batch_ids, &fetched_txids, &mut outcome)?;
            }
            let touched: Vec<AddressId> = outcome.touched.iter().copied().collect();
            let updated = balance::recompute_addresses(&store_tx, &touched, &mut events)?;
            store_tx.commit()?;
            diffs.apply_ops(subscriptions, outcome.diff_ops);
            pending_events.extend(events);
            summary.new_txs += outcome.new_txs;
            summary.promoted_txs += outcome.promoted_txs;
            summary.orphaned_txs += outcome.orphaned_txs;
            summary.dropped_txs += outcome.dropped_txs;
            summary.balances_updated += updated;
        }
        shared.drain_events();

        {
            let state = shared.state.lock().unwrap();
            let conn = state.store.conn();
            for entry in &batch {
                if transactions::address_has_activity(conn, entry.id)? {
                    any_used = true;
                    consecutive_unused = 0;
                } else {
                    consecutive_unused += 1;
                }
            }
        }

        summary.addresses_scanned += batch.len();
        next_index += batch_size;
    }
    Ok(any_used)
}

/// Settles transactions still carried as unconfirmed: ones that confirmed
/// are promoted, ones the backend dropped are removed with their spend
/// links released.
fn reconcile_unconfirmed<C: ChainQuery>(
    shared: &EngineShared<C>,
    permit: &ScanPermit,
    summary: &mut ScanSummary,
) -> SyncResult<()> {
    permit.checkpoint()?;
    let pending: Vec<TxRecord> = {
        let state = shared.state.lock().unwrap();
        transactions::list_unconfirmed_txs(state.store.conn())?
    };
    if pending.is_empty() {
        return Ok(());
    }

    let mut promotes = Vec::new();
    let mut drops = Vec::new();
    for record in &pending {
        match shared.chain.transaction(&record.txid, true) {
            Ok(tx) => {
                if tx.is_confirmed() {
                    tx.validate()?;
                    promotes.push((record.id, tx));
                }
            }
            Err(ChainError::TxNotFound(txid)) => {
                tracing::debug!("unconfirmed transaction {} left the mempool", txid);
                drops.push(record.id);
            }
            Err(e) => return Err(e.into()),
        }
    }
    if promotes.is_empty() && drops.is_empty() {
        return Ok(());
    }

    {
        let mut state = shared.state.lock().unwrap();
        let EngineState {
            store,
            diffs,
            subscriptions,
            pending_events,
            ..
        } = &mut *state;
        let mut events = Vec::new();
        let store_tx = store.transaction()?;
        let outcome = ingest::apply_reconcile(&store_tx, &promotes, &drops)?;
        let touched: Vec<AddressId> = outcome.touched.iter().copied().collect();
        let updated = balance::recompute_addresses(&store_tx, &touched, &mut events)?;
        store_tx.commit()?;
        diffs.apply_ops(subscriptions, outcome.diff_ops);
        pending_events.extend(events);
        summary.promoted_txs += outcome.promoted_txs;
        summary.dropped_txs += outcome.dropped_txs;
        summary.balances_updated += updated;
    }
    shared.drain_events();
    Ok(())
}

/// Cross-checks stored balances against the backend for funded addresses
/// whose last check has aged out. Disagreeing addresses get their cursors
/// rewound; the next sweep refetches their whole history and purges what
/// the chain no longer carries.
fn network_balance_check<C: ChainQuery>(
    shared: &EngineShared<C>,
    permit: &ScanPermit,
) -> SyncResult<()> {
    permit.checkpoint()?;
    let now = Instant::now();
    let due = {
        let state = shared.state.lock().unwrap();
        let Some(tree_id) = state.cache.tree_id() else {
            return Ok(());
        };
        balance::plan_network_check(
            state.store.conn(),
            tree_id,
            &state.balance_checks,
            shared.config.balance_check_interval,
            now,
        )?
    };
    if due.is_empty() {
        return Ok(());
    }

    let address_strings: Vec<String> = due.iter().map(|e| e.address.clone()).collect();
    let reports = shared.chain.address_balances(&address_strings)?;

    let mut state = shared.state.lock().unwrap();
    let stale = balance::apply_network_check(state.store.conn(), &due, &reports)?;
    for entry in &due {
        state.balance_checks.insert(entry.id, now);
    }
    if !stale.is_empty() {
        tracing::info!(
            "{} of {} cross-checked addresses scheduled for rescan",
            stale.len(),
            due.len()
        );
    }
    Ok(())
}
