//! The synchronization engine and its public operations.
//!
//! One [`SyncEngine`] owns the store, the derivation cache, the diff
//! tracker and the scan slot. Clones share all of it, so a caller can hand
//! clones to worker threads and drive scans from one while reading from
//! another. Scanning operations go through the scheduler and may preempt
//! each other by priority; plain reads only take the state lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashcore::bip32::ExtendedPubKey;
use dashcore::secp256k1::Secp256k1;

use crate::chain::ChainQuery;
use crate::config::SyncConfig;
use crate::derivation::{self, AddressCache, EXTERNAL_CHAIN, INTERNAL_CHAIN};
use crate::error::{DerivationError, StoreError, SyncError, SyncResult};
use crate::events::{NotificationHub, WalletEvent, WalletObserver};
use crate::identity;
use crate::key_source::KeySource;
use crate::scan::{self, ScanSummary};
use crate::scheduler::{ScanPermit, ScanPriority, ScanScheduler};
use crate::store::{addresses, transactions, WalletStore};
use crate::types::{
    Account, AccountId, AccountStatus, AddressEntry, AddressId, HdTree, Scope, TreeId, TxRecord,
    Utxo, UtxoDiff,
};
use crate::utxo_tracker::{DiffTracker, Subscriptions};

/// Everything behind the state lock.
pub(crate) struct EngineState {
    pub(crate) store: WalletStore,
    pub(crate) key_source: Option<Box<dyn KeySource>>,
    pub(crate) cache: AddressCache,
    pub(crate) diffs: DiffTracker,
    pub(crate) subscriptions: Subscriptions,
    pub(crate) balance_checks: HashMap<AddressId, Instant>,
    pub(crate) pending_events: Vec<WalletEvent>,
}

/// State shared by every clone of the engine.
pub(crate) struct EngineShared<C: ChainQuery> {
    pub(crate) config: SyncConfig,
    pub(crate) chain: C,
    pub(crate) state: Mutex<EngineState>,
    pub(crate) scheduler: Arc<ScanScheduler>,
    pub(crate) hub: NotificationHub,
}

impl<C: ChainQuery> EngineShared<C> {
    /// Delivers queued observer events. Never called with the state lock
    /// held; callbacks run on the calling thread.
    pub(crate) fn drain_events(&self) {
        let events = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.pending_events)
        };
        self.hub.dispatch_all(events);
    }
}

/// HD wallet synchronization engine over a chain backend `C`.
pub struct SyncEngine<C: ChainQuery> {
    shared: Arc<EngineShared<C>>,
}

impl<C: ChainQuery> Clone for SyncEngine<C> {
    fn clone(&self) -> Self {
        SyncEngine {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: ChainQuery> SyncEngine<C> {
    pub fn new(config: SyncConfig, chain: C, store: WalletStore) -> SyncResult<Self> {
        config.validate().map_err(SyncError::Config)?;
        Ok(SyncEngine {
            shared: Arc::new(EngineShared {
                config,
                chain,
                state: Mutex::new(EngineState {
                    store,
                    key_source: None,
                    cache: AddressCache::new(),
                    diffs: DiffTracker::default(),
                    subscriptions: Subscriptions::default(),
                    balance_checks: HashMap::new(),
                    pending_events: Vec::new(),
                }),
                scheduler: ScanScheduler::new(),
                hub: NotificationHub::new(),
            }),
        })
    }

    /// Registers an observer for wallet change callbacks. Callbacks run on
    /// whichever thread triggered the change; keep them short.
    pub fn register_observer(&self, observer: Arc<dyn WalletObserver>) {
        self.shared.hub.register(observer);
    }

    /// Attaches or replaces the key source. Re-attaching the same identity
    /// only swaps the source; a different identity preempts any scan in
    /// flight and drops every per-identity cache before binding its tree.
    pub fn attach_key_source(&self, key_source: Box<dyn KeySource>) -> SyncResult<HdTree> {
        let ident = key_source.tree_ident()?;
        let _permit = self.shared.scheduler.acquire(ScanPriority::High);
        let mut state = self.shared.state.lock().unwrap();
        let EngineState {
            store,
            key_source: source_slot,
            cache,
            diffs,
            subscriptions,
            balance_checks,
            ..
        } = &mut *state;

        if let Some(tree) = cache.tree() {
            if tree.ident == ident {
                let tree = tree.clone();
                *source_slot = Some(key_source);
                return Ok(tree);
            }
        }

        let switching = cache.tree().is_some();
        cache.clear();
        diffs.reset();
        subscriptions.clear();
        balance_checks.clear();
        let tree = identity::load_or_create_tree(store.conn(), &ident)?;
        cache.bind(tree.clone());
        *source_slot = Some(key_source);
        if switching {
            tracing::info!("switched to hd tree {}", tree.ident);
        } else {
            tracing::info!("attached key source for hd tree {}", tree.ident);
        }
        Ok(tree)
    }

    /// Discovers and refreshes every account of the attached identity,
    /// then returns the visible ones. Runs at low priority, so any other
    /// wallet operation can preempt it.
    pub fn fetch_all_accounts(&self) -> SyncResult<Vec<Account>> {
        let permit = self.shared.scheduler.acquire(ScanPriority::Low);
        let tree_id = self.ensure_identity()?;
        let result = scan::run_wallet_scan(&self.shared, &permit, None);
        self.shared.drain_events();
        let summary = result?;
        log_summary(&summary);

        let state = self.shared.state.lock().unwrap();
        Ok(addresses::list_accounts(state.store.conn(), tree_id, false)?)
    }

    /// Scans one account and returns its addresses across both chains.
    pub fn fetch_account_addresses(&self, account_index: u32) -> SyncResult<Vec<AddressEntry>> {
        let permit = self.shared.scheduler.acquire(ScanPriority::Normal);
        let tree_id = self.ensure_identity()?;
        let result = scan::run_wallet_scan(&self.shared, &permit, Some(account_index));
        self.shared.drain_events();
        let summary = result?;
        log_summary(&summary);

        let entries = {
            let mut state = self.shared.state.lock().unwrap();
            let EngineState {
                store,
                cache,
                key_source,
                pending_events,
                ..
            } = &mut *state;
            let key_source = key_source.as_deref().ok_or(SyncError::NoKeySource)?;
            let account = derivation::account_by_index(
                store.conn(),
                cache,
                key_source,
                &self.shared.config,
                tree_id,
                account_index,
                pending_events,
            )?;
            let entries = addresses::list_account_addresses(store.conn(), account.id)?;
            pending_events.extend(entries.iter().cloned().map(WalletEvent::AddressLoaded));
            entries
        };
        self.shared.drain_events();
        Ok(entries)
    }

    /// Looks up a raw address string in the wallet. When the store does not
    /// know it, sweeps fresh derivations under a high priority permit, and
    /// persists the address if the sweep finds it.
    pub fn find_address(&self, address: &str) -> SyncResult<Option<AddressEntry>> {
        let tree_id = self.ensure_identity()?;
        {
            let state = self.shared.state.lock().unwrap();
            let conn = state.store.conn();
            if let Some(address_id) = state.cache.address_id_by_string(address) {
                let entry = addresses::address_by_id(conn, address_id)?.ok_or_else(|| {
                    StoreError::Corrupt(format!("cached address row {address_id} missing"))
                })?;
                return Ok(Some(entry));
            }
            if let Some(entry) = addresses::address_entry_by_string(conn, tree_id, address)? {
                return Ok(Some(entry));
            }
        }

        let permit = self.shared.scheduler.acquire(ScanPriority::High);
        let result = self.sweep_for_address(&permit, tree_id, address);
        self.shared.drain_events();
        result
    }

    /// Accounts of the bound tree, hidden ones excluded.
    pub fn list_accounts(&self) -> SyncResult<Vec<Account>> {
        let tree_id = self.ensure_identity()?;
        let state = self.shared.state.lock().unwrap();
        Ok(addresses::list_accounts(state.store.conn(), tree_id, false)?)
    }

    /// Unspent outputs within the scope, confirmed-height order.
    pub fn list_utxos(&self, scope: Scope) -> SyncResult<Vec<Utxo>> {
        let tree_id = self.ensure_identity()?;
        let state = self.shared.state.lock().unwrap();
        let conn = state.store.conn();
        let utxos = match scope {
            Scope::Wallet => transactions::list_utxos_for_tree(conn, tree_id)?,
            Scope::Account(account_id) => transactions::list_utxos_for_account(conn, account_id)?,
            Scope::Address(address_id) => transactions::list_utxos_for_address(conn, address_id)?,
        };
        Ok(utxos)
    }

    /// Transactions touching the scope, oldest confirmed first and
    /// unconfirmed last.
    pub fn list_transactions(&self, scope: Scope) -> SyncResult<Vec<TxRecord>> {
        let tree_id = self.ensure_identity()?;
        let state = self.shared.state.lock().unwrap();
        let conn = state.store.conn();
        let txs = match scope {
            Scope::Wallet => transactions::list_txs_for_tree(conn, tree_id)?,
            Scope::Account(account_id) => transactions::list_txs_for_account(conn, account_id)?,
            Scope::Address(address_id) => transactions::list_txs_for_address(conn, address_id)?,
        };
        Ok(txs)
    }

    /// UTXO set changes accumulated since the last [`reset_utxo_diff`].
    ///
    /// [`reset_utxo_diff`]: SyncEngine::reset_utxo_diff
    pub fn utxo_diff(&self) -> UtxoDiff {
        self.shared.state.lock().unwrap().diffs.snapshot()
    }

    /// Drops the accumulated diff and starts a fresh observation window.
    pub fn reset_utxo_diff(&self) {
        self.shared.state.lock().unwrap().diffs.reset();
    }

    /// Restricts future diff accumulation to the given account (additive;
    /// an empty subscription set means everything is recorded).
    pub fn subscribe_account(&self, account_id: AccountId) {
        self.shared
            .state
            .lock()
            .unwrap()
            .subscriptions
            .subscribe_account(account_id);
    }

    /// Restricts future diff accumulation to the given address (additive).
    pub fn subscribe_address(&self, address_id: AddressId) {
        self.shared
            .state
            .lock()
            .unwrap()
            .subscriptions
            .subscribe_address(address_id);
    }

    /// Clears all subscriptions; every change is recorded again.
    pub fn clear_subscriptions(&self) {
        self.shared.state.lock().unwrap().subscriptions.clear();
    }

    pub fn set_account_label(
        &self,
        account_id: AccountId,
        label: Option<&str>,
    ) -> SyncResult<()> {
        let state = self.shared.state.lock().unwrap();
        Ok(addresses::set_account_label(state.store.conn(), account_id, label)?)
    }

    pub fn set_account_status(
        &self,
        account_id: AccountId,
        status: AccountStatus,
    ) -> SyncResult<()> {
        let state = self.shared.state.lock().unwrap();
        Ok(addresses::set_account_status(state.store.conn(), account_id, status)?)
    }

    pub fn set_address_label(
        &self,
        address_id: AddressId,
        label: Option<&str>,
    ) -> SyncResult<()> {
        let state = self.shared.state.lock().unwrap();
        Ok(addresses::set_address_label(state.store.conn(), address_id, label)?)
    }

    /// Rewinds every scan cursor of the bound tree so the next scan
    /// refetches all history. Stored rows stay in place until that scan
    /// reconciles them against the refetched history.
    pub fn reset_scan_state(&self) -> SyncResult<usize> {
        let tree_id = self.ensure_identity()?;
        let _permit = self.shared.scheduler.acquire(ScanPriority::Normal);
        let state = self.shared.state.lock().unwrap();
        let count = addresses::reset_scan_heights(state.store.conn(), tree_id)?;
        tracing::info!("rewound scan cursors for {} addresses", count);
        Ok(count)
    }

    /// Binds the cache to the attached key source's tree, erroring out when
    /// no source is attached or the cache belongs to another identity.
    fn ensure_identity(&self) -> SyncResult<TreeId> {
        let mut state = self.shared.state.lock().unwrap();
        let EngineState {
            store,
            cache,
            key_source,
            ..
        } = &mut *state;
        identity::ensure_bound(store.conn(), cache, key_source.as_deref())
    }

    fn sweep_for_address(
        &self,
        permit: &ScanPermit,
        tree_id: TreeId,
        address: &str,
    ) -> SyncResult<Option<AddressEntry>> {
        let secp = Secp256k1::new();
        let accounts = {
            let state = self.shared.state.lock().unwrap();
            addresses::list_accounts(state.store.conn(), tree_id, true)?
        };

        for account in accounts {
            permit.checkpoint()?;
            let xpub = account
                .xpub
                .parse::<ExtendedPubKey>()
                .map_err(DerivationError::Bip32)?;
            for chain in [EXTERNAL_CHAIN, INTERNAL_CHAIN] {
                // derive up to one gap past the highest slot the store holds
                let bound = {
                    let state = self.shared.state.lock().unwrap();
                    let conn = state.store.conn();
                    let highest = match addresses::chain_row(conn, account.id, chain)? {
                        Some(chain_row_id) => addresses::list_chain_addresses(conn, chain_row_id)?
                            .last()
                            .map(|entry| entry.address_index + 1)
                            .unwrap_or(0),
                        None => 0,
                    };
                    (highest + self.shared.config.address_scan_gap_limit)
                        .min(self.shared.config.max_addresses_to_scan)
                };
                for index in 0..bound {
                    let derived = derivation::derive_address_string(
                        &secp,
                        &xpub,
                        chain,
                        index,
                        self.shared.config.network,
                    )?;
                    if derived != address {
                        continue;
                    }
                    let mut state = self.shared.state.lock().unwrap();
                    let EngineState {
                        store,
                        cache,
                        pending_events,
                        diffs,
                        subscriptions,
                        ..
                    } = &mut *state;
                    let mut diff_ops = Vec::new();
                    let entry = derivation::child_address(
                        store.conn(),
                        cache,
                        &self.shared.config,
                        &account,
                        chain,
                        index,
                        pending_events,
                        &mut diff_ops,
                    )?;
                    diffs.apply_ops(subscriptions, diff_ops);
                    return Ok(Some(entry));
                }
            }
        }
        Ok(None)
    }
}

fn log_summary(summary: &ScanSummary) {
    tracing::info!(
        "scan finished: {} accounts, {} addresses, {} new / {} promoted / {} orphaned / {} dropped txs, {} balances updated",
        summary.accounts_scanned,
        summary.addresses_scanned,
        summary.new_txs,
        summary.promoted_txs,
        summary.orphaned_txs,
        summary.dropped_txs,
        summary.balances_updated
    );
}
