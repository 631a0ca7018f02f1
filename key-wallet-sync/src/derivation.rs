//! BIP44 address derivation backed by the persistent cache.
//!
//! Derivation never happens twice for the same slot if the store already
//! holds it. The in-memory [`AddressCache`] keeps row ids and parsed xpubs
//! for the lifetime of one attached key source, so a steady-state sweep over
//! known addresses touches SQLite only for the per-row reads it actually
//! needs. All writes go through the store immediately; the cache holds no
//! state that cannot be rebuilt from it.

use std::collections::HashMap;

use dashcore::bip32::{ChildNumber, DerivationPath, ExtendedPubKey};
use dashcore::hashes::{sha256, Hash};
use dashcore::secp256k1::{All, Secp256k1};
use dashcore::{Address, Network};
use rusqlite::Connection;

use crate::config::SyncConfig;
use crate::error::{DerivationError, StoreError, SyncError, SyncResult};
use crate::events::WalletEvent;
use crate::key_source::KeySource;
use crate::store::{addresses, transactions};
use crate::types::{Account, AccountId, AddressEntry, AddressId, HdTree, TreeId};
use crate::utxo_tracker::DiffOp;

/// External (receive) chain index within an account.
pub const EXTERNAL_CHAIN: u32 = 0;
/// Internal (change) chain index within an account.
pub const INTERNAL_CHAIN: u32 = 1;

/// In-memory view of the derivation tree for the attached key source.
///
/// Bound to exactly one [`HdTree`] at a time. Switching key sources clears
/// it wholesale; there is no eviction.
pub(crate) struct AddressCache {
    tree: Option<HdTree>,
    accounts_by_hash: HashMap<String, AccountId>,
    xpubs: HashMap<AccountId, ExtendedPubKey>,
    chain_rows: HashMap<(AccountId, u32), i64>,
    slots: HashMap<(i64, u32), AddressId>,
    by_address: HashMap<String, AddressId>,
    secp: Secp256k1<All>,
}

impl AddressCache {
    pub(crate) fn new() -> Self {
        AddressCache {
            tree: None,
            accounts_by_hash: HashMap::new(),
            xpubs: HashMap::new(),
            chain_rows: HashMap::new(),
            slots: HashMap::new(),
            by_address: HashMap::new(),
            secp: Secp256k1::new(),
        }
    }

    /// Drops everything except the secp context.
    pub(crate) fn clear(&mut self) {
        self.tree = None;
        self.accounts_by_hash.clear();
        self.xpubs.clear();
        self.chain_rows.clear();
        self.slots.clear();
        self.by_address.clear();
    }

    pub(crate) fn bind(&mut self, tree: HdTree) {
        self.tree = Some(tree);
    }

    pub(crate) fn tree(&self) -> Option<&HdTree> {
        self.tree.as_ref()
    }

    pub(crate) fn tree_id(&self) -> Option<TreeId> {
        self.tree.as_ref().map(|t| t.id)
    }

    pub(crate) fn address_id_by_string(&self, address: &str) -> Option<AddressId> {
        self.by_address.get(address).copied()
    }

    fn remember_address(&mut self, address: String, id: AddressId) {
        self.by_address.insert(address, id);
    }
}

/// Derivation path of a BIP44 account: `m/44'/coin'/account'`.
pub(crate) fn account_derivation_path(
    coin_type: u32,
    account_index: u32,
) -> Result<DerivationPath, DerivationError> {
    Ok(DerivationPath::from(vec![
        ChildNumber::from_hardened_idx(44)?,
        ChildNumber::from_hardened_idx(coin_type)?,
        ChildNumber::from_hardened_idx(account_index)?,
    ]))
}

/// P2PKH address string for one leaf under an account xpub.
pub(crate) fn derive_address_string(
    secp: &Secp256k1<All>,
    account_xpub: &ExtendedPubKey,
    chain: u32,
    address_index: u32,
    network: Network,
) -> Result<String, DerivationError> {
    let path = DerivationPath::from(vec![
        ChildNumber::from_normal_idx(chain)?,
        ChildNumber::from_normal_idx(address_index)?,
    ]);
    let child = account_xpub.derive_pub(secp, &path)?;
    let address = Address::p2pkh(&dashcore::PublicKey::new(child.public_key), network);
    Ok(address.to_string())
}

/// Identifying hash of an account xpub, as stored in the `xpub_hash` column.
pub(crate) fn xpub_hash(xpub: &ExtendedPubKey) -> String {
    sha256::Hash::hash(xpub.to_string().as_bytes()).to_string()
}

/// Account at `account_index` of the bound tree, derived through the key
/// source and persisted on first sight. Repeated calls resolve through the
/// cache without touching the key source result twice for the store lookup.
pub(crate) fn account_by_index(
    conn: &Connection,
    cache: &mut AddressCache,
    key_source: &dyn KeySource,
    config: &SyncConfig,
    tree_id: TreeId,
    account_index: u32,
    events: &mut Vec<WalletEvent>,
) -> SyncResult<Account> {
    let path = account_derivation_path(config.coin_type(), account_index)?;
    let xpub = key_source.xpub_at(&path)?;
    let hash = xpub_hash(&xpub);

    if let Some(&account_id) = cache.accounts_by_hash.get(&hash) {
        let account = addresses::account_by_id(conn, account_id)?.ok_or_else(|| {
            StoreError::Corrupt(format!("cached account row {account_id} missing"))
        })?;
        return Ok(account);
    }

    let account = match addresses::account_by_xpub_hash(conn, tree_id, &hash)? {
        Some(account) => {
            if account.account_index != account_index {
                return Err(SyncError::CacheInconsistency(format!(
                    "xpub hash {} stored at account index {} but derived for index {}",
                    hash, account.account_index, account_index
                )));
            }
            account
        }
        None => {
            let path_str = format!("m/44'/{}'/{}'", config.coin_type(), account_index);
            let account_id = addresses::insert_account(
                conn,
                tree_id,
                account_index,
                &xpub.to_string(),
                &hash,
                &path_str,
            )?;
            let account = addresses::account_by_id(conn, account_id)?.ok_or_else(|| {
                StoreError::Corrupt(format!("account row {account_id} vanished after insert"))
            })?;
            tracing::debug!(
                "created account #{} for tree {} at {}",
                account_index + 1,
                tree_id,
                path_str
            );
            events.push(WalletEvent::AccountAdded(account.clone()));
            account
        }
    };

    cache.accounts_by_hash.insert(hash, account.id);
    cache.xpubs.insert(account.id, xpub);
    Ok(account)
}

/// Leaf address at `(chain, address_index)` under an account, derived and
/// persisted on first sight. When outputs for the address were already
/// ingested before the address existed, they are bound to the new row and
/// its balance is recomputed; any unspent ones surface through `diff_ops`.
pub(crate) fn child_address(
    conn: &Connection,
    cache: &mut AddressCache,
    config: &SyncConfig,
    account: &Account,
    chain: u32,
    address_index: u32,
    events: &mut Vec<WalletEvent>,
    diff_ops: &mut Vec<DiffOp>,
) -> SyncResult<AddressEntry> {
    let chain_row_id = match cache.chain_rows.get(&(account.id, chain)) {
        Some(&id) => id,
        None => {
            let id = match addresses::chain_row(conn, account.id, chain)? {
                Some(id) => id,
                None => {
                    let path = format!("{}/{}", account.path, chain);
                    addresses::insert_chain_row(conn, account.id, chain, &path)?
                }
            };
            cache.chain_rows.insert((account.id, chain), id);
            id
        }
    };

    if let Some(&address_id) = cache.slots.get(&(chain_row_id, address_index)) {
        let entry = addresses::address_by_id(conn, address_id)?.ok_or_else(|| {
            StoreError::Corrupt(format!("cached address row {address_id} missing"))
        })?;
        return Ok(entry);
    }

    let xpub = match cache.xpubs.get(&account.id) {
        Some(xpub) => *xpub,
        None => {
            let xpub = account
                .xpub
                .parse::<ExtendedPubKey>()
                .map_err(DerivationError::Bip32)?;
            cache.xpubs.insert(account.id, xpub);
            xpub
        }
    };
    let derived =
        derive_address_string(&cache.secp, &xpub, chain, address_index, config.network)?;
    let path_str = format!("{}/{}/{}", account.path, chain, address_index);

    let mut entry = match addresses::address_by_slot(conn, chain_row_id, address_index)? {
        Some(existing) => {
            if existing.address != derived {
                return Err(SyncError::CacheInconsistency(format!(
                    "slot {}/{} of account #{} holds {} but derivation yields {}",
                    chain,
                    address_index,
                    account.account_index + 1,
                    existing.address,
                    derived
                )));
            }
            existing
        }
        None => match addresses::address_row_by_string(conn, &derived)? {
            Some(row) if row.parent_id.is_none() => {
                addresses::claim_address_row(conn, row.id, chain_row_id, address_index, &path_str)?;
                let entry = addresses::address_by_id(conn, row.id)?.ok_or_else(|| {
                    StoreError::Corrupt(format!("address row {} vanished during claim", row.id))
                })?;
                events.push(WalletEvent::AddressAdded(entry.clone()));
                entry
            }
            Some(row) => {
                return Err(SyncError::CacheInconsistency(format!(
                    "address {} already bound to another slot (row {})",
                    derived, row.id
                )));
            }
            None => {
                let address_id =
                    addresses::insert_address(conn, chain_row_id, address_index, &derived, &path_str)?;
                let entry = addresses::address_by_id(conn, address_id)?.ok_or_else(|| {
                    StoreError::Corrupt(format!("address row {address_id} vanished after insert"))
                })?;
                events.push(WalletEvent::AddressAdded(entry.clone()));
                entry
            }
        },
    };

    // Outputs ingested before this address existed now get attached to it.
    let bound = transactions::bind_outputs_to_address(conn, entry.id, &entry.address)?;
    if !bound.is_empty() {
        for output_id in &bound {
            let Some(output) = transactions::output_by_id(conn, *output_id)? else {
                continue;
            };
            if output.spent_tx_id.is_some() {
                continue;
            }
            if let Some(utxo) = transactions::utxo_by_output_id(conn, output.id)? {
                diff_ops.push(DiffOp::Added(utxo));
            }
        }
        crate::balance::recompute_addresses(conn, &[entry.id], events)?;
        entry = addresses::address_by_id(conn, entry.id)?.ok_or_else(|| {
            StoreError::Corrupt(format!("address row {} vanished after backfill", entry.id))
        })?;
    }

    cache.slots.insert((chain_row_id, address_index), entry.id);
    cache.remember_address(entry.address.clone(), entry.id);
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_source::SoftwareKeySource;
    use crate::store::WalletStore;
    use dashcore::Txid;

    const SEED: [u8; 16] = [7u8; 16];

    fn setup() -> (WalletStore, AddressCache, SoftwareKeySource, SyncConfig, TreeId) {
        let store = WalletStore::open_in_memory().unwrap();
        let config = SyncConfig::testnet();
        let source = SoftwareKeySource::from_seed(config.network, &SEED).unwrap();
        let ident = source.tree_ident().unwrap();
        let tree_id = addresses::insert_tree(store.conn(), &ident).unwrap();
        let mut cache = AddressCache::new();
        cache.bind(HdTree {
            id: tree_id,
            ident,
            label: None,
        });
        (store, cache, source, config, tree_id)
    }

    #[test]
    fn test_account_created_once() {
        let (store, mut cache, source, config, tree_id) = setup();
        let mut events = Vec::new();

        let first =
            account_by_index(store.conn(), &mut cache, &source, &config, tree_id, 0, &mut events)
                .unwrap();
        let second =
            account_by_index(store.conn(), &mut cache, &source, &config, tree_id, 0, &mut events)
                .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.path, "m/44'/1'/0'");
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, WalletEvent::AccountAdded(_)))
                .count(),
            1
        );
    }

    #[test]
    fn test_account_survives_cache_clear() {
        let (store, mut cache, source, config, tree_id) = setup();
        let mut events = Vec::new();

        let first =
            account_by_index(store.conn(), &mut cache, &source, &config, tree_id, 0, &mut events)
                .unwrap();
        let tree = cache.tree().cloned().unwrap();
        cache.clear();
        cache.bind(tree);
        let second =
            account_by_index(store.conn(), &mut cache, &source, &config, tree_id, 0, &mut events)
                .unwrap();

        assert_eq!(first.id, second.id, "store lookup resolves the same row");
        assert_eq!(first.xpub_hash, second.xpub_hash);
    }

    #[test]
    fn test_child_address_deterministic_and_persisted() {
        let (store, mut cache, source, config, tree_id) = setup();
        let mut events = Vec::new();
        let mut diff_ops = Vec::new();

        let account =
            account_by_index(store.conn(), &mut cache, &source, &config, tree_id, 0, &mut events)
                .unwrap();
        let first = child_address(
            store.conn(),
            &mut cache,
            &config,
            &account,
            EXTERNAL_CHAIN,
            0,
            &mut events,
            &mut diff_ops,
        )
        .unwrap();
        let second = child_address(
            store.conn(),
            &mut cache,
            &config,
            &account,
            EXTERNAL_CHAIN,
            0,
            &mut events,
            &mut diff_ops,
        )
        .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.address, second.address);
        assert_eq!(first.path, "m/44'/1'/0'/0/0");

        // matches a direct derivation from the account xpub
        let secp = Secp256k1::new();
        let xpub = account.xpub.parse::<ExtendedPubKey>().unwrap();
        let direct =
            derive_address_string(&secp, &xpub, EXTERNAL_CHAIN, 0, config.network).unwrap();
        assert_eq!(first.address, direct);

        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, WalletEvent::AddressAdded(_)))
                .count(),
            1
        );
    }

    #[test]
    fn test_change_chain_differs_from_receive_chain() {
        let (store, mut cache, source, config, tree_id) = setup();
        let mut events = Vec::new();
        let mut diff_ops = Vec::new();

        let account =
            account_by_index(store.conn(), &mut cache, &source, &config, tree_id, 0, &mut events)
                .unwrap();
        let receive = child_address(
            store.conn(),
            &mut cache,
            &config,
            &account,
            EXTERNAL_CHAIN,
            0,
            &mut events,
            &mut diff_ops,
        )
        .unwrap();
        let change = child_address(
            store.conn(),
            &mut cache,
            &config,
            &account,
            INTERNAL_CHAIN,
            0,
            &mut events,
            &mut diff_ops,
        )
        .unwrap();

        assert_ne!(receive.address, change.address);
        assert_eq!(change.path, "m/44'/1'/0'/1/0");
        assert_eq!(change.chain, INTERNAL_CHAIN);
    }

    #[test]
    fn test_foreign_row_at_slot_is_rejected() {
        let (store, mut cache, source, config, tree_id) = setup();
        let mut events = Vec::new();
        let mut diff_ops = Vec::new();

        let account =
            account_by_index(store.conn(), &mut cache, &source, &config, tree_id, 0, &mut events)
                .unwrap();
        let chain_row_id =
            addresses::insert_chain_row(store.conn(), account.id, 0, "m/44'/1'/0'/0").unwrap();
        addresses::insert_address(store.conn(), chain_row_id, 0, "yBogusAddr", "m/44'/1'/0'/0/0")
            .unwrap();

        let result = child_address(
            store.conn(),
            &mut cache,
            &config,
            &account,
            EXTERNAL_CHAIN,
            0,
            &mut events,
            &mut diff_ops,
        );
        assert!(matches!(result, Err(SyncError::CacheInconsistency(_))));
    }

    #[test]
    fn test_claims_unbound_row_keeping_its_id() {
        let (store, mut cache, source, config, tree_id) = setup();
        let mut events = Vec::new();
        let mut diff_ops = Vec::new();

        let account =
            account_by_index(store.conn(), &mut cache, &source, &config, tree_id, 0, &mut events)
                .unwrap();
        let secp = Secp256k1::new();
        let xpub = account.xpub.parse::<ExtendedPubKey>().unwrap();
        let derived =
            derive_address_string(&secp, &xpub, EXTERNAL_CHAIN, 0, config.network).unwrap();

        // a standalone row for that address, not attached to any slot
        store
            .conn()
            .execute("INSERT INTO address (address) VALUES (?1)", [derived.as_str()])
            .unwrap();
        let unbound_id = store.conn().last_insert_rowid();

        let entry = child_address(
            store.conn(),
            &mut cache,
            &config,
            &account,
            EXTERNAL_CHAIN,
            0,
            &mut events,
            &mut diff_ops,
        )
        .unwrap();
        assert_eq!(entry.id, unbound_id);
        assert_eq!(entry.address_index, 0);
        assert_eq!(entry.path, "m/44'/1'/0'/0/0");
    }

    #[test]
    fn test_backfill_binds_preexisting_outputs() {
        let (store, mut cache, source, config, tree_id) = setup();
        let mut events = Vec::new();
        let mut diff_ops = Vec::new();

        let account =
            account_by_index(store.conn(), &mut cache, &source, &config, tree_id, 0, &mut events)
                .unwrap();
        let secp = Secp256k1::new();
        let xpub = account.xpub.parse::<ExtendedPubKey>().unwrap();
        let derived =
            derive_address_string(&secp, &xpub, EXTERNAL_CHAIN, 0, config.network).unwrap();

        // output stored before the address was ever derived
        let tx_row = transactions::insert_tx(
            store.conn(),
            &Txid::from_byte_array([3u8; 32]),
            100,
            0,
            false,
        )
        .unwrap();
        transactions::insert_tx_out(store.conn(), tx_row, 0, None, Some(&derived), 2500).unwrap();

        let entry = child_address(
            store.conn(),
            &mut cache,
            &config,
            &account,
            EXTERNAL_CHAIN,
            0,
            &mut events,
            &mut diff_ops,
        )
        .unwrap();

        assert_eq!(entry.balance, 2500, "backfilled output counts immediately");
        assert_eq!(diff_ops.len(), 1);
        assert!(matches!(&diff_ops[0], DiffOp::Added(u) if u.satoshis == 2500));
        assert!(events
            .iter()
            .any(|e| matches!(e, WalletEvent::BalanceChanged(a) if a.balance == 2500)));
    }
}
