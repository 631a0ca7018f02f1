//! Balance reconciliation from stored spend links.
//!
//! Balances are never adjusted incrementally. Whenever ingestion touches an
//! address, its totals are re-derived from the outputs and spend markers the
//! store holds, and account totals are re-derived from their children. The
//! periodic network cross-check compares those derived figures against what
//! the chain backend reports and flags diverging addresses for a rescan.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use rusqlite::Connection;

use crate::chain::AddressBalanceInfo;
use crate::error::SyncResult;
use crate::events::WalletEvent;
use crate::store::{addresses, transactions};
use crate::types::{AccountId, AddressEntry, AddressId, TreeId};

/// Re-derives totals for the given leaf addresses, then refreshes every
/// account whose children moved. Returns the number of rows whose totals
/// actually changed.
pub(crate) fn recompute_addresses(
    conn: &Connection,
    address_ids: &[AddressId],
    events: &mut Vec<WalletEvent>,
) -> SyncResult<usize> {
    let mut changed = 0usize;
    let mut dirty_accounts: BTreeSet<AccountId> = BTreeSet::new();

    for &address_id in address_ids {
        let Some(entry) = addresses::address_by_id(conn, address_id)? else {
            continue;
        };
        let (received, spent) = transactions::address_sums(conn, address_id)?;
        let mut balance = received - spent;
        if balance < 0 {
            tracing::warn!(
                "address {} spent {} exceeds received {}, clamping balance to zero",
                entry.address,
                spent,
                received
            );
            balance = 0;
        }
        if entry.balance as i64 != balance || entry.received as i64 != received {
            addresses::update_address_totals(conn, address_id, balance, received)?;
            changed += 1;
            dirty_accounts.insert(entry.account_id);
        }
    }

    for account_id in dirty_accounts {
        if recompute_account(conn, account_id, events)? {
            changed += 1;
        }
    }
    Ok(changed)
}

/// Re-derives one account's totals from its children. Emits a balance
/// change event when they moved.
pub(crate) fn recompute_account(
    conn: &Connection,
    account_id: AccountId,
    events: &mut Vec<WalletEvent>,
) -> SyncResult<bool> {
    let Some(account) = addresses::account_by_id(conn, account_id)? else {
        return Ok(false);
    };
    let (balance, received) = addresses::account_child_sums(conn, account_id)?;
    if account.balance as i64 == balance && account.received as i64 == received {
        return Ok(false);
    }
    addresses::update_account_totals(conn, account_id, balance, received)?;
    if let Some(updated) = addresses::account_by_id(conn, account_id)? {
        events.push(WalletEvent::BalanceChanged(updated));
    }
    Ok(true)
}

/// Addresses due for a network balance cross-check: funded leaves whose last
/// check is older than `interval`, or which were never checked.
pub(crate) fn plan_network_check(
    conn: &Connection,
    tree_id: TreeId,
    last_checks: &HashMap<AddressId, Instant>,
    interval: Duration,
    now: Instant,
) -> SyncResult<Vec<AddressEntry>> {
    let mut due = Vec::new();
    for entry in addresses::list_tree_addresses(conn, tree_id)? {
        if entry.received == 0 {
            continue;
        }
        let fresh = last_checks
            .get(&entry.id)
            .is_some_and(|checked| now.duration_since(*checked) < interval);
        if !fresh {
            due.push(entry);
        }
    }
    Ok(due)
}

/// Compares stored totals against backend-reported ones. Addresses that
/// disagree get their scan cursor rewound so the next sweep refetches their
/// history. Returns the rewound address ids.
pub(crate) fn apply_network_check(
    conn: &Connection,
    entries: &[AddressEntry],
    reports: &[AddressBalanceInfo],
) -> SyncResult<Vec<AddressId>> {
    let by_address: HashMap<&str, &AddressBalanceInfo> =
        reports.iter().map(|r| (r.address.as_str(), r)).collect();

    let mut stale = Vec::new();
    for entry in entries {
        let Some(report) = by_address.get(entry.address.as_str()) else {
            continue;
        };
        if report.balance != entry.balance || report.received != entry.received {
            tracing::warn!(
                "address {} disagrees with backend (balance {} vs {}, received {} vs {}), scheduling rescan",
                entry.address,
                entry.balance,
                report.balance,
                entry.received,
                report.received
            );
            addresses::set_last_scan_height(conn, &[entry.id], 0)?;
            stale.push(entry.id);
        }
    }
    Ok(stale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WalletStore;
    use dashcore::hashes::Hash;
    use dashcore::Txid;

    fn seed_leaf(conn: &Connection) -> (AccountId, AddressId) {
        let tree_id = addresses::insert_tree(conn, "testfp").unwrap();
        let account_id =
            addresses::insert_account(conn, tree_id, 0, "tpubXYZ", "hash0", "m/44'/1'/0'")
                .unwrap();
        let chain_row_id = addresses::insert_chain_row(conn, account_id, 0, "m/44'/1'/0'/0").unwrap();
        let address_id =
            addresses::insert_address(conn, chain_row_id, 0, "yLeafZero", "m/44'/1'/0'/0/0")
                .unwrap();
        (account_id, address_id)
    }

    #[test]
    fn test_recompute_updates_address_and_account() {
        let store = WalletStore::open_in_memory().unwrap();
        let conn = store.conn();
        let (account_id, address_id) = seed_leaf(conn);

        let tx_row = transactions::insert_tx(conn, &Txid::from_byte_array([1u8; 32]), 100, 0, false)
            .unwrap();
        transactions::insert_tx_out(conn, tx_row, 0, Some(address_id), Some("yLeafZero"), 7000)
            .unwrap();

        let mut events = Vec::new();
        let changed = recompute_addresses(conn, &[address_id], &mut events).unwrap();
        assert_eq!(changed, 2, "address row and account row both moved");

        let entry = addresses::address_by_id(conn, address_id).unwrap().unwrap();
        assert_eq!(entry.balance, 7000);
        assert_eq!(entry.received, 7000);

        let account = addresses::account_by_id(conn, account_id).unwrap().unwrap();
        assert_eq!(account.balance, 7000);
        assert!(matches!(&events[..], [WalletEvent::BalanceChanged(a)] if a.balance == 7000));

        // unchanged totals produce no further writes or events
        events.clear();
        let changed = recompute_addresses(conn, &[address_id], &mut events).unwrap();
        assert_eq!(changed, 0);
        assert!(events.is_empty());
    }

    #[test]
    fn test_recompute_clamps_negative_balance() {
        let store = WalletStore::open_in_memory().unwrap();
        let conn = store.conn();
        let (_, address_id) = seed_leaf(conn);

        let funding =
            transactions::insert_tx(conn, &Txid::from_byte_array([1u8; 32]), 100, 0, false)
                .unwrap();
        transactions::insert_tx_out(conn, funding, 0, Some(address_id), Some("yLeafZero"), 500)
            .unwrap();
        let spender =
            transactions::insert_tx(conn, &Txid::from_byte_array([2u8; 32]), 101, 0, false)
                .unwrap();
        let out = transactions::output_by_index(conn, funding, 0).unwrap().unwrap();
        transactions::mark_output_spent(conn, out.id, spender, 0).unwrap();

        // shrink the recorded output after the fact so spent exceeds received
        conn.execute("UPDATE tx_out SET satoshis = 300 WHERE id = ?1", [out.id])
            .unwrap();

        let mut events = Vec::new();
        recompute_addresses(conn, &[address_id], &mut events).unwrap();
        let entry = addresses::address_by_id(conn, address_id).unwrap().unwrap();
        assert_eq!(entry.balance, 0);
        assert_eq!(entry.received, 300);
    }

    #[test]
    fn test_network_check_plan_and_apply() {
        let store = WalletStore::open_in_memory().unwrap();
        let conn = store.conn();
        let (_, address_id) = seed_leaf(conn);

        let tx_row = transactions::insert_tx(conn, &Txid::from_byte_array([1u8; 32]), 100, 0, false)
            .unwrap();
        transactions::insert_tx_out(conn, tx_row, 0, Some(address_id), Some("yLeafZero"), 4000)
            .unwrap();
        let mut events = Vec::new();
        recompute_addresses(conn, &[address_id], &mut events).unwrap();
        addresses::set_last_scan_height(conn, &[address_id], 100).unwrap();

        let tree_id = addresses::tree_by_ident(conn, "testfp").unwrap().unwrap().id;
        let now = Instant::now();
        let mut checks = HashMap::new();

        let due = plan_network_check(conn, tree_id, &checks, Duration::from_secs(60), now).unwrap();
        assert_eq!(due.len(), 1, "funded and never checked means due");

        checks.insert(address_id, now);
        let due = plan_network_check(conn, tree_id, &checks, Duration::from_secs(60), now).unwrap();
        assert!(due.is_empty(), "recently checked address is skipped");

        // backend disagrees, cursor rewinds
        let entries = vec![addresses::address_by_id(conn, address_id).unwrap().unwrap()];
        let reports = vec![AddressBalanceInfo {
            address: "yLeafZero".to_string(),
            balance: 1000,
            received: 4000,
        }];
        let stale = apply_network_check(conn, &entries, &reports).unwrap();
        assert_eq!(stale, vec![address_id]);
        let entry = addresses::address_by_id(conn, address_id).unwrap().unwrap();
        assert_eq!(entry.last_scan_block_height, 0);

        // agreeing report leaves the cursor alone
        addresses::set_last_scan_height(conn, &[address_id], 100).unwrap();
        let entries = vec![addresses::address_by_id(conn, address_id).unwrap().unwrap()];
        let reports = vec![AddressBalanceInfo {
            address: "yLeafZero".to_string(),
            balance: 4000,
            received: 4000,
        }];
        let stale = apply_network_check(conn, &entries, &reports).unwrap();
        assert!(stale.is_empty());
        let entry = addresses::address_by_id(conn, address_id).unwrap().unwrap();
        assert_eq!(entry.last_scan_block_height, 100);
    }
}
