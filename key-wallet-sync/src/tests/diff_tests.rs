//! UTXO diff accumulation and subscription filtering through the engine.

use std::sync::Arc;

use crate::config::SyncConfig;
use crate::derivation::EXTERNAL_CHAIN;
use crate::engine::SyncEngine;
use crate::store::WalletStore;
use crate::test_utils::{expected_address, payment_to, spend_of, test_key_source, txid, MockChainQuery};
use crate::types::{Scope, UNCONFIRMED_BLOCK_HEIGHT};

fn wallet(height: u32) -> (SyncEngine<Arc<MockChainQuery>>, Arc<MockChainQuery>) {
    let chain = Arc::new(MockChainQuery::new(height));
    let store = WalletStore::open_in_memory().unwrap();
    let config = SyncConfig::testnet().with_gap_limit(5).with_scan_batch_size(5);
    let engine = SyncEngine::new(config, Arc::clone(&chain), store).unwrap();
    (engine, chain)
}

#[test]
fn test_spend_shows_up_as_removed() {
    let (engine, chain) = wallet(100);
    let addr = expected_address(0, EXTERNAL_CHAIN, 0);
    chain.add_transaction(payment_to(&addr, 1, Some(50), 4_000));
    chain.set_address_balance(&addr, 4_000, 4_000);

    engine.attach_key_source(Box::new(test_key_source())).unwrap();
    engine.fetch_all_accounts().unwrap();
    engine.reset_utxo_diff();

    chain.set_height(120);
    chain.add_transaction(spend_of(2, txid(1), 0, Some(110), 3_500));
    engine.fetch_all_accounts().unwrap();

    let diff = engine.utxo_diff();
    assert!(diff.added.is_empty());
    assert_eq!(diff.removed.len(), 1);
    assert_eq!(diff.removed[0].outpoint.txid, txid(1));
    assert_eq!(diff.removed[0].outpoint.vout, 0);

    assert!(engine.list_utxos(Scope::Wallet).unwrap().is_empty());
    let accounts = engine.list_accounts().unwrap();
    assert_eq!(accounts[0].balance, 0);
    assert_eq!(accounts[0].received, 4_000);
}

#[test]
fn test_add_and_spend_in_one_window_cancel_out() {
    let (engine, chain) = wallet(100);
    let addr = expected_address(0, EXTERNAL_CHAIN, 0);
    chain.add_transaction(payment_to(&addr, 1, Some(50), 4_000));
    chain.add_transaction(spend_of(2, txid(1), 0, Some(60), 3_500));
    chain.set_address_balance(&addr, 0, 4_000);

    engine.attach_key_source(Box::new(test_key_source())).unwrap();
    engine.fetch_all_accounts().unwrap();

    // Ingested and spent within one observation window, the output never
    // surfaces in the diff.
    assert!(engine.utxo_diff().is_empty());
    assert!(engine.list_utxos(Scope::Wallet).unwrap().is_empty());
    assert_eq!(engine.list_transactions(Scope::Wallet).unwrap().len(), 2);

    let entry = engine.find_address(&addr).unwrap().unwrap();
    assert_eq!(entry.balance, 0);
    assert_eq!(entry.received, 4_000);
}

#[test]
fn test_unconfirmed_utxo_reports_sentinel_height() {
    let (engine, chain) = wallet(100);
    let addr = expected_address(0, EXTERNAL_CHAIN, 0);
    chain.add_transaction(payment_to(&addr, 1, None, 1_500));
    chain.set_address_balance(&addr, 1_500, 1_500);

    engine.attach_key_source(Box::new(test_key_source())).unwrap();
    engine.fetch_all_accounts().unwrap();

    let diff = engine.utxo_diff();
    assert_eq!(diff.added.len(), 1);
    assert_eq!(diff.added[0].block_height, UNCONFIRMED_BLOCK_HEIGHT);
    assert_eq!(diff.added[0].confirmations(100), 0);
}

#[test]
fn test_subscriptions_filter_recorded_diffs() {
    let (engine, chain) = wallet(100);
    let a0 = expected_address(0, EXTERNAL_CHAIN, 0);
    let b0 = expected_address(1, EXTERNAL_CHAIN, 0);
    chain.add_transaction(payment_to(&a0, 1, Some(50), 1_000));
    chain.add_transaction(payment_to(&b0, 2, Some(55), 2_000));

    engine.attach_key_source(Box::new(test_key_source())).unwrap();
    let accounts = engine.fetch_all_accounts().unwrap();
    assert_eq!(accounts.len(), 3);
    let first = accounts[0].id;
    let second = accounts[1].id;

    // Only the subscribed account's additions are recorded.
    engine.reset_utxo_diff();
    engine.subscribe_account(first);
    chain.set_height(120);
    chain.add_transaction(payment_to(&expected_address(0, EXTERNAL_CHAIN, 1), 3, Some(110), 600));
    chain.add_transaction(payment_to(&expected_address(1, EXTERNAL_CHAIN, 1), 4, Some(110), 700));
    engine.fetch_all_accounts().unwrap();

    let diff = engine.utxo_diff();
    assert_eq!(diff.added.len(), 1);
    assert_eq!(diff.added[0].account_id, first);

    // Clearing the filter records everything again.
    engine.clear_subscriptions();
    engine.reset_utxo_diff();
    chain.set_height(140);
    chain.add_transaction(payment_to(&expected_address(0, EXTERNAL_CHAIN, 2), 5, Some(130), 800));
    chain.add_transaction(payment_to(&expected_address(1, EXTERNAL_CHAIN, 2), 6, Some(130), 900));
    engine.fetch_all_accounts().unwrap();

    let diff = engine.utxo_diff();
    assert_eq!(diff.added.len(), 2);
    let mut touched: Vec<i64> = diff.added.iter().map(|u| u.account_id).collect();
    touched.sort_unstable();
    let mut expected = vec![first, second];
    expected.sort_unstable();
    assert_eq!(touched, expected);

    // A single-address subscription is narrower than its account.
    let watched = expected_address(1, EXTERNAL_CHAIN, 3);
    let watched_id = engine.find_address(&watched).unwrap().unwrap().id;
    engine.reset_utxo_diff();
    engine.subscribe_address(watched_id);
    chain.set_height(160);
    chain.add_transaction(payment_to(&watched, 7, Some(150), 900));
    chain.add_transaction(payment_to(&expected_address(0, EXTERNAL_CHAIN, 3), 8, Some(150), 800));
    engine.fetch_all_accounts().unwrap();

    let diff = engine.utxo_diff();
    assert_eq!(diff.added.len(), 1);
    assert_eq!(diff.added[0].address, watched);
    assert_eq!(diff.added[0].address_id, watched_id);
}
