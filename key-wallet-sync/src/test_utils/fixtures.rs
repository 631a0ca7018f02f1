//! Canned wallet fixtures shared across tests.

use dashcore::hashes::Hash;
use dashcore::secp256k1::Secp256k1;
use dashcore::{Network, Txid};

use crate::chain::{ChainTransaction, ChainTxInput, ChainTxOutput};
use crate::key_source::{KeySource, SoftwareKeySource};

/// Seed every test wallet derives from.
pub const TEST_SEED: [u8; 32] = [42u8; 32];

/// Key source over [`TEST_SEED`] on testnet.
pub fn test_key_source() -> SoftwareKeySource {
    SoftwareKeySource::from_seed(Network::Testnet, &TEST_SEED).expect("fixture seed")
}

/// Txid filled with `byte`.
pub fn txid(byte: u8) -> Txid {
    Txid::from_byte_array([byte; 32])
}

/// Address the test wallet derives at the given account, chain and slot.
pub fn expected_address(account_index: u32, chain: u32, address_index: u32) -> String {
    let source = test_key_source();
    let path =
        crate::derivation::account_derivation_path(1, account_index).expect("account path");
    let xpub = source.xpub_at(&path).expect("account xpub");
    let secp = Secp256k1::new();
    crate::derivation::derive_address_string(&secp, &xpub, chain, address_index, Network::Testnet)
        .expect("fixture address")
}

/// A one-output payment of `satoshis` to `address`. The input spends an
/// outpoint unknown to the wallet, so ingesting it only credits the
/// destination.
pub fn payment_to(
    address: &str,
    txid_byte: u8,
    height: Option<u32>,
    satoshis: u64,
) -> ChainTransaction {
    ChainTransaction {
        txid: txid(txid_byte),
        block_height: height,
        timestamp: height.map(|h| 1_700_000_000 + u64::from(h)),
        coinbase: false,
        inputs: vec![ChainTxInput {
            source_txid: txid(txid_byte.wrapping_add(200)),
            source_vout: 0,
        }],
        outputs: vec![ChainTxOutput {
            index: 0,
            address: Some(address.to_string()),
            satoshis,
        }],
    }
}

/// A spend of `source:source_vout` paying `satoshis` to an unrelated
/// address.
pub fn spend_of(
    txid_byte: u8,
    source: Txid,
    source_vout: u32,
    height: Option<u32>,
    satoshis: u64,
) -> ChainTransaction {
    ChainTransaction {
        txid: txid(txid_byte),
        block_height: height,
        timestamp: height.map(|h| 1_700_000_000 + u64::from(h)),
        coinbase: false,
        inputs: vec![ChainTxInput {
            source_txid: source,
            source_vout,
        }],
        outputs: vec![ChainTxOutput {
            index: 0,
            address: Some("yTb47qEBpNmgXvYYsHEN4nh8yJwa5iC4Cs".to_string()),
            satoshis,
        }],
    }
}
