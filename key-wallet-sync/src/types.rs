//! Core data types for the wallet address and UTXO cache.

use dashcore::{OutPoint, Txid};
use serde::{Deserialize, Serialize};

/// Row id of an HD tree in the store.
pub type TreeId = i64;
/// Row id of an account entry in the address tree.
pub type AccountId = i64;
/// Row id of a leaf address entry in the address tree.
pub type AddressId = i64;
/// Row id of a transaction record.
pub type TxRowId = i64;

/// Sentinel block height for transactions seen only in the mempool. Sorts
/// after every real height in the store's integer columns.
pub const UNCONFIRMED_BLOCK_HEIGHT: u32 = u32::MAX;

/// One BIP44 master-key identity known to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HdTree {
    pub id: TreeId,
    /// Stable identifier for the master key. Derived from key fingerprints,
    /// never from key material itself.
    pub ident: String,
    pub label: Option<String>,
}

/// Visibility of an account in listing APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    /// Discovered through address activity or default creation.
    Active,
    /// Shown even without any on-chain activity.
    ForceShown,
    /// Hidden from listings regardless of activity.
    Hidden,
}

impl AccountStatus {
    pub fn to_db(self) -> i64 {
        match self {
            AccountStatus::Active => 1,
            AccountStatus::ForceShown => 2,
            AccountStatus::Hidden => 3,
        }
    }

    pub fn from_db(value: i64) -> Option<Self> {
        match value {
            1 => Some(AccountStatus::Active),
            2 => Some(AccountStatus::ForceShown),
            3 => Some(AccountStatus::Hidden),
            _ => None,
        }
    }
}

/// A BIP44 account (`m/44'/coin'/index'`) cached in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub tree_id: TreeId,
    /// Zero-based account index; the derivation hardens it.
    pub account_index: u32,
    /// Account-level extended public key, serialized in base58.
    pub xpub: String,
    /// Hash of the serialized xpub, the account's lookup key.
    pub xpub_hash: String,
    pub path: String,
    pub label: Option<String>,
    pub status: AccountStatus,
    pub balance: u64,
    pub received: u64,
}

impl Account {
    /// User-facing name: the label if set, otherwise a numbered default.
    pub fn name(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => format!("Account #{}", self.account_index + 1),
        }
    }
}

/// A derived receive or change address cached in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressEntry {
    pub id: AddressId,
    pub account_id: AccountId,
    /// 0 for the external (receive) chain, 1 for the change chain.
    pub chain: u32,
    pub address_index: u32,
    pub address: String,
    pub path: String,
    pub label: Option<String>,
    pub balance: u64,
    pub received: u64,
    /// Highest block height this address has been scanned through.
    pub last_scan_block_height: u32,
}

impl AddressEntry {
    /// An address counts as used once it has received anything.
    pub fn is_used(&self) -> bool {
        self.received > 0
    }
}

/// A transaction known to the wallet cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRecord {
    pub id: TxRowId,
    pub txid: Txid,
    /// [`UNCONFIRMED_BLOCK_HEIGHT`] while the transaction sits in the
    /// mempool.
    pub block_height: u32,
    pub timestamp: u64,
    pub coinbase: bool,
}

impl TxRecord {
    pub fn is_confirmed(&self) -> bool {
        self.block_height != UNCONFIRMED_BLOCK_HEIGHT
    }
}

/// An unspent output belonging to a cached address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    /// Row id of the backing output record.
    pub id: i64,
    pub outpoint: OutPoint,
    pub address_id: AddressId,
    pub account_id: AccountId,
    pub address: String,
    pub satoshis: u64,
    pub block_height: u32,
    pub coinbase: bool,
}

impl Utxo {
    pub fn is_confirmed(&self) -> bool {
        self.block_height != UNCONFIRMED_BLOCK_HEIGHT
    }

    /// Confirmation count at the given chain tip, zero while unconfirmed.
    pub fn confirmations(&self, tip_height: u32) -> u32 {
        if !self.is_confirmed() || self.block_height > tip_height {
            return 0;
        }
        tip_height - self.block_height + 1
    }
}

/// Accumulated UTXO set changes since the last diff reset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoDiff {
    pub added: Vec<Utxo>,
    pub modified: Vec<Utxo>,
    pub removed: Vec<Utxo>,
}

impl UtxoDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Restricts listing APIs to a slice of the wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Everything under the bound HD tree.
    Wallet,
    Account(AccountId),
    Address(AddressId),
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashcore::hashes::Hash;

    #[test]
    fn test_account_status_roundtrip() {
        for status in [AccountStatus::Active, AccountStatus::ForceShown, AccountStatus::Hidden] {
            assert_eq!(AccountStatus::from_db(status.to_db()), Some(status));
        }
        assert_eq!(AccountStatus::from_db(0), None);
        assert_eq!(AccountStatus::from_db(42), None);
    }

    #[test]
    fn test_account_name_fallback() {
        let account = Account {
            id: 1,
            tree_id: 1,
            account_index: 0,
            xpub: String::new(),
            xpub_hash: String::new(),
            path: "m/44'/1'/0'".to_string(),
            label: None,
            status: AccountStatus::Active,
            balance: 0,
            received: 0,
        };
        assert_eq!(account.name(), "Account #1");

        let labeled = Account {
            label: Some("savings".to_string()),
            ..account
        };
        assert_eq!(labeled.name(), "savings");
    }

    #[test]
    fn test_utxo_confirmations() {
        let mut utxo = Utxo {
            id: 1,
            outpoint: OutPoint {
                txid: Txid::from_byte_array([1u8; 32]),
                vout: 0,
            },
            address_id: 1,
            account_id: 1,
            address: "yTb47qEBpNmgXvYYsHEN4nh8yJwa5iC4Cs".to_string(),
            satoshis: 1000,
            block_height: 100,
            coinbase: false,
        };
        assert!(utxo.is_confirmed());
        assert_eq!(utxo.confirmations(100), 1);
        assert_eq!(utxo.confirmations(105), 6);
        assert_eq!(utxo.confirmations(99), 0);

        utxo.block_height = UNCONFIRMED_BLOCK_HEIGHT;
        assert!(!utxo.is_confirmed());
        assert_eq!(utxo.confirmations(1_000_000), 0);
    }
}
