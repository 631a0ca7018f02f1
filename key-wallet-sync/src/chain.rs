//! Chain query interface consumed by the synchronization engine.

use std::collections::HashSet;

use dashcore::Txid;
use serde::{Deserialize, Serialize};

use crate::error::ChainError;
use crate::types::UNCONFIRMED_BLOCK_HEIGHT;

/// Backend the engine queries for chain state. Implementations typically
/// wrap an address-indexed Dash Core RPC or an Insight-style HTTP API.
///
/// All calls block until the backend answers. The engine never holds its
/// state lock across them, so slow backends stall only the scan that issued
/// the call.
pub trait ChainQuery: Send + Sync {
    /// Current best block height.
    fn block_height(&self) -> Result<u32, ChainError>;

    /// Full detail for one transaction. `skip_cache` forces a fresh fetch
    /// on backends that cache responses, used when a cached copy may have
    /// stale confirmation state.
    fn transaction(&self, txid: &Txid, skip_cache: bool) -> Result<ChainTransaction, ChainError>;

    /// Transactions touching any of `addresses` within the inclusive block
    /// height window. With `include_mempool`, unconfirmed transactions are
    /// reported as well.
    fn address_history(
        &self,
        addresses: &[String],
        from_height: u32,
        to_height: u32,
        include_mempool: bool,
    ) -> Result<Vec<HistoryEntry>, ChainError>;

    /// Balances for the given addresses as the chain's address index sees
    /// them.
    fn address_balances(
        &self,
        addresses: &[String],
    ) -> Result<Vec<AddressBalanceInfo>, ChainError>;
}

/// Shared backends work anywhere an owned one does, so one client can serve
/// both the engine and other consumers.
impl<T: ChainQuery + ?Sized> ChainQuery for std::sync::Arc<T> {
    fn block_height(&self) -> Result<u32, ChainError> {
        (**self).block_height()
    }

    fn transaction(&self, txid: &Txid, skip_cache: bool) -> Result<ChainTransaction, ChainError> {
        (**self).transaction(txid, skip_cache)
    }

    fn address_history(
        &self,
        addresses: &[String],
        from_height: u32,
        to_height: u32,
        include_mempool: bool,
    ) -> Result<Vec<HistoryEntry>, ChainError> {
        (**self).address_history(addresses, from_height, to_height, include_mempool)
    }

    fn address_balances(
        &self,
        addresses: &[String],
    ) -> Result<Vec<AddressBalanceInfo>, ChainError> {
        (**self).address_balances(addresses)
    }
}

/// One row of address history: a transaction and where it sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub txid: Txid,
    /// `None` while the transaction is only in the mempool.
    pub block_height: Option<u32>,
}

impl HistoryEntry {
    /// Height as recorded in the wallet cache.
    pub fn store_height(&self) -> u32 {
        self.block_height.unwrap_or(UNCONFIRMED_BLOCK_HEIGHT)
    }
}

/// Parsed transaction detail returned by the chain backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub txid: Txid,
    /// `None` while unconfirmed.
    pub block_height: Option<u32>,
    /// Block time for confirmed transactions, first-seen time otherwise.
    pub timestamp: Option<u64>,
    pub coinbase: bool,
    pub inputs: Vec<ChainTxInput>,
    pub outputs: Vec<ChainTxOutput>,
}

impl ChainTransaction {
    pub fn is_confirmed(&self) -> bool {
        self.block_height.is_some()
    }

    /// Height as recorded in the wallet cache.
    pub fn store_height(&self) -> u32 {
        self.block_height.unwrap_or(UNCONFIRMED_BLOCK_HEIGHT)
    }

    /// Structural checks applied before a response reaches the store.
    pub fn validate(&self) -> Result<(), ChainError> {
        if self.inputs.is_empty() && !self.coinbase {
            return Err(ChainError::InvalidResponse(format!(
                "transaction {} has no inputs and is not coinbase",
                self.txid
            )));
        }
        if self.block_height == Some(UNCONFIRMED_BLOCK_HEIGHT) {
            return Err(ChainError::InvalidResponse(format!(
                "transaction {} reports a reserved block height",
                self.txid
            )));
        }
        let mut indexes = HashSet::with_capacity(self.outputs.len());
        for output in &self.outputs {
            if output.index as usize >= self.outputs.len() {
                return Err(ChainError::InvalidResponse(format!(
                    "transaction {} output index {} is out of range for {} outputs",
                    self.txid,
                    output.index,
                    self.outputs.len()
                )));
            }
            if !indexes.insert(output.index) {
                return Err(ChainError::InvalidResponse(format!(
                    "transaction {} repeats output index {}",
                    self.txid, output.index
                )));
            }
            if i64::try_from(output.satoshis).is_err() {
                return Err(ChainError::InvalidResponse(format!(
                    "transaction {} output {} value {} is beyond the storable range",
                    self.txid, output.index, output.satoshis
                )));
            }
        }
        Ok(())
    }
}

/// An outpoint spent by a transaction input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTxInput {
    pub source_txid: Txid,
    pub source_vout: u32,
}

/// One transaction output. `address` is `None` for outputs no address can
/// be extracted from (OP_RETURN and non-standard scripts).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTxOutput {
    pub index: u32,
    pub address: Option<String>,
    pub satoshis: u64,
}

/// Address balance figures reported by the chain index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBalanceInfo {
    pub address: String,
    pub balance: u64,
    pub received: u64,
}
