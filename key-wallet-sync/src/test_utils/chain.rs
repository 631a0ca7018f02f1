//! In-memory [`ChainQuery`] backend with programmable contents.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use dashcore::Txid;

use crate::chain::{AddressBalanceInfo, ChainQuery, ChainTransaction, HistoryEntry};
use crate::error::ChainError;

/// One recorded history request, for asserting scan windows and batching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryCall {
    pub addresses: Vec<String>,
    pub from_height: u32,
    pub to_height: u32,
    pub include_mempool: bool,
}

#[derive(Default)]
struct MockChainState {
    height: u32,
    transactions: HashMap<Txid, ChainTransaction>,
    history: HashMap<String, Vec<HistoryEntry>>,
    balances: HashMap<String, AddressBalanceInfo>,
    history_calls: Vec<HistoryCall>,
    detail_calls: Vec<(Txid, bool)>,
    fail_next_history: bool,
    history_delay: Option<Duration>,
}

/// Mock chain backend for tests. Transactions added to it are indexed
/// under the addresses of their outputs, and under the addresses of the
/// outputs they spend, the way an address-index backend reports history.
pub struct MockChainQuery {
    state: Mutex<MockChainState>,
}

impl MockChainQuery {
    pub fn new(height: u32) -> Self {
        MockChainQuery {
            state: Mutex::new(MockChainState {
                height,
                ..MockChainState::default()
            }),
        }
    }

    pub fn set_height(&self, height: u32) {
        self.state.lock().unwrap().height = height;
    }

    /// Makes `tx` known to the backend and indexes it for history queries.
    pub fn add_transaction(&self, tx: ChainTransaction) {
        let mut state = self.state.lock().unwrap();
        let entry = HistoryEntry {
            txid: tx.txid,
            block_height: tx.block_height,
        };

        let mut touched: Vec<String> = tx
            .outputs
            .iter()
            .filter_map(|output| output.address.clone())
            .collect();
        // a spend shows up in the history of the address it spends from
        for input in &tx.inputs {
            if let Some(source) = state.transactions.get(&input.source_txid) {
                if let Some(output) = source
                    .outputs
                    .iter()
                    .find(|output| output.index == input.source_vout)
                {
                    if let Some(address) = &output.address {
                        touched.push(address.clone());
                    }
                }
            }
        }

        for address in touched {
            let entries = state.history.entry(address).or_default();
            entries.retain(|existing| existing.txid != entry.txid);
            entries.push(entry);
        }
        state.transactions.insert(tx.txid, tx);
    }

    /// Re-indexes a known transaction at a new height, `None` moving it
    /// back to the mempool.
    pub fn set_transaction_height(&self, txid: &Txid, height: Option<u32>) {
        let mut state = self.state.lock().unwrap();
        if let Some(tx) = state.transactions.get_mut(txid) {
            tx.block_height = height;
        }
        for entries in state.history.values_mut() {
            for entry in entries.iter_mut() {
                if entry.txid == *txid {
                    entry.block_height = height;
                }
            }
        }
    }

    /// Forgets a transaction entirely, as a backend does after a mempool
    /// eviction.
    pub fn remove_transaction(&self, txid: &Txid) {
        let mut state = self.state.lock().unwrap();
        state.transactions.remove(txid);
        for entries in state.history.values_mut() {
            entries.retain(|entry| entry.txid != *txid);
        }
    }

    pub fn set_address_balance(&self, address: &str, balance: u64, received: u64) {
        self.state.lock().unwrap().balances.insert(
            address.to_string(),
            AddressBalanceInfo {
                address: address.to_string(),
                balance,
                received,
            },
        );
    }

    /// Makes the next history request fail with a transport error.
    pub fn fail_next_history(&self) {
        self.state.lock().unwrap().fail_next_history = true;
    }

    /// Stalls every history request by `delay`, giving concurrent callers a
    /// window to act while a scan is in flight.
    pub fn set_history_delay(&self, delay: Duration) {
        self.state.lock().unwrap().history_delay = Some(delay);
    }

    /// Every history request seen so far.
    pub fn history_calls(&self) -> Vec<HistoryCall> {
        self.state.lock().unwrap().history_calls.clone()
    }

    /// Every transaction detail request seen so far, with its skip-cache
    /// flag.
    pub fn detail_calls(&self) -> Vec<(Txid, bool)> {
        self.state.lock().unwrap().detail_calls.clone()
    }
}

impl ChainQuery for MockChainQuery {
    fn block_height(&self) -> Result<u32, ChainError> {
        Ok(self.state.lock().unwrap().height)
    }

    fn transaction(&self, txid: &Txid, skip_cache: bool) -> Result<ChainTransaction, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.detail_calls.push((*txid, skip_cache));
        state
            .transactions
            .get(txid)
            .cloned()
            .ok_or(ChainError::TxNotFound(*txid))
    }

    fn address_history(
        &self,
        addresses: &[String],
        from_height: u32,
        to_height: u32,
        include_mempool: bool,
    ) -> Result<Vec<HistoryEntry>, ChainError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.history_calls.push(HistoryCall {
                addresses: addresses.to_vec(),
                from_height,
                to_height,
                include_mempool,
            });
            if state.fail_next_history {
                state.fail_next_history = false;
                return Err(ChainError::Transport("injected failure".to_string()));
            }
            state.history_delay
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let state = self.state.lock().unwrap();
        let mut entries = Vec::new();
        for address in addresses {
            let Some(known) = state.history.get(address) else {
                continue;
            };
            for entry in known {
                let wanted = match entry.block_height {
                    Some(height) => height >= from_height && height <= to_height,
                    None => include_mempool,
                };
                if wanted {
                    entries.push(*entry);
                }
            }
        }
        Ok(entries)
    }

    fn address_balances(
        &self,
        addresses: &[String],
    ) -> Result<Vec<AddressBalanceInfo>, ChainError> {
        let state = self.state.lock().unwrap();
        Ok(addresses
            .iter()
            .map(|address| {
                state.balances.get(address).cloned().unwrap_or_else(|| {
                    AddressBalanceInfo {
                        address: address.clone(),
                        balance: 0,
                        received: 0,
                    }
                })
            })
            .collect())
    }
}
