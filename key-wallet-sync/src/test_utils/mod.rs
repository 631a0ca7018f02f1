//! Shared helpers for tests: a programmable chain backend and canned
//! wallet fixtures.

mod chain;
mod fixtures;

pub use chain::{HistoryCall, MockChainQuery};
pub use fixtures::{
    expected_address, payment_to, spend_of, test_key_source, txid, TEST_SEED,
};
