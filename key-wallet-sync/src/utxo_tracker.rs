//! UTXO diff accumulation between consumer reads.

use std::collections::{BTreeMap, HashSet};

use dashcore::OutPoint;

use crate::types::{AccountId, AddressId, Utxo, UtxoDiff};

/// Selects which accounts and addresses diff recording pays attention to.
/// Empty sets mean everything is of interest.
#[derive(Debug, Default, Clone)]
pub(crate) struct Subscriptions {
    accounts: HashSet<AccountId>,
    addresses: HashSet<AddressId>,
}

impl Subscriptions {
    pub(crate) fn subscribe_account(&mut self, account_id: AccountId) {
        self.accounts.insert(account_id);
    }

    pub(crate) fn subscribe_address(&mut self, address_id: AddressId) {
        self.addresses.insert(address_id);
    }

    pub(crate) fn clear(&mut self) {
        self.accounts.clear();
        self.addresses.clear();
    }

    pub(crate) fn matches(&self, account_id: AccountId, address_id: AddressId) -> bool {
        if self.accounts.is_empty() && self.addresses.is_empty() {
            return true;
        }
        self.accounts.contains(&account_id) || self.addresses.contains(&address_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiffKind {
    Added,
    Modified,
    Removed,
}

/// One UTXO set change produced by ingestion, not yet filtered or merged.
#[derive(Debug, Clone)]
pub(crate) enum DiffOp {
    Added(Utxo),
    Modified(Utxo),
    Removed(Utxo),
}

impl DiffOp {
    fn utxo(&self) -> &Utxo {
        match self {
            DiffOp::Added(u) | DiffOp::Modified(u) | DiffOp::Removed(u) => u,
        }
    }
}

/// Accumulates UTXO set changes between snapshots, collapsing intermediate
/// states per outpoint: an output added and removed within the same window
/// nets out to nothing, one removed and re-added nets out to a change.
#[derive(Default)]
pub(crate) struct DiffTracker {
    entries: BTreeMap<OutPoint, (DiffKind, Utxo)>,
}

impl DiffTracker {
    pub(crate) fn record_added(&mut self, utxo: Utxo) {
        match self.entries.get_mut(&utxo.outpoint) {
            Some((kind @ DiffKind::Removed, existing)) => {
                *kind = DiffKind::Modified;
                *existing = utxo;
            }
            Some((_, existing)) => {
                *existing = utxo;
            }
            None => {
                self.entries.insert(utxo.outpoint, (DiffKind::Added, utxo));
            }
        }
    }

    pub(crate) fn record_modified(&mut self, utxo: Utxo) {
        match self.entries.get_mut(&utxo.outpoint) {
            Some((_, existing)) => {
                *existing = utxo;
            }
            None => {
                self.entries.insert(utxo.outpoint, (DiffKind::Modified, utxo));
            }
        }
    }

    pub(crate) fn record_removed(&mut self, utxo: Utxo) {
        match self.entries.get(&utxo.outpoint).map(|(kind, _)| *kind) {
            Some(DiffKind::Added) => {
                self.entries.remove(&utxo.outpoint);
            }
            _ => {
                self.entries.insert(utxo.outpoint, (DiffKind::Removed, utxo));
            }
        }
    }

    /// Folds a batch of ingestion ops into the accumulator, keeping only
    /// those the current subscriptions care about.
    pub(crate) fn apply_ops(&mut self, subscriptions: &Subscriptions, ops: Vec<DiffOp>) {
        for op in ops {
            let utxo = op.utxo();
            if !subscriptions.matches(utxo.account_id, utxo.address_id) {
                continue;
            }
            match op {
                DiffOp::Added(u) => self.record_added(u),
                DiffOp::Modified(u) => self.record_modified(u),
                DiffOp::Removed(u) => self.record_removed(u),
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current accumulated diff, ordered by outpoint within each class.
    pub(crate) fn snapshot(&self) -> UtxoDiff {
        let mut diff = UtxoDiff::default();
        for (kind, utxo) in self.entries.values() {
            match kind {
                DiffKind::Added => diff.added.push(utxo.clone()),
                DiffKind::Modified => diff.modified.push(utxo.clone()),
                DiffKind::Removed => diff.removed.push(utxo.clone()),
            }
        }
        diff
    }

    pub(crate) fn reset(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashcore::hashes::Hash;
    use dashcore::Txid;

    fn utxo(tx_byte: u8, vout: u32, satoshis: u64, height: u32) -> Utxo {
        Utxo {
            id: (tx_byte as i64) * 100 + vout as i64,
            outpoint: OutPoint {
                txid: Txid::from_byte_array([tx_byte; 32]),
                vout,
            },
            address_id: 1,
            account_id: 1,
            address: "yAddrZero".to_string(),
            satoshis,
            block_height: height,
            coinbase: false,
        }
    }

    #[test]
    fn test_add_then_remove_cancels() {
        let mut tracker = DiffTracker::default();
        tracker.record_added(utxo(1, 0, 1000, 100));
        tracker.record_removed(utxo(1, 0, 1000, 100));
        assert!(tracker.is_empty());
        assert!(tracker.snapshot().is_empty());
    }

    #[test]
    fn test_add_then_modify_stays_added() {
        let mut tracker = DiffTracker::default();
        tracker.record_added(utxo(1, 0, 1000, crate::types::UNCONFIRMED_BLOCK_HEIGHT));
        tracker.record_modified(utxo(1, 0, 1000, 120));

        let diff = tracker.snapshot();
        assert_eq!(diff.added.len(), 1);
        assert!(diff.modified.is_empty());
        assert_eq!(diff.added[0].block_height, 120);
    }

    #[test]
    fn test_modify_then_remove_becomes_removed() {
        let mut tracker = DiffTracker::default();
        tracker.record_modified(utxo(1, 0, 1000, 120));
        tracker.record_removed(utxo(1, 0, 1000, 120));

        let diff = tracker.snapshot();
        assert!(diff.added.is_empty());
        assert!(diff.modified.is_empty());
        assert_eq!(diff.removed.len(), 1);
    }

    #[test]
    fn test_remove_then_add_becomes_modified() {
        let mut tracker = DiffTracker::default();
        tracker.record_removed(utxo(1, 0, 1000, 100));
        tracker.record_added(utxo(1, 0, 1000, 150));

        let diff = tracker.snapshot();
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].block_height, 150);
    }

    #[test]
    fn test_snapshot_keeps_entries_until_reset() {
        let mut tracker = DiffTracker::default();
        tracker.record_added(utxo(1, 0, 1000, 100));
        assert_eq!(tracker.snapshot().added.len(), 1);
        assert_eq!(tracker.snapshot().added.len(), 1);

        tracker.reset();
        assert!(tracker.snapshot().is_empty());
    }

    #[test]
    fn test_apply_ops_respects_subscriptions() {
        let mut subs = Subscriptions::default();
        subs.subscribe_account(1);

        let mut other = utxo(2, 0, 500, 90);
        other.account_id = 9;
        other.address_id = 99;

        let mut tracker = DiffTracker::default();
        tracker.apply_ops(
            &subs,
            vec![DiffOp::Added(utxo(1, 0, 1000, 100)), DiffOp::Added(other)],
        );

        let diff = tracker.snapshot();
        assert_eq!(diff.added.len(), 1);
        assert_eq!(diff.added[0].account_id, 1);
    }

    #[test]
    fn test_apply_ops_merges_in_order() {
        let subs = Subscriptions::default();
        let mut tracker = DiffTracker::default();
        tracker.apply_ops(
            &subs,
            vec![
                DiffOp::Added(utxo(1, 0, 1000, 100)),
                DiffOp::Removed(utxo(1, 0, 1000, 100)),
                DiffOp::Removed(utxo(2, 1, 400, 80)),
            ],
        );

        let diff = tracker.snapshot();
        assert!(diff.added.is_empty());
        assert_eq!(diff.removed.len(), 1);
        assert_eq!(diff.removed[0].outpoint.vout, 1);
    }

    #[test]
    fn test_subscriptions_matching() {
        let mut subs = Subscriptions::default();
        assert!(subs.matches(1, 10), "empty subscriptions match everything");

        subs.subscribe_account(2);
        assert!(subs.matches(2, 99));
        assert!(!subs.matches(1, 10));

        subs.subscribe_address(10);
        assert!(subs.matches(1, 10));
        assert!(!subs.matches(1, 11));

        subs.clear();
        assert!(subs.matches(7, 70));
    }
}
