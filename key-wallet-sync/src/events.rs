//! Observer notifications for wallet state changes.

use std::sync::{Arc, Mutex};

use crate::types::{Account, AddressEntry};

/// Callbacks invoked as the engine discovers and updates wallet state.
///
/// All methods default to no-ops so implementors opt into the events they
/// care about. Callbacks run on the thread that performed the change, after
/// the engine has committed the change and released its locks, so an
/// implementation may call back into the engine's read APIs.
pub trait WalletObserver: Send + Sync {
    /// A new account row was created.
    fn on_account_added(&self, _account: &Account) {}

    /// A new address row was created, or a previously unbound row was
    /// claimed into the tree.
    fn on_address_added(&self, _address: &AddressEntry) {}

    /// An account's balance changed during reconciliation.
    fn on_balance_changed(&self, _account: &Account) {}

    /// A stored address entry was handed out by an enumeration operation.
    fn on_address_loaded(&self, _address: &AddressEntry) {}
}

/// Event payloads queued while a store mutation is in flight and delivered
/// once it has committed.
#[derive(Debug, Clone)]
pub(crate) enum WalletEvent {
    AccountAdded(Account),
    AddressAdded(AddressEntry),
    BalanceChanged(Account),
    AddressLoaded(AddressEntry),
}

/// Fans events out to registered observers.
pub(crate) struct NotificationHub {
    observers: Mutex<Vec<Arc<dyn WalletObserver>>>,
}

impl NotificationHub {
    pub(crate) fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(&self, observer: Arc<dyn WalletObserver>) {
        self.observers.lock().unwrap().push(observer);
    }

    /// Delivers one event to every observer. The observer list lock is not
    /// held while callbacks run.
    pub(crate) fn dispatch(&self, event: &WalletEvent) {
        let observers = self.observers.lock().unwrap().clone();
        for observer in &observers {
            match event {
                WalletEvent::AccountAdded(account) => observer.on_account_added(account),
                WalletEvent::AddressAdded(address) => observer.on_address_added(address),
                WalletEvent::BalanceChanged(account) => observer.on_balance_changed(account),
                WalletEvent::AddressLoaded(address) => observer.on_address_loaded(address),
            }
        }
    }

    pub(crate) fn dispatch_all(&self, events: impl IntoIterator<Item = WalletEvent>) {
        for event in events {
            self.dispatch(&event);
        }
    }
}
