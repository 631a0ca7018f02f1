//! Binding between an attached key source and its persisted HD tree.

use rusqlite::Connection;

use crate::derivation::AddressCache;
use crate::error::{SyncError, SyncResult};
use crate::key_source::KeySource;
use crate::store::addresses;
use crate::types::{HdTree, TreeId};

/// Tree row for `ident`, created on first sight.
pub(crate) fn load_or_create_tree(conn: &Connection, ident: &str) -> SyncResult<HdTree> {
    if let Some(tree) = addresses::tree_by_ident(conn, ident)? {
        return Ok(tree);
    }
    let id = addresses::insert_tree(conn, ident)?;
    tracing::debug!("registered hd tree {} as row {}", ident, id);
    Ok(HdTree {
        id,
        ident: ident.to_string(),
        label: None,
    })
}

/// Confirms the cache is bound to the tree of the currently attached key
/// source, binding it when fresh. A cache still bound to a different tree
/// is refused; the caller has to go through an explicit key switch.
pub(crate) fn ensure_bound(
    conn: &Connection,
    cache: &mut AddressCache,
    key_source: Option<&dyn KeySource>,
) -> SyncResult<TreeId> {
    let Some(key_source) = key_source else {
        return Err(SyncError::NoKeySource);
    };
    let ident = key_source.tree_ident()?;
    if let Some(tree) = cache.tree() {
        if tree.ident == ident {
            return Ok(tree.id);
        }
        return Err(SyncError::IdentitySwitched);
    }
    let tree = load_or_create_tree(conn, &ident)?;
    let id = tree.id;
    cache.bind(tree);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_source::SoftwareKeySource;
    use crate::store::WalletStore;
    use dashcore::Network;

    #[test]
    fn test_load_or_create_is_idempotent() {
        let store = WalletStore::open_in_memory().unwrap();
        let first = load_or_create_tree(store.conn(), "aabbccdd").unwrap();
        let second = load_or_create_tree(store.conn(), "aabbccdd").unwrap();
        assert_eq!(first.id, second.id);

        let other = load_or_create_tree(store.conn(), "11223344").unwrap();
        assert_ne!(first.id, other.id);
    }

    #[test]
    fn test_ensure_bound_requires_key_source() {
        let store = WalletStore::open_in_memory().unwrap();
        let mut cache = AddressCache::new();
        let result = ensure_bound(store.conn(), &mut cache, None);
        assert!(matches!(result, Err(SyncError::NoKeySource)));
    }

    #[test]
    fn test_ensure_bound_binds_and_reuses() {
        let store = WalletStore::open_in_memory().unwrap();
        let mut cache = AddressCache::new();
        let source = SoftwareKeySource::from_seed(Network::Testnet, &[9u8; 16]).unwrap();

        let first = ensure_bound(store.conn(), &mut cache, Some(&source)).unwrap();
        assert_eq!(cache.tree_id(), Some(first));
        let second = ensure_bound(store.conn(), &mut cache, Some(&source)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_ensure_bound_refuses_identity_switch() {
        let store = WalletStore::open_in_memory().unwrap();
        let mut cache = AddressCache::new();
        let original = SoftwareKeySource::from_seed(Network::Testnet, &[9u8; 16]).unwrap();
        ensure_bound(store.conn(), &mut cache, Some(&original)).unwrap();

        let replacement = SoftwareKeySource::from_seed(Network::Testnet, &[10u8; 16]).unwrap();
        let result = ensure_bound(store.conn(), &mut cache, Some(&replacement));
        assert!(matches!(result, Err(SyncError::IdentitySwitched)));
    }
}
