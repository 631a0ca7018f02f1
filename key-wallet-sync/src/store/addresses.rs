//! Address-tree queries: HD trees, accounts, chains and leaf addresses.

use rusqlite::{named_params, Connection, OptionalExtension};

use crate::types::{
    Account, AccountId, AccountStatus, AddressEntry, AddressId, HdTree, TreeId,
};

const ACCOUNT_SELECT: &str = "SELECT id, tree_id, address_index, xpub, xpub_hash, path, label,
            status, balance, received
     FROM address";

const LEAF_SELECT: &str = "SELECT a.id, c.parent_id, c.address_index, a.address_index, a.address, a.path,
            a.label, a.balance, a.received, a.last_scan_block_height
     FROM address a
     JOIN address c ON a.parent_id = c.id";

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let status_raw: i64 = row.get(7)?;
    let status = AccountStatus::from_db(status_raw)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(7, status_raw))?;
    Ok(Account {
        id: row.get(0)?,
        tree_id: row.get(1)?,
        account_index: row.get::<_, i64>(2)? as u32,
        xpub: row.get(3)?,
        xpub_hash: row.get(4)?,
        path: row.get(5)?,
        label: row.get(6)?,
        status,
        balance: row.get::<_, i64>(8)?.max(0) as u64,
        received: row.get::<_, i64>(9)?.max(0) as u64,
    })
}

fn leaf_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AddressEntry> {
    Ok(AddressEntry {
        id: row.get(0)?,
        account_id: row.get(1)?,
        chain: row.get::<_, i64>(2)? as u32,
        address_index: row.get::<_, i64>(3)? as u32,
        address: row.get(4)?,
        path: row.get(5)?,
        label: row.get(6)?,
        balance: row.get::<_, i64>(7)?.max(0) as u64,
        received: row.get::<_, i64>(8)?.max(0) as u64,
        last_scan_block_height: row.get::<_, i64>(9)? as u32,
    })
}

pub(crate) fn tree_by_ident(
    conn: &Connection,
    ident: &str,
) -> rusqlite::Result<Option<HdTree>> {
    conn.prepare_cached("SELECT id, ident, label FROM hd_tree WHERE ident = :ident")?
        .query_row(named_params![":ident": ident], |row| {
            Ok(HdTree {
                id: row.get(0)?,
                ident: row.get(1)?,
                label: row.get(2)?,
            })
        })
        .optional()
}

pub(crate) fn insert_tree(conn: &Connection, ident: &str) -> rusqlite::Result<TreeId> {
    conn.prepare_cached("INSERT INTO hd_tree (ident) VALUES (:ident)")?
        .execute(named_params![":ident": ident])?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn account_by_xpub_hash(
    conn: &Connection,
    tree_id: TreeId,
    xpub_hash: &str,
) -> rusqlite::Result<Option<Account>> {
    let sql = format!(
        "{ACCOUNT_SELECT} WHERE parent_id IS NULL AND tree_id = :tree_id AND xpub_hash = :xpub_hash"
    );
    conn.prepare_cached(&sql)?
        .query_row(
            named_params![":tree_id": tree_id, ":xpub_hash": xpub_hash],
            account_from_row,
        )
        .optional()
}

pub(crate) fn account_by_id(
    conn: &Connection,
    account_id: AccountId,
) -> rusqlite::Result<Option<Account>> {
    let sql = format!("{ACCOUNT_SELECT} WHERE parent_id IS NULL AND id = :id");
    conn.prepare_cached(&sql)?
        .query_row(named_params![":id": account_id], account_from_row)
        .optional()
}

pub(crate) fn insert_account(
    conn: &Connection,
    tree_id: TreeId,
    account_index: u32,
    xpub: &str,
    xpub_hash: &str,
    path: &str,
) -> rusqlite::Result<AccountId> {
    conn.prepare_cached(
        "INSERT INTO address (tree_id, address_index, xpub, xpub_hash, path)
         VALUES (:tree_id, :address_index, :xpub, :xpub_hash, :path)",
    )?
    .execute(named_params![
        ":tree_id": tree_id,
        ":address_index": account_index as i64,
        ":xpub": xpub,
        ":xpub_hash": xpub_hash,
        ":path": path,
    ])?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn list_accounts(
    conn: &Connection,
    tree_id: TreeId,
    include_hidden: bool,
) -> rusqlite::Result<Vec<Account>> {
    let sql = if include_hidden {
        format!(
            "{ACCOUNT_SELECT} WHERE parent_id IS NULL AND tree_id = :tree_id ORDER BY address_index"
        )
    } else {
        format!(
            "{ACCOUNT_SELECT} WHERE parent_id IS NULL AND tree_id = :tree_id AND status != 3
             ORDER BY address_index"
        )
    };
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(named_params![":tree_id": tree_id], account_from_row)?;
    rows.collect()
}

pub(crate) fn update_account_totals(
    conn: &Connection,
    account_id: AccountId,
    balance: i64,
    received: i64,
) -> rusqlite::Result<()> {
    conn.prepare_cached(
        "UPDATE address SET balance = :balance, received = :received WHERE id = :id",
    )?
    .execute(named_params![":balance": balance, ":received": received, ":id": account_id])?;
    Ok(())
}

/// Sums leaf balances and lifetime received over both chains of an account.
pub(crate) fn account_child_sums(
    conn: &Connection,
    account_id: AccountId,
) -> rusqlite::Result<(i64, i64)> {
    conn.prepare_cached(
        "SELECT COALESCE(SUM(a.balance), 0), COALESCE(SUM(a.received), 0)
         FROM address a
         JOIN address c ON a.parent_id = c.id
         WHERE c.parent_id = :account_id",
    )?
    .query_row(named_params![":account_id": account_id], |row| {
        Ok((row.get(0)?, row.get(1)?))
    })
}

pub(crate) fn set_account_label(
    conn: &Connection,
    account_id: AccountId,
    label: Option<&str>,
) -> rusqlite::Result<()> {
    conn.prepare_cached("UPDATE address SET label = :label WHERE id = :id")?
        .execute(named_params![":label": label, ":id": account_id])?;
    Ok(())
}

pub(crate) fn set_account_status(
    conn: &Connection,
    account_id: AccountId,
    status: AccountStatus,
) -> rusqlite::Result<()> {
    conn.prepare_cached("UPDATE address SET status = :status WHERE id = :id")?
        .execute(named_params![":status": status.to_db(), ":id": account_id])?;
    Ok(())
}

/// Row id of the chain-level node under an account, if present.
pub(crate) fn chain_row(
    conn: &Connection,
    account_id: AccountId,
    chain: u32,
) -> rusqlite::Result<Option<i64>> {
    conn.prepare_cached(
        "SELECT id FROM address WHERE parent_id = :parent_id AND address_index = :chain",
    )?
    .query_row(
        named_params![":parent_id": account_id, ":chain": chain as i64],
        |row| row.get(0),
    )
    .optional()
}

pub(crate) fn insert_chain_row(
    conn: &Connection,
    account_id: AccountId,
    chain: u32,
    path: &str,
) -> rusqlite::Result<i64> {
    conn.prepare_cached(
        "INSERT INTO address (parent_id, address_index, path) VALUES (:parent_id, :chain, :path)",
    )?
    .execute(named_params![":parent_id": account_id, ":chain": chain as i64, ":path": path])?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn address_by_slot(
    conn: &Connection,
    chain_row_id: i64,
    address_index: u32,
) -> rusqlite::Result<Option<AddressEntry>> {
    let sql = format!(
        "{LEAF_SELECT} WHERE a.parent_id = :parent_id AND a.address_index = :address_index"
    );
    conn.prepare_cached(&sql)?
        .query_row(
            named_params![":parent_id": chain_row_id, ":address_index": address_index as i64],
            leaf_from_row,
        )
        .optional()
}

pub(crate) fn address_by_id(
    conn: &Connection,
    address_id: AddressId,
) -> rusqlite::Result<Option<AddressEntry>> {
    let sql = format!("{LEAF_SELECT} WHERE a.id = :id");
    conn.prepare_cached(&sql)?
        .query_row(named_params![":id": address_id], leaf_from_row)
        .optional()
}

/// Raw lookup by address string, shape-agnostic. Used to claim rows that
/// were stored before their derivation slot was known.
pub(crate) struct AddressRowRef {
    pub id: i64,
    pub parent_id: Option<i64>,
    pub address_index: Option<i64>,
}

pub(crate) fn address_row_by_string(
    conn: &Connection,
    address: &str,
) -> rusqlite::Result<Option<AddressRowRef>> {
    conn.prepare_cached(
        "SELECT id, parent_id, address_index FROM address WHERE address = :address",
    )?
    .query_row(named_params![":address": address], |row| {
        Ok(AddressRowRef {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            address_index: row.get(2)?,
        })
    })
    .optional()
}

pub(crate) fn claim_address_row(
    conn: &Connection,
    row_id: i64,
    chain_row_id: i64,
    address_index: u32,
    path: &str,
) -> rusqlite::Result<()> {
    conn.prepare_cached(
        "UPDATE address SET parent_id = :parent_id, address_index = :address_index, path = :path
         WHERE id = :id",
    )?
    .execute(named_params![
        ":parent_id": chain_row_id,
        ":address_index": address_index as i64,
        ":path": path,
        ":id": row_id,
    ])?;
    Ok(())
}

pub(crate) fn insert_address(
    conn: &Connection,
    chain_row_id: i64,
    address_index: u32,
    address: &str,
    path: &str,
) -> rusqlite::Result<AddressId> {
    conn.prepare_cached(
        "INSERT INTO address (parent_id, address_index, address, path)
         VALUES (:parent_id, :address_index, :address, :path)",
    )?
    .execute(named_params![
        ":parent_id": chain_row_id,
        ":address_index": address_index as i64,
        ":address": address,
        ":path": path,
    ])?;
    Ok(conn.last_insert_rowid())
}

/// Leaf entry for an address string, restricted to one HD tree.
pub(crate) fn address_entry_by_string(
    conn: &Connection,
    tree_id: TreeId,
    address: &str,
) -> rusqlite::Result<Option<AddressEntry>> {
    let sql = format!(
        "{LEAF_SELECT}
         JOIN address acct ON c.parent_id = acct.id
         WHERE a.address = :address AND acct.tree_id = :tree_id"
    );
    conn.prepare_cached(&sql)?
        .query_row(
            named_params![":address": address, ":tree_id": tree_id],
            leaf_from_row,
        )
        .optional()
}

pub(crate) fn list_chain_addresses(
    conn: &Connection,
    chain_row_id: i64,
) -> rusqlite::Result<Vec<AddressEntry>> {
    let sql = format!("{LEAF_SELECT} WHERE a.parent_id = :parent_id ORDER BY a.address_index");
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(named_params![":parent_id": chain_row_id], leaf_from_row)?;
    rows.collect()
}

pub(crate) fn list_account_addresses(
    conn: &Connection,
    account_id: AccountId,
) -> rusqlite::Result<Vec<AddressEntry>> {
    let sql = format!(
        "{LEAF_SELECT} WHERE c.parent_id = :account_id
         ORDER BY c.address_index, a.address_index"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(named_params![":account_id": account_id], leaf_from_row)?;
    rows.collect()
}

pub(crate) fn list_tree_addresses(
    conn: &Connection,
    tree_id: TreeId,
) -> rusqlite::Result<Vec<AddressEntry>> {
    let sql = format!(
        "{LEAF_SELECT}
         JOIN address acct ON c.parent_id = acct.id
         WHERE acct.tree_id = :tree_id
         ORDER BY acct.address_index, c.address_index, a.address_index"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(named_params![":tree_id": tree_id], leaf_from_row)?;
    rows.collect()
}

pub(crate) fn update_address_totals(
    conn: &Connection,
    address_id: AddressId,
    balance: i64,
    received: i64,
) -> rusqlite::Result<()> {
    conn.prepare_cached(
        "UPDATE address SET balance = :balance, received = :received WHERE id = :id",
    )?
    .execute(named_params![":balance": balance, ":received": received, ":id": address_id])?;
    Ok(())
}

pub(crate) fn set_address_label(
    conn: &Connection,
    address_id: AddressId,
    label: Option<&str>,
) -> rusqlite::Result<()> {
    conn.prepare_cached("UPDATE address SET label = :label WHERE id = :id")?
        .execute(named_params![":label": label, ":id": address_id])?;
    Ok(())
}

pub(crate) fn set_last_scan_height(
    conn: &Connection,
    address_ids: &[AddressId],
    height: u32,
) -> rusqlite::Result<()> {
    let mut stmt = conn
        .prepare_cached("UPDATE address SET last_scan_block_height = :height WHERE id = :id")?;
    for id in address_ids {
        stmt.execute(named_params![":height": height as i64, ":id": id])?;
    }
    Ok(())
}

/// Rewinds every leaf of the tree to unscanned. Returns the row count.
pub(crate) fn reset_scan_heights(
    conn: &Connection,
    tree_id: TreeId,
) -> rusqlite::Result<usize> {
    conn.prepare_cached(
        "UPDATE address SET last_scan_block_height = 0
         WHERE id IN (
             SELECT a.id FROM address a
             JOIN address c ON a.parent_id = c.id
             JOIN address acct ON c.parent_id = acct.id
             WHERE acct.tree_id = :tree_id
         )",
    )?
    .execute(named_params![":tree_id": tree_id])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::init(&conn).unwrap();
        conn
    }

    fn seed_tree(conn: &Connection) -> (TreeId, AccountId, i64) {
        let tree_id = insert_tree(conn, "a1b2c3d4").unwrap();
        let account_id =
            insert_account(conn, tree_id, 0, "xpub-test", "hash-test", "m/44'/1'/0'").unwrap();
        let chain_row_id = insert_chain_row(conn, account_id, 0, "m/44'/1'/0'/0").unwrap();
        (tree_id, account_id, chain_row_id)
    }

    #[test]
    fn test_tree_roundtrip() {
        let conn = conn();
        assert!(tree_by_ident(&conn, "a1b2c3d4").unwrap().is_none());
        let id = insert_tree(&conn, "a1b2c3d4").unwrap();
        let tree = tree_by_ident(&conn, "a1b2c3d4").unwrap().unwrap();
        assert_eq!(tree.id, id);
        assert_eq!(tree.ident, "a1b2c3d4");
    }

    #[test]
    fn test_account_lookup_is_tree_scoped() {
        let conn = conn();
        let (tree_id, account_id, _) = seed_tree(&conn);
        let other_tree = insert_tree(&conn, "ffffffff").unwrap();

        let found = account_by_xpub_hash(&conn, tree_id, "hash-test").unwrap().unwrap();
        assert_eq!(found.id, account_id);
        assert_eq!(found.account_index, 0);
        assert!(account_by_xpub_hash(&conn, other_tree, "hash-test").unwrap().is_none());
    }

    #[test]
    fn test_leaf_roundtrip_and_slot_uniqueness() {
        let conn = conn();
        let (_, account_id, chain_row_id) = seed_tree(&conn);

        let id = insert_address(&conn, chain_row_id, 5, "yAddrFive", "m/44'/1'/0'/0/5").unwrap();
        let entry = address_by_slot(&conn, chain_row_id, 5).unwrap().unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.account_id, account_id);
        assert_eq!(entry.chain, 0);
        assert_eq!(entry.address_index, 5);
        assert_eq!(entry.address, "yAddrFive");
        assert_eq!(entry.last_scan_block_height, 0);

        // Same (parent, index) slot must be rejected by the store itself.
        assert!(insert_address(&conn, chain_row_id, 5, "yOther", "m/44'/1'/0'/0/5").is_err());
    }

    #[test]
    fn test_claim_unbound_row() {
        let conn = conn();
        let (_, _, chain_row_id) = seed_tree(&conn);

        conn.execute(
            "INSERT INTO address (address) VALUES ('yLooseAddr')",
            [],
        )
        .unwrap();
        let row = address_row_by_string(&conn, "yLooseAddr").unwrap().unwrap();
        assert!(row.parent_id.is_none());

        claim_address_row(&conn, row.id, chain_row_id, 2, "m/44'/1'/0'/0/2").unwrap();
        let entry = address_by_slot(&conn, chain_row_id, 2).unwrap().unwrap();
        assert_eq!(entry.address, "yLooseAddr");
    }

    #[test]
    fn test_list_is_ordered_and_hidden_filtered() {
        let conn = conn();
        let (tree_id, account_id, chain_row_id) = seed_tree(&conn);
        insert_address(&conn, chain_row_id, 1, "yOne", "m/44'/1'/0'/0/1").unwrap();
        insert_address(&conn, chain_row_id, 0, "yZero", "m/44'/1'/0'/0/0").unwrap();

        let listed = list_chain_addresses(&conn, chain_row_id).unwrap();
        assert_eq!(
            listed.iter().map(|a| a.address_index).collect::<Vec<_>>(),
            vec![0, 1]
        );

        let second =
            insert_account(&conn, tree_id, 1, "xpub-two", "hash-two", "m/44'/1'/1'").unwrap();
        set_account_status(&conn, second, AccountStatus::Hidden).unwrap();
        let visible = list_accounts(&conn, tree_id, false).unwrap();
        assert_eq!(visible.iter().map(|a| a.id).collect::<Vec<_>>(), vec![account_id]);
        assert_eq!(list_accounts(&conn, tree_id, true).unwrap().len(), 2);
    }

    #[test]
    fn test_reset_scan_heights() {
        let conn = conn();
        let (tree_id, _, chain_row_id) = seed_tree(&conn);
        let a = insert_address(&conn, chain_row_id, 0, "yZero", "m/44'/1'/0'/0/0").unwrap();
        set_last_scan_height(&conn, &[a], 500).unwrap();
        assert_eq!(
            address_by_id(&conn, a).unwrap().unwrap().last_scan_block_height,
            500
        );

        let reset = reset_scan_heights(&conn, tree_id).unwrap();
        assert_eq!(reset, 1);
        assert_eq!(
            address_by_id(&conn, a).unwrap().unwrap().last_scan_block_height,
            0
        );
    }
}
