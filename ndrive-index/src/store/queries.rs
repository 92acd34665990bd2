//! Read-only lookups on the `States` table.

use rusqlite::params;

use super::{char_len, path_prefix, select_pair, select_pairs, PairStateStore};
use crate::errors::Result;
use crate::pair::{DocPair, Transfer};

/// Error count past which a pair is reported as failing.
pub const ERROR_THRESHOLD: u32 = 3;

/// Kind of items counted by [`PairStateStore::get_sync_count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    File,
    Folder,
}

impl PairStateStore {
    pub fn get_state_from_id(&self, id: i64) -> Result<Option<DocPair>> {
        self.read(|conn| select_pair(conn, "id = ?1", params![id]))
    }

    pub fn get_state_from_local(&self, path: &str) -> Result<Option<DocPair>> {
        self.read(|conn| select_pair(conn, "local_path = ?1", params![path]))
    }

    pub fn get_states_from_remote(&self, remote_ref: &str) -> Result<Vec<DocPair>> {
        self.read(|conn| select_pairs(conn, "remote_ref = ?1", params![remote_ref]))
    }

    /// First pair bound to `remote_ref`.
    pub fn get_normal_state_from_remote(&self, remote_ref: &str) -> Result<Option<DocPair>> {
        Ok(self.get_states_from_remote(remote_ref)?.into_iter().next())
    }

    /// Pair bound to `remote_ref` under the remote parent path `path`; the
    /// root is stored with an empty parent path.
    pub fn get_state_from_remote_with_path(&self, remote_ref: &str, path: &str) -> Result<Option<DocPair>> {
        let path = if path == "/" { "" } else { path };
        self.read(|conn| {
            select_pair(
                conn,
                "remote_ref = ?1 AND remote_parent_path = ?2",
                params![remote_ref, path],
            )
        })
    }

    /// Oldest pair whose remote reference ends with `suffix`, usually a document uid.
    pub fn get_first_state_from_partial_remote(&self, suffix: &str) -> Result<Option<DocPair>> {
        self.read(|conn| {
            select_pair(
                conn,
                "substr(remote_ref, -?2) = ?1 ORDER BY last_remote_updated ASC",
                params![suffix, char_len(suffix)],
            )
        })
    }

    /// Pairs whose local path starts with `path`. With `strict`, only those
    /// strictly under it.
    pub fn get_states_from_partial_local(&self, path: &str, strict: bool) -> Result<Vec<DocPair>> {
        let prefix = if strict { path_prefix(path) } else { path.to_string() };
        self.read(|conn| {
            select_pairs(
                conn,
                "substr(local_path, 1, ?1) = ?2",
                params![char_len(&prefix), prefix],
            )
        })
    }

    pub fn get_local_children(&self, path: &str) -> Result<Vec<DocPair>> {
        self.read(|conn| select_pairs(conn, "local_parent_path = ?1", params![path]))
    }

    pub fn get_remote_children(&self, remote_ref: &str) -> Result<Vec<DocPair>> {
        self.read(|conn| select_pairs(conn, "remote_parent_ref = ?1", params![remote_ref]))
    }

    /// Remote children not yet materialized locally.
    pub fn get_new_remote_children(&self, remote_ref: &str) -> Result<Vec<DocPair>> {
        self.read(|conn| {
            select_pairs(
                conn,
                "remote_parent_ref = ?1 AND remote_state = 'created' AND local_state = 'unknown'",
                params![remote_ref],
            )
        })
    }

    /// Pairs whose remote parent path starts with `path`.
    pub fn get_remote_descendants(&self, path: &str) -> Result<Vec<DocPair>> {
        self.read(|conn| {
            select_pairs(
                conn,
                "substr(remote_parent_path, 1, ?1) = ?2",
                params![char_len(path), path],
            )
        })
    }

    /// A synchronized file with `digest` on both sides, to copy instead of download.
    pub fn get_valid_duplicate_file(&self, digest: &str) -> Result<Option<DocPair>> {
        self.read(|conn| {
            select_pair(
                conn,
                "local_digest = ?1 AND remote_digest = ?1 AND pair_state = 'synchronized'",
                params![digest],
            )
        })
    }

    /// Another pair named `name` under the same remote parent.
    pub fn get_dedupe_pair(&self, name: &str, remote_parent_ref: &str, id: i64) -> Result<Option<DocPair>> {
        self.read(|conn| {
            select_pair(
                conn,
                "id != ?1 AND local_name = ?2 AND remote_parent_ref = ?3",
                params![id, name, remote_parent_ref],
            )
        })
    }

    /// Last synchronized files, newest first, optionally filtered by
    /// transfer direction and to the last `minutes`.
    pub fn get_last_files(
        &self,
        number: u32,
        direction: Option<Transfer>,
        minutes: Option<u32>,
    ) -> Result<Vec<DocPair>> {
        let mut clause = String::from("pair_state = 'synchronized' AND folderish = 0");
        if direction.is_some() {
            clause.push_str(" AND last_transfer = ?2");
        } else {
            clause.push_str(" AND ?2 IS NULL");
        }
        if let Some(minutes) = minutes {
            clause.push_str(&format!(
                " AND datetime(last_sync_date, '+{} minutes') > datetime('now')",
                minutes
            ));
        }
        clause.push_str(" ORDER BY last_sync_date DESC LIMIT ?1");
        self.read(|conn| select_pairs(conn, &clause, params![number, direction]))
    }

    fn count(&self, condition: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM States WHERE {}", condition);
        self.read(|conn| {
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
    }

    pub fn get_unsynchronized_count(&self) -> Result<u64> {
        self.count("pair_state = 'unsynchronized'")
    }

    pub fn get_conflict_count(&self) -> Result<u64> {
        self.count("pair_state = 'conflicted'")
    }

    pub fn get_error_count(&self) -> Result<u64> {
        self.count(&format!("error_count > {}", ERROR_THRESHOLD))
    }

    /// Pairs with work left that are neither conflicted nor failing.
    pub fn get_syncing_count(&self) -> Result<u64> {
        self.count(&format!(
            "pair_state NOT IN ('synchronized', 'conflicted', 'unsynchronized')
             AND error_count < {}",
            ERROR_THRESHOLD
        ))
    }

    pub fn get_sync_count(&self, kind: Option<ItemKind>) -> Result<u64> {
        match kind {
            None => self.count("pair_state = 'synchronized'"),
            Some(ItemKind::File) => self.count("pair_state = 'synchronized' AND folderish = 0"),
            Some(ItemKind::Folder) => self.count("pair_state = 'synchronized' AND folderish = 1"),
        }
    }

    /// Total size of synchronized files.
    pub fn get_global_size(&self) -> Result<u64> {
        self.read(|conn| {
            let total: Option<i64> = conn.query_row(
                "SELECT SUM(size) FROM States WHERE folderish = 0 AND pair_state = 'synchronized'",
                [],
                |row| row.get(0),
            )?;
            Ok(total.unwrap_or(0).max(0) as u64)
        })
    }

    pub fn get_conflicts(&self) -> Result<Vec<DocPair>> {
        self.read(|conn| select_pairs(conn, "pair_state = 'conflicted'", []))
    }

    pub fn get_errors(&self) -> Result<Vec<DocPair>> {
        self.read(|conn| select_pairs(conn, "error_count > ?1", params![ERROR_THRESHOLD]))
    }

    pub fn get_unsynchronizeds(&self) -> Result<Vec<DocPair>> {
        self.read(|conn| select_pairs(conn, "pair_state = 'unsynchronized'", []))
    }
}

#[cfg(test)]
mod tests {
    use super::super::states::tests::{local_info, remote_info};
    use super::super::tests::open_store;
    use super::*;
    use crate::pair::{PairState, SideState};

    #[test]
    fn test_lookup_by_local_and_remote() {
        let (_dir, store, _) = open_store();
        let id = store
            .insert_remote_state(&remote_info("ns#doc-1", "root", "a", false), "/root", "/a", "/")
            .unwrap()
            .unwrap();

        assert_eq!(store.get_state_from_local("/a").unwrap().unwrap().id, id);
        assert_eq!(store.get_states_from_remote("ns#doc-1").unwrap().len(), 1);
        assert_eq!(store.get_normal_state_from_remote("ns#doc-1").unwrap().unwrap().id, id);
        assert_eq!(
            store.get_first_state_from_partial_remote("doc-1").unwrap().unwrap().id,
            id
        );
        assert!(store.get_first_state_from_partial_remote("doc-2").unwrap().is_none());
        assert!(store
            .get_state_from_remote_with_path("ns#doc-1", "/root")
            .unwrap()
            .is_some());
        assert_eq!(store.get_remote_children("root").unwrap().len(), 1);
        assert_eq!(store.get_new_remote_children("root").unwrap().len(), 1);
    }

    #[test]
    fn test_root_remote_path_is_empty() {
        let (_dir, store, _) = open_store();
        let mut root = remote_info("root", "none", "Nuxeo Drive", true);
        root.parent_uid = None;
        store.insert_remote_state(&root, "", "/", "").unwrap();
        assert!(store.get_state_from_remote_with_path("root", "/").unwrap().is_some());
    }

    #[test]
    fn test_partial_local_is_strict_by_default() {
        let (_dir, store, _) = open_store();
        store.insert_local_state(&local_info("/A", true), None).unwrap();
        store.insert_local_state(&local_info("/A/x", false), None).unwrap();
        store.insert_local_state(&local_info("/AB", false), None).unwrap();

        assert_eq!(store.get_states_from_partial_local("/A", true).unwrap().len(), 1);
        assert_eq!(store.get_states_from_partial_local("/A", false).unwrap().len(), 3);
        assert_eq!(store.get_local_children("/A").unwrap().len(), 1);
    }

    #[test]
    fn test_counts() {
        let (_dir, store, _) = open_store();
        let file = store.insert_local_state(&local_info("/f", false), None).unwrap();
        let folder = store.insert_local_state(&local_info("/d", true), None).unwrap();
        let conflicted = store.insert_local_state(&local_info("/c", false), None).unwrap();
        assert_eq!(store.get_syncing_count().unwrap(), 3);

        let mut row = store.get_state_from_id(file).unwrap().unwrap();
        row.local_state = SideState::Synchronized;
        row.remote_state = SideState::Synchronized;
        store.synchronize_state(&row, None, false).unwrap();
        let folder_row = store.get_state_from_id(folder).unwrap().unwrap();
        store.synchronize_state(&folder_row, None, false).unwrap();
        store
            .set_conflict_state(&store.get_state_from_id(conflicted).unwrap().unwrap())
            .unwrap();

        assert_eq!(store.get_sync_count(None).unwrap(), 2);
        assert_eq!(store.get_sync_count(Some(ItemKind::File)).unwrap(), 1);
        assert_eq!(store.get_sync_count(Some(ItemKind::Folder)).unwrap(), 1);
        assert_eq!(store.get_conflict_count().unwrap(), 1);
        assert_eq!(store.get_conflicts().unwrap()[0].pair_state, PairState::Conflicted);
        assert_eq!(store.get_syncing_count().unwrap(), 0);
        assert_eq!(store.get_global_size().unwrap(), 0);

        let last = store.get_last_files(10, None, None).unwrap();
        assert_eq!(last.len(), 1);
        assert!(store.get_last_files(10, Some(Transfer::Upload), None).unwrap().is_empty());
        store.update_last_transfer(file, Transfer::Upload).unwrap();
        assert_eq!(
            store.get_last_files(10, Some(Transfer::Upload), Some(60)).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_error_threshold() {
        let (_dir, store, _) = open_store();
        let id = store.insert_local_state(&local_info("/f", false), None).unwrap();
        let row = store.get_state_from_id(id).unwrap().unwrap();
        store.increase_error(&row, "UPLOAD", None, ERROR_THRESHOLD).unwrap();
        assert_eq!(store.get_error_count().unwrap(), 0);
        store.increase_error(&row, "UPLOAD", None, 1).unwrap();
        assert_eq!(store.get_error_count().unwrap(), 1);
        assert_eq!(store.get_errors().unwrap().len(), 1);
        assert_eq!(store.get_syncing_count().unwrap(), 0);
    }

    #[test]
    fn test_dedupe_and_duplicate_lookup() {
        let (_dir, store, _) = open_store();
        let a = store
            .insert_remote_state(&remote_info("a", "root", "same", false), "/root", "/same", "/")
            .unwrap()
            .unwrap();
        let b = store
            .insert_remote_state(&remote_info("b", "root", "same", false), "/root", "/same__1", "/")
            .unwrap()
            .unwrap();
        assert_eq!(store.get_dedupe_pair("same", "root", a).unwrap().unwrap().id, b);
        assert!(store.get_valid_duplicate_file("digest-a").unwrap().is_none());
    }
}
