//! Remote scan bookkeeping and selective-sync filters.
//!
//! Paths in these tables are remote paths (`/ref/ref/...`) always stored
//! with a trailing slash so a prefix test never matches a sibling.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{char_len, path_prefix, PairStateStore};
use crate::errors::Result;

fn delete_under(conn: &Connection, table: &str, prefix: &str) -> Result<usize> {
    Ok(conn.execute(
        &format!("DELETE FROM {} WHERE substr(path, 1, ?1) = ?2", table),
        params![char_len(prefix), prefix],
    )?)
}

fn select_paths(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(&format!("SELECT path FROM {} ORDER BY path", table))?;
    let paths = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(paths)
}

impl PairStateStore {
    /// Schedule a remote folder for a full rescan, replacing any scheduled
    /// subfolder.
    pub fn add_path_to_scan(&self, path: &str) -> Result<()> {
        let path = path_prefix(path);
        self.write(|conn| {
            delete_under(conn, "ToRemoteScan", &path)?;
            conn.execute(
                "INSERT OR IGNORE INTO ToRemoteScan (path) VALUES (?1)",
                params![path],
            )?;
            Ok(())
        })
    }

    pub fn delete_path_to_scan(&self, path: &str) -> Result<()> {
        let path = path_prefix(path);
        self.write(|conn| {
            conn.execute("DELETE FROM ToRemoteScan WHERE path = ?1", params![path])?;
            Ok(())
        })
    }

    pub fn get_paths_to_scan(&self) -> Result<Vec<String>> {
        self.read(|conn| select_paths(conn, "ToRemoteScan"))
    }

    /// Remember `path` was scanned during the current full scan.
    pub fn add_path_scanned(&self, path: &str) -> Result<()> {
        let path = path_prefix(path);
        self.write(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO RemoteScan (path) VALUES (?1)",
                params![path],
            )?;
            Ok(())
        })
    }

    pub fn clean_scanned(&self) -> Result<()> {
        self.write(|conn| {
            conn.execute("DELETE FROM RemoteScan", [])?;
            Ok(())
        })
    }

    pub fn is_path_scanned(&self, path: &str) -> Result<bool> {
        let path = path_prefix(path);
        self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT 1 FROM RemoteScan WHERE path = ?1 LIMIT 1",
                    params![path],
                    |_| Ok(()),
                )
                .optional()?
                .is_some())
        })
    }

    /// Whether `path` lies under a filtered remote path.
    pub fn is_filter(&self, path: &str) -> bool {
        let path = path_prefix(path);
        self.filters.read().iter().any(|f| path.starts_with(f.as_str()))
    }

    pub fn get_filters(&self) -> Result<Vec<String>> {
        self.read(|conn| select_paths(conn, "Filters"))
    }

    /// Exclude a remote subtree from synchronization. Filters below it and
    /// pending rescans inside it are dropped.
    pub fn add_filter(&self, path: &str) -> Result<()> {
        if self.is_filter(path) {
            return Ok(());
        }
        let path = path_prefix(path);
        debug!("Add filter on {:?}", path);
        self.write(|conn| {
            delete_under(conn, "Filters", &path)?;
            delete_under(conn, "ToRemoteScan", &path)?;
            conn.execute("INSERT INTO Filters (path) VALUES (?1)", params![path])?;
            Ok(())
        })?;
        self.reload_filters()
    }

    /// Drop the filter on `path` and every filter below it.
    pub fn remove_filter(&self, path: &str) -> Result<()> {
        let path = path_prefix(path);
        debug!("Remove filter on {:?}", path);
        self.write(|conn| delete_under(conn, "Filters", &path))?;
        self.reload_filters()
    }

    pub(crate) fn reload_filters(&self) -> Result<()> {
        let filters = self.write(|conn| select_paths(conn, "Filters"))?;
        *self.filters.write() = filters;
        Ok(())
    }
}
