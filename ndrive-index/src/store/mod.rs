//! Pair-state database of one engine.
//!
//! Writes go through a single connection guarded by a reentrant mutex, so
//! one thread can hold a transaction across several store calls. Reads use
//! pooled connections unless a transaction is open, in which case they go
//! through the writer and wait on the same gate.

mod queries;
mod scan;
mod states;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock};
use rusqlite::{params, Connection, OptionalExtension, Params};
use tracing::{debug, info, trace};

use ndrive_client::DigestAlgorithm;

use crate::database_pool::DatabasePool;
use crate::errors::Result;
use crate::migrations::{run_migrations, MigrationManager};
use crate::pair::{DocPair, PairState};
use crate::queue::{PairQueue, QueueItem};
use crate::schema::{CONFIGURATION_TABLE, ENGINE_PRAGMAS, ENGINE_SCHEMA};

pub use queries::{ItemKind, ERROR_THRESHOLD};
pub use states::RemoteUpdate;

/// Configuration keys reset along with the States table.
pub const REMOTE_SYNC_KEYS: [&str; 5] = [
    "remote_last_sync_date",
    "remote_last_event_log_id",
    "remote_last_event_last_root_definitions",
    "remote_last_full_scan",
    "last_sync_date",
];

/// Tunables of the pair-state store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Files at least this large get a placeholder digest on insert
    pub big_file_bytes: u64,
    pub digest_algorithm: DigestAlgorithm,
    /// Reader connections
    pub readers: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            big_file_bytes: 300 * 1024 * 1024,
            digest_algorithm: DigestAlgorithm::Md5,
            readers: 4,
        }
    }
}

pub struct PairStateStore {
    path: PathBuf,
    writer: ReentrantMutex<Connection>,
    readers: DatabasePool,
    queue: RwLock<Option<Arc<dyn PairQueue>>>,
    filters: RwLock<Vec<String>>,
    open_transactions: AtomicUsize,
    config: StoreConfig,
}

impl PairStateStore {
    /// Open or create the database at `path`, migrating it if needed.
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let existed = path.exists();

        let mut writer = Connection::open(&path)?;
        writer.busy_timeout(std::time::Duration::from_secs(5))?;
        writer.execute_batch(ENGINE_PRAGMAS)?;
        writer.execute_batch(CONFIGURATION_TABLE)?;
        writer.execute_batch(ENGINE_SCHEMA)?;
        run_migrations(&mut writer, &MigrationManager::for_engine(), existed)?;

        let readers = DatabasePool::builder()
            .path(&path)
            .max_size(config.readers.max(1))
            .query_only(true)
            .build()?;

        let store = Self {
            path,
            writer: ReentrantMutex::new(writer),
            readers,
            queue: RwLock::new(None),
            filters: RwLock::new(Vec::new()),
            open_transactions: AtomicUsize::new(0),
            config,
        };
        store.reload_filters()?;
        info!("Opened pair-state database {}", store.path.display());
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Start a transaction held by the calling thread until committed.
    ///
    /// Other threads block on every store call until it ends; dropping the
    /// guard without committing rolls back.
    pub fn begin_transaction(&self) -> Result<StoreTransaction<'_>> {
        let guard = self.writer.lock();
        guard.execute_batch("BEGIN IMMEDIATE")?;
        self.open_transactions.fetch_add(1, Ordering::AcqRel);
        Ok(StoreTransaction {
            store: self,
            guard,
            done: false,
        })
    }

    pub(crate) fn write<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
        let conn = self.writer.lock();
        f(&conn)
    }

    pub(crate) fn read<R>(&self, mut f: impl FnMut(&Connection) -> Result<R>) -> Result<R> {
        if self.open_transactions.load(Ordering::Acquire) > 0 {
            let conn = self.writer.lock();
            return f(&conn);
        }
        self.readers.with_connection(&mut f)
    }

    /// Route queue decisions to `queue` without pushing pending pairs.
    pub fn set_queue(&self, queue: Arc<dyn PairQueue>) {
        *self.queue.write() = Some(queue);
    }

    /// Attach `queue` and push every pair still needing work, parents first.
    ///
    /// Children of a pending folder are left out: the folder's
    /// synchronization queues them.
    pub fn register_queue_manager(&self, queue: Arc<dyn PairQueue>) -> Result<()> {
        self.set_queue(queue);
        let pending = self.read(|conn| {
            select_pairs(
                conn,
                "pair_state NOT IN ('synchronized', 'unsynchronized') ORDER BY local_path ASC",
                [],
            )
        })?;

        let mut folders: Vec<&str> = Vec::new();
        let mut pushed = 0;
        for pair in &pending {
            if pair.folderish {
                folders.push(&pair.local_path);
            }
            if folders.contains(&pair.local_parent_path.as_str()) {
                continue;
            }
            self.queue_pair(pair.id, pair.folderish, pair.pair_state);
            pushed += 1;
        }
        info!("Queued {} pending pairs ({} found)", pushed, pending.len());
        Ok(())
    }

    pub(crate) fn queue_pair(&self, id: i64, folderish: bool, pair_state: PairState) {
        if !pair_state.needs_sync() {
            return;
        }
        let queue = self.queue.read();
        let Some(queue) = queue.as_ref() else {
            trace!("No queue attached, pair {} not queued", id);
            return;
        };
        if pair_state == PairState::Conflicted {
            debug!("Pair {} is conflicted", id);
            queue.new_conflict(id);
        } else {
            queue.push(QueueItem::new(id, folderish, pair_state));
        }
    }

    pub(crate) fn interrupt_processors_on(&self, path: &str, exact_match: bool) {
        if let Some(queue) = self.queue.read().as_ref() {
            queue.interrupt_processors_on(path, exact_match);
        }
    }

    /// Reset the processor of every pair, at startup.
    pub fn reinit_processors(&self) -> Result<()> {
        self.write(|conn| {
            conn.execute("UPDATE States SET processor = 0", [])?;
            conn.execute(
                "UPDATE States SET error_count = 0, last_sync_error_date = NULL, last_error = NULL
                 WHERE pair_state = 'synchronized'",
                [],
            )?;
            Ok(())
        })
    }

    /// Drop every pair and the remote watermarks: the next start rescans both sides.
    pub fn reinit_states(&self) -> Result<()> {
        self.write(|conn| {
            conn.execute_batch("DROP TABLE IF EXISTS States;")?;
            conn.execute_batch(ENGINE_SCHEMA)?;
            for key in REMOTE_SYNC_KEYS {
                conn.execute("DELETE FROM Configuration WHERE name = ?1", params![key])?;
            }
            Ok(())
        })?;
        self.write(|conn| Ok(conn.execute_batch("VACUUM")?))
    }

    pub fn get_config(&self, name: &str) -> Result<Option<String>> {
        self.read(|conn| {
            let value: Option<Option<String>> = conn
                .query_row(
                    "SELECT value FROM Configuration WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value.flatten())
        })
    }

    pub fn get_config_or(&self, name: &str, default: &str) -> Result<String> {
        Ok(self
            .get_config(name)?
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.to_string()))
    }

    /// Store a configuration value; `None` stores SQL NULL.
    pub fn update_config(&self, name: &str, value: Option<&str>) -> Result<()> {
        if self.get_config(name)?.as_deref() == value && value.is_some() {
            return Ok(());
        }
        self.write(|conn| {
            conn.execute(
                "UPDATE OR IGNORE Configuration SET value = ?2 WHERE name = ?1",
                params![name, value],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO Configuration (name, value) VALUES (?1, ?2)",
                params![name, value],
            )?;
            Ok(())
        })
    }

    pub fn delete_config(&self, name: &str) -> Result<()> {
        self.write(|conn| {
            conn.execute("DELETE FROM Configuration WHERE name = ?1", params![name])?;
            Ok(())
        })
    }

    pub fn store_bool(&self, name: &str, value: bool) -> Result<()> {
        self.store_int(name, value as i64)
    }

    pub fn get_bool(&self, name: &str, default: bool) -> Result<bool> {
        Ok(self.get_int(name, default as i64)? != 0)
    }

    pub fn store_int(&self, name: &str, value: i64) -> Result<()> {
        self.update_config(name, Some(&value.to_string()))
    }

    pub fn get_int(&self, name: &str, default: i64) -> Result<i64> {
        Ok(self
            .get_config(name)?
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default))
    }
}

/// A write transaction owned by the current thread.
pub struct StoreTransaction<'a> {
    store: &'a PairStateStore,
    guard: ReentrantMutexGuard<'a, Connection>,
    done: bool,
}

impl StoreTransaction<'_> {
    pub fn commit(mut self) -> Result<()> {
        self.done = true;
        self.guard.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.done = true;
        self.guard.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

impl Drop for StoreTransaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.guard.execute_batch("ROLLBACK") {
                tracing::warn!("Rollback of abandoned transaction failed: {}", e);
            }
        }
        self.store.open_transactions.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) fn select_pairs<P: Params>(
    conn: &Connection,
    clause: &str,
    params: P,
) -> Result<Vec<DocPair>> {
    let sql = format!("SELECT {} FROM States WHERE {}", DocPair::COLUMNS, clause);
    let mut stmt = conn.prepare_cached(&sql)?;
    let pairs = stmt
        .query_map(params, DocPair::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(pairs)
}

pub(crate) fn select_pair<P: Params>(
    conn: &Connection,
    clause: &str,
    params: P,
) -> Result<Option<DocPair>> {
    let sql = format!("SELECT {} FROM States WHERE {} LIMIT 1", DocPair::COLUMNS, clause);
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.query_row(params, DocPair::from_row).optional()?)
}

/// Character length of `prefix`, for `substr(column, 1, n) = prefix` tests.
pub(crate) fn char_len(prefix: &str) -> i64 {
    prefix.chars().count() as i64
}

/// Local descendants of a folder pair, as a SQL condition on named
/// parameters `:lpath`, `:lprefix`, `:lprefix_len`, `:rpath` and `:rpath_len`.
pub(crate) const LOCAL_DESCENDANTS: &str = "(local_parent_path = :lpath
        OR substr(local_parent_path, 1, :lprefix_len) = :lprefix)
    AND (:rpath IS NULL OR remote_parent_path IS NULL
        OR substr(remote_parent_path, 1, :rpath_len) = :rpath)";

/// Remote descendants of a folder pair, on `:rpath`, `:rprefix` and `:rprefix_len`.
pub(crate) const REMOTE_DESCENDANTS: &str = "(remote_parent_path = :rpath
        OR substr(remote_parent_path, 1, :rprefix_len) = :rprefix)";

/// Prefix matching every path strictly under `path`.
pub(crate) fn path_prefix(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Queue recording everything the store sends it.
    #[derive(Default)]
    pub struct RecordingQueue {
        pub pushed: Mutex<Vec<QueueItem>>,
        pub conflicts: Mutex<Vec<i64>>,
        pub interrupted: Mutex<Vec<String>>,
    }

    impl RecordingQueue {
        pub fn pushed_ids(&self) -> Vec<i64> {
            self.pushed.lock().iter().map(|i| i.id).collect()
        }
    }

    impl PairQueue for RecordingQueue {
        fn push(&self, item: QueueItem) {
            self.pushed.lock().push(item);
        }

        fn new_conflict(&self, id: i64) {
            self.conflicts.lock().push(id);
        }

        fn interrupt_processors_on(&self, path: &str, _exact_match: bool) {
            self.interrupted.lock().push(path.to_string());
        }
    }

    pub fn open_store() -> (TempDir, PairStateStore, Arc<RecordingQueue>) {
        let dir = tempfile::tempdir().unwrap();
        let store = PairStateStore::open(dir.path().join("engine.db"), StoreConfig::default()).unwrap();
        let queue = Arc::new(RecordingQueue::default());
        store.set_queue(queue.clone());
        (dir, store, queue)
    }

    #[test]
    fn test_config_accessors() {
        let (_dir, store, _) = open_store();
        assert_eq!(store.get_config("missing").unwrap(), None);
        assert_eq!(store.get_config_or("missing", "fallback").unwrap(), "fallback");

        store.update_config("remote_last_sync_date", Some("1234")).unwrap();
        store.update_config("remote_last_sync_date", Some("5678")).unwrap();
        assert_eq!(
            store.get_config("remote_last_sync_date").unwrap().as_deref(),
            Some("5678")
        );

        store.store_bool("use_trash", true).unwrap();
        assert!(store.get_bool("use_trash", false).unwrap());
        assert_eq!(store.get_int("nope", 7).unwrap(), 7);

        store.delete_config("use_trash").unwrap();
        assert!(!store.get_bool("use_trash", false).unwrap());
    }

    #[test]
    fn test_reopen_keeps_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.db");
        {
            let store = PairStateStore::open(&path, StoreConfig::default()).unwrap();
            store.update_config("locale", Some("fr")).unwrap();
        }
        let store = PairStateStore::open(&path, StoreConfig::default()).unwrap();
        assert_eq!(store.get_config("locale").unwrap().as_deref(), Some("fr"));
        assert_eq!(
            store.get_int(crate::schema::SCHEMA_VERSION_KEY, 0).unwrap(),
            crate::schema::ENGINE_SCHEMA_VERSION as i64
        );
    }

    #[test]
    fn test_transaction_rollback_on_drop() {
        let (_dir, store, _) = open_store();
        {
            let _tx = store.begin_transaction().unwrap();
            store.update_config("key", Some("value")).unwrap();
            assert_eq!(store.get_config("key").unwrap().as_deref(), Some("value"));
        }
        assert_eq!(store.get_config("key").unwrap(), None);

        let tx = store.begin_transaction().unwrap();
        store.update_config("key", Some("kept")).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.get_config("key").unwrap().as_deref(), Some("kept"));
    }

    #[test]
    fn test_reinit_states_clears_watermarks() {
        let (_dir, store, _) = open_store();
        store.update_config("remote_last_full_scan", Some("now")).unwrap();
        store.update_config("locale", Some("en")).unwrap();
        store.reinit_states().unwrap();
        assert_eq!(store.get_config("remote_last_full_scan").unwrap(), None);
        assert_eq!(store.get_config("locale").unwrap().as_deref(), Some("en"));
    }

    #[test]
    fn test_path_prefix() {
        assert_eq!(path_prefix("/"), "/");
        assert_eq!(path_prefix("/a"), "/a/");
        assert_eq!(char_len("/é/"), 3);
    }
}
