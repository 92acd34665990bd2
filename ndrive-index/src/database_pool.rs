//! Pooled SQLite connections using r2d2
//!
//! The engine database has a single writer connection owned by the
//! [`crate::store::PairStateStore`]; everything here is for readers and for
//! the manager database, which has no long-lived writer.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tokio::task;
use tracing::{debug, warn};

use crate::errors::{Result, StoreError};

/// How many times a busy database is retried before giving up.
pub const BUSY_RETRIES: u32 = 5;

const BUSY_BACKOFF: Duration = Duration::from_millis(20);

/// Run `f` again while it fails with a busy database, up to [`BUSY_RETRIES`] times.
pub fn retry_busy<R>(mut f: impl FnMut() -> Result<R>) -> Result<R> {
    let mut attempt = 0;
    loop {
        match f() {
            Err(e) if e.is_busy() && attempt < BUSY_RETRIES => {
                attempt += 1;
                debug!("Database busy, retry {}/{}", attempt, BUSY_RETRIES);
                thread::sleep(BUSY_BACKOFF * attempt);
            }
            Err(e) if e.is_busy() => {
                warn!("Database still busy after {} retries", BUSY_RETRIES);
                return Err(e);
            }
            other => return other,
        }
    }
}

/// Database connection pool using r2d2
#[derive(Clone)]
pub struct DatabasePool {
    pool: Pool<SqliteConnectionManager>,
}

impl DatabasePool {
    /// Create a builder for configuring the database pool
    pub fn builder() -> DatabasePoolBuilder {
        DatabasePoolBuilder::new()
    }

    /// Check a connection out of the pool.
    pub fn get(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Run `f` on a pooled connection, retrying while the database is busy.
    pub fn with_connection<R>(&self, mut f: impl FnMut(&Connection) -> Result<R>) -> Result<R> {
        let conn = self.get()?;
        retry_busy(|| f(&conn))
    }

    /// Execute a database operation on the blocking thread pool
    pub(crate) async fn execute_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnMut(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let pool = self.clone();
        task::spawn_blocking(move || pool.with_connection(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Get connection pool statistics
    pub fn pool_stats(&self) -> (u32, u32) {
        let state = self.pool.state();
        (state.connections, state.idle_connections)
    }
}

/// Builder for DatabasePool with configuration options
pub struct DatabasePoolBuilder {
    path: Option<PathBuf>,
    max_size: u32,
    connection_timeout: Duration,
    busy_timeout: Duration,
    test_on_check_out: bool,
    query_only: bool,
    pragmas: &'static str,
}

impl DatabasePoolBuilder {
    pub fn new() -> Self {
        Self {
            path: None,
            max_size: 4,
            connection_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
            test_on_check_out: true,
            query_only: false,
            pragmas: "",
        }
    }

    /// Set the database file path
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the maximum number of connections in the pool
    pub fn max_size(mut self, max_size: u32) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// How long SQLite itself waits on a lock before reporting busy
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn test_on_check_out(mut self, test: bool) -> Self {
        self.test_on_check_out = test;
        self
    }

    /// Refuse writes on pooled connections
    pub fn query_only(mut self, query_only: bool) -> Self {
        self.query_only = query_only;
        self
    }

    /// Pragmas run on every new connection
    pub fn pragmas(mut self, pragmas: &'static str) -> Self {
        self.pragmas = pragmas;
        self
    }

    /// Build the database pool
    pub fn build(self) -> Result<DatabasePool> {
        let path = self.path.ok_or_else(|| {
            StoreError::Pool("Path is required for file-based databases".to_string())
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let busy_timeout = self.busy_timeout;
        let query_only = self.query_only;
        let pragmas = self.pragmas;
        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            if !pragmas.is_empty() {
                conn.execute_batch(pragmas)?;
            }
            if query_only {
                conn.execute_batch("PRAGMA query_only = ON;")?;
            }
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(self.max_size)
            .connection_timeout(self.connection_timeout)
            .test_on_check_out(self.test_on_check_out)
            .build(manager)?;

        Ok(DatabasePool { pool })
    }
}

impl Default for DatabasePoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}
