//! Manager database: bound engines, notifications, DirectEdit auto-locks
//! and process-wide configuration such as the device id.

use std::path::{Path, PathBuf};

use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::database_pool::DatabasePool;
use crate::errors::{Result, StoreError};
use crate::migrations::{run_migrations, MigrationManager};
use crate::schema::{CONFIGURATION_TABLE, MANAGER_PRAGMAS, MANAGER_SCHEMA};

const DEVICE_ID_KEY: &str = "device_id";

/// A bound server, as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineDef {
    pub uid: String,
    /// Engine type, `NXDRIVE` for the default one
    pub engine: String,
    pub name: Option<String>,
    pub local_folder: PathBuf,
}

impl EngineDef {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uid: row.get(0)?,
            engine: row.get(1)?,
            name: row.get(2)?,
            local_folder: PathBuf::from(row.get::<_, String>(3)?),
        })
    }
}

/// Notification flag bits.
pub mod flags {
    pub const DISCARD: i64 = 1;
    pub const UNIQUE: i64 = 2;
    pub const DISCARDABLE: i64 = 4;
    pub const VOLATILE: i64 = 8;
    pub const PERSISTENT: i64 = 16;
    pub const ACTIONABLE: i64 = 128;
    pub const REMOVE_ON_DISCARD: i64 = 256;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    pub uid: String,
    pub engine: Option<String>,
    pub level: String,
    pub title: String,
    pub description: String,
    pub action: Option<String>,
    pub flags: i64,
}

impl NotificationRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            uid: row.get(0)?,
            engine: row.get(1)?,
            level: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            title: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            description: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            action: row.get(5)?,
            flags: row.get::<_, Option<i64>>(6)?.unwrap_or(0),
        })
    }

    pub fn is_discarded(&self) -> bool {
        self.flags & flags::DISCARD != 0
    }
}

/// A file locked on the server while it is being edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoLockEntry {
    pub path: PathBuf,
    pub remote_id: String,
    pub process: i64,
}

pub struct ManagerStore {
    path: PathBuf,
    pool: DatabasePool,
}

impl ManagerStore {
    /// Open or create the manager database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();
        let pool = DatabasePool::builder()
            .path(&path)
            .max_size(2)
            .pragmas(MANAGER_PRAGMAS)
            .build()?;
        {
            let mut conn = pool.get()?;
            conn.execute_batch(CONFIGURATION_TABLE)?;
            conn.execute_batch(MANAGER_SCHEMA)?;
            run_migrations(&mut conn, &MigrationManager::for_manager(), existed)?;
        }
        info!("Opened manager database {}", path.display());
        Ok(Self { path, pool })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get_config(&self, name: &str) -> Result<Option<String>> {
        let name = name.to_string();
        self.pool
            .execute_blocking(move |conn| {
                let value: Option<Option<String>> = conn
                    .query_row(
                        "SELECT value FROM Configuration WHERE name = ?1",
                        params![name],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(value.flatten())
            })
            .await
    }

    pub async fn update_config(&self, name: &str, value: Option<&str>) -> Result<()> {
        let name = name.to_string();
        let value = value.map(str::to_string);
        self.pool
            .execute_blocking(move |conn| {
                conn.execute(
                    "INSERT INTO Configuration (name, value) VALUES (?1, ?2)
                     ON CONFLICT(name) DO UPDATE SET value = excluded.value",
                    params![name, value],
                )?;
                Ok(())
            })
            .await
    }

    /// Identifier of this installation, created on first use.
    pub async fn device_id(&self) -> Result<String> {
        if let Some(id) = self.get_config(DEVICE_ID_KEY).await?.filter(|id| !id.is_empty()) {
            return Ok(id);
        }
        let id = Uuid::new_v4().simple().to_string();
        debug!("Generated device id {}", id);
        self.update_config(DEVICE_ID_KEY, Some(&id)).await?;
        Ok(id)
    }

    pub async fn get_engines(&self) -> Result<Vec<EngineDef>> {
        self.pool
            .execute_blocking(|conn| {
                let mut stmt =
                    conn.prepare_cached("SELECT uid, engine, name, local_folder FROM Engines")?;
                let engines = stmt
                    .query_map([], EngineDef::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(engines)
            })
            .await
    }

    /// Record a new engine. A folder already used by another engine yields
    /// [`StoreError::DuplicatePair`].
    pub async fn add_engine(
        &self,
        engine: &str,
        local_folder: &Path,
        uid: &str,
        name: Option<&str>,
    ) -> Result<EngineDef> {
        let def = EngineDef {
            uid: uid.to_string(),
            engine: engine.to_string(),
            name: name.map(str::to_string),
            local_folder: local_folder.to_path_buf(),
        };
        let row = def.clone();
        self.pool
            .execute_blocking(move |conn| {
                conn.execute(
                    "INSERT INTO Engines (local_folder, engine, uid, name) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        row.local_folder.to_string_lossy(),
                        row.engine,
                        row.uid,
                        row.name
                    ],
                )?;
                Ok(())
            })
            .await?;
        info!("Added engine {} on {}", def.uid, def.local_folder.display());
        Ok(def)
    }

    pub async fn update_engine_path(&self, uid: &str, local_folder: &Path) -> Result<()> {
        let uid = uid.to_string();
        let folder = local_folder.to_string_lossy().into_owned();
        self.pool
            .execute_blocking(move |conn| {
                conn.execute(
                    "UPDATE Engines SET local_folder = ?1 WHERE uid = ?2",
                    params![folder, uid],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn delete_engine(&self, uid: &str) -> Result<()> {
        let uid = uid.to_string();
        self.pool
            .execute_blocking(move |conn| {
                conn.execute("DELETE FROM Engines WHERE uid = ?1", params![uid])?;
                Ok(())
            })
            .await
    }

    pub async fn insert_notification(&self, notification: &NotificationRecord) -> Result<()> {
        let n = notification.clone();
        self.pool
            .execute_blocking(move |conn| {
                conn.execute(
                    "INSERT INTO Notifications (uid, engine, level, title, description, action, flags)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![n.uid, n.engine, n.level, n.title, n.description, n.action, n.flags],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn update_notification(&self, notification: &NotificationRecord) -> Result<()> {
        let n = notification.clone();
        self.pool
            .execute_blocking(move |conn| {
                conn.execute(
                    "UPDATE Notifications SET level = ?1, title = ?2, description = ?3 WHERE uid = ?4",
                    params![n.level, n.title, n.description, n.uid],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get_notifications(&self, include_discarded: bool) -> Result<Vec<NotificationRecord>> {
        let sql = if include_discarded {
            "SELECT uid, engine, level, title, description, action, flags FROM Notifications"
        } else {
            "SELECT uid, engine, level, title, description, action, flags FROM Notifications
              WHERE (flags & 1) = 0"
        };
        self.pool
            .execute_blocking(move |conn| {
                let mut stmt = conn.prepare_cached(sql)?;
                let notifications = stmt
                    .query_map([], NotificationRecord::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(notifications)
            })
            .await
    }

    /// Discard a notification; only discardable ones are affected.
    pub async fn discard_notification(&self, uid: &str) -> Result<bool> {
        let uid = uid.to_string();
        self.pool
            .execute_blocking(move |conn| {
                let updated = conn.execute(
                    "UPDATE Notifications SET flags = (flags | ?1)
                      WHERE uid = ?2 AND (flags & ?3) = ?3",
                    params![flags::DISCARD, uid, flags::DISCARDABLE],
                )?;
                Ok(updated > 0)
            })
            .await
    }

    pub async fn remove_notification(&self, uid: &str) -> Result<()> {
        let uid = uid.to_string();
        self.pool
            .execute_blocking(move |conn| {
                conn.execute("DELETE FROM Notifications WHERE uid = ?1", params![uid])?;
                Ok(())
            })
            .await
    }

    /// Record a server lock taken on `path`, replacing an older entry.
    pub async fn lock_path(&self, path: &Path, process: i64, remote_id: &str) -> Result<()> {
        let path = path.to_string_lossy().into_owned();
        let remote_id = remote_id.to_string();
        self.pool
            .execute_blocking(move |conn| {
                match conn.execute(
                    "INSERT INTO AutoLock (path, process, remote_id) VALUES (?1, ?2, ?3)",
                    params![path, process, remote_id],
                ) {
                    Ok(_) => Ok(()),
                    Err(e) => match StoreError::from(e) {
                        StoreError::DuplicatePair(_) => {
                            conn.execute(
                                "UPDATE AutoLock SET process = ?1, remote_id = ?2 WHERE path = ?3",
                                params![process, remote_id, path],
                            )?;
                            Ok(())
                        }
                        other => Err(other),
                    },
                }
            })
            .await
    }

    pub async fn unlock_path(&self, path: &Path) -> Result<()> {
        let path = path.to_string_lossy().into_owned();
        self.pool
            .execute_blocking(move |conn| {
                conn.execute("DELETE FROM AutoLock WHERE path = ?1", params![path])?;
                Ok(())
            })
            .await
    }

    pub async fn get_locks(&self) -> Result<Vec<AutoLockEntry>> {
        self.pool
            .execute_blocking(|conn| {
                let mut stmt = conn.prepare_cached("SELECT path, remote_id, process FROM AutoLock")?;
                let locks = stmt
                    .query_map([], |row| {
                        Ok(AutoLockEntry {
                            path: PathBuf::from(row.get::<_, String>(0)?),
                            remote_id: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                            process: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(locks)
            })
            .await
    }

    pub async fn get_locked_paths(&self) -> Result<Vec<PathBuf>> {
        Ok(self.get_locks().await?.into_iter().map(|l| l.path).collect())
    }
}
