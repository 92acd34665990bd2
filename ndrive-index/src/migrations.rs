//! Schema upgrades for the engine and manager databases
//!
//! Versions only move forward: a database written by a newer release is
//! refused instead of being rolled back. Every step is idempotent so that
//! an upgrade interrupted half-way can simply run again.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::errors::{Result, StoreError};
use crate::schema::{ENGINE_SCHEMA_VERSION, MANAGER_SCHEMA_VERSION, SCHEMA_VERSION_KEY};

/// A single step of a migration
#[derive(Debug, Clone)]
pub enum MigrationStep {
    /// Plain SQL, expected to be written with `IF NOT EXISTS` guards
    Sql(String),
    /// Add a column unless the table already has it
    AddColumn {
        table: String,
        column: String,
        definition: String,
    },
}

impl MigrationStep {
    fn apply(&self, conn: &Connection) -> Result<()> {
        match self {
            MigrationStep::Sql(sql) => conn.execute_batch(sql)?,
            MigrationStep::AddColumn {
                table,
                column,
                definition,
            } => {
                if !table_columns(conn, table)?.iter().any(|c| c == column) {
                    conn.execute_batch(&format!(
                        "ALTER TABLE {} ADD COLUMN {} {}",
                        table, column, definition
                    ))?;
                }
            }
        }
        Ok(())
    }
}

/// A single database migration
pub struct Migration {
    /// Migration version number
    pub version: u32,
    /// Description of what this migration does
    pub description: String,
    pub steps: Vec<MigrationStep>,
}

impl Migration {
    pub fn new(version: u32, description: impl Into<String>, steps: Vec<MigrationStep>) -> Self {
        Self {
            version,
            description: description.into(),
            steps,
        }
    }

    /// Apply this migration and record the new version in one transaction.
    pub fn apply(&self, conn: &mut Connection) -> Result<()> {
        info!("Applying migration {}: {}", self.version, self.description);

        let tx = conn.transaction()?;
        for step in &self.steps {
            step.apply(&tx)?;
        }
        write_version(&tx, self.version)?;
        tx.commit()?;

        info!("Migration {} applied successfully", self.version);
        Ok(())
    }
}

/// Database migration manager
pub struct MigrationManager {
    migrations: BTreeMap<u32, Migration>,
    target_version: u32,
}

impl MigrationManager {
    pub fn new(target_version: u32) -> Self {
        Self {
            migrations: BTreeMap::new(),
            target_version,
        }
    }

    /// Migrations of the per-engine pair-state database
    pub fn for_engine() -> Self {
        let mut manager = Self::new(ENGINE_SCHEMA_VERSION);
        manager.add_migration(Migration::new(
            2,
            "Track the direction of the last transfer",
            vec![add_column("States", "last_transfer", "VARCHAR")],
        ));
        manager.add_migration(Migration::new(
            3,
            "Keep error details and remote creation dates",
            vec![
                add_column("States", "last_error_details", "TEXT"),
                add_column("States", "creation_date", "TIMESTAMP"),
                MigrationStep::Sql(
                    "CREATE TABLE IF NOT EXISTS ToRemoteScan (path STRING NOT NULL, PRIMARY KEY (path))"
                        .to_string(),
                ),
            ],
        ));
        manager
    }

    /// Migrations of the manager database
    pub fn for_manager() -> Self {
        let mut manager = Self::new(MANAGER_SCHEMA_VERSION);
        manager.add_migration(Migration::new(
            2,
            "Add notifications",
            vec![MigrationStep::Sql(
                "CREATE TABLE IF NOT EXISTS Notifications (
                    uid VARCHAR, engine VARCHAR, level VARCHAR, title VARCHAR,
                    description VARCHAR, action VARCHAR, flags INT, PRIMARY KEY (uid))"
                    .to_string(),
            )],
        ));
        manager.add_migration(Migration::new(
            3,
            "Add DirectEdit auto-locks",
            vec![MigrationStep::Sql(
                "CREATE TABLE IF NOT EXISTS AutoLock (
                    path VARCHAR, remote_id VARCHAR, process INT, PRIMARY KEY (path))"
                    .to_string(),
            )],
        ));
        manager
    }

    /// Add a migration to the manager
    pub fn add_migration(&mut self, migration: Migration) {
        let version = migration.version;
        if self.migrations.insert(version, migration).is_some() {
            warn!("Replacing existing migration for version {}", version);
        }
    }

    pub fn target_version(&self) -> u32 {
        self.target_version
    }

    /// Migrate a database holding `current` to the target version.
    pub fn migrate(&self, conn: &mut Connection, current: u32) -> Result<()> {
        if current > self.target_version {
            return Err(StoreError::SchemaDowngrade {
                found: current,
                supported: self.target_version,
            });
        }
        if current == self.target_version {
            return Ok(());
        }

        info!(
            "Migrating database from version {} to {}",
            current, self.target_version
        );
        for (_, migration) in self.migrations.range(current + 1..=self.target_version) {
            migration.apply(conn)?;
        }
        write_version(conn, self.target_version)?;
        Ok(())
    }
}

fn add_column(table: &str, column: &str, definition: &str) -> MigrationStep {
    MigrationStep::AddColumn {
        table: table.to_string(),
        column: column.to_string(),
        definition: definition.to_string(),
    }
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info('{}')", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

/// Schema version recorded in the Configuration table, if any.
pub fn read_version(conn: &Connection) -> Result<Option<u32>> {
    let value: Option<Option<String>> = conn
        .query_row(
            "SELECT value FROM Configuration WHERE name = ?1",
            params![SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.flatten().and_then(|v| v.parse().ok()))
}

pub fn write_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute(
        "INSERT INTO Configuration (name, value) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        params![SCHEMA_VERSION_KEY, version.to_string()],
    )?;
    Ok(())
}

/// Bring a freshly opened database to `manager`'s version.
///
/// `existed` tells whether the file was there before opening; a new
/// database is created at the latest version directly.
pub fn run_migrations(conn: &mut Connection, manager: &MigrationManager, existed: bool) -> Result<()> {
    match read_version(conn)? {
        Some(current) => manager.migrate(conn, current),
        None if existed => manager.migrate(conn, 1),
        None => write_version(conn, manager.target_version()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::CONFIGURATION_TABLE;

    fn create_test_connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CONFIGURATION_TABLE).unwrap();
        conn.execute_batch("CREATE TABLE States (id INTEGER PRIMARY KEY, local_path VARCHAR)")
            .unwrap();
        conn
    }

    #[test]
    fn test_engine_upgrade_from_v1() {
        let mut conn = create_test_connection();
        write_version(&conn, 1).unwrap();

        let manager = MigrationManager::for_engine();
        run_migrations(&mut conn, &manager, true).unwrap();

        assert_eq!(read_version(&conn).unwrap(), Some(ENGINE_SCHEMA_VERSION));
        let columns = table_columns(&conn, "States").unwrap();
        assert!(columns.contains(&"last_transfer".to_string()));
        assert!(columns.contains(&"creation_date".to_string()));
    }

    #[test]
    fn test_add_column_is_idempotent() {
        let conn = create_test_connection();
        let step = add_column("States", "last_transfer", "VARCHAR");
        step.apply(&conn).unwrap();
        step.apply(&conn).unwrap();
        let count = table_columns(&conn, "States")
            .unwrap()
            .into_iter()
            .filter(|c| c == "last_transfer")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_downgrade_is_refused() {
        let mut conn = create_test_connection();
        write_version(&conn, ENGINE_SCHEMA_VERSION + 1).unwrap();
        let err = run_migrations(&mut conn, &MigrationManager::for_engine(), true).unwrap_err();
        assert!(matches!(err, StoreError::SchemaDowngrade { .. }));
    }

    #[test]
    fn test_new_database_starts_at_target() {
        let mut conn = create_test_connection();
        run_migrations(&mut conn, &MigrationManager::for_manager(), false).unwrap();
        assert_eq!(read_version(&conn).unwrap(), Some(MANAGER_SCHEMA_VERSION));
    }
}
