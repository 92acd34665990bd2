/// Configuration key holding the schema version.
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Engine database schema version
pub const ENGINE_SCHEMA_VERSION: u32 = 3;

/// Manager database schema version
pub const MANAGER_SCHEMA_VERSION: u32 = 3;

/// Pragmas of the engine database; WAL lets readers run beside the writer.
pub const ENGINE_PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
PRAGMA foreign_keys = ON;
"#;

/// The manager database is written rarely.
pub const MANAGER_PRAGMAS: &str = r#"
PRAGMA journal_mode = DELETE;
PRAGMA foreign_keys = ON;
"#;

pub const CONFIGURATION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS Configuration (
    name    VARCHAR NOT NULL,
    value   VARCHAR,
    PRIMARY KEY (name)
);
"#;

/// Engine database: one row per pair plus remote scan bookkeeping.
///
/// `local_path` cannot be UNIQUE: a duplicate may share it until the
/// processor resolves it.
pub const ENGINE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS States (
    id                      INTEGER    NOT NULL,
    last_local_updated      TIMESTAMP,
    last_remote_updated     TIMESTAMP,
    local_digest            VARCHAR,
    remote_digest           VARCHAR,
    local_path              VARCHAR,
    remote_ref              VARCHAR,
    local_parent_path       VARCHAR,
    remote_parent_ref       VARCHAR,
    remote_parent_path      VARCHAR,
    local_name              VARCHAR,
    remote_name             VARCHAR,
    size                    INTEGER    DEFAULT (0),
    folderish               INTEGER,
    local_state             VARCHAR    DEFAULT ('unknown'),
    remote_state            VARCHAR    DEFAULT ('unknown'),
    pair_state              VARCHAR    DEFAULT ('unknown'),
    remote_can_rename       INTEGER,
    remote_can_delete       INTEGER,
    remote_can_update       INTEGER,
    remote_can_create_child INTEGER,
    last_remote_modifier    VARCHAR,
    last_sync_date          TIMESTAMP,
    error_count             INTEGER    DEFAULT (0),
    last_sync_error_date    TIMESTAMP,
    last_error              VARCHAR,
    last_error_details      TEXT,
    version                 INTEGER    DEFAULT (0),
    processor               INTEGER    DEFAULT (0),
    last_transfer           VARCHAR,
    creation_date           TIMESTAMP,
    PRIMARY KEY (id),
    UNIQUE (remote_ref, remote_parent_ref),
    UNIQUE (remote_ref, local_path)
);

CREATE INDEX IF NOT EXISTS idx_states_local_path ON States(local_path);
CREATE INDEX IF NOT EXISTS idx_states_local_parent_path ON States(local_parent_path);
CREATE INDEX IF NOT EXISTS idx_states_remote_ref ON States(remote_ref);
CREATE INDEX IF NOT EXISTS idx_states_remote_parent_ref ON States(remote_parent_ref);
CREATE INDEX IF NOT EXISTS idx_states_pair_state ON States(pair_state);

CREATE TABLE IF NOT EXISTS Filters (
    path STRING NOT NULL,
    PRIMARY KEY (path)
);

CREATE TABLE IF NOT EXISTS RemoteScan (
    path STRING NOT NULL,
    PRIMARY KEY (path)
);

CREATE TABLE IF NOT EXISTS ToRemoteScan (
    path STRING NOT NULL,
    PRIMARY KEY (path)
);
"#;

/// Manager database: bound engines, notifications and DirectEdit locks.
pub const MANAGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS Engines (
    uid          VARCHAR,
    engine       VARCHAR NOT NULL,
    name         VARCHAR,
    local_folder VARCHAR NOT NULL UNIQUE,
    PRIMARY KEY (uid)
);

CREATE TABLE IF NOT EXISTS Notifications (
    uid         VARCHAR UNIQUE,
    engine      VARCHAR,
    level       VARCHAR,
    title       VARCHAR,
    description VARCHAR,
    action      VARCHAR,
    flags       INT,
    PRIMARY KEY (uid)
);

CREATE TABLE IF NOT EXISTS AutoLock (
    path      VARCHAR,
    remote_id VARCHAR,
    process   INT,
    PRIMARY KEY (path)
);
"#;
