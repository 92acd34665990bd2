use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Database busy: {0}")]
    StoreBusy(String),

    #[error("Duplicate pair: {0}")]
    DuplicatePair(String),

    #[error("Unknown pair state for ({local}, {remote})")]
    UnknownPairState { local: String, remote: String },

    #[error("Schema version {found} is newer than the supported {supported}")]
    SchemaDowngrade { found: u32, supported: u32 },

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Watcher error: {0}")]
    Watcher(String),

    #[error("Task join error: {0}")]
    Join(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        match error.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => StoreError::DuplicatePair(error.to_string()),
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::StoreBusy(error.to_string())
            }
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                StoreError::StoreUnavailable(error.to_string())
            }
            _ => StoreError::Database(error),
        }
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(error: r2d2::Error) -> Self {
        StoreError::Pool(error.to_string())
    }
}

impl From<notify::Error> for StoreError {
    fn from(error: notify::Error) -> Self {
        StoreError::Watcher(error.to_string())
    }
}

impl StoreError {
    pub fn is_busy(&self) -> bool {
        matches!(self, StoreError::StoreBusy(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_constraint_is_duplicate_pair() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT UNIQUE); INSERT INTO t (v) VALUES ('a');")
            .unwrap();
        let err: StoreError = conn
            .execute("INSERT INTO t (v) VALUES ('a')", [])
            .unwrap_err()
            .into();
        assert!(matches!(err, StoreError::DuplicatePair(_)));
    }
}
