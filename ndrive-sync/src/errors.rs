//! Error types for synchronization workers

use thiserror::Error;

use ndrive_client::ClientError;
use ndrive_index::StoreError;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The worker was asked to stop
    #[error("Worker interrupted")]
    ThreadInterrupt,

    /// Give up the current pair for now; it is pushed back shortly.
    #[error("Pair interrupted")]
    PairInterrupt,

    #[error("Parent of {path} is not synchronized yet ({parent})")]
    ParentNotSynced { path: String, parent: String },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Illegal state: {0}")]
    IllegalState(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn parent_not_synced(path: impl Into<String>, parent: impl Into<String>) -> Self {
        SyncError::ParentNotSynced {
            path: path.into(),
            parent: parent.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::Client(e) => e.is_not_found(),
            SyncError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    /// `ENOSPC` on a local write.
    pub fn is_no_space(&self) -> bool {
        match self {
            SyncError::Client(e) => e.is_no_space(),
            SyncError::Io(e) => e.raw_os_error() == Some(libc::ENOSPC),
            SyncError::Store(StoreError::Io(e)) => e.raw_os_error() == Some(libc::ENOSPC),
            _ => false,
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        match self {
            SyncError::Client(e) => e.is_permission_denied(),
            SyncError::Io(e) => e.kind() == std::io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let err = SyncError::from(ClientError::NotFound("ref".into()));
        assert!(err.is_not_found());

        let err = SyncError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert!(err.is_no_space());
        assert!(!err.is_not_found());

        let err = SyncError::from(ClientError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "busy",
        )));
        assert!(err.is_permission_denied());
    }
}
