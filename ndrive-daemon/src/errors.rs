use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Folder {0} is already used by another engine")]
    FolderAlreadyUsed(PathBuf),

    #[error("Folder already bound to {server} with user {user}")]
    RootAlreadyBindWithDifferentAccount { user: String, server: String },

    #[error("Invalid drive folder {0}: extended attributes are not supported")]
    InvalidDrive(PathBuf),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("No engine bound to {server} for {user}")]
    EngineNotFound { server: String, user: String },

    #[error("Engine already running")]
    AlreadyRunning,

    #[error("Client error: {0}")]
    Client(#[from] ndrive_client::ClientError),

    #[error("Store error: {0}")]
    Store(#[from] ndrive_index::StoreError),

    #[error("Sync error: {0}")]
    Sync(#[from] ndrive_sync::SyncError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Cooperative stop requested by the owner of the task.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, EngineError::Sync(ndrive_sync::SyncError::ThreadInterrupt))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            EngineError::Client(ndrive_client::ClientError::Unauthorized { .. })
                | EngineError::Sync(ndrive_sync::SyncError::Client(
                    ndrive_client::ClientError::Unauthorized { .. }
                ))
        )
    }
}
