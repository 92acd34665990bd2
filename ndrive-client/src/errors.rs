use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Unauthorized access to {server} for user {user} (HTTP {code})")]
    Unauthorized {
        server: String,
        user: String,
        code: u16,
    },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Server addon not installed, missing operation {0}")]
    AddonNotInstalled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP {status} on {url}: {message}")]
    Http {
        status: u16,
        url: String,
        message: String,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("De-duplication is disabled for {0}")]
    DuplicationDisabled(String),

    #[error("Operation interrupted")]
    Interrupted,

    #[error("Corrupted file {path}: expected digest {expected}, got {actual}")]
    CorruptedFile {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Extended attribute {name} on {path}: {source}")]
    Xattr {
        path: String,
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Document already locked by {owner}")]
    DocumentAlreadyLocked { owner: String },
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    pub fn http(status: u16, url: impl Into<String>, message: impl Into<String>) -> Self {
        ClientError::Http {
            status,
            url: url.into(),
            message: message.into(),
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Http { status, .. } => Some(*status),
            ClientError::Unauthorized { code, .. } => Some(*code),
            ClientError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            ClientError::NotFound(_) => true,
            ClientError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_no_space(&self) -> bool {
        matches!(self, ClientError::Io(e) if e.raw_os_error() == Some(libc::ENOSPC))
    }

    pub fn is_permission_denied(&self) -> bool {
        match self {
            ClientError::Io(e) => e.kind() == std::io::ErrorKind::PermissionDenied,
            ClientError::Xattr { source, .. } => {
                source.kind() == std::io::ErrorKind::PermissionDenied
            }
            _ => false,
        }
    }

    /// Connection refused, DNS failure, TLS failure or timeout.
    pub fn is_connection_error(&self) -> bool {
        match self {
            ClientError::Transport(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let err = ClientError::http(404, "http://srv/api", "missing");
        assert_eq!(err.status(), Some(404));
        assert!(!err.is_not_found());

        let err = ClientError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert!(err.is_no_space());

        let err = ClientError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "gone",
        ));
        assert!(err.is_not_found());

        let err = ClientError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(err.is_permission_denied());
    }
}
