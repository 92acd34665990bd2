pub mod digest;
pub mod errors;
pub mod info;
pub mod local;
pub mod names;
pub mod remote;

pub use digest::{compute_digest, digest_bytes, DigestAlgorithm};
pub use errors::{ClientError, Result};
pub use info::{
    Blob, ChangeSummary, FileSystemChange, LocalFileInfo, RemoteDocument, RemoteFileInfo,
    ScrollBatch,
};
pub use local::LocalClient;
pub use names::IgnoreRules;
pub use remote::{AutomationClient, MemoryRemote, RemoteConfig, RemoteFileSystem};
