//! Runtime of ndrive
//!
//! - [`Engine`]: one bound account, its store, watchers and processors
//! - [`LocalWatcher`] and [`RemoteWatcher`]: feed pair states from both sides
//! - [`DirectEdit`]: single document editing outside of the sync roots
//! - [`Manager`]: the set of engines and their persisted definitions

pub mod direct_edit;
pub mod engine;
pub mod errors;
pub mod local_watcher;
pub mod manager;
pub mod remote_watcher;

pub use direct_edit::{
    parse_edit_url, simplify_url, DirectEdit, DirectEditConfig, DirectEditMetrics, EditRequest,
};
pub use engine::{Engine, EngineConfig, EngineMetrics, EngineState, EngineStatus};
pub use errors::{EngineError, Result};
pub use local_watcher::{LocalWatcher, LocalWatcherConfig, LocalWatcherMetrics};
pub use manager::{
    automation_factory, device_description, open_local_file, EngineRegistry, Manager,
    ManagerConfig, ManagerStatus, RemoteFactory,
};
pub use remote_watcher::{RemoteWatcher, RemoteWatcherConfig, RemoteWatcherMetrics};
