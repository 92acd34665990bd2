//! Synchronization workers for ndrive
//!
//! This crate turns pair states into file operations:
//! - Queue manager with per side folder and file queues
//! - Error blacklist with exponential backoff
//! - Processors dispatching on the pair state
//! - Path, readonly and folder locks shared by the processors
//! - Engine events published to listeners

pub mod blacklist;
pub mod errors;
pub mod events;
pub mod locks;
pub mod metrics;
pub mod processor;
pub mod queue_manager;
pub mod worker;

pub use blacklist::{BlacklistEntry, BlacklistQueue};
pub use errors::{Result, SyncError};
pub use events::{EngineEvent, EventBus};
pub use locks::{FolderLock, PathLocks, ReadonlyLocks};
pub use metrics::{ProcessorMetrics, QueueMetrics};
pub use processor::{spawn_processors, Processor, ProcessorConfig, SyncContext};
pub use queue_manager::{ProcessorInfo, ProcessorRole, QueueConfig, QueueKind, QueueManager};
pub use worker::WorkerControl;
