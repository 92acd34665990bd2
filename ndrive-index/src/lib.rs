pub mod database_pool;
pub mod errors;
pub mod manager;
pub mod migrations;
pub mod pair;
pub mod queue;
pub mod schema;
pub mod store;
pub mod watcher;

pub use database_pool::{DatabasePool, DatabasePoolBuilder};
pub use errors::{Result, StoreError};
pub use migrations::{run_migrations, Migration, MigrationManager};
pub use manager::{flags as notification_flags, AutoLockEntry, EngineDef, ManagerStore, NotificationRecord};
pub use pair::{derive_pair_state, DocPair, PairState, SideState, Transfer};
pub use queue::{PairQueue, QueueItem};
pub use store::{ItemKind, PairStateStore, RemoteUpdate, StoreConfig, StoreTransaction, ERROR_THRESHOLD};
pub use watcher::{FsEvent, FsEventSource};
