//! ndrive integration tests and workspace root
//!
//! This crate serves as the root of the ndrive workspace and contains
//! integration tests that exercise the crates together against an in
//! memory server.

pub use ndrive_client as client;
pub use ndrive_daemon as daemon;
pub use ndrive_index as index;
pub use ndrive_sync as sync;
