//! Engine notifications
//!
//! Components publish on a broadcast channel and never wait for listeners;
//! a lagging listener loses the oldest events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::trace;

use crate::metrics::ProcessorMetrics;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EngineEvent {
    SyncStarted,
    SyncCompleted,
    SyncSuspended,
    SyncResumed,
    RootDeleted,
    RootMoved {
        new_path: PathBuf,
    },
    NoSpaceLeftOnDevice,
    InvalidAuthentication,
    NewConflict {
        id: i64,
    },
    NewReadonly {
        filename: String,
        parent: Option<String>,
    },
    DeleteReadonly {
        filename: String,
    },
    NewLocked {
        filename: String,
        owner: String,
        created: Option<DateTime<Utc>>,
    },
    NewError {
        id: i64,
    },
    ErrorOpenedFile {
        path: String,
    },
    PairSyncEnded {
        metrics: ProcessorMetrics,
    },
    Offline,
    Online,
    LocalScanFinished,
    RemoteScanFinished,
    NoChangesFound,
    /// A remote poll finished and applied changes
    Updated,
    OpenDocument {
        path: PathBuf,
    },
    DirectEditStarting {
        server: String,
        filename: String,
    },
    DirectEditLocked {
        filename: String,
        owner: String,
        created: Option<DateTime<Utc>>,
    },
    DirectEditReadonly {
        filename: String,
    },
    DirectEditConflict {
        filename: String,
        reference: String,
        digest: String,
    },
    DirectEditLockError {
        action: String,
        filename: String,
        reference: String,
    },
    DirectEditUploadCompleted {
        filename: String,
    },
    DirectEditError {
        message: String,
        values: Vec<String>,
    },
}

/// Publisher side of the event channel; cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: EngineEvent) {
        trace!("Event {:?}", event);
        // No listener is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_listener_then_subscribe() {
        let bus = EventBus::new();
        bus.emit(EngineEvent::SyncStarted);

        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::NewConflict { id: 4 });
        assert_eq!(rx.recv().await.unwrap(), EngineEvent::NewConflict { id: 4 });
    }

    #[test]
    fn test_serialized_tag() {
        let json = serde_json::to_value(EngineEvent::DeleteReadonly {
            filename: "a.txt".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "deleteReadonly");
        assert_eq!(json["filename"], "a.txt");
    }
}
