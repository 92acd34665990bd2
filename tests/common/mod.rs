use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};

use anyhow::{Context, Result};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tracing::info;

use ndrive::client::{MemoryRemote, RemoteFileInfo, RemoteFileSystem};
use ndrive::daemon::{Engine, Manager, ManagerConfig, RemoteFactory};
use ndrive::index::{DocPair, FsEvent};
use ndrive::sync::{EngineEvent, Processor, ProcessorRole, WorkerControl};

pub const SERVER_URL: &str = "http://memory/nuxeo/";
pub const USER: &str = "alice";

/// Upper bound of pairs handled by one [`TestDrive::process`] call.
const MAX_PAIRS_PER_CYCLE: usize = 200;

static TRACING_INIT: Once = Once::new();

/// Initialize logging for tests - call once per test process
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn memory_factory(remote: Arc<MemoryRemote>) -> RemoteFactory {
    Arc::new(move |_config| {
        let client: Arc<dyn RemoteFileSystem> = remote.clone();
        Ok(client)
    })
}

/// One bound account against an in memory server, with its workers driven
/// by hand: nothing runs in the background.
pub struct TestDrive {
    #[allow(dead_code)]
    pub manager: Manager,
    pub engine: Arc<Engine>,
    pub remote: Arc<MemoryRemote>,
    /// The `Workspace` sync root
    pub workspace: RemoteFileInfo,
    pub control: WorkerControl,
    processor: Processor,
    temp_dir: TempDir,
}

impl TestDrive {
    /// Bind a fresh folder to a server holding one empty `Workspace` sync
    /// root, then run the first synchronization.
    pub async fn new() -> Result<Self> {
        init_tracing();
        let temp_dir = TempDir::new().context("Failed to create temp directory")?;
        let remote = Arc::new(MemoryRemote::new(SERVER_URL, USER));
        let workspace = remote.create_sync_root("Workspace")?;

        let mut config = ManagerConfig::new(temp_dir.path().join("home"));
        config.direct_edit.folder = temp_dir.path().join("edit");
        config.direct_edit.open_files = false;
        let manager = Manager::open(config, memory_factory(remote.clone())).await?;
        let engine = manager
            .bind_server(temp_dir.path().join("Nuxeo Drive"), remote.clone(), Some("token"), None)
            .await?;

        let processor = Processor::new(
            engine.context().clone(),
            ProcessorRole::Generic,
            "GenericProcessor#0",
            WorkerControl::new(),
        );
        let mut drive = Self {
            manager,
            engine,
            remote,
            workspace,
            control: WorkerControl::new(),
            processor,
            temp_dir,
        };

        drive.poll_remote().await?;
        drive.process().await?;
        anyhow::ensure!(
            drive.local_path("/Workspace").is_dir(),
            "the sync root was not created locally"
        );
        info!("Test drive ready in {}", drive.temp_dir.path().display());
        Ok(drive)
    }

    pub fn root(&self) -> &Path {
        self.engine.local_folder()
    }

    /// Absolute path of a local reference.
    pub fn local_path(&self, reference: &str) -> PathBuf {
        self.root().join(reference.trim_start_matches('/'))
    }

    /// One remote watcher round; the first one is a full scan.
    pub async fn poll_remote(&self) -> Result<()> {
        let handled = self.engine.remote_watcher().handle_changes(&self.control).await?;
        anyhow::ensure!(handled, "remote polling failed");
        Ok(())
    }

    #[allow(dead_code)]
    pub async fn scan_local(&self) -> Result<()> {
        self.engine.local_watcher().scan(&self.control).await?;
        Ok(())
    }

    /// Feed filesystem events to the local watcher and flush what it
    /// delayed.
    #[allow(dead_code)]
    pub fn local_events(&self, events: &[FsEvent]) -> Result<()> {
        let watcher = self.engine.local_watcher();
        for event in events {
            watcher.handle_event(event)?;
        }
        watcher.flush_delayed(true)?;
        Ok(())
    }

    /// Handle every queued pair. Returns how many were handled.
    pub async fn process(&mut self) -> Result<usize> {
        let handled = self.processor.run_until_idle(MAX_PAIRS_PER_CYCLE).await?;
        anyhow::ensure!(handled < MAX_PAIRS_PER_CYCLE, "the queue did not drain");
        Ok(handled)
    }

    #[allow(dead_code)]
    pub fn pair(&self, reference: &str) -> Result<DocPair> {
        self.engine
            .store()
            .get_state_from_local(reference)?
            .with_context(|| format!("no pair for {}", reference))
    }

    /// Remote child of the `Workspace` sync root (or of `parent_id`) named
    /// `name`.
    #[allow(dead_code)]
    pub fn remote_child(&self, parent_id: Option<&str>, name: &str) -> Option<RemoteFileInfo> {
        self.remote
            .child_by_name(parent_id.unwrap_or(&self.workspace.uid), name)
    }
}

/// Every event received so far.
pub fn drain_events(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
