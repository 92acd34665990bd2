//! Application level owner of the engines
//!
//! The manager keeps one [`Engine`] per bound server account, persists
//! their definitions and credentials in the manager database and runs the
//! Direct Edit worker shared by all of them.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ndrive_client::{AutomationClient, RemoteConfig, RemoteFileSystem};
use ndrive_index::{EngineDef, ManagerStore};
use ndrive_sync::WorkerControl;

use crate::direct_edit::{simplify_url, DirectEdit, DirectEditConfig};
use crate::engine::{Engine, EngineConfig, EngineStatus};
use crate::errors::{EngineError, Result};

/// Engines by uid, shared with Direct Edit.
pub type EngineRegistry = Arc<RwLock<HashMap<String, Arc<Engine>>>>;

/// Builds the remote client of an engine loaded from the manager database.
pub type RemoteFactory =
    Arc<dyn Fn(RemoteConfig) -> ndrive_client::Result<Arc<dyn RemoteFileSystem>> + Send + Sync>;

const ENGINE_TYPE: &str = "NXDRIVE";
const MANAGER_DB: &str = "manager.db";

/// Remote client talking to a real server.
pub fn automation_factory() -> RemoteFactory {
    Arc::new(|config| {
        let client: Arc<dyn RemoteFileSystem> = Arc::new(AutomationClient::new(config)?);
        Ok(client)
    })
}

/// Launch the default application of the desktop on `path`.
pub fn open_local_file(path: &Path) -> io::Result<()> {
    #[cfg(target_os = "macos")]
    let mut command = std::process::Command::new("open");
    #[cfg(target_os = "windows")]
    let mut command = {
        let mut command = std::process::Command::new("cmd");
        command.args(["/C", "start", ""]);
        command
    };
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    let mut command = std::process::Command::new("xdg-open");

    debug!("Opening {}", path.display());
    command.arg(path).spawn()?;
    Ok(())
}

/// Short description of this computer sent along token requests.
pub fn device_description() -> String {
    format!("{} ({})", whoami::devicename(), whoami::distro())
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Application home: manager and engine databases, Direct Edit folder
    pub home: PathBuf,
    /// Template of every engine configuration; the device id is filled in
    pub engine: EngineConfig,
    pub direct_edit: DirectEditConfig,
    pub direct_edit_enabled: bool,
}

impl ManagerConfig {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            direct_edit: DirectEditConfig {
                folder: home.join("edit"),
                ..DirectEditConfig::default()
            },
            home,
            engine: EngineConfig::default(),
            direct_edit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub device_id: String,
    pub device_description: String,
    pub engines: Vec<EngineStatus>,
}

pub struct Manager {
    config: ManagerConfig,
    store: Arc<ManagerStore>,
    device_id: String,
    factory: RemoteFactory,
    engines: EngineRegistry,
    direct_edit: Arc<DirectEdit>,
    control: parking_lot::Mutex<WorkerControl>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    /// Open the manager database and load the bound engines.
    pub async fn open(config: ManagerConfig, factory: RemoteFactory) -> Result<Self> {
        std::fs::create_dir_all(&config.home)?;
        let store = Arc::new(ManagerStore::open(config.home.join(MANAGER_DB))?);
        let device_id = store.device_id().await?;
        let engines: EngineRegistry = Arc::new(RwLock::new(HashMap::new()));
        let direct_edit = Arc::new(DirectEdit::new(
            config.direct_edit.clone(),
            engines.clone(),
            Some(store.clone()),
        ));

        let manager = Self {
            config,
            store,
            device_id,
            factory,
            engines,
            direct_edit,
            control: parking_lot::Mutex::new(WorkerControl::new()),
            tasks: Mutex::new(Vec::new()),
        };
        manager.load_engines().await?;
        info!(
            "Manager ready on {} with {} engine(s)",
            manager.config.home.display(),
            manager.engines.read().len()
        );
        Ok(manager)
    }

    pub fn home(&self) -> &Path {
        &self.config.home
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn store(&self) -> &Arc<ManagerStore> {
        &self.store
    }

    pub fn direct_edit(&self) -> &Arc<DirectEdit> {
        &self.direct_edit
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            device_id: self.device_id.clone(),
            ..self.config.engine.clone()
        }
    }

    fn setting_key(uid: &str, name: &str) -> String {
        format!("engine.{}.{}", uid, name)
    }

    async fn load_engines(&self) -> Result<()> {
        for def in self.store.get_engines().await? {
            if let Err(e) = self.load_engine(&def).await {
                error!("Cannot load engine {}: {}", def.uid, e);
            }
        }
        Ok(())
    }

    async fn load_engine(&self, def: &EngineDef) -> Result<()> {
        let store = &self.store;
        let Some(server_url) = store.get_config(&Self::setting_key(&def.uid, "server_url")).await? else {
            warn!("Engine {} has no server url, skipping it", def.uid);
            return Ok(());
        };
        let user = store
            .get_config(&Self::setting_key(&def.uid, "user"))
            .await?
            .unwrap_or_default();
        let token = store.get_config(&Self::setting_key(&def.uid, "token")).await?;

        let remote = (self.factory)(RemoteConfig {
            server_url,
            user_id: user,
            device_id: self.device_id.clone(),
            token,
            ..RemoteConfig::default()
        })?;
        let engine = Engine::new(
            def.uid.clone(),
            def.local_folder.clone(),
            &self.config.home,
            remote,
            self.engine_config(),
        )?;
        debug!("Loaded engine {} on {}", def.uid, def.local_folder.display());
        self.engines.write().insert(def.uid.clone(), Arc::new(engine));
        Ok(())
    }

    /// Every bound engine, in no particular order.
    pub fn engines(&self) -> Vec<Arc<Engine>> {
        self.engines.read().values().cloned().collect()
    }

    pub fn engine(&self, uid: &str) -> Option<Arc<Engine>> {
        self.engines.read().get(uid).cloned()
    }

    /// Engine bound to `server_url` for `user`, the user compared ignoring
    /// case.
    pub fn get_engine(&self, server_url: &str, user: &str) -> Result<Arc<Engine>> {
        let url = simplify_url(server_url);
        self.engines
            .read()
            .values()
            .find(|e| simplify_url(e.server_url()) == url && e.user().eq_ignore_ascii_case(user))
            .cloned()
            .ok_or_else(|| EngineError::EngineNotFound {
                server: server_url.to_string(),
                user: user.to_string(),
            })
    }

    fn check_folder_free(&self, local_folder: &Path) -> Result<()> {
        let used = self.engines.read().values().any(|e| {
            let other = e.local_folder();
            local_folder.starts_with(other) || other.starts_with(local_folder)
        });
        if used {
            return Err(EngineError::FolderAlreadyUsed(local_folder.to_path_buf()));
        }
        Ok(())
    }

    /// Bind `local_folder` to the account `remote` is logged in with.
    /// `token` is persisted to rebuild the client on the next start.
    pub async fn bind_server(
        &self,
        local_folder: impl Into<PathBuf>,
        remote: Arc<dyn RemoteFileSystem>,
        token: Option<&str>,
        name: Option<&str>,
    ) -> Result<Arc<Engine>> {
        let local_folder = local_folder.into();
        self.check_folder_free(&local_folder)?;

        let uid = uuid::Uuid::new_v4().simple().to_string();
        let server_url = remote.server_url().to_string();
        let user = remote.user_id().to_string();
        info!("Binding {} to {} as {}", local_folder.display(), server_url, user);

        let engine = Engine::new(
            uid.clone(),
            local_folder.clone(),
            &self.config.home,
            remote,
            self.engine_config(),
        )?;
        if let Err(e) = engine.bind().await {
            if let Err(cleanup) = engine.unbind().await {
                warn!("Cannot clean the failed binding of {}: {}", uid, cleanup);
            }
            return Err(e);
        }

        self.store
            .add_engine(ENGINE_TYPE, &local_folder, &uid, name)
            .await?;
        self.store
            .update_config(&Self::setting_key(&uid, "server_url"), Some(&server_url))
            .await?;
        self.store
            .update_config(&Self::setting_key(&uid, "user"), Some(&user))
            .await?;
        self.store
            .update_config(&Self::setting_key(&uid, "token"), token)
            .await?;

        let engine = Arc::new(engine);
        self.engines.write().insert(uid, engine.clone());
        Ok(engine)
    }

    /// Stop the engine and forget everything about it.
    pub async fn unbind_server(&self, uid: &str) -> Result<()> {
        let Some(engine) = self.engines.write().remove(uid) else {
            return Err(EngineError::EngineNotFound {
                server: String::new(),
                user: uid.to_string(),
            });
        };
        engine.unbind().await?;
        self.store.delete_engine(uid).await?;
        for name in ["server_url", "user", "token"] {
            self.store
                .update_config(&Self::setting_key(uid, name), None)
                .await?;
        }
        info!("Unbound engine {}", uid);
        Ok(())
    }

    /// Start every engine and the Direct Edit worker.
    pub async fn start(&self) -> Result<()> {
        for engine in self.engines() {
            match engine.start().await {
                Ok(()) | Err(EngineError::AlreadyRunning) => {}
                Err(e) => error!("Cannot start engine {}: {}", engine.uid(), e),
            }
        }
        if !self.config.direct_edit_enabled {
            return Ok(());
        }
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }
        let control = {
            let mut guard = self.control.lock();
            *guard = WorkerControl::new();
            guard.clone()
        };
        let direct_edit = self.direct_edit.clone();
        tasks.push(tokio::spawn(async move {
            match direct_edit.run(control).await {
                Ok(()) => info!("DirectEdit stopped"),
                Err(e) if e.is_interrupt() => debug!("DirectEdit interrupted"),
                Err(e) => error!("DirectEdit failed: {}", e),
            }
        }));
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.control.lock().stop();
        for task in self.tasks.lock().await.drain(..) {
            if let Err(e) = task.await {
                warn!("DirectEdit task ended abnormally: {}", e);
            }
        }
        for engine in self.engines() {
            if let Err(e) = engine.stop().await {
                error!("Cannot stop engine {}: {}", engine.uid(), e);
            }
        }
        Ok(())
    }

    pub fn suspend(&self) {
        for engine in self.engines() {
            engine.suspend();
        }
    }

    pub fn resume(&self) {
        for engine in self.engines() {
            engine.resume();
        }
    }

    pub async fn get_status(&self) -> Result<ManagerStatus> {
        let mut engines = Vec::new();
        for engine in self.engines() {
            engines.push(engine.get_status().await?);
        }
        engines.sort_by(|a, b| a.local_folder.cmp(&b.local_folder));
        Ok(ManagerStatus {
            device_id: self.device_id.clone(),
            device_description: device_description(),
            engines,
        })
    }
}
