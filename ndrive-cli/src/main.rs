use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use ndrive_client::names::ROOT;
use ndrive_client::{AutomationClient, LocalClient};
use ndrive_daemon::{automation_factory, Manager};

mod config;

use config::{default_home, Config};

#[derive(Parser)]
#[command(name = "ndrive")]
#[command(about = "Bidirectional file synchronization with a content repository", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Application home, `~/.ndrive` by default
    #[arg(long, global = true)]
    home: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bound engines in the foreground
    Console,

    /// Bind a local folder to a server account
    BindServer {
        /// Local folder to synchronize
        local_folder: PathBuf,
        /// Server URL, e.g. https://example.org/nuxeo
        url: String,
        /// User name
        user: String,
        /// Password, read from NDRIVE_PASSWORD when not given
        #[arg(long, env = "NDRIVE_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Display name of the binding
        #[arg(long)]
        name: Option<String>,
    },

    /// Forget the binding of a local folder
    UnbindServer {
        local_folder: PathBuf,
    },

    /// Show the engines and their counters
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Open a document from an nxdrive://edit/ URL
    Edit {
        url: String,
    },

    /// Remove the synchronization metadata of a folder
    CleanFolder {
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let home = match cli.home {
        Some(home) => home,
        None => default_home()?,
    };
    let config = Config::load(&home)?;

    // Initialize logging
    let log_level = config.options.log_level(cli.verbose);
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    match cli.command {
        Commands::Console => console(&home, &config).await?,
        Commands::BindServer {
            local_folder,
            url,
            user,
            password,
            name,
        } => {
            let manager = open_manager(&home, &config).await?;
            let mut remote_config = config.options.remote_config(&url, &user, manager.device_id());
            remote_config.password = password;
            let client = AutomationClient::connect(remote_config.clone())
                .await
                .with_context(|| format!("Cannot connect to {}", url))?;
            let token = client.request_token(false).await?;
            let client = match &token {
                Some(token) => {
                    remote_config.token = Some(token.clone());
                    remote_config.password = None;
                    AutomationClient::new(remote_config)?
                }
                None => {
                    warn!("The server did not provide a token, the password will be needed again");
                    client
                }
            };

            let engine = manager
                .bind_server(&local_folder, Arc::new(client), token.as_deref(), name.as_deref())
                .await
                .with_context(|| format!("Cannot bind {}", local_folder.display()))?;
            println!(
                "Bound {} to {} as {} (engine {})",
                local_folder.display(),
                engine.server_url(),
                engine.user(),
                engine.uid()
            );
        }
        Commands::UnbindServer { local_folder } => {
            let manager = open_manager(&home, &config).await?;
            let Some(engine) = manager
                .engines()
                .into_iter()
                .find(|e| e.local_folder() == local_folder.as_path())
            else {
                bail!("No engine is bound to {}", local_folder.display());
            };
            manager.unbind_server(engine.uid()).await?;
            println!("Unbound {}", local_folder.display());
        }
        Commands::Status { json } => {
            let manager = open_manager(&home, &config).await?;
            let status = manager.get_status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("Device {} ({})", status.device_id, status.device_description);
                if status.engines.is_empty() {
                    println!("No folder bound");
                }
                for engine in &status.engines {
                    println!(
                        "{} -> {} as {}",
                        engine.local_folder.display(),
                        engine.server_url,
                        engine.user
                    );
                    println!(
                        "  {} files, {} folders synchronized, {} pending, {} conflicts, {} errors",
                        engine.metrics.sync_files,
                        engine.metrics.sync_folders,
                        engine.metrics.syncing,
                        engine.metrics.conflicted,
                        engine.metrics.error
                    );
                    if let Some(date) = &engine.last_sync_date {
                        println!("  last synchronization: {}", date);
                    }
                }
            }
        }
        Commands::Edit { url } => {
            let manager = open_manager(&home, &config).await?;
            match manager.direct_edit().handle_url(&url).await? {
                Some(path) => println!("Editing {}", path.display()),
                None => bail!("Cannot edit {}", url),
            }
        }
        Commands::CleanFolder { path } => clean_folder(&path)?,
    }

    Ok(())
}

async fn open_manager(home: &Path, config: &Config) -> Result<Manager> {
    Manager::open(config.options.manager_config(home), automation_factory())
        .await
        .with_context(|| format!("Cannot open the manager in {}", home.display()))
}

async fn console(home: &Path, config: &Config) -> Result<()> {
    let manager = open_manager(home, config).await?;
    if manager.engines().is_empty() {
        warn!("No folder bound yet, see `ndrive bind-server`");
    }

    for engine in manager.engines() {
        let mut events = engine.subscribe();
        let uid = engine.uid().to_string();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                info!("[{}] {:?}", uid, event);
            }
        });
    }
    let mut events = manager.direct_edit().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!("[DirectEdit] {:?}", event);
        }
    });

    manager.start().await?;
    info!("Running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Cannot listen for Ctrl-C")?;
    info!("Stopping");
    manager.stop().await?;
    Ok(())
}

fn clean_folder(path: &Path) -> Result<()> {
    if !path.is_dir() {
        bail!("{} is not a folder", path.display());
    }
    let local = LocalClient::new(path);
    local
        .clean_xattr_root()
        .with_context(|| format!("Cannot clean {}", path.display()))?;
    local.clean_xattr_folder_recursive(ROOT)?;
    println!("Cleaned {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_bind_server() {
        let cli = Cli::try_parse_from([
            "ndrive",
            "-vv",
            "--home",
            "/tmp/home",
            "bind-server",
            "/tmp/Drive",
            "https://example.org/nuxeo",
            "alice",
            "--password",
            "secret",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.home, Some(PathBuf::from("/tmp/home")));
        match cli.command {
            Commands::BindServer {
                local_folder,
                url,
                user,
                password,
                name,
            } => {
                assert_eq!(local_folder, PathBuf::from("/tmp/Drive"));
                assert_eq!(url, "https://example.org/nuxeo");
                assert_eq!(user, "alice");
                assert_eq!(password.as_deref(), Some("secret"));
                assert!(name.is_none());
            }
            _ => panic!("unexpected command"),
        }
    }

    #[test]
    fn test_parse_status_and_edit() {
        let cli = Cli::try_parse_from(["ndrive", "status", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { json: true }));

        let cli = Cli::try_parse_from(["ndrive", "edit", "nxdrive://edit/https/host/nuxeo"]).unwrap();
        assert!(matches!(cli.command, Commands::Edit { .. }));
        assert!(Cli::try_parse_from(["ndrive", "unknown"]).is_err());
    }

    #[test]
    fn test_clean_folder_removes_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalClient::new(dir.path());
        let file = local.make_file(ROOT, "a.txt", Some(b"a")).unwrap();
        local.set_remote_id(&file, "remote-a").unwrap();
        local.set_root_id("root").unwrap();

        clean_folder(dir.path()).unwrap();
        assert!(local.get_remote_id(&file).is_none());
        assert!(local.get_root_id().is_none());
        assert!(clean_folder(&dir.path().join("missing")).is_err());
    }
}
