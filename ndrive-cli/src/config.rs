use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ndrive_client::{IgnoreRules, RemoteConfig};
use ndrive_daemon::{EngineConfig, ManagerConfig};

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProxyType {
    #[default]
    System,
    Manual,
    Automatic,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProxySettings {
    #[serde(rename = "type")]
    pub kind: ProxyType,
    /// Automatic configuration script
    pub pac_url: Option<String>,
    pub proxy_url: Option<String>,
}

/// Launch options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub debug: bool,
    pub remote_repo: String,
    pub startup_page: String,
    pub force_locale: Option<String>,
    pub update_site_url: String,
    pub beta_update_site_url: String,
    /// MiB; larger unchanged files skip the digest check
    pub big_file: u64,
    pub consider_ssl_errors: bool,
    /// Replace the default ignore rules when set
    pub ignored_suffixes: Option<Vec<String>>,
    pub ignored_prefixes: Option<Vec<String>>,
    pub theme: String,
    /// Remote polling interval, in seconds
    pub delay: u64,
    pub max_processors: usize,
    pub max_errors: u32,
    /// Seconds
    pub timeout: u64,
    /// Seconds
    pub handshake_timeout: u64,
    pub use_trash: bool,
    pub local_rollback: bool,
    pub proxy: ProxySettings,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            debug: false,
            remote_repo: "default".to_string(),
            startup_page: "drive_login.jsp".to_string(),
            force_locale: None,
            update_site_url: "https://community.nuxeo.com/static/drive-updates".to_string(),
            beta_update_site_url: "https://community.nuxeo.com/static/drive-tests".to_string(),
            big_file: 300,
            consider_ssl_errors: true,
            ignored_suffixes: None,
            ignored_prefixes: None,
            theme: "ui5".to_string(),
            delay: 30,
            max_processors: 4,
            max_errors: 3,
            timeout: 20,
            handshake_timeout: 60,
            use_trash: true,
            local_rollback: false,
            proxy: ProxySettings::default(),
        }
    }
}

impl Options {
    /// Log filter for `verbose` occurrences of `-v`; `debug` forces at
    /// least `debug`.
    pub fn log_level(&self, verbose: u8) -> &'static str {
        match (verbose, self.debug) {
            (0, false) => "info",
            (0, true) | (1, _) => "debug",
            _ => "trace",
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        let mut config = EngineConfig {
            max_processors: self.max_processors,
            max_errors: self.max_errors,
            local_rollback: self.local_rollback,
            use_trash: self.use_trash,
            ignore: IgnoreRules::new(self.ignored_prefixes.clone(), self.ignored_suffixes.clone()),
            ..defaults
        };
        config.store.big_file_bytes = self.big_file * 1024 * 1024;
        config.remote_watcher.delay = Duration::from_secs(self.delay);
        config
    }

    pub fn remote_config(&self, server_url: &str, user: &str, device_id: &str) -> RemoteConfig {
        RemoteConfig {
            server_url: server_url.to_string(),
            user_id: user.to_string(),
            device_id: device_id.to_string(),
            repository: self.remote_repo.clone(),
            timeout: Duration::from_secs(self.timeout),
            ..RemoteConfig::default()
        }
    }

    pub fn manager_config(&self, home: &Path) -> ManagerConfig {
        let mut config = ManagerConfig::new(home);
        config.engine = self.engine_config();
        config
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub options: Options,
}

impl Config {
    /// Save configuration under `home`
    pub fn save(&self, home: &Path) -> Result<()> {
        let config_path = config_path(home);

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        std::fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Load configuration from `home`, defaults when there is none yet
    pub fn load(home: &Path) -> Result<Config> {
        let config_path = config_path(home);
        if !config_path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }
}

pub fn config_path(home: &Path) -> PathBuf {
    home.join(CONFIG_FILE)
}

/// Get the default application home
pub fn default_home() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Home directory not found")?;
    Ok(home.join(".ndrive"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.options.debug = true;
        config.options.proxy = ProxySettings {
            kind: ProxyType::Automatic,
            pac_url: Some("http://proxy/proxy.pac".to_string()),
            proxy_url: None,
        };

        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("debug = true"));
        assert!(toml_str.contains("type = \"Automatic\""));

        let deserialized: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(deserialized, config);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str("[options]\ndelay = 5\nignored_suffixes = [\".bak\"]\n").unwrap();
        assert_eq!(config.options.delay, 5);
        assert_eq!(config.options.max_processors, 4);
        assert_eq!(config.options.proxy.kind, ProxyType::System);

        let engine = config.options.engine_config();
        assert_eq!(engine.remote_watcher.delay, Duration::from_secs(5));
        assert!(engine.ignore.is_ignored_name("notes.bak"));
        assert!(!engine.ignore.is_ignored_name("notes.tmp"));
        assert!(engine.ignore.is_ignored_name(".hidden"));
    }

    #[test]
    fn test_save_and_load_config() {
        let temp_dir = tempdir().unwrap();
        let home = temp_dir.path().join(".ndrive");
        assert_eq!(Config::load(&home).unwrap(), Config::default());

        let mut config = Config::default();
        config.options.big_file = 10;
        config.options.use_trash = false;
        config.save(&home).unwrap();

        let loaded = Config::load(&home).unwrap();
        assert_eq!(loaded, config);
        let engine = loaded.options.engine_config();
        assert_eq!(engine.store.big_file_bytes, 10 * 1024 * 1024);
        assert!(!engine.use_trash);
    }

    #[test]
    fn test_invalid_file_is_reported() {
        let temp_dir = tempdir().unwrap();
        std::fs::write(config_path(temp_dir.path()), "options = 3").unwrap();
        let err = Config::load(temp_dir.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_log_level() {
        let mut options = Options::default();
        assert_eq!(options.log_level(0), "info");
        assert_eq!(options.log_level(1), "debug");
        assert_eq!(options.log_level(3), "trace");
        options.debug = true;
        assert_eq!(options.log_level(0), "debug");
    }
}
