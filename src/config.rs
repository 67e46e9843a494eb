//! On-disk configuration: `config.json`, `.syncignore` and the location of
//! `database.json`, all inside one config directory.

use crate::filter::ExclusionFilter;
use crate::mapping::Mapping;
use crate::session::SessionTiming;
use crate::transport::Credentials;
use anyhow::{anyhow, bail, Context, Result};
use directories::BaseDirs;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.json";
pub const IGNORE_FILE: &str = ".syncignore";
pub const DATABASE_FILE: &str = "database.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownHost {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl KnownHost {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub warmup_secs: u64,
    pub round_interval_secs: u64,
    pub reconnect_secs: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            warmup_secs: 5,
            round_interval_secs: 5,
            reconnect_secs: 10,
        }
    }
}

impl Timing {
    pub fn session(&self) -> SessionTiming {
        SessionTiming {
            warmup: Duration::from_secs(self.warmup_secs),
            round_interval: Duration::from_secs(self.round_interval_secs),
        }
    }

    pub fn reconnect(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listen address for incoming peers.
    pub host: String,
    pub port: u16,
    /// Accepted peer credentials (user -> password).
    #[serde(default)]
    pub users: Credentials,
    #[serde(default)]
    pub known_hosts: Vec<KnownHost>,
    /// Namespace -> local directory.
    pub sync_to_local_folder: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub timing: Timing,
    /// Optional address for the read-only debug HTTP server.
    #[serde(default)]
    pub status_addr: Option<String>,
}

impl Config {
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content).context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Config does not exist: {}", path.display());
        }
        let content = fs::read_to_string(path)?;
        Self::parse(&content).with_context(|| format!("Failed to load {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        for namespace in self.sync_to_local_folder.keys() {
            if namespace.is_empty() || namespace.contains(':') {
                bail!("Invalid namespace {namespace:?}: must be non-empty and contain no ':'");
            }
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn mapping(&self) -> Mapping {
        Mapping::new(self.sync_to_local_folder.clone())
    }
}

/// Where the config, ignore file and database live.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub dir: PathBuf,
}

impl ConfigPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `%APPDATA%\p2p_sync` on Windows, `~/.p2p_sync` elsewhere.
    pub fn default_location() -> Result<Self> {
        let dirs = BaseDirs::new().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
        let dir = if cfg!(windows) {
            dirs.config_dir().join("p2p_sync")
        } else {
            dirs.home_dir().join(".p2p_sync")
        };
        Ok(Self { dir })
    }

    pub fn config_file(&self) -> PathBuf {
        self.dir.join(CONFIG_FILE)
    }

    pub fn ignore_file(&self) -> PathBuf {
        self.dir.join(IGNORE_FILE)
    }

    pub fn database_file(&self) -> PathBuf {
        self.dir.join(DATABASE_FILE)
    }

    pub fn load_config(&self) -> Result<Config> {
        Config::load(&self.config_file())
    }

    pub fn load_filter(&self) -> Result<ExclusionFilter> {
        ExclusionFilter::load(&self.ignore_file())
    }
}
