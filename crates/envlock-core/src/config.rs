use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV_VAR: &str = "ENVLOCK_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// `docker`, `podman` or `mock`.
    pub backend: String,
    /// Executable used by the CLI backends.
    pub binary: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: "docker".to_owned(),
            binary: "docker".to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    pub verify_secs: u64,
    pub apply_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            verify_secs: 120,
            apply_secs: 900,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub root: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: "~/.local/share/envlock".to_owned(),
        }
    }
}

/// User configuration, read from `~/.config/envlock/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub timeouts: TimeoutConfig,
    pub store: StoreConfig,
}

impl Config {
    pub fn parse(content: &str) -> Result<Self, CoreError> {
        toml::from_str(content).map_err(|e| CoreError::Parse(format!("invalid config: {e}")))
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load from an explicit path, `$ENVLOCK_CONFIG`, or the default location.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, CoreError> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(CoreError::NotFound(format!(
                    "config file {}",
                    path.display()
                )));
            }
            return Self::load(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.is_empty() {
                return Self::load(&expand_tilde(&path));
            }
        }
        match default_config_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn store_root(&self) -> PathBuf {
        expand_tilde(&self.store.root)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.verify_secs)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.apply_secs)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".config/envlock/config.toml"))
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
