use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::runtime::RuntimeConfig;

pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub data_dir: Option<PathBuf>,
    pub legacy_dir: Option<PathBuf>,
    pub save_debounce_ms: u64,
    pub heartbeat_ms: u64,
    pub timer_tick_ms: u64,
    pub log: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            legacy_dir: None,
            save_debounce_ms: 750,
            heartbeat_ms: 1_000,
            timer_tick_ms: 1_000,
            log: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::parse(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Intervals for the companion runtime. Zero periods are raised to one
    /// millisecond.
    pub fn runtime(&self) -> RuntimeConfig {
        RuntimeConfig {
            save_debounce: Duration::from_millis(self.save_debounce_ms),
            heartbeat: Duration::from_millis(self.heartbeat_ms.max(1)),
            timer_tick: Duration::from_millis(self.timer_tick_ms.max(1)),
        }
    }
}
