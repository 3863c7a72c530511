use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::flow_cache::FlowCacheConfig;

#[cfg(unix)]
const DEFAULT_LOG_FILE: &str = "/var/log/flowgate/flowgate.log";
#[cfg(windows)]
const DEFAULT_LOG_FILE: &str = "C:\\Flowgate\\log\\flowgate.log";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] io::Error),
    #[error("config invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub log_file: String,
    #[serde(with = "LevelDef")]
    pub log_level: log::Level,
    /// Packet-processing workers, each owning its own flow cache.
    pub workers: usize,
    pub flow: FlowCacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_file: DEFAULT_LOG_FILE.into(),
            log_level: log::Level::Info,
            workers: 1,
            flow: FlowCacheConfig::default(),
        }
    }
}

impl Config {
    pub fn load_from_file<T: AsRef<Path>>(path: T) -> Result<Config, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let mut c: Config = serde_yaml::from_str(&contents)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if c.workers < 1 {
            c.workers = 1;
        }
        // a cache with fewer than two slots cannot hold the current flow
        // while pruning another
        if c.flow.max_flows < 2 {
            c.flow.max_flows = 2;
        }
        if c.flow.cleanup_flows < 1 {
            c.flow.cleanup_flows = 1;
        }
        if c.flow.prune_flows < 1 {
            c.flow.prune_flows = 1;
        }

        Ok(c)
    }
}

#[derive(Deserialize)]
#[serde(remote = "log::Level", rename_all = "kebab-case")]
enum LevelDef {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}
