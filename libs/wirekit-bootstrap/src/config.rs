//! Host configuration: a YAML file layered with environment overrides.
//!
//! The file has two top-level sections: `logging` (per-subsystem sinks and
//! levels) and `components` (one block per configuration pid, handed to the
//! component runtime's configuration source verbatim). Environment
//! variables prefixed `WIREKIT__` override file values, with `__` as the
//! path separator (`WIREKIT__LOGGING__DEFAULT__CONSOLE_LEVEL=debug`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(PathBuf),
    #[error("invalid configuration")]
    Invalid(#[from] Box<figment::Error>),
}

/// One logging section: the `default` key sets the fallback, any other key
/// names a subsystem (a target prefix such as `wirekit::component`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_level")]
    pub console_level: String,
    #[serde(default = "default_level")]
    pub file_level: String,
    /// Log file path, relative to the logs directory. Empty disables the
    /// file sink for this section.
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub max_backups: Option<usize>,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            console_level: default_level(),
            file_level: default_level(),
            file: String::new(),
            max_size_mb: None,
            max_age_days: None,
            max_backups: None,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

pub type LoggingConfig = BTreeMap<String, LogSection>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Component configuration by pid. Keys of the form `pid~instance`
    /// feed factory components, one entry per instance.
    #[serde(default)]
    pub components: BTreeMap<String, serde_json::Value>,
    /// Directory file sinks are created under.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl AppConfig {
    /// Load defaults, then the given YAML file (if any), then `WIREKIT__`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed("WIREKIT__").split("__"));
        figment
            .extract()
            .map_err(|e| ConfigError::Invalid(Box::new(e)))
    }

    /// Split a `components` key into (pid, factory instance).
    pub fn split_pid(key: &str) -> (&str, Option<&str>) {
        match key.split_once('~') {
            Some((pid, instance)) => (pid, Some(instance)),
            None => (key, None),
        }
    }
}
