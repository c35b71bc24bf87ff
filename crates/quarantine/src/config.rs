//! Quarantine engine configuration.
//!
//! Values come from an optional TOML file layered under environment
//! variables prefixed with `SAFESTORE` (`SAFESTORE__DATABASE_DIR=/var/...`).

use config::{Config, Environment, File as ConfigFile};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "SAFESTORE";
pub const DEFAULT_ERROR_THRESHOLD: u32 = 10;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("configuration file {} not found", .0.display())]
    NotFound(PathBuf),
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarantineConfig {
    /// Directory holding the object store database.
    pub database_dir: PathBuf,
    pub database_name: String,
    /// Hex password for the database, generated on first start.
    pub password_file: PathBuf,
    /// Present while the engine cannot serve requests.
    pub dormant_flag_path: PathBuf,
    /// Plain integer: consecutive store failures tolerated before the
    /// database is treated as corrupt.
    pub error_threshold_path: PathBuf,
    /// Scratch directory for full rescans.
    pub staging_dir: PathBuf,
    pub database_mode: u32,
    pub database_uid: Option<u32>,
    pub database_gid: Option<u32>,
    pub monitor_initial_backoff_secs: u64,
    pub monitor_max_backoff_secs: u64,
    pub max_object_size: Option<u64>,
    pub max_store_size: Option<u64>,
    pub max_stored_object_count: Option<u64>,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        let base = PathBuf::from("/var/lib/safestore");
        Self {
            database_dir: base.join("db"),
            database_name: "safestore.db".to_string(),
            password_file: base.join("safestore.pw"),
            dormant_flag_path: base.join("safestore_dormant_flag"),
            error_threshold_path: base.join("safestore_db_error_threshold"),
            staging_dir: base.join("rescan"),
            database_mode: 0o700,
            database_uid: None,
            database_gid: None,
            monitor_initial_backoff_secs: 60,
            monitor_max_backoff_secs: 3600,
            max_object_size: None,
            max_store_size: None,
            max_stored_object_count: None,
        }
    }
}

/// Build the layered source: the file (when given) then the environment.
pub fn layered_source(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut builder = Config::builder();

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        builder = builder.add_source(ConfigFile::from(path));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    Ok(builder.build()?)
}

impl QuarantineConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::from_source(&layered_source(path)?)
    }

    pub fn from_source(source: &Config) -> Result<Self, ConfigError> {
        let config: Self = source.clone().try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_name.trim().is_empty() {
            return Err(ConfigError::Invalid("database_name is empty".into()));
        }
        if self.database_name.contains('/') {
            return Err(ConfigError::Invalid(
                "database_name must not contain '/'".into(),
            ));
        }
        if !self.database_dir.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "database_dir must be absolute: {}",
                self.database_dir.display()
            )));
        }
        if self.monitor_initial_backoff_secs == 0 {
            return Err(ConfigError::Invalid(
                "monitor_initial_backoff_secs must be positive".into(),
            ));
        }
        if self.monitor_max_backoff_secs < self.monitor_initial_backoff_secs {
            return Err(ConfigError::Invalid(format!(
                "monitor_max_backoff_secs ({}) is below monitor_initial_backoff_secs ({})",
                self.monitor_max_backoff_secs, self.monitor_initial_backoff_secs
            )));
        }
        Ok(())
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.monitor_initial_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.monitor_max_backoff_secs)
    }

    /// Lay every path out under `root`. Used by tests and local runs.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            database_dir: root.join("db"),
            password_file: root.join("safestore.pw"),
            dormant_flag_path: root.join("safestore_dormant_flag"),
            error_threshold_path: root.join("safestore_db_error_threshold"),
            staging_dir: root.join("rescan"),
            ..Self::default()
        }
    }
}
