//! TOML configuration for condensation and serving.
//!
//! # Responsibility
//! - Deserialize `ServeConfig` with a default for every key.
//! - Validate values that would otherwise fail late (templates, capacities).
//!
//! # Invariants
//! - A config returned by `load`/`from_toml_str` has passed `validate`.

use serde::Deserialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ORGANIZATION_PLACEHOLDER: &str = "{organization_id}";

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse(toml::de::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "cannot read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "invalid config toml: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(value: toml::de::Error) -> Self {
        Self::Parse(value)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// Master switch for the condensation job.
    pub create_condensed_datasets: bool,
    /// Scratch directory for condensed files before upload.
    pub tmp_dir: Option<PathBuf>,
    /// Public base URL of the catalog site, used for API basins.
    pub site_url: String,
    /// Root of local block storage.
    pub storage_path: PathBuf,
    /// Directory for lock markers; `<storage_path>/locks` when unset.
    pub lock_dir: Option<PathBuf>,
    pub object_store: ObjectStoreConfig,
    pub cache: CacheConfig,
    pub wait_for_resource: WaitConfig,
    pub logging: LoggingConfig,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            create_condensed_datasets: true,
            tmp_dir: None,
            site_url: "http://localhost:5000".to_string(),
            storage_path: PathBuf::from("/data/ckan-storage"),
            lock_dir: None,
            object_store: ObjectStoreConfig::default(),
            cache: CacheConfig::default(),
            wait_for_resource: WaitConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub endpoint_url: String,
    /// Bucket name template; `{organization_id}` is substituted.
    pub bucket_name: String,
    /// Local directory backing the store.
    pub root: PathBuf,
    pub presign_secret: String,
    pub presign_expiry_secs: u64,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint_url: "http://localhost:9000".to_string(),
            bucket_name: "circle-{organization_id}".to_string(),
            root: PathBuf::from("/data/object-store"),
            presign_secret: String::new(),
            presign_expiry_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Open dataset handles kept per process.
    pub handle_capacity: usize,
    /// Memoized mime-type checks.
    pub mimetype_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            handle_capacity: 100,
            mimetype_capacity: 1024,
        }
    }
}

/// Bounded wait for late-arriving uploads.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            poll_interval_ms: 100,
        }
    }
}

impl WaitConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub log_dir: Option<PathBuf>,
}

impl ServeConfig {
    /// Reads and validates the TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.object_store.bucket_name.contains(ORGANIZATION_PLACEHOLDER) {
            return Err(ConfigError::Invalid(format!(
                "object_store.bucket_name must contain `{ORGANIZATION_PLACEHOLDER}`"
            )));
        }
        if self.site_url.trim().is_empty() {
            return Err(ConfigError::Invalid("site_url must not be empty".to_string()));
        }
        if self.wait_for_resource.poll_interval_ms > self.wait_for_resource.timeout_ms {
            return Err(ConfigError::Invalid(
                "wait_for_resource.poll_interval_ms exceeds timeout_ms".to_string(),
            ));
        }
        if self.cache.handle_capacity == 0 || self.cache.mimetype_capacity == 0 {
            return Err(ConfigError::Invalid(
                "cache capacities must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Bucket holding artifacts of `organization_id`.
    pub fn bucket_name(&self, organization_id: &str) -> String {
        self.object_store
            .bucket_name
            .replace(ORGANIZATION_PLACEHOLDER, organization_id)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| self.storage_path.join("locks"))
    }

    pub fn presign_expiry(&self) -> Duration {
        Duration::from_secs(self.object_store.presign_expiry_secs)
    }
}
