//! Gateway configuration document and the store that owns it on disk.
//!
//! The document is plain JSON. Only the keys the control plane reads are
//! typed; everything else is carried through `extra` so a rewrite never drops
//! settings this crate does not know about.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::ConfigError;

/// Seconds between load reports when `drl_notification_frequency` is unset.
pub const DEFAULT_DRL_NOTIFICATION_FREQUENCY: u64 = 2;
/// Seconds between analytics purge cycles when `purge_interval` is unset.
pub const DEFAULT_PURGE_INTERVAL: u64 = 10;

/// Connection settings for the backing data store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StorageOptions {
    #[serde(rename = "type")]
    pub storage_type: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Upstream sync settings used when the node is managed remotely.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SlaveOptions {
    pub use_rpc: bool,
    pub connection_string: String,
    pub rpc_key: String,
    pub api_key: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Settings for loading APIs from the fleet database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DbAppConfOptions {
    pub connection_string: String,
    pub node_is_segmented: bool,
    /// Group tags; their concatenation is the node's segment fingerprint.
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub enable_multiple_analytics_keys: bool,
    /// Seconds between purge cycles; `0` falls back to the default.
    pub purge_interval: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The gateway configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen_port: u16,
    pub secret: String,
    pub node_secret: String,
    pub storage: StorageOptions,
    pub slave_options: SlaveOptions,
    pub auth_override: Map<String, Value>,
    pub allow_remote_config: bool,
    pub drl_notification_frequency: u64,
    pub db_app_conf_options: DbAppConfOptions,
    pub analytics_config: AnalyticsConfig,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            secret: String::new(),
            node_secret: String::new(),
            storage: StorageOptions::default(),
            slave_options: SlaveOptions::default(),
            auth_override: Map::new(),
            allow_remote_config: false,
            drl_notification_frequency: 0,
            db_app_conf_options: DbAppConfOptions::default(),
            analytics_config: AnalyticsConfig::default(),
            extra: Map::new(),
        }
    }
}

impl GatewayConfig {
    pub fn drl_notification_interval(&self) -> Duration {
        match self.drl_notification_frequency {
            0 => Duration::from_secs(DEFAULT_DRL_NOTIFICATION_FREQUENCY),
            secs => Duration::from_secs(secs),
        }
    }

    pub fn purge_interval(&self) -> Duration {
        match self.analytics_config.purge_interval {
            0 => Duration::from_secs(DEFAULT_PURGE_INTERVAL),
            secs => Duration::from_secs(secs),
        }
    }

    /// Concatenation of the configured group tags, in order.
    pub fn tag_hash(&self) -> String {
        self.db_app_conf_options.tags.concat()
    }
}

/// Serialize with four-space indentation, keys in declaration order.
pub fn to_pretty_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut ser)?;
    Ok(buf)
}

/// Merge `patch` into `base` the way decoding into a pre-filled struct does.
///
/// Objects merge key by key, recursively. A `null` in the patch leaves the
/// base untouched. Any other value replaces the base value, arrays included.
pub fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        if !value.is_null() {
                            base_map.insert(key, value);
                        }
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

/// Read and decode a configuration file.
pub fn read_config_file(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Owner of the node's configuration: the in-memory copy, the candidate file
/// paths and the directory backups are written to.
///
/// The first candidate path is the primary path new configuration is written
/// to. The running configuration may have been loaded from a later candidate;
/// that one is remembered as the source path.
#[derive(Debug)]
pub struct ConfigStore {
    paths: Vec<PathBuf>,
    backup_dir: PathBuf,
    current: RwLock<GatewayConfig>,
    source_path: RwLock<Option<PathBuf>>,
}

impl ConfigStore {
    /// Build a store around an already-loaded configuration.
    pub fn new(paths: Vec<PathBuf>, backup_dir: impl Into<PathBuf>, config: GatewayConfig) -> Self {
        let source_path = paths.first().cloned();
        Self {
            paths,
            backup_dir: backup_dir.into(),
            current: RwLock::new(config),
            source_path: RwLock::new(source_path),
        }
    }

    /// Load from the first readable candidate path.
    ///
    /// Missing files are skipped; a file that exists but does not decode is an
    /// error. With no readable file the defaults are used.
    pub fn load(paths: Vec<PathBuf>, backup_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        if paths.is_empty() {
            return Err(ConfigError::NoPath);
        }

        let backup_dir = backup_dir.into();
        for path in &paths {
            match read_config_file(path) {
                Ok(config) => {
                    info!("Loaded configuration from {}", path.display());
                    return Ok(Self {
                        paths: paths.clone(),
                        backup_dir,
                        current: RwLock::new(config),
                        source_path: RwLock::new(Some(path.clone())),
                    });
                }
                Err(ConfigError::Read { source, .. }) => {
                    debug!("Skipping configuration candidate {}: {}", path.display(), source);
                }
                Err(e) => return Err(e),
            }
        }

        warn!("No configuration file found, using defaults");
        Ok(Self {
            paths,
            backup_dir,
            current: RwLock::new(GatewayConfig::default()),
            source_path: RwLock::new(None),
        })
    }

    /// Snapshot of the running configuration.
    pub fn get(&self) -> GatewayConfig {
        self.current.read().clone()
    }

    pub fn set(&self, config: GatewayConfig) {
        *self.current.write() = config;
    }

    /// Path new configuration is written to.
    pub fn primary_path(&self) -> Result<&Path, ConfigError> {
        self.paths.first().map(PathBuf::as_path).ok_or(ConfigError::NoPath)
    }

    /// Path the running configuration came from, falling back to the primary path.
    pub fn source_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = self.source_path.read().clone() {
            return Ok(path);
        }
        self.primary_path().map(Path::to_path_buf)
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Decode the on-disk configuration into the typed document.
    pub fn read_on_disk(&self) -> Result<GatewayConfig, ConfigError> {
        read_config_file(&self.source_path()?)
    }

    /// Read the on-disk configuration as a generic key/value map.
    pub fn read_document(&self) -> Result<Map<String, Value>, ConfigError> {
        let path = self.source_path()?;
        let bytes = fs::read(&path).map_err(|source| ConfigError::Read { path, source })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Re-read the configuration from disk and make it the running one.
    pub fn reload(&self) -> Result<(), ConfigError> {
        for path in &self.paths {
            match read_config_file(path) {
                Ok(config) => {
                    self.set(config);
                    *self.source_path.write() = Some(path.clone());
                    info!("Reloaded configuration from {}", path.display());
                    return Ok(());
                }
                Err(ConfigError::Read { source, .. }) if source.kind() == ErrorKind::NotFound => {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(ConfigError::NoPath)
    }
}
