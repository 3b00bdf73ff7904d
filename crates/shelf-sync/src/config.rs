//! Engine configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::SortOrder;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5000/api";
pub const DEFAULT_WS_URL: &str = "ws://localhost:5000";
pub const DEFAULT_PAGE_SIZE: u32 = 36;
pub const DEFAULT_SORT_BY: &str = "id";

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL of the books REST API
    pub api_base_url: String,

    /// Push channel URL
    pub ws_url: String,

    /// Records per page when listing
    pub page_size: u32,

    /// Default sort field and order for the primary view
    pub default_sort_by: String,
    pub default_order: SortOrder,

    /// Where engine documents are persisted
    pub storage: StorageBackend,

    /// Interval between reachability probes while online
    pub probe_interval: Duration,

    /// Upper bound on a single reachability probe
    pub probe_timeout: Duration,

    /// Upper bound on a regular API request
    pub request_timeout: Duration,

    /// Pause between a reachability transition and the sync pass it triggers
    pub sync_delay: Duration,

    /// Debounce window for aggregate (stats) refreshes
    pub stats_debounce: Duration,

    /// Retry backoff for periodic passes after a pass left failures behind
    pub retry: RetryPolicy,

    /// Push channel reconnection policy
    pub reconnect: ReconnectPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            default_sort_by: DEFAULT_SORT_BY.to_string(),
            default_order: SortOrder::Asc,
            storage: StorageBackend::Memory,
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            sync_delay: Duration::from_millis(500),
            stats_debounce: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-memory storage (fast, non-persistent)
    Memory,

    /// One JSON file per document (persistent, single process)
    Filesystem(FilesystemConfig),

    /// No local storage at all: reads are empty, writes are dropped
    Detached,
}

/// Filesystem storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilesystemConfig {
    /// Data directory path
    pub path: PathBuf,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".shelf/data"),
        }
    }
}

/// Backoff between periodic sync attempts once a pass has left failed items
///
/// `base * 2^failures`, capped at `max`. A reachability transition ignores
/// the backoff and syncs right away.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            max: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `consecutive_failures` failing passes
    pub fn backoff(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(consecutive_failures.min(16));
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Push channel reconnection policy: `base * 2^attempt`, `max_attempts` tries
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

/// TOML configuration for shelf.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineTomlConfig {
    pub api_base_url: Option<String>,
    pub ws_url: Option<String>,
    pub page_size: Option<u32>,
    pub sort_by: Option<String>,
    pub order: Option<String>,

    /// Probe interval in seconds
    pub probe_interval: Option<u64>,
    /// Probe timeout in milliseconds
    pub probe_timeout_ms: Option<u64>,
    /// Sync trigger delay in milliseconds
    pub sync_delay_ms: Option<u64>,

    pub storage: StorageTomlConfig,
    pub push: PushTomlConfig,
}

/// Storage configuration in TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageTomlConfig {
    /// "memory", "filesystem" or "detached"
    pub backend: Option<String>,

    /// Filesystem-specific config
    pub filesystem: Option<FilesystemConfig>,
}

/// Push channel configuration in TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PushTomlConfig {
    pub max_reconnect_attempts: Option<u32>,
    /// Base reconnect delay in milliseconds
    pub reconnect_base_ms: Option<u64>,
}

impl EngineTomlConfig {
    /// Parse a TOML document
    pub fn from_toml_str(source: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Load a config file; a missing file yields the defaults
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(source) => Self::from_toml_str(&source)
                .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(anyhow::anyhow!("Failed to read {}: {}", path.display(), e)),
        }
    }

    /// Convert TOML config to runtime config
    pub fn to_runtime_config(&self) -> anyhow::Result<EngineConfig> {
        let defaults = EngineConfig::default();

        let default_order = match self.order.as_deref() {
            Some(order) => order.parse()?,
            None => defaults.default_order,
        };

        let storage = match self.storage.backend.as_deref() {
            None | Some("memory") => StorageBackend::Memory,
            Some("filesystem") => {
                StorageBackend::Filesystem(self.storage.filesystem.clone().unwrap_or_default())
            }
            Some("detached") => StorageBackend::Detached,
            Some(other) => return Err(anyhow::anyhow!("Unknown storage backend: {}", other)),
        };

        let reconnect = ReconnectPolicy {
            max_attempts: self
                .push
                .max_reconnect_attempts
                .unwrap_or(defaults.reconnect.max_attempts),
            base_delay: self
                .push
                .reconnect_base_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconnect.base_delay),
        };

        Ok(EngineConfig {
            api_base_url: self.api_base_url.clone().unwrap_or(defaults.api_base_url),
            ws_url: self.ws_url.clone().unwrap_or(defaults.ws_url),
            page_size: self.page_size.unwrap_or(defaults.page_size),
            default_sort_by: self.sort_by.clone().unwrap_or(defaults.default_sort_by),
            default_order,
            storage,
            probe_interval: self
                .probe_interval
                .map(Duration::from_secs)
                .unwrap_or(defaults.probe_interval),
            probe_timeout: self
                .probe_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.probe_timeout),
            sync_delay: self
                .sync_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.sync_delay),
            reconnect,
            ..defaults
        })
    }
}
