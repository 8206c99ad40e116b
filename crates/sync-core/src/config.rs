//! Configuration for the sync core.

use crate::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Default service URL (can be overridden at compile time via SYNC_SERVICE_URL env var).
pub const DEFAULT_SERVICE_URL: &str = match option_env!("SYNC_SERVICE_URL") {
    Some(url) => url,
    None => "https://sync.example.com",
};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

const DATABASE_FILE_NAME: &str = "sync.sqlite3";

/// Queue-level backoff for transient failures.
///
/// Retry delay follows `initial * 2^(retry - 1)` capped at `max_delay_ms`.
/// Once `max_retries` transient failures have been consumed, the next one
/// aborts the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryConfig {
    /// Delay before the given retry (1-indexed). Zero for retry 0.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = (retry - 1).min(31);
        let delay_ms = self
            .initial_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

/// Inline retry of gateway-class responses (502/503/504) on the
/// request/response path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayRetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub delay_ms: u64,
}

impl Default for GatewayRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
        }
    }
}

impl GatewayRetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Main sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Base URL relative endpoints are resolved against.
    pub service_url: String,
    /// Fixed instance id; a random one is generated per run when unset.
    pub instance_id: Option<String>,
    /// SQLite file backing the durable store. `None` runs memory-only.
    pub database_path: Option<PathBuf>,
    /// Entity cache tables wiped when a cached session belongs to another
    /// user or has expired.
    pub entity_tables: Vec<String>,
    pub retry: RetryConfig,
    pub gateway: GatewayRetryConfig,
    /// Per-attempt timeout of the request/response client.
    pub request_timeout_secs: u64,
    pub heartbeat_interval_ms: u64,
    /// How stale a heartbeat must be before that instance's records are
    /// adopted by others.
    pub orphan_after_ms: u64,
    pub orphan_sweep_interval_ms: u64,
    /// Upper bound on how long the dispatch loop sleeps when idle.
    pub idle_tick_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            service_url: DEFAULT_SERVICE_URL.to_string(),
            instance_id: None,
            database_path: None,
            entity_tables: Vec::new(),
            retry: RetryConfig::default(),
            gateway: GatewayRetryConfig::default(),
            request_timeout_secs: 30,
            heartbeat_interval_ms: 5_000,
            orphan_after_ms: 30_000,
            orphan_sweep_interval_ms: 15_000,
            idle_tick_ms: 1_000,
        }
    }
}

impl SyncConfig {
    /// Create a new config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from an optional file, falling back to defaults,
    /// then apply environment overrides.
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let mut config = match path {
            Some(path) if path.exists() => Self::load_from_file(path)?,
            _ => Self::default(),
        };
        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SyncConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn load_from_env(&mut self) {
        if let Ok(level) = std::env::var("SYNC_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Ok(url) = std::env::var("SYNC_SERVICE_URL") {
            self.service_url = url;
        }
        if let Ok(id) = std::env::var("SYNC_INSTANCE_ID") {
            if !id.trim().is_empty() {
                self.instance_id = Some(id.trim().to_string());
            }
        }
        if let Ok(path) = std::env::var("SYNC_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }
    }

    fn validate(&self) -> CoreResult<()> {
        self.service_url()?;
        if self.gateway.max_attempts == 0 {
            return Err(CoreError::Config(
                "gateway.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.orphan_after_ms <= self.heartbeat_interval_ms {
            return Err(CoreError::Config(
                "orphan_after_ms must exceed heartbeat_interval_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// The service URL, parsed.
    pub fn service_url(&self) -> CoreResult<Url> {
        Url::parse(&self.service_url).map_err(CoreError::from)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn orphan_after(&self) -> Duration {
        Duration::from_millis(self.orphan_after_ms)
    }

    pub fn orphan_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.orphan_sweep_interval_ms)
    }

    pub fn idle_tick(&self) -> Duration {
        Duration::from_millis(self.idle_tick_ms)
    }
}

/// Platform data directory location for the durable store.
pub fn default_database_path() -> CoreResult<PathBuf> {
    let base = dirs::data_local_dir()
        .ok_or_else(|| CoreError::Path("Could not determine data directory".to_string()))?;
    Ok(base.join("unbound-sync").join(DATABASE_FILE_NAME))
}
