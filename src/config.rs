// Configuration File Support
//
// TOML configuration for the meterguard quota core, with environment
// variable overrides (prefix METERGUARD_). The default location is the
// platform config directory, e.g. ~/.config/meterguard/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::hierarchy::HierarchyConfig;
use crate::ledger::LedgerConfig;
use crate::logging::LoggingConfig;
use crate::maintenance::MaintenanceConfig;
use crate::rate_limit::RateLimitConfig;
use crate::scheduler::SchedulerConfig;
use crate::store::{MemoryStore, StoreTimeout, Stores};
use crate::usage::recorder::UsageConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Shared store backend
    pub store: StoreConfig,

    /// Reservation lifetime and commit retries
    pub ledger: LedgerConfig,

    pub rate_limit: RateLimitConfig,

    /// Resolver cache
    pub hierarchy: HierarchyConfig,

    /// Billing period resets
    pub scheduler: SchedulerConfig,

    /// Asynchronous usage writes
    pub usage: UsageConfig,

    /// Background job intervals
    pub maintenance: MaintenanceConfig,

    /// Metrics endpoint
    pub metrics: MetricsConfig,
}

/// Store backend kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store; state is lost on exit
    #[default]
    Memory,
    /// Redis, shared by every server instance (feature `store-redis`)
    Redis,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            _ => Err(format!("Invalid store backend: {}. Must be 'memory' or 'redis'", s)),
        }
    }
}

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Connection URL (required for redis)
    pub url: Option<String>,

    /// Upper bound for one store call in milliseconds
    pub timeout_ms: u64,

    /// Key prefix for shared backends
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: None,
            timeout_ms: 500,
            key_prefix: "meterguard".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> StoreTimeout {
        StoreTimeout::from_millis(self.timeout_ms)
    }

    /// Connect to the configured backend
    pub async fn open(&self) -> Result<Stores> {
        match self.backend {
            StoreBackend::Memory => Ok(Stores::from_backend(Arc::new(MemoryStore::new()))),
            #[cfg(feature = "store-redis")]
            StoreBackend::Redis => {
                let url = self
                    .url
                    .as_deref()
                    .context("Redis store backend requires store.url")?;
                let store = crate::store::RedisStore::connect(url, &self.key_prefix)
                    .await
                    .with_context(|| format!("Failed to connect to redis at {}", url))?;
                Ok(Stores::from_backend(Arc::new(store)))
            }
            #[cfg(not(feature = "store-redis"))]
            StoreBackend::Redis => {
                anyhow::bail!("Redis store backend requires building with the 'store-redis' feature")
            }
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve /metrics while maintenance runs
    pub enabled: bool,

    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();
        Self::load_from_path(&config_path)
    }

    /// Load configuration from `path`; a missing file yields the defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Default configuration file path
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "meterguard", "meterguard") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config").join("meterguard").join("config.toml")
        }
    }

    fn apply_env_overrides(mut self) -> Self {
        // Logging overrides
        if let Ok(level) = std::env::var("METERGUARD_LOG_LEVEL") {
            if let Ok(level) = level.parse() {
                self.logging.level = level;
            }
        }
        if let Ok(format) = std::env::var("METERGUARD_LOG_FORMAT") {
            if let Ok(format) = format.parse() {
                self.logging.format = format;
            }
        }

        // Store overrides
        if let Ok(backend) = std::env::var("METERGUARD_STORE_BACKEND") {
            if let Ok(backend) = backend.parse() {
                self.store.backend = backend;
            }
        }
        if let Ok(url) = std::env::var("METERGUARD_STORE_URL") {
            self.store.url = Some(url);
        }
        if let Ok(timeout) = std::env::var("METERGUARD_STORE_TIMEOUT_MS") {
            if let Ok(timeout) = timeout.parse::<u64>() {
                if timeout > 0 {
                    self.store.timeout_ms = timeout;
                }
            }
        }

        // Ledger overrides
        if let Ok(ttl) = std::env::var("METERGUARD_RESERVATION_TTL_SECS") {
            if let Ok(ttl) = ttl.parse::<u64>() {
                if ttl > 0 {
                    self.ledger.reservation_ttl_secs = ttl;
                }
            }
        }

        self.rate_limit = self.rate_limit.with_env_overrides();

        // Metrics overrides
        if let Ok(enabled) = std::env::var("METERGUARD_METRICS_ENABLED") {
            self.metrics.enabled = enabled.parse().unwrap_or(self.metrics.enabled);
        }
        if let Ok(port) = std::env::var("METERGUARD_METRICS_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.metrics.port = port;
            }
        }

        self
    }

    /// Reject settings the quota core cannot run with
    pub fn validate(&self) -> Result<()> {
        // Store
        if self.store.timeout_ms == 0 {
            anyhow::bail!("Store timeout must be > 0 ms");
        }
        if self.store.backend == StoreBackend::Redis && self.store.url.is_none() {
            anyhow::bail!("Redis store backend requires store.url");
        }
        if self.store.key_prefix.is_empty() {
            anyhow::bail!("Store key prefix must not be empty");
        }

        // Ledger
        if self.ledger.reservation_ttl_secs == 0 {
            anyhow::bail!("Reservation TTL must be > 0 seconds");
        }
        if self.ledger.max_cas_retries == 0 {
            anyhow::bail!("Ledger max_cas_retries must be > 0");
        }
        if self.ledger.sweep_batch == 0 {
            anyhow::bail!("Ledger sweep_batch must be > 0");
        }
        if self.ledger.reconcile_batch == 0 {
            anyhow::bail!("Ledger reconcile_batch must be > 0");
        }
        validate_retry("ledger.adjustment_retry", &self.ledger.adjustment_retry)?;

        // Hierarchy
        if self.hierarchy.cache_capacity == 0 {
            anyhow::bail!("Hierarchy cache capacity must be > 0");
        }

        // Scheduler
        if self.scheduler.batch_size == 0 {
            anyhow::bail!("Scheduler batch_size must be > 0");
        }
        if let crate::scheduler::BillingPeriod::Fixed { seconds: 0 } = self.scheduler.billing_period {
            anyhow::bail!("Fixed billing period must be > 0 seconds");
        }

        // Usage
        if self.usage.queue_capacity == 0 {
            anyhow::bail!("Usage queue capacity must be > 0");
        }
        if self.usage.max_dead_letters == 0 {
            anyhow::bail!("Usage max_dead_letters must be > 0");
        }
        validate_retry("usage.retry", &self.usage.retry)?;

        // Maintenance
        let intervals = [
            ("reset", self.maintenance.reset_interval_secs),
            ("sweep", self.maintenance.sweep_interval_secs),
            ("reconcile", self.maintenance.reconcile_interval_secs),
            ("purge", self.maintenance.purge_interval_secs),
        ];
        for (name, secs) in intervals {
            if secs == 0 {
                anyhow::bail!("Maintenance {} interval must be > 0 seconds", name);
            }
        }

        // Metrics
        if self.metrics.port == 0 {
            anyhow::bail!("Metrics port must be > 0");
        }

        Ok(())
    }
}

fn validate_retry(name: &str, policy: &crate::retry::RetryPolicy) -> Result<()> {
    if policy.max_attempts == 0 {
        anyhow::bail!("{} max_attempts must be > 0", name);
    }
    if !(0.0..=1.0).contains(&policy.jitter) {
        anyhow::bail!("{} jitter must be between 0.0 and 1.0", name);
    }
    if policy.base_delay_ms > policy.max_delay_ms {
        anyhow::bail!("{} base_delay_ms must not exceed max_delay_ms", name);
    }
    Ok(())
}
