//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

use crate::telemetry::LoggingConfig;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Job scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Redis configuration
    #[serde(default)]
    pub redis: RedisConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Scheduler tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Identifier of this instance, stored on jobs it runs
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Maximum number of jobs running at once across the cluster
    #[serde(default = "default_max_running")]
    pub max_running: usize,

    /// How long finished non-recurring jobs are kept before the purge job deletes them
    #[serde(default = "default_retention_time", with = "humantime_serde")]
    pub retention_time: Duration,

    /// Expiry of the cluster-wide lock
    #[serde(default = "default_lock_expiry", with = "humantime_serde")]
    pub lock_expiry: Duration,

    /// How long to keep trying to obtain the cluster-wide lock
    #[serde(default = "default_lock_acquire_timeout", with = "humantime_serde")]
    pub lock_acquire_timeout: Duration,

    /// Cron expression of the purge job
    #[serde(default = "default_purge_cron")]
    pub purge_cron: String,

    /// Cron expression of the overdue job reclaimer
    #[serde(default = "default_overdue_cron")]
    pub overdue_cron: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            max_running: default_max_running(),
            retention_time: default_retention_time(),
            lock_expiry: default_lock_expiry(),
            lock_acquire_timeout: default_lock_acquire_timeout(),
            purge_cron: default_purge_cron(),
            overdue_cron: default_overdue_cron(),
        }
    }
}

impl SchedulerConfig {
    /// Set the instance id.
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Set the concurrency budget.
    pub fn with_max_running(mut self, max_running: usize) -> Self {
        self.max_running = max_running;
        self
    }

    /// Set the retention window for finished jobs.
    pub fn with_retention_time(mut self, retention_time: Duration) -> Self {
        self.retention_time = retention_time;
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Address of the Prometheus scrape endpoint, disabled when absent
    pub listen_addr: Option<String>,
}

// Default value functions
fn default_instance_id() -> String { format!("apex-{}", uuid::Uuid::new_v4().simple()) }
fn default_max_running() -> usize { 10 }
fn default_retention_time() -> Duration { Duration::from_secs(120 * 60 * 60) }
fn default_lock_expiry() -> Duration { Duration::from_secs(10) }
fn default_lock_acquire_timeout() -> Duration { Duration::from_secs(15) }
fn default_purge_cron() -> String { "15 */4 * * *".to_string() }
fn default_overdue_cron() -> String { "*/20 * * * *".to_string() }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }

impl AppConfig {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("APEX").separator("__"))
            .build()?;

        let cfg: AppConfig = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("APEX").separator("__"))
            .build()?;

        let cfg: AppConfig = config.try_deserialize()?;
        Ok(cfg)
    }
}
