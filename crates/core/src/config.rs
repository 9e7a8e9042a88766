use serde::Deserialize;

use crate::error::{CampaignError, CampaignResult};
use crate::providers::{validate_providers, ProviderSettings};

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `CAMPAIGN_DELIVERY__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub audience: AudienceConfig,
    #[serde(default)]
    pub providers: Vec<ProviderSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Which backend holds tasks, ledger rows and usage counters.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum concurrently executing tasks per node.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long a claim stays exclusive before the task is redelivered.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_start_jitter_min_secs")]
    pub start_jitter_min_secs: u64,
    #[serde(default = "default_start_jitter_max_secs")]
    pub start_jitter_max_secs: u64,
    /// Floor applied to every step delay, including configured zero delays.
    #[serde(default = "default_min_step_delay_secs")]
    pub min_step_delay_secs: u64,
    #[serde(default = "default_auto_complete")]
    pub auto_complete: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// In-line retries for sends that never reached the vendor. 0 disables.
    #[serde(default)]
    pub max_transient_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AudienceConfig {
    /// JSON file mapping audience id to its recipients.
    #[serde(default)]
    pub seed_file: Option<String>,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_key_prefix() -> String {
    "cd".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_workers() -> usize {
    16
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_batch_size() -> usize {
    256
}
fn default_lease_secs() -> u64 {
    120
}
fn default_task_timeout_secs() -> u64 {
    30
}
fn default_start_jitter_min_secs() -> u64 {
    1
}
fn default_start_jitter_max_secs() -> u64 {
    5
}
fn default_min_step_delay_secs() -> u64 {
    5
}
fn default_auto_complete() -> bool {
    true
}
fn default_retry_base_delay_ms() -> u64 {
    500
}
fn default_retry_max_delay_ms() -> u64 {
    10_000
}
fn default_health_interval_secs() -> u64 {
    300
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            lease_secs: default_lease_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            start_jitter_min_secs: default_start_jitter_min_secs(),
            start_jitter_max_secs: default_start_jitter_max_secs(),
            min_step_delay_secs: default_min_step_delay_secs(),
            auto_complete: default_auto_complete(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_transient_retries: 0,
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl DeliveryConfig {
    /// Backoff before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped at `retry_max_delay_ms`.
    pub fn retry_delay(&self, attempt: u32) -> std::time::Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .retry_base_delay_ms
            .saturating_mul(factor)
            .min(self.retry_max_delay_ms);
        std::time::Duration::from_millis(ms)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval_secs(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            storage: StorageConfig::default(),
            redis: RedisConfig::default(),
            scheduler: SchedulerConfig::default(),
            delivery: DeliveryConfig::default(),
            health: HealthConfig::default(),
            audience: AudienceConfig::default(),
            providers: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional config file and environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("CAMPAIGN_DELIVERY")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> CampaignResult<()> {
        let s = &self.scheduler;
        if s.workers == 0 {
            return Err(CampaignError::Config(
                "scheduler.workers must be at least 1".to_string(),
            ));
        }
        if s.start_jitter_min_secs > s.start_jitter_max_secs {
            return Err(CampaignError::Config(
                "scheduler.start_jitter_min_secs exceeds start_jitter_max_secs".to_string(),
            ));
        }
        if s.lease_secs <= s.task_timeout_secs {
            return Err(CampaignError::Config(
                "scheduler.lease_secs must be longer than task_timeout_secs".to_string(),
            ));
        }
        validate_providers(&self.providers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.delivery.max_transient_retries, 0);
    }

    #[test]
    fn test_lease_must_outlive_task_timeout() {
        let mut config = AppConfig::default();
        config.scheduler.lease_secs = 10;
        config.scheduler.task_timeout_secs = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_jitter_bounds_checked() {
        let mut config = AppConfig::default();
        config.scheduler.start_jitter_min_secs = 10;
        config.scheduler.start_jitter_max_secs = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let delivery = DeliveryConfig {
            max_transient_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 1500,
        };
        assert_eq!(delivery.retry_delay(0).as_millis(), 500);
        assert_eq!(delivery.retry_delay(1).as_millis(), 1000);
        assert_eq!(delivery.retry_delay(2).as_millis(), 1500);
        assert_eq!(delivery.retry_delay(70).as_millis(), 1500);
    }
}
