//! Configuration management for the Herald campaign service.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use herald_pipeline::{
    enqueue::EnqueueSettings,
    fanout::FanoutSettings,
    reconcile::ReconcileSettings,
    scheduler::SchedulerSettings,
    send::SendSettings,
    BackoffStrategy, LockConfig, PipelineConfig, ProviderConfig, RetryPolicy, WorkerSettings,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.toml";

/// Whether this process runs the queue workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    /// Workers run inside the API process once the worker lock is held.
    Embedded,
    /// API only; another deployment consumes the queues.
    Disabled,
}

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`config.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Every key except the SMS provider has a usable default. With
/// `worker_mode = "embedded"` the provider URL and API key are required.
///
/// # Example
///
/// ```no_run
/// use herald_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Server will bind to {}:{}", config.host, config.port);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,
    /// Database connection idle timeout in seconds.
    ///
    /// Environment variable: `DATABASE_IDLE_TIMEOUT`
    #[serde(default = "default_idle_timeout", alias = "DATABASE_IDLE_TIMEOUT")]
    pub database_idle_timeout: u64,
    /// Maximum lifetime of database connections in seconds.
    ///
    /// Environment variable: `DATABASE_MAX_LIFETIME`
    #[serde(default = "default_max_lifetime", alias = "DATABASE_MAX_LIFETIME")]
    pub database_max_lifetime: u64,

    // Server
    /// Server bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Server bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// HTTP request timeout in seconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,

    // Workers
    /// `embedded` runs the queue workers in this process.
    ///
    /// Environment variable: `WORKER_MODE`
    #[serde(default = "default_worker_mode", alias = "WORKER_MODE")]
    pub worker_mode: WorkerMode,
    /// Service name in the worker lock key.
    ///
    /// Environment variable: `SERVICE_NAME`
    #[serde(default = "default_service_name", alias = "SERVICE_NAME")]
    pub service_name: String,
    /// Deployment environment in the worker lock key.
    ///
    /// Environment variable: `ENVIRONMENT`
    #[serde(default = "default_environment", alias = "ENVIRONMENT")]
    pub environment: String,
    /// Worker lock lease lifetime in milliseconds.
    ///
    /// Environment variable: `LOCK_TTL_MS`
    #[serde(default = "default_lock_ttl_ms", alias = "LOCK_TTL_MS")]
    pub lock_ttl_ms: u64,
    /// Worker lock refresh interval in milliseconds.
    ///
    /// Environment variable: `LOCK_REFRESH_MS`
    #[serde(default = "default_lock_refresh_ms", alias = "LOCK_REFRESH_MS")]
    pub lock_refresh_ms: u64,

    // Throughput
    /// Workers consuming `campaign-send`.
    ///
    /// Environment variable: `FANOUT_WORKERS`
    #[serde(default = "default_fanout_workers", alias = "FANOUT_WORKERS")]
    pub fanout_workers: usize,
    /// Workers consuming `sms-send`.
    ///
    /// Environment variable: `SMS_WORKERS`
    #[serde(default = "default_sms_workers", alias = "SMS_WORKERS")]
    pub sms_workers: usize,
    /// Workers consuming `delivery-status-update`.
    ///
    /// Environment variable: `RECONCILE_WORKERS`
    #[serde(default = "default_reconcile_workers", alias = "RECONCILE_WORKERS")]
    pub reconcile_workers: usize,
    /// Provider sends per second across all send workers.
    ///
    /// Environment variable: `SMS_RATE_PER_SECOND`
    #[serde(default = "default_sms_rate", alias = "SMS_RATE_PER_SECOND")]
    pub sms_rate_per_second: u32,
    /// Contacts per fan-out chunk.
    ///
    /// Environment variable: `FANOUT_BATCH_SIZE`
    #[serde(default = "default_fanout_batch_size", alias = "FANOUT_BATCH_SIZE")]
    pub fanout_batch_size: usize,
    /// Provider message ids per status poll.
    ///
    /// Environment variable: `RECONCILE_BATCH_SIZE`
    #[serde(default = "default_reconcile_batch_size", alias = "RECONCILE_BATCH_SIZE")]
    pub reconcile_batch_size: usize,
    /// Idle wait between empty queue polls in milliseconds.
    ///
    /// Environment variable: `POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms", alias = "POLL_INTERVAL_MS")]
    pub poll_interval_ms: u64,
    /// Seconds a claimed job stays invisible before another worker may
    /// reclaim it.
    ///
    /// Environment variable: `JOB_VISIBILITY_TIMEOUT_SECS`
    #[serde(default = "default_visibility_timeout", alias = "JOB_VISIBILITY_TIMEOUT_SECS")]
    pub job_visibility_timeout_secs: u64,

    // Retry
    /// Maximum provider send attempts per message.
    ///
    /// Environment variable: `MAX_SEND_ATTEMPTS`
    #[serde(default = "default_send_attempts", alias = "MAX_SEND_ATTEMPTS")]
    pub max_send_attempts: u32,
    /// Base delay for exponential backoff in milliseconds.
    ///
    /// Environment variable: `RETRY_BASE_DELAY_MS`
    #[serde(default = "default_base_delay_ms", alias = "RETRY_BASE_DELAY_MS")]
    pub retry_base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms", alias = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,
    /// Jitter factor for retry timing (0.0 to 1.0).
    ///
    /// Environment variable: `RETRY_JITTER_FACTOR`
    #[serde(default = "default_jitter_factor", alias = "RETRY_JITTER_FACTOR")]
    pub retry_jitter_factor: f64,

    // Provider
    /// SMS provider API base URL.
    ///
    /// Environment variable: `PROVIDER_BASE_URL`
    #[serde(default, alias = "PROVIDER_BASE_URL")]
    pub provider_base_url: Option<String>,
    /// SMS provider bearer token. Never serialized.
    ///
    /// Environment variable: `PROVIDER_API_KEY`
    #[serde(default, alias = "PROVIDER_API_KEY", skip_serializing)]
    pub provider_api_key: Option<String>,
    /// Timeout for one provider request in seconds.
    ///
    /// Environment variable: `PROVIDER_TIMEOUT_SECONDS`
    #[serde(default = "default_provider_timeout", alias = "PROVIDER_TIMEOUT_SECONDS")]
    pub provider_timeout_seconds: u64,

    // Ledger
    /// Credits charged per accepted message.
    ///
    /// Environment variable: `PER_MESSAGE_COST`
    #[serde(default = "default_per_message_cost", alias = "PER_MESSAGE_COST")]
    pub per_message_cost: i64,
    /// Hours before an active reservation is swept.
    ///
    /// Environment variable: `RESERVATION_TTL_HOURS`
    #[serde(default = "default_reservation_ttl_hours", alias = "RESERVATION_TTL_HOURS")]
    pub reservation_ttl_hours: i64,

    // Sweeps
    /// Idle minutes after which a sending campaign is reported stuck.
    ///
    /// Environment variable: `STUCK_CAMPAIGN_MINUTES`
    #[serde(default = "default_stuck_minutes", alias = "STUCK_CAMPAIGN_MINUTES")]
    pub stuck_campaign_minutes: i64,
    /// Seconds between per-campaign delivery polls.
    ///
    /// Environment variable: `DELIVERY_POLL_INTERVAL_SECS`
    #[serde(default = "default_delivery_poll_interval", alias = "DELIVERY_POLL_INTERVAL_SECS")]
    pub delivery_poll_interval_secs: u64,
    /// Seconds between global delivery sweeps.
    ///
    /// Environment variable: `DELIVERY_SWEEP_INTERVAL_SECS`
    #[serde(default = "default_delivery_sweep_interval", alias = "DELIVERY_SWEEP_INTERVAL_SECS")]
    pub delivery_sweep_interval_secs: u64,
    /// Seconds between maintenance sweeps.
    ///
    /// Environment variable: `MAINTENANCE_INTERVAL_SECS`
    #[serde(default = "default_maintenance_interval", alias = "MAINTENANCE_INTERVAL_SECS")]
    pub maintenance_interval_secs: u64,
    /// Minimum seconds between manual reconcile requests for one campaign.
    ///
    /// Environment variable: `RECONCILE_COOLDOWN_SECS`
    #[serde(default = "default_reconcile_cooldown", alias = "RECONCILE_COOLDOWN_SECS")]
    pub reconcile_cooldown_secs: i64,

    // Logging
    /// Log level configuration.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns error if a source cannot be parsed or validation fails.
    pub fn load() -> Result<Self> {
        let config = Self::figment().extract::<Self>().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""))
    }

    /// Whether this process should run the queue workers.
    pub fn workers_enabled(&self) -> bool {
        self.worker_mode == WorkerMode::Embedded
    }

    /// Convert to the pipeline engine configuration.
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        let retry_policy = self.to_retry_policy();
        let worker = WorkerSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            visibility_timeout: Duration::from_secs(self.job_visibility_timeout_secs),
            ..WorkerSettings::default()
        };
        let poll_interval = Duration::from_secs(self.delivery_poll_interval_secs);

        PipelineConfig {
            fanout_workers: self.fanout_workers,
            sms_workers: self.sms_workers,
            reconcile_workers: self.reconcile_workers,
            sms_rate_per_second: self.sms_rate_per_second,
            worker,
            fanout: FanoutSettings { batch_size: self.fanout_batch_size, delivery_poll_interval: poll_interval },
            send: SendSettings {
                per_message_cost: self.per_message_cost,
                provider_timeout: Duration::from_secs(self.provider_timeout_seconds),
                retry_policy,
            },
            reconcile: ReconcileSettings {
                batch_size: self.reconcile_batch_size,
                poll_interval,
                ..ReconcileSettings::default()
            },
            enqueue: EnqueueSettings {
                per_message_cost: self.per_message_cost,
                reservation_ttl: chrono::Duration::hours(self.reservation_ttl_hours),
            },
            scheduler: SchedulerSettings {
                delivery_sweep_interval: Duration::from_secs(self.delivery_sweep_interval_secs),
                maintenance_interval: Duration::from_secs(self.maintenance_interval_secs),
            },
            stuck_campaign_after: chrono::Duration::minutes(self.stuck_campaign_minutes),
            reconcile_cooldown: chrono::Duration::seconds(self.reconcile_cooldown_secs),
            shutdown_timeout: Duration::from_secs(self.request_timeout),
        }
    }

    /// Convert to the provider send retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_send_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    /// Convert to the HTTP provider configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the provider URL or API key is missing.
    pub fn to_provider_config(&self) -> Result<ProviderConfig> {
        let base_url = non_empty(self.provider_base_url.as_deref()).context("provider_base_url is not set")?;
        let api_key = non_empty(self.provider_api_key.as_deref()).context("provider_api_key is not set")?;

        Ok(ProviderConfig {
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            timeout: Duration::from_secs(self.provider_timeout_seconds),
            ..ProviderConfig::default()
        })
    }

    /// Convert to worker lock configuration.
    pub fn to_lock_config(&self) -> LockConfig {
        LockConfig {
            service: self.service_name.clone(),
            environment: self.environment.clone(),
            ttl: Duration::from_millis(self.lock_ttl_ms),
            refresh_interval: Duration::from_millis(self.lock_refresh_ms),
        }
    }

    /// Parse server socket address from host and port configuration.
    ///
    /// # Errors
    ///
    /// Returns error if host and port do not form a socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        if self.sms_workers == 0 || self.fanout_workers == 0 || self.reconcile_workers == 0 {
            anyhow::bail!("fanout_workers, sms_workers and reconcile_workers must be greater than 0");
        }

        if self.sms_rate_per_second == 0 {
            anyhow::bail!("sms_rate_per_second must be greater than 0");
        }

        if self.fanout_batch_size == 0 || self.reconcile_batch_size == 0 {
            anyhow::bail!("fanout_batch_size and reconcile_batch_size must be greater than 0");
        }

        if self.max_send_attempts == 0 {
            anyhow::bail!("max_send_attempts must be greater than 0");
        }

        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            anyhow::bail!("retry_base_delay_ms cannot exceed retry_max_delay_ms");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        if self.per_message_cost <= 0 {
            anyhow::bail!("per_message_cost must be greater than 0");
        }

        if self.reservation_ttl_hours <= 0 || self.stuck_campaign_minutes <= 0 {
            anyhow::bail!("reservation_ttl_hours and stuck_campaign_minutes must be greater than 0");
        }

        if self.lock_refresh_ms == 0 || self.lock_refresh_ms >= self.lock_ttl_ms {
            anyhow::bail!("lock_refresh_ms must be greater than 0 and less than lock_ttl_ms");
        }

        if self.workers_enabled() {
            self.to_provider_config()
                .context("worker_mode is embedded but the SMS provider is not configured")?;
        }

        Ok(())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            database_idle_timeout: default_idle_timeout(),
            database_max_lifetime: default_max_lifetime(),
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            worker_mode: default_worker_mode(),
            service_name: default_service_name(),
            environment: default_environment(),
            lock_ttl_ms: default_lock_ttl_ms(),
            lock_refresh_ms: default_lock_refresh_ms(),
            fanout_workers: default_fanout_workers(),
            sms_workers: default_sms_workers(),
            reconcile_workers: default_reconcile_workers(),
            sms_rate_per_second: default_sms_rate(),
            fanout_batch_size: default_fanout_batch_size(),
            reconcile_batch_size: default_reconcile_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            job_visibility_timeout_secs: default_visibility_timeout(),
            max_send_attempts: default_send_attempts(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_jitter_factor: default_jitter_factor(),
            provider_base_url: None,
            provider_api_key: None,
            provider_timeout_seconds: default_provider_timeout(),
            per_message_cost: default_per_message_cost(),
            reservation_ttl_hours: default_reservation_ttl_hours(),
            stuck_campaign_minutes: default_stuck_minutes(),
            delivery_poll_interval_secs: default_delivery_poll_interval(),
            delivery_sweep_interval_secs: default_delivery_sweep_interval(),
            maintenance_interval_secs: default_maintenance_interval(),
            reconcile_cooldown_secs: default_reconcile_cooldown(),
            rust_log: default_log_level(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/herald".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_max_lifetime() -> u64 {
    1800
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_worker_mode() -> WorkerMode {
    WorkerMode::Embedded
}

fn default_service_name() -> String {
    "herald".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_lock_ttl_ms() -> u64 {
    60_000
}

fn default_lock_refresh_ms() -> u64 {
    30_000
}

fn default_fanout_workers() -> usize {
    1
}

fn default_sms_workers() -> usize {
    herald_pipeline::DEFAULT_SMS_WORKERS
}

fn default_reconcile_workers() -> usize {
    1
}

fn default_sms_rate() -> u32 {
    herald_pipeline::DEFAULT_SMS_RATE_PER_SECOND
}

fn default_fanout_batch_size() -> usize {
    500
}

fn default_reconcile_batch_size() -> usize {
    100
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_visibility_timeout() -> u64 {
    300
}

fn default_send_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    3000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_jitter_factor() -> f64 {
    0.2
}

fn default_provider_timeout() -> u64 {
    10
}

fn default_per_message_cost() -> i64 {
    1
}

fn default_reservation_ttl_hours() -> i64 {
    24
}

fn default_stuck_minutes() -> i64 {
    15
}

fn default_delivery_poll_interval() -> u64 {
    60
}

fn default_delivery_sweep_interval() -> u64 {
    300
}

fn default_maintenance_interval() -> u64 {
    300
}

fn default_reconcile_cooldown() -> i64 {
    180
}

fn default_log_level() -> String {
    "info,herald=debug,tower_http=debug".to_string()
}
