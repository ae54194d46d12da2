//! Job system configuration.
//!
//! Loaded in layers, later sources overriding earlier ones:
//! 1. `{dir}/default.toml`
//! 2. `{dir}/{COURIER_ENVIRONMENT}.toml` (defaults to `development`)
//! 3. `{dir}/local.toml`
//! 4. `COURIER__*` environment variables, e.g. `COURIER__WORKER__CONCURRENCY=8`

use crate::backoff::Backoff;
use crate::error::{JobError, JobResult};
use crate::job::MAX_PRIORITY;
use crate::telemetry::LoggingConfig;
use crate::worker::MAX_LEASE;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Default prefix for every Redis key the broker writes.
pub const DEFAULT_KEY_PREFIX: &str = "courier:jobs";

/// Configuration for the job system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Redis connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Worker configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Default options for queues created without explicit options.
    #[serde(default)]
    pub queue: QueueDefaults,

    /// Dead-letter configuration.
    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl JobsConfig {
    /// Load configuration from `dir`, then validate it.
    pub fn load(dir: impl AsRef<Path>) -> JobResult<Self> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let dir = dir.as_ref();
        let environment =
            std::env::var("COURIER_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = Config::builder();
        for name in ["default", environment.as_str(), "local"] {
            let path = dir.join(format!("{name}.toml"));
            if path.exists() {
                debug!(path = %path.display(), "Loading config file");
                builder = builder.add_source(File::from(path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("COURIER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: JobsConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the job system cannot run with.
    pub fn validate(&self) -> JobResult<()> {
        self.redis.validate()?;
        self.worker.validate()?;
        self.queue.validate()?;

        if self.dead_letter.enabled && self.dead_letter.queue_name.trim().is_empty() {
            return Err(JobError::Configuration(
                "dead_letter.queue_name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Key prefix for all job-related keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl RedisConfig {
    fn validate(&self) -> JobResult<()> {
        if self.pool_size == 0 {
            return Err(JobError::Configuration("redis.pool_size must be at least 1".into()));
        }
        if self.key_prefix.is_empty() {
            return Err(JobError::Configuration("redis.key_prefix must not be empty".into()));
        }
        Ok(())
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Jobs processed in parallel per worker.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Upper bound on an idle wait before polling the broker again.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Visibility timeout of a dequeued job.
    #[serde(default = "default_lease")]
    pub lease_ms: u64,

    /// How often a running job's lease is extended.
    #[serde(default = "default_lease_renew")]
    pub lease_renew_ms: u64,

    /// Shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// First delay after a broker failure in the worker loop.
    #[serde(default = "default_infra_backoff_initial")]
    pub infra_backoff_initial_ms: u64,

    /// Cap for the worker loop's broker-failure backoff.
    #[serde(default = "default_infra_backoff_max")]
    pub infra_backoff_max_ms: u64,
}

impl WorkerConfig {
    /// Idle poll bound as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Lease as a `Duration`.
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    /// Lease renewal period as a `Duration`.
    pub fn lease_renew(&self) -> Duration {
        Duration::from_millis(self.lease_renew_ms)
    }

    /// Shutdown timeout as a `Duration`.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    fn validate(&self) -> JobResult<()> {
        if self.concurrency == 0 {
            return Err(JobError::Configuration("worker.concurrency must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(JobError::Configuration("worker.poll_interval_ms must be positive".into()));
        }
        if self.lease() > MAX_LEASE {
            return Err(JobError::Configuration(format!(
                "worker.lease_ms must be at most {}",
                MAX_LEASE.as_millis()
            )));
        }
        if self.lease_renew_ms == 0 || self.lease_renew_ms >= self.lease_ms {
            return Err(JobError::Configuration(format!(
                "worker.lease_renew_ms ({}) must be positive and below worker.lease_ms ({})",
                self.lease_renew_ms, self.lease_ms
            )));
        }
        if self.infra_backoff_initial_ms > self.infra_backoff_max_ms {
            return Err(JobError::Configuration(
                "worker.infra_backoff_initial_ms exceeds worker.infra_backoff_max_ms".into(),
            ));
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval(),
            lease_ms: default_lease(),
            lease_renew_ms: default_lease_renew(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            infra_backoff_initial_ms: default_infra_backoff_initial(),
            infra_backoff_max_ms: default_infra_backoff_max(),
        }
    }
}

fn default_concurrency() -> usize {
    // Processing is I/O-bound, so this is a floor rather than a core count.
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
        .max(4)
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_lease() -> u64 {
    30_000
}

fn default_lease_renew() -> u64 {
    10_000
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_infra_backoff_initial() -> u64 {
    100
}

fn default_infra_backoff_max() -> u64 {
    10_000
}

/// Default job options applied by queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDefaults {
    /// Total permitted attempts, the first included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff between attempts.
    #[serde(default)]
    pub backoff: Backoff,

    /// Priority (lower = sooner).
    #[serde(default)]
    pub priority: u32,

    /// Completed history cap.
    #[serde(default = "default_retention_completed")]
    pub retention_completed: usize,

    /// Failed history cap.
    #[serde(default = "default_retention_failed")]
    pub retention_failed: usize,
}

impl QueueDefaults {
    fn validate(&self) -> JobResult<()> {
        if self.max_attempts == 0 {
            return Err(JobError::Configuration("queue.max_attempts must be at least 1".into()));
        }
        if self.priority > MAX_PRIORITY {
            return Err(JobError::Configuration(format!(
                "queue.priority must be at most {MAX_PRIORITY}"
            )));
        }
        self.backoff
            .validate()
            .map_err(|e| JobError::Configuration(format!("queue.backoff: {e}")))
    }
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
            priority: 0,
            retention_completed: default_retention_completed(),
            retention_failed: default_retention_failed(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retention_completed() -> usize {
    100
}

fn default_retention_failed() -> usize {
    500
}

/// Dead-letter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// Copy exhausted jobs into the dead-letter queue.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Name of the dead-letter queue.
    #[serde(default = "default_dead_letter_queue")]
    pub queue_name: String,

    /// Entries kept before the oldest are evicted.
    #[serde(default = "default_dead_letter_retention")]
    pub retention: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_name: default_dead_letter_queue(),
            retention: default_dead_letter_retention(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_dead_letter_queue() -> String {
    "dead-letter".to_string()
}

fn default_dead_letter_retention() -> usize {
    10_000
}
