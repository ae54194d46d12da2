//! Redis-backed broker.
//!
//! Every state transition is a Lua script so that multi-key moves
//! (waiting -> active, active -> delayed, ...) happen atomically on the
//! server. Per queue the layout is:
//!
//! ```text
//! {prefix}:{queue}:waiting     ZSET  priority * 2^32 + seq
//! {prefix}:{queue}:delayed     ZSET  available_at (ms)
//! {prefix}:{queue}:active      ZSET  lease deadline (ms)
//! {prefix}:{queue}:completed   ZSET  finished_at (ms)
//! {prefix}:{queue}:failed      ZSET  finished_at (ms)
//! {prefix}:{queue}:dead        ZSET  finished_at (ms)
//! {prefix}:{queue}:paused      STRING flag
//! {prefix}:{queue}:job:{id}    HASH  job fields
//! {prefix}:seq                 STRING enqueue counter
//! ```
//!
//! Waiting scores stay below 2^53 for every legal priority, so they are
//! exact doubles. `seq` is taken mod 2^32: FIFO within one priority holds
//! for the first 2^32 enqueues under a key prefix.

mod broker;
mod scripts;

pub use broker::RedisBroker;

use crate::config::RedisConfig;
use crate::error::{JobError, JobResult};
use deadpool_redis::{Config, Pool, Runtime};
use std::time::Duration;
use tracing::info;

/// Create a Redis connection pool and verify it with a PING.
pub async fn create_pool(config: &RedisConfig) -> JobResult<Pool> {
    info!("Creating Redis connection pool for job queues...");

    let cfg = Config::from_url(&config.url);
    let connect_timeout = Duration::from_secs(config.connect_timeout_secs);

    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {e}")))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .create_timeout(Some(connect_timeout))
        .wait_timeout(Some(connect_timeout))
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {e}")))?;

    let mut conn = pool
        .get()
        .await
        .map_err(|e| JobError::BrokerUnavailable(format!("Redis unreachable: {e}")))?;
    let _: String = redis::cmd("PING").query_async(&mut *conn).await?;

    info!(url = %config.url, "Redis connection pool created successfully");

    Ok(pool)
}

/// Redis key builder for one key prefix.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Eligible jobs, scored by priority then sequence.
    pub fn waiting(&self, queue: &str) -> String {
        format!("{}:{}:waiting", self.prefix, queue)
    }

    /// Jobs scored by `available_at`.
    pub fn delayed(&self, queue: &str) -> String {
        format!("{}:{}:delayed", self.prefix, queue)
    }

    /// Leased jobs scored by lease deadline.
    pub fn active(&self, queue: &str) -> String {
        format!("{}:{}:active", self.prefix, queue)
    }

    /// Completed history.
    pub fn completed(&self, queue: &str) -> String {
        format!("{}:{}:completed", self.prefix, queue)
    }

    /// Failed history.
    pub fn failed(&self, queue: &str) -> String {
        format!("{}:{}:failed", self.prefix, queue)
    }

    /// Dead-letter snapshots.
    pub fn dead(&self, queue: &str) -> String {
        format!("{}:{}:dead", self.prefix, queue)
    }

    /// Pause flag.
    pub fn paused(&self, queue: &str) -> String {
        format!("{}:{}:paused", self.prefix, queue)
    }

    /// Job hash.
    pub fn job(&self, queue: &str, job_id: &str) -> String {
        format!("{}{}", self.job_prefix(queue), job_id)
    }

    /// Prefix of every job hash in a queue; scripts append the ID.
    pub fn job_prefix(&self, queue: &str) -> String {
        format!("{}:{}:job:", self.prefix, queue)
    }

    /// Global enqueue sequence.
    pub fn seq(&self) -> String {
        format!("{}:seq", self.prefix)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_KEY_PREFIX)
    }
}
