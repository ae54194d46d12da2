//! Redis implementation of [`Broker`].

use super::scripts::Scripts;
use super::RedisKeys;
use crate::backoff::Backoff;
use crate::broker::{later, Broker, Clock, StateCounts, SystemClock};
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobState, Retention};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Redis-backed broker.
pub struct RedisBroker {
    pool: Pool,
    keys: RedisKeys,
    scripts: Scripts,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

impl RedisBroker {
    /// Create a broker over an existing pool.
    pub fn new(pool: Pool, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(key_prefix),
            scripts: Scripts::new(),
            clock: Arc::new(SystemClock),
            closed: AtomicBool::new(false),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(JobError::BrokerUnavailable("broker handle is closed".into()));
        }
        self.pool
            .get()
            .await
            .map_err(|e| JobError::BrokerUnavailable(e.to_string()))
    }

    fn history_key(&self, queue: &str, state: JobState) -> JobResult<String> {
        match state {
            JobState::Completed => Ok(self.keys.completed(queue)),
            JobState::Failed => Ok(self.keys.failed(queue)),
            JobState::DeadLettered => Ok(self.keys.dead(queue)),
            other => Err(JobError::Configuration(format!(
                "state '{other}' has no finished history"
            ))),
        }
    }

    fn state_key(&self, queue: &str, state: JobState) -> String {
        match state {
            JobState::Waiting => self.keys.waiting(queue),
            JobState::Delayed => self.keys.delayed(queue),
            JobState::Active => self.keys.active(queue),
            JobState::Completed => self.keys.completed(queue),
            JobState::Failed => self.keys.failed(queue),
            JobState::DeadLettered => self.keys.dead(queue),
        }
    }

    fn owner_of(job: &Job) -> JobResult<&str> {
        job.owner
            .as_deref()
            .ok_or_else(|| JobError::LeaseLost(job.id.to_string()))
    }

    fn lease_deadline(&self, lease: Duration) -> JobResult<DateTime<Utc>> {
        later(self.clock.now(), lease)
    }

    async fn finish(&self, job: &Job, state: JobState, cap: usize) -> JobResult<()> {
        let owner = Self::owner_of(job)?;
        let mut conn = self.conn().await?;

        let outcome: i64 = self
            .scripts
            .finish
            .key(self.keys.job(&job.queue, job.id.as_str()))
            .key(self.keys.active(&job.queue))
            .key(self.history_key(&job.queue, state)?)
            .arg(job.id.as_str())
            .arg(owner)
            .arg(self.clock.now().timestamp_millis())
            .arg(state.as_str())
            .arg(cap)
            .arg(self.keys.job_prefix(&job.queue))
            .arg(job.attempts_made)
            .arg(job.last_error.as_deref().unwrap_or_default())
            .invoke_async(&mut *conn)
            .await?;

        if outcome < 0 {
            return Err(JobError::LeaseLost(job.id.to_string()));
        }
        debug!(job_id = %job.id, queue = %job.queue, state = %state, "Finished job");
        Ok(())
    }
}

fn millis(at: DateTime<Utc>) -> String {
    at.timestamp_millis().to_string()
}

fn optional_millis(at: Option<DateTime<Utc>>) -> String {
    at.map(millis).unwrap_or_default()
}

/// Flatten a job into hash field/value pairs. `seq` and `state` are
/// written by the enqueue script.
fn job_to_fields(job: &Job) -> JobResult<Vec<String>> {
    let fields = [
        ("id", job.id.to_string()),
        ("queue", job.queue.clone()),
        ("name", job.name.clone()),
        ("payload", serde_json::to_string(&job.payload)?),
        ("attempts_made", job.attempts_made.to_string()),
        ("max_attempts", job.max_attempts.to_string()),
        ("backoff", serde_json::to_string(&job.backoff)?),
        ("priority", job.priority.to_string()),
        ("available_at", millis(job.available_at)),
        ("created_at", millis(job.created_at)),
        ("started_at", optional_millis(job.started_at)),
        ("finished_at", optional_millis(job.finished_at)),
        ("last_error", job.last_error.clone().unwrap_or_default()),
        ("retention_completed", job.retention.completed.to_string()),
        ("retention_failed", job.retention.failed.to_string()),
        ("owner", String::new()),
        ("lease_until", String::new()),
    ];

    Ok(fields
        .into_iter()
        .flat_map(|(name, value)| [name.to_string(), value])
        .collect())
}

struct Fields(HashMap<String, String>);

impl Fields {
    fn raw(&self, name: &str) -> JobResult<&str> {
        self.0
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| JobError::Internal(format!("job hash missing field '{name}'")))
    }

    fn optional(&self, name: &str) -> Option<String> {
        self.0.get(name).filter(|v| !v.is_empty()).cloned()
    }

    fn number<T: std::str::FromStr>(&self, name: &str) -> JobResult<T> {
        self.raw(name)?
            .parse()
            .map_err(|_| JobError::Internal(format!("job hash field '{name}' is not a number")))
    }

    fn time(&self, name: &str) -> JobResult<DateTime<Utc>> {
        let ms: i64 = self.number(name)?;
        DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| JobError::Internal(format!("job hash field '{name}' is out of range")))
    }

    fn optional_time(&self, name: &str) -> JobResult<Option<DateTime<Utc>>> {
        match self.optional(name) {
            Some(_) => self.time(name).map(Some),
            None => Ok(None),
        }
    }
}

fn job_from_fields(map: HashMap<String, String>) -> JobResult<Job> {
    let f = Fields(map);
    let backoff: Backoff = serde_json::from_str(f.raw("backoff")?)?;

    Ok(Job {
        id: JobId::from_string(f.raw("id")?),
        queue: f.raw("queue")?.to_string(),
        name: f.raw("name")?.to_string(),
        payload: serde_json::from_str(f.raw("payload")?)?,
        state: f.raw("state")?.parse()?,
        attempts_made: f.number("attempts_made")?,
        max_attempts: f.number("max_attempts")?,
        backoff,
        priority: f.number("priority")?,
        seq: f.number("seq")?,
        available_at: f.time("available_at")?,
        created_at: f.time("created_at")?,
        started_at: f.optional_time("started_at")?,
        finished_at: f.optional_time("finished_at")?,
        last_error: f.optional("last_error"),
        retention: Retention {
            completed: f.number("retention_completed")?,
            failed: f.number("retention_failed")?,
        },
        owner: f.optional("owner"),
        lease_until: f.optional_time("lease_until")?,
    })
}

#[async_trait]
impl Broker for RedisBroker {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn enqueue(&self, mut job: Job) -> JobResult<Job> {
        let now = self.clock.now();
        let fields = job_to_fields(&job)?;
        let mode = if job.state == JobState::DeadLettered {
            JobState::DeadLettered.as_str()
        } else {
            ""
        };

        let mut conn = self.conn().await?;
        let seq: u64 = self
            .scripts
            .enqueue
            .key(self.keys.job(&job.queue, job.id.as_str()))
            .key(self.keys.waiting(&job.queue))
            .key(self.keys.delayed(&job.queue))
            .key(self.keys.dead(&job.queue))
            .key(self.keys.seq())
            .arg(job.id.as_str())
            .arg(now.timestamp_millis())
            .arg(job.available_at.timestamp_millis())
            .arg(job.priority)
            .arg(mode)
            .arg(job.retention.failed)
            .arg(self.keys.job_prefix(&job.queue))
            .arg(fields)
            .invoke_async(&mut *conn)
            .await?;

        job.seq = seq;
        job.owner = None;
        job.lease_until = None;
        job.state = if job.state == JobState::DeadLettered {
            job.finished_at = Some(now);
            JobState::DeadLettered
        } else if job.available_at > now {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        debug!(job_id = %job.id, queue = %job.queue, state = %job.state, "Stored job");
        Ok(job)
    }

    async fn dequeue_next(
        &self,
        queue: &str,
        owner: &str,
        lease: Duration,
    ) -> JobResult<Option<Job>> {
        let now = self.clock.now();
        let lease_until = self.lease_deadline(lease)?;
        let mut conn = self.conn().await?;

        let fields: Option<HashMap<String, String>> = self
            .scripts
            .dequeue
            .key(self.keys.waiting(queue))
            .key(self.keys.delayed(queue))
            .key(self.keys.active(queue))
            .key(self.keys.paused(queue))
            .arg(now.timestamp_millis())
            .arg(lease_until.timestamp_millis())
            .arg(owner)
            .arg(self.keys.job_prefix(queue))
            .invoke_async(&mut *conn)
            .await?;

        fields.map(job_from_fields).transpose()
    }

    async fn extend_lease(&self, job: &Job, lease: Duration) -> JobResult<()> {
        let owner = Self::owner_of(job)?;
        let lease_until = self.lease_deadline(lease)?;
        let mut conn = self.conn().await?;

        let outcome: i64 = self
            .scripts
            .extend_lease
            .key(self.keys.job(&job.queue, job.id.as_str()))
            .key(self.keys.active(&job.queue))
            .arg(job.id.as_str())
            .arg(owner)
            .arg(lease_until.timestamp_millis())
            .invoke_async(&mut *conn)
            .await?;

        if outcome < 0 {
            return Err(JobError::LeaseLost(job.id.to_string()));
        }
        Ok(())
    }

    async fn ack_complete(&self, job: &Job) -> JobResult<()> {
        self.finish(job, JobState::Completed, job.retention.completed)
            .await
    }

    async fn ack_retry(&self, job: &Job, available_at: DateTime<Utc>) -> JobResult<()> {
        let owner = Self::owner_of(job)?;
        let mut conn = self.conn().await?;

        let outcome: i64 = self
            .scripts
            .retry
            .key(self.keys.job(&job.queue, job.id.as_str()))
            .key(self.keys.active(&job.queue))
            .key(self.keys.waiting(&job.queue))
            .key(self.keys.delayed(&job.queue))
            .arg(job.id.as_str())
            .arg(owner)
            .arg(self.clock.now().timestamp_millis())
            .arg(available_at.timestamp_millis())
            .arg(job.attempts_made)
            .arg(job.last_error.as_deref().unwrap_or_default())
            .invoke_async(&mut *conn)
            .await?;

        if outcome < 0 {
            return Err(JobError::LeaseLost(job.id.to_string()));
        }
        debug!(job_id = %job.id, queue = %job.queue, retry_at = %available_at, "Scheduled job retry");
        Ok(())
    }

    async fn ack_failed(&self, job: &Job) -> JobResult<()> {
        self.finish(job, JobState::Failed, job.retention.failed).await
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> JobResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let map: HashMap<String, String> = conn.hgetall(self.keys.job(queue, id.as_str())).await?;
        if map.is_empty() {
            return Ok(None);
        }
        job_from_fields(map).map(Some)
    }

    async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> JobResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;

        let start = isize::try_from(offset).unwrap_or(isize::MAX);
        let stop = isize::try_from(offset.saturating_add(limit) - 1).unwrap_or(isize::MAX);
        let ids: Vec<String> = conn.zrange(self.state_key(queue, state), start, stop).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(self.keys.job(queue, id));
        }
        let maps: Vec<HashMap<String, String>> = pipe.query_async(&mut *conn).await?;

        maps.into_iter()
            .filter(|map| !map.is_empty())
            .map(job_from_fields)
            .collect()
    }

    async fn count_by_state(&self, queue: &str) -> JobResult<StateCounts> {
        let mut conn = self.conn().await?;
        let (waiting, active, completed, failed, delayed, dead_lettered, paused): (
            u64,
            u64,
            u64,
            u64,
            u64,
            u64,
            bool,
        ) = redis::pipe()
            .zcard(self.keys.waiting(queue))
            .zcard(self.keys.active(queue))
            .zcard(self.keys.completed(queue))
            .zcard(self.keys.failed(queue))
            .zcard(self.keys.delayed(queue))
            .zcard(self.keys.dead(queue))
            .exists(self.keys.paused(queue))
            .query_async(&mut *conn)
            .await?;

        Ok(StateCounts {
            waiting,
            active,
            completed,
            failed,
            delayed,
            dead_lettered,
            paused,
        })
    }

    async fn delete(&self, queue: &str, id: &JobId) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let previous: Option<String> = self
            .scripts
            .remove
            .key(self.keys.job(queue, id.as_str()))
            .key(self.keys.waiting(queue))
            .key(self.keys.delayed(queue))
            .key(self.keys.completed(queue))
            .key(self.keys.failed(queue))
            .key(self.keys.dead(queue))
            .arg(id.as_str())
            .invoke_async(&mut *conn)
            .await?;

        match previous.as_deref() {
            None => Ok(false),
            Some("active") => Err(JobError::InvalidState {
                expected: "waiting, delayed or finished".to_string(),
                actual: "active".to_string(),
            }),
            Some(_) => Ok(true),
        }
    }

    async fn promote(&self, queue: &str, id: &JobId) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let previous: Option<String> = self
            .scripts
            .promote
            .key(self.keys.job(queue, id.as_str()))
            .key(self.keys.waiting(queue))
            .key(self.keys.delayed(queue))
            .arg(id.as_str())
            .arg(self.clock.now().timestamp_millis())
            .invoke_async(&mut *conn)
            .await?;

        match previous.as_deref() {
            None => Err(JobError::NotFound(id.to_string())),
            Some("waiting" | "delayed") => Ok(()),
            Some(other) => Err(JobError::InvalidState {
                expected: "waiting or delayed".to_string(),
                actual: other.to_string(),
            }),
        }
    }

    async fn pause(&self, queue: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.set(self.keys.paused(queue), 1).await?;
        Ok(())
    }

    async fn resume(&self, queue: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(self.keys.paused(queue)).await?;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let paused: bool = conn.exists(self.keys.paused(queue)).await?;
        Ok(paused)
    }

    async fn purge(
        &self,
        queue: &str,
        older_than: DateTime<Utc>,
        limit: usize,
        state: JobState,
    ) -> JobResult<Vec<JobId>> {
        let key = self.history_key(queue, state)?;
        let mut conn = self.conn().await?;

        let ids: Vec<String> = self
            .scripts
            .purge
            .key(key)
            .arg(older_than.timestamp_millis())
            .arg(limit)
            .arg(self.keys.job_prefix(queue))
            .invoke_async(&mut *conn)
            .await?;

        Ok(ids.into_iter().map(JobId::from).collect())
    }

    async fn health_check(&self) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }

    async fn close(&self) -> JobResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.pool.close();
            info!("Redis broker closed");
        }
        Ok(())
    }
}
