//! Named, persisted job queues.

use crate::backoff::Backoff;
use crate::broker::{earlier, later, Broker};
use crate::config::QueueDefaults;
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobOptions, JobState, Retention, MAX_PRIORITY};
use crate::metrics::{JobMetrics, MetricsAggregator, QueueMetrics};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Default job options of one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Total permitted attempts, the first included.
    pub max_attempts: u32,
    /// Backoff between attempts.
    pub backoff: Backoff,
    /// Priority (lower = sooner).
    pub priority: u32,
    /// Completed history cap.
    pub retention_completed: usize,
    /// Failed history cap.
    pub retention_failed: usize,
}

impl QueueOptions {
    /// Reject options that would break job invariants.
    pub fn validate(&self) -> JobResult<()> {
        validate_job_fields(self.max_attempts, self.priority, &self.backoff)
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::from(&QueueDefaults::default())
    }
}

impl From<&QueueDefaults> for QueueOptions {
    fn from(defaults: &QueueDefaults) -> Self {
        Self {
            max_attempts: defaults.max_attempts,
            backoff: defaults.backoff.clone(),
            priority: defaults.priority,
            retention_completed: defaults.retention_completed,
            retention_failed: defaults.retention_failed,
        }
    }
}

fn validate_job_fields(max_attempts: u32, priority: u32, backoff: &Backoff) -> JobResult<()> {
    if max_attempts == 0 {
        return Err(JobError::Configuration("max_attempts must be at least 1".into()));
    }
    if priority > MAX_PRIORITY {
        return Err(JobError::Configuration(format!(
            "priority {priority} exceeds maximum {MAX_PRIORITY}"
        )));
    }
    backoff.validate().map_err(JobError::Configuration)
}

/// Terminal states that [`Queue::clean`] can purge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishedState {
    /// Completed history.
    Completed,
    /// Failed history.
    Failed,
}

impl From<FinishedState> for JobState {
    fn from(state: FinishedState) -> Self {
        match state {
            FinishedState::Completed => JobState::Completed,
            FinishedState::Failed => JobState::Failed,
        }
    }
}

/// A named queue backed by the shared broker.
///
/// Cheap to share: the registry hands out `Arc<Queue>` and every handle for
/// one name is the same instance.
pub struct Queue {
    name: String,
    options: QueueOptions,
    broker: Arc<dyn Broker>,
    notify: Arc<Notify>,
    closed: AtomicBool,
}

impl Queue {
    /// Create a queue. Prefer [`QueueRegistry::queue`](crate::QueueRegistry::queue).
    pub fn new(name: impl Into<String>, options: QueueOptions, broker: Arc<dyn Broker>) -> Self {
        Self {
            name: name.into(),
            options,
            broker,
            notify: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default job options.
    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Durably add a job. Returns once the broker has stored it.
    pub async fn enqueue<T: Serialize + ?Sized>(
        &self,
        job_name: &str,
        payload: &T,
        options: JobOptions,
    ) -> JobResult<Job> {
        let payload = serde_json::to_value(payload)?;
        self.enqueue_json(job_name, payload, options).await
    }

    /// Durably add a job with an already-serialized payload.
    pub async fn enqueue_json(
        &self,
        job_name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> JobResult<Job> {
        self.ensure_open()?;
        let job = self.build_job(job_name, payload, options)?;
        let job = self.broker.enqueue(job).await?;

        JobMetrics::job_enqueued(&self.name, &job.name);
        debug!(
            job_id = %job.id,
            queue = %self.name,
            job_name = %job.name,
            priority = job.priority,
            state = %job.state,
            "Enqueued job"
        );

        if job.state == JobState::Waiting {
            self.notify.notify_one();
        }
        Ok(job)
    }

    fn build_job(
        &self,
        job_name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> JobResult<Job> {
        if job_name.is_empty() {
            return Err(JobError::Configuration("job name must not be empty".into()));
        }

        let max_attempts = options.max_attempts.unwrap_or(self.options.max_attempts);
        let priority = options.priority.unwrap_or(self.options.priority);
        let backoff = options.backoff.unwrap_or_else(|| self.options.backoff.clone());
        validate_job_fields(max_attempts, priority, &backoff)?;

        let now = self.broker.now();
        let available_at = match options.delay {
            Some(delay) => later(now, delay)?,
            None => now,
        };

        Ok(Job {
            id: JobId::new(),
            queue: self.name.clone(),
            name: job_name.to_string(),
            payload,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts,
            backoff,
            priority,
            seq: 0,
            available_at,
            created_at: now,
            started_at: None,
            finished_at: None,
            last_error: None,
            retention: Retention {
                completed: options
                    .retention_completed
                    .unwrap_or(self.options.retention_completed),
                failed: options.retention_failed.unwrap_or(self.options.retention_failed),
            },
            owner: None,
            lease_until: None,
        })
    }

    /// Store a pre-built job as-is (used for dead-letter snapshots).
    pub(crate) async fn insert(&self, job: Job) -> JobResult<Job> {
        self.ensure_open()?;
        self.broker.enqueue(job).await
    }

    /// Take the next eligible job, owned by `owner` for `lease`.
    ///
    /// Workers call this; it is public for custom consumers.
    pub async fn dequeue_next(&self, owner: &str, lease: Duration) -> JobResult<Option<Job>> {
        self.broker.dequeue_next(&self.name, owner, lease).await
    }

    /// Fetch a job by ID.
    pub async fn get_job(&self, id: &JobId) -> JobResult<Option<Job>> {
        self.broker.get_job(&self.name, id).await
    }

    /// List jobs in one state.
    pub async fn list(&self, state: JobState, offset: usize, limit: usize) -> JobResult<Vec<Job>> {
        self.broker.list_jobs(&self.name, state, offset, limit).await
    }

    /// Halt new dequeues. In-flight jobs continue.
    pub async fn pause(&self) -> JobResult<()> {
        self.broker.pause(&self.name).await?;
        debug!(queue = %self.name, "Paused queue");
        Ok(())
    }

    /// Resume dequeues.
    pub async fn resume(&self) -> JobResult<()> {
        self.broker.resume(&self.name).await?;
        debug!(queue = %self.name, "Resumed queue");
        self.notify.notify_one();
        Ok(())
    }

    /// Whether the queue is paused.
    pub async fn is_paused(&self) -> JobResult<bool> {
        self.broker.is_paused(&self.name).await
    }

    /// Purge up to `limit` (0 = all) finished jobs older than `older_than`.
    pub async fn clean(
        &self,
        older_than: Duration,
        limit: usize,
        state: FinishedState,
    ) -> JobResult<Vec<JobId>> {
        let cutoff = earlier(self.broker.now(), older_than)?;
        let removed = self
            .broker
            .purge(&self.name, cutoff, limit, state.into())
            .await?;
        debug!(queue = %self.name, count = removed.len(), state = ?state, "Cleaned jobs");
        Ok(removed)
    }

    /// Remove a waiting, delayed or finished job. Active jobs are refused.
    pub async fn remove_job(&self, id: &JobId) -> JobResult<bool> {
        self.broker.delete(&self.name, id).await
    }

    /// Make a waiting or delayed job eligible now without resetting its
    /// attempt count.
    pub async fn retry_job(&self, id: &JobId) -> JobResult<()> {
        self.broker.promote(&self.name, id).await?;
        self.notify.notify_one();
        Ok(())
    }

    /// Live state counts.
    pub async fn metrics(&self) -> JobResult<QueueMetrics> {
        MetricsAggregator::new(self.broker.clone())
            .collect(&self.name)
            .await
    }

    /// Stop accepting new jobs and wake idle workers.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(queue = %self.name, "Closed queue");
        }
        self.notify.notify_waiters();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub(crate) fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    fn ensure_open(&self) -> JobResult<()> {
        if self.is_closed() {
            return Err(JobError::ShuttingDown);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
