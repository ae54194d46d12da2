//! Dead-letter sink.
//!
//! The sink is an ordinary [`Queue`] whose jobs are snapshots in the
//! `dead_lettered` state. Snapshots are never dispatched, and they live
//! independently of the original job, which stays `failed` in its own queue
//! until retention evicts it.

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobOptions, JobState, Retention};
use crate::queue::Queue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Snapshot of a job that exhausted its attempts or failed permanently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// ID of the entry in the dead-letter queue.
    #[serde(skip)]
    pub id: JobId,
    /// Queue the job came from.
    pub original_queue: String,
    /// ID of the failed job in its queue.
    pub original_job_id: JobId,
    /// Logical job type.
    pub job_name: String,
    /// Original payload.
    pub payload: serde_json::Value,
    /// Final error.
    pub error: String,
    /// When the final attempt failed.
    pub failed_at: DateTime<Utc>,
    /// Attempts made before giving up.
    pub attempts: u32,
}

impl DeadLetterEntry {
    fn from_job(job: Job) -> JobResult<Self> {
        let mut entry: DeadLetterEntry = serde_json::from_value(job.payload)?;
        entry.id = job.id;
        Ok(entry)
    }
}

/// Terminal store for failed jobs.
pub struct DeadLetterSink {
    queue: Arc<Queue>,
    retention: usize,
}

impl DeadLetterSink {
    /// Wrap `queue` as a dead-letter sink keeping at most `retention` entries.
    pub fn new(queue: Arc<Queue>, retention: usize) -> Self {
        Self { queue, retention }
    }

    /// The backing queue.
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Write a snapshot of `job`, which failed with `error`.
    pub async fn record(&self, job: &Job, error: &JobError) -> JobResult<DeadLetterEntry> {
        let now = self.queue.broker().now();
        let mut entry = DeadLetterEntry {
            id: JobId::new(),
            original_queue: job.queue.clone(),
            original_job_id: job.id.clone(),
            job_name: job.name.clone(),
            payload: job.payload.clone(),
            error: error.to_string(),
            failed_at: job.finished_at.unwrap_or(now),
            attempts: job.attempts_made,
        };

        let snapshot = Job {
            id: entry.id.clone(),
            queue: self.queue.name().to_string(),
            name: job.name.clone(),
            payload: serde_json::to_value(&entry)?,
            state: JobState::DeadLettered,
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
            backoff: job.backoff.clone(),
            priority: job.priority,
            seq: 0,
            available_at: now,
            created_at: now,
            started_at: None,
            finished_at: Some(now),
            last_error: Some(entry.error.clone()),
            retention: Retention {
                completed: 0,
                failed: self.retention,
            },
            owner: None,
            lease_until: None,
        };

        let stored = self.queue.insert(snapshot).await?;
        entry.id = stored.id;
        debug!(
            entry_id = %entry.id,
            queue = %entry.original_queue,
            job_id = %entry.original_job_id,
            "Recorded dead-letter entry"
        );
        Ok(entry)
    }

    /// List entries, oldest first.
    pub async fn list(&self, offset: usize, limit: usize) -> JobResult<Vec<DeadLetterEntry>> {
        self.queue
            .list(JobState::DeadLettered, offset, limit)
            .await?
            .into_iter()
            .map(DeadLetterEntry::from_job)
            .collect()
    }

    /// Fetch one entry.
    pub async fn get(&self, entry_id: &JobId) -> JobResult<Option<DeadLetterEntry>> {
        match self.queue.get_job(entry_id).await? {
            Some(job) if job.state == JobState::DeadLettered => {
                DeadLetterEntry::from_job(job).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Number of entries held.
    pub async fn count(&self) -> JobResult<u64> {
        Ok(self.queue.metrics().await?.dead_lettered)
    }

    /// Re-enqueue an entry's payload into `target` with fresh attempts,
    /// then drop the entry. `target` must be the entry's original queue.
    pub async fn replay(&self, entry_id: &JobId, target: &Queue) -> JobResult<Job> {
        let entry = self
            .get(entry_id)
            .await?
            .ok_or_else(|| JobError::NotFound(entry_id.to_string()))?;

        if entry.original_queue != target.name() {
            return Err(JobError::Configuration(format!(
                "entry {} belongs to queue '{}', not '{}'",
                entry_id,
                entry.original_queue,
                target.name()
            )));
        }

        let job = target
            .enqueue_json(&entry.job_name, entry.payload, JobOptions::new())
            .await?;
        self.queue.remove_job(entry_id).await?;

        info!(
            entry_id = %entry_id,
            queue = %target.name(),
            job_id = %job.id,
            "Replayed dead-letter entry"
        );
        Ok(job)
    }

    /// Delete an entry. Returns false if it did not exist.
    pub async fn remove(&self, entry_id: &JobId) -> JobResult<bool> {
        self.queue.remove_job(entry_id).await
    }
}
