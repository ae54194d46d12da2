//! Dependency injection interface for the job system.
//!
//! Application services hold an `Arc<dyn JobQueueInterface>` instead of the
//! concrete registry, which keeps them testable and lets a Shaku module
//! provide the registry.

use crate::error::JobResult;
use crate::job::{Job, JobId, JobOptions};
use crate::metrics::QueueMetrics;
use crate::registry::QueueRegistry;
use async_trait::async_trait;
use shaku::Interface;
use std::collections::HashMap;

/// Caller-facing job queue operations.
///
/// Object-safe: payloads are passed as JSON values.
#[async_trait]
pub trait JobQueueInterface: Interface + Send + Sync {
    /// Enqueue a job, creating the queue if needed.
    async fn enqueue_json(
        &self,
        queue: &str,
        job_name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> JobResult<Job>;

    /// Get job by ID.
    async fn get_job(&self, queue: &str, id: &JobId) -> JobResult<Option<Job>>;

    /// Live metrics for one queue.
    async fn get_metrics(&self, queue: &str) -> JobResult<QueueMetrics>;

    /// Live metrics for all known queues.
    async fn get_all_metrics(&self) -> JobResult<HashMap<String, QueueMetrics>>;

    /// Halt dequeues.
    async fn pause(&self, queue: &str) -> JobResult<()>;

    /// Resume dequeues.
    async fn resume(&self, queue: &str) -> JobResult<()>;

    /// Make a waiting or delayed job eligible now.
    async fn retry_job(&self, queue: &str, id: &JobId) -> JobResult<()>;

    /// Remove a non-active job.
    async fn remove_job(&self, queue: &str, id: &JobId) -> JobResult<bool>;

    /// Re-enqueue a dead-letter entry into its original queue.
    async fn replay_dead_letter(&self, entry_id: &JobId) -> JobResult<Job>;

    /// Get the list of queue names being managed.
    fn queue_names(&self) -> Vec<String>;
}

#[async_trait]
impl JobQueueInterface for QueueRegistry {
    async fn enqueue_json(
        &self,
        queue: &str,
        job_name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> JobResult<Job> {
        self.queue(queue)?
            .enqueue_json(job_name, payload, options)
            .await
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> JobResult<Option<Job>> {
        QueueRegistry::get_job(self, queue, id).await
    }

    async fn get_metrics(&self, queue: &str) -> JobResult<QueueMetrics> {
        QueueRegistry::get_metrics(self, queue).await
    }

    async fn get_all_metrics(&self) -> JobResult<HashMap<String, QueueMetrics>> {
        QueueRegistry::get_all_metrics(self).await
    }

    async fn pause(&self, queue: &str) -> JobResult<()> {
        QueueRegistry::pause(self, queue).await
    }

    async fn resume(&self, queue: &str) -> JobResult<()> {
        QueueRegistry::resume(self, queue).await
    }

    async fn retry_job(&self, queue: &str, id: &JobId) -> JobResult<()> {
        QueueRegistry::retry_job(self, queue, id).await
    }

    async fn remove_job(&self, queue: &str, id: &JobId) -> JobResult<bool> {
        QueueRegistry::remove_job(self, queue, id).await
    }

    async fn replay_dead_letter(&self, entry_id: &JobId) -> JobResult<Job> {
        QueueRegistry::replay_dead_letter(self, entry_id).await
    }

    fn queue_names(&self) -> Vec<String> {
        QueueRegistry::queue_names(self)
    }
}
