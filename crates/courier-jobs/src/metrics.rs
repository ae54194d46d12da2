//! Queue metrics.
//!
//! Two kinds of numbers live here: live per-queue state counts read from the
//! broker ([`QueueMetrics`], [`MetricsAggregator`]), and process-local
//! counters and histograms pushed through the `metrics` facade
//! ([`JobMetrics`]). Install any `metrics` recorder to export the latter.

use crate::broker::{Broker, StateCounts};
use crate::error::JobResult;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Metric names for the job system.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "courier_jobs_enqueued_total";
    /// Total attempts started.
    pub const JOBS_STARTED_TOTAL: &str = "courier_jobs_started_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "courier_jobs_completed_total";
    /// Total failed attempts.
    pub const JOBS_FAILED_TOTAL: &str = "courier_jobs_failed_total";
    /// Total attempts scheduled for retry.
    pub const JOBS_RETRIED_TOTAL: &str = "courier_jobs_retried_total";
    /// Total jobs copied to the dead-letter queue.
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "courier_jobs_dead_lettered_total";

    /// Current waiting jobs.
    pub const JOBS_WAITING: &str = "courier_jobs_waiting";
    /// Current active jobs.
    pub const JOBS_ACTIVE: &str = "courier_jobs_active";
    /// Current delayed jobs.
    pub const JOBS_DELAYED: &str = "courier_jobs_delayed";
    /// Current completed history size.
    pub const JOBS_COMPLETED: &str = "courier_jobs_completed";
    /// Current failed history size.
    pub const JOBS_FAILED: &str = "courier_jobs_failed";

    /// Attempt duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "courier_job_duration_seconds";

    /// Broker errors seen by worker loops.
    pub const BROKER_ERRORS_TOTAL: &str = "courier_jobs_broker_errors_total";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(names::JOBS_STARTED_TOTAL, "Total number of attempts started");
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of failed attempts");
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of job retries");
    describe_counter!(
        names::JOBS_DEAD_LETTERED_TOTAL,
        "Total number of jobs sent to the dead-letter queue"
    );

    describe_gauge!(names::JOBS_WAITING, "Current number of waiting jobs");
    describe_gauge!(names::JOBS_ACTIVE, "Current number of active jobs");
    describe_gauge!(names::JOBS_DELAYED, "Current number of delayed jobs");
    describe_gauge!(names::JOBS_COMPLETED, "Jobs in the completed history");
    describe_gauge!(names::JOBS_FAILED, "Jobs in the failed history");

    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Job attempt duration in seconds"
    );
    describe_counter!(
        names::BROKER_ERRORS_TOTAL,
        "Broker errors encountered by worker loops"
    );
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job enqueued.
    pub fn job_enqueued(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record an attempt started.
    pub fn job_started(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_STARTED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record a job completed.
    pub fn job_completed(queue: &str, job_name: &str, duration: Duration) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed attempt.
    pub fn job_failed(queue: &str, job_name: &str, error_type: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "error_type" => error_type.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job retried.
    pub fn job_retried(queue: &str, job_name: &str, attempt: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Record a job sent to the dead-letter queue.
    pub fn job_dead_lettered(queue: &str, job_name: &str, reason: &str) {
        counter!(
            names::JOBS_DEAD_LETTERED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
    }

    /// Record a broker error in a worker loop.
    pub fn broker_error(queue: &str) {
        counter!(names::BROKER_ERRORS_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Update queue size gauges.
    pub fn update_queue_sizes(metrics: &QueueMetrics) {
        let queue = metrics.queue.clone();
        gauge!(names::JOBS_WAITING, "queue" => queue.clone()).set(metrics.waiting as f64);
        gauge!(names::JOBS_ACTIVE, "queue" => queue.clone()).set(metrics.active as f64);
        gauge!(names::JOBS_DELAYED, "queue" => queue.clone()).set(metrics.delayed as f64);
        gauge!(names::JOBS_COMPLETED, "queue" => queue.clone()).set(metrics.completed as f64);
        gauge!(names::JOBS_FAILED, "queue" => queue).set(metrics.failed as f64);
    }
}

/// Live state counts for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    /// Queue name.
    pub queue: String,
    /// Jobs eligible for dequeue.
    pub waiting: u64,
    /// Jobs owned by a worker.
    pub active: u64,
    /// Completed history size.
    pub completed: u64,
    /// Failed history size.
    pub failed: u64,
    /// Jobs waiting for their `available_at`.
    pub delayed: u64,
    /// Dead-letter snapshots (non-zero only for the dead-letter queue).
    pub dead_lettered: u64,
    /// Whether dequeues are halted.
    pub paused: bool,
}

impl QueueMetrics {
    /// Build from broker counts.
    pub fn from_counts(queue: impl Into<String>, counts: StateCounts) -> Self {
        Self {
            queue: queue.into(),
            waiting: counts.waiting,
            active: counts.active,
            completed: counts.completed,
            failed: counts.failed,
            delayed: counts.delayed,
            dead_lettered: counts.dead_lettered,
            paused: counts.paused,
        }
    }

    /// Jobs in the queue's own lifecycle, dead-letter snapshots excluded.
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.delayed + self.completed + self.failed
    }
}

/// Computes [`QueueMetrics`] from live broker state. Read-only.
#[derive(Clone)]
pub struct MetricsAggregator {
    broker: Arc<dyn Broker>,
}

impl MetricsAggregator {
    /// Create an aggregator over a broker.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Metrics for one queue; also refreshes its gauges.
    pub async fn collect(&self, queue: &str) -> JobResult<QueueMetrics> {
        let counts = self.broker.count_by_state(queue).await?;
        let metrics = QueueMetrics::from_counts(queue, counts);
        JobMetrics::update_queue_sizes(&metrics);
        Ok(metrics)
    }

    /// Metrics for every named queue.
    pub async fn collect_all<'a, I>(&self, queues: I) -> JobResult<HashMap<String, QueueMetrics>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut all = HashMap::new();
        for queue in queues {
            all.insert(queue.to_string(), self.collect(queue).await?);
        }
        Ok(all)
    }
}
