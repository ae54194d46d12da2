//! Broker contract shared by every queue and worker.
//!
//! A broker is the durable, shared store behind all queues. Every state
//! transition goes through it, and the in-process [`Job`] copy is only a
//! snapshot of the last broker write. Implementations must guarantee:
//!
//! - `dequeue_next` hands a job to exactly one owner, with a lease that
//!   expires if the owner stops renewing it (visibility timeout);
//! - acks succeed only for the current owner of an active job;
//! - waiting jobs are ordered by priority (lower first), then by enqueue
//!   sequence; delayed jobs become eligible at `available_at`.

mod memory;

pub use memory::MemoryBroker;

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Live per-state job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    /// Jobs eligible for dequeue.
    pub waiting: u64,
    /// Jobs owned by a worker.
    pub active: u64,
    /// Jobs in the completed history.
    pub completed: u64,
    /// Jobs in the failed history.
    pub failed: u64,
    /// Jobs waiting for their `available_at`.
    pub delayed: u64,
    /// Dead-letter snapshots held by this queue.
    pub dead_lettered: u64,
    /// Whether dequeues are halted.
    pub paused: bool,
}

/// Time source. The broker is the single time authority for a registry.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// `at + by`, failing when the instant is not representable.
pub(crate) fn later(at: DateTime<Utc>, by: Duration) -> JobResult<DateTime<Utc>> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| at.checked_add_signed(by))
        .ok_or_else(|| JobError::Configuration(format!("duration {by:?} is out of range")))
}

/// `at - by`, failing when the instant is not representable.
pub(crate) fn earlier(at: DateTime<Utc>, by: Duration) -> JobResult<DateTime<Utc>> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| at.checked_sub_signed(by))
        .ok_or_else(|| JobError::Configuration(format!("duration {by:?} is out of range")))
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        if let Ok(next) = later(*now, by) {
            *now = next;
        }
    }

    /// Jump to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Durable broker backing queues and workers.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Current broker time.
    fn now(&self) -> DateTime<Utc>;

    /// Persist a new job and return it with its broker-assigned sequence
    /// and state (`waiting`, `delayed`, or `dead_lettered` for sink entries).
    async fn enqueue(&self, job: Job) -> JobResult<Job>;

    /// Atomically take the next eligible job, marking it active and owned
    /// by `owner` until `now + lease`.
    async fn dequeue_next(
        &self,
        queue: &str,
        owner: &str,
        lease: Duration,
    ) -> JobResult<Option<Job>>;

    /// Push the lease deadline of an owned active job to `now + lease`.
    async fn extend_lease(&self, job: &Job, lease: Duration) -> JobResult<()>;

    /// Mark an owned active job completed and apply completed retention.
    async fn ack_complete(&self, job: &Job) -> JobResult<()>;

    /// Release an owned active job as delayed until `available_at`,
    /// persisting its attempt count and last error.
    async fn ack_retry(&self, job: &Job, available_at: DateTime<Utc>) -> JobResult<()>;

    /// Mark an owned active job failed and apply failed retention.
    async fn ack_failed(&self, job: &Job) -> JobResult<()>;

    /// Fetch a job by ID.
    async fn get_job(&self, queue: &str, id: &JobId) -> JobResult<Option<Job>>;

    /// List jobs in one state, oldest first.
    async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> JobResult<Vec<Job>>;

    /// Count jobs per state.
    async fn count_by_state(&self, queue: &str) -> JobResult<StateCounts>;

    /// Remove a non-active job. Returns false if it did not exist.
    async fn delete(&self, queue: &str, id: &JobId) -> JobResult<bool>;

    /// Make a waiting or delayed job eligible now, keeping its attempts.
    async fn promote(&self, queue: &str, id: &JobId) -> JobResult<()>;

    /// Halt dequeues for a queue.
    async fn pause(&self, queue: &str) -> JobResult<()>;

    /// Resume dequeues for a queue.
    async fn resume(&self, queue: &str) -> JobResult<()>;

    /// Whether a queue is paused.
    async fn is_paused(&self, queue: &str) -> JobResult<bool>;

    /// Remove up to `limit` (0 = unlimited) jobs in a terminal `state` that
    /// finished before `older_than`. Returns the removed IDs.
    async fn purge(
        &self,
        queue: &str,
        older_than: DateTime<Utc>,
        limit: usize,
        state: JobState,
    ) -> JobResult<Vec<JobId>>;

    /// Health check.
    async fn health_check(&self) -> JobResult<()>;

    /// Release the broker handle.
    async fn close(&self) -> JobResult<()>;
}
