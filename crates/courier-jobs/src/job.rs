//! Job model and enqueue options.

use crate::backoff::Backoff;
use crate::error::{JobError, JobResult};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Highest accepted priority value. Lower values are dequeued first.
///
/// Redis scores waiting jobs as `priority * 2^32 + seq` in a double, so
/// every score must stay below 2^53 to keep FIFO order exact.
pub const MAX_PRIORITY: u32 = 2_097_151;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Eligible for dequeue.
    Waiting,
    /// Not eligible before `available_at`.
    Delayed,
    /// Owned by exactly one worker.
    Active,
    /// Processed successfully.
    Completed,
    /// Exhausted its attempts or failed permanently.
    Failed,
    /// Snapshot held by the dead-letter sink; never dispatched.
    DeadLettered,
}

impl JobState {
    /// Returns the stable lowercase name used in storage and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::DeadLettered => "dead_lettered",
        }
    }

    /// Returns true for states a job never leaves on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::DeadLettered
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead_lettered" => Ok(JobState::DeadLettered),
            other => Err(JobError::Internal(format!("unknown job state '{other}'"))),
        }
    }
}

/// How many finished jobs a queue keeps before evicting the oldest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    /// Cap for the completed history.
    pub completed: usize,
    /// Cap for the failed history.
    pub failed: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            completed: 100,
            failed: 500,
        }
    }
}

/// One unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job ID.
    pub id: JobId,

    /// Queue name.
    pub queue: String,

    /// Logical job type.
    pub name: String,

    /// Opaque payload.
    pub payload: serde_json::Value,

    /// Current state.
    pub state: JobState,

    /// Failed attempts so far.
    pub attempts_made: u32,

    /// Total permitted attempts, the first one included.
    pub max_attempts: u32,

    /// Delay policy between attempts.
    pub backoff: Backoff,

    /// Priority (lower = sooner).
    pub priority: u32,

    /// Broker-assigned enqueue order.
    pub seq: u64,

    /// Earliest time the job may be dequeued.
    pub available_at: DateTime<Utc>,

    /// When the job was created.
    pub created_at: DateTime<Utc>,

    /// When the current or last attempt started.
    pub started_at: Option<DateTime<Utc>>,

    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,

    /// Error from the last failed attempt.
    pub last_error: Option<String>,

    /// Finished-history caps applied when this job finishes.
    pub retention: Retention,

    /// Owner token of the worker slot holding the job.
    pub owner: Option<String>,

    /// Ownership expiry while active.
    pub lease_until: Option<DateTime<Utc>>,
}

impl Job {
    /// Deserialize the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> JobResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Returns true once all permitted attempts have failed.
    pub fn is_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }

    /// Returns remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts_made)
    }

    /// Records a failed attempt.
    pub(crate) fn record_failure(&mut self, error: &JobError) {
        self.attempts_made = (self.attempts_made + 1).min(self.max_attempts);
        self.last_error = Some(error.to_string());
    }

    /// Returns true if this job may be dequeued at `now`.
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, JobState::Waiting | JobState::Delayed) && self.available_at <= now
    }
}

/// Per-job enqueue options. Unset fields fall back to the queue defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Priority (lower = sooner).
    pub priority: Option<u32>,
    /// Delay before the job becomes eligible.
    pub delay: Option<Duration>,
    /// Total permitted attempts.
    pub max_attempts: Option<u32>,
    /// Backoff between attempts.
    pub backoff: Option<Backoff>,
    /// Completed history cap.
    pub retention_completed: Option<usize>,
    /// Failed history cap.
    pub retention_failed: Option<usize>,
}

impl JobOptions {
    /// Create empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the priority.
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set a delay before execution.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Set the total number of attempts.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Override the backoff policy.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Override the completed history cap.
    pub fn retention_completed(mut self, cap: usize) -> Self {
        self.retention_completed = Some(cap);
        self
    }

    /// Override the failed history cap.
    pub fn retention_failed(mut self, cap: usize) -> Self {
        self.retention_failed = Some(cap);
        self
    }
}
