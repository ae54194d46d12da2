//! In-process broker.
//!
//! Holds every queue behind one mutex, so each operation is a single atomic
//! transition. Suitable for tests and single-process deployments; it offers
//! no durability across restarts.

use super::{later, Broker, Clock, StateCounts, SystemClock};
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    waiting: BTreeSet<(u32, u64, JobId)>,
    delayed: BTreeSet<(DateTime<Utc>, u64, JobId)>,
    active: HashMap<JobId, DateTime<Utc>>,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    dead: VecDeque<JobId>,
    paused: bool,
}

impl QueueState {
    fn push_waiting(&mut self, job: &mut Job) {
        job.state = JobState::Waiting;
        job.owner = None;
        job.lease_until = None;
        self.waiting.insert((job.priority, job.seq, job.id.clone()));
    }

    fn push_delayed(&mut self, job: &mut Job) {
        job.state = JobState::Delayed;
        job.owner = None;
        job.lease_until = None;
        self.delayed.insert((job.available_at, job.seq, job.id.clone()));
    }

    /// Return jobs whose owner let the lease lapse to the waiting set.
    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<JobId> = self
            .active
            .iter()
            .filter(|(_, lease)| **lease <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            self.active.remove(&id);
            if let Some(mut job) = self.jobs.remove(&id) {
                debug!(job_id = %id, queue = %job.queue, "Reclaimed job with expired lease");
                self.push_waiting(&mut job);
                self.jobs.insert(id, job);
            }
        }
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(first) = self.delayed.first() {
            if first.0 > now {
                break;
            }
            let Some((_, _, id)) = self.delayed.pop_first() else {
                break;
            };
            if let Some(mut job) = self.jobs.remove(&id) {
                self.push_waiting(&mut job);
                self.jobs.insert(id, job);
            }
        }
    }

    fn unlink(&mut self, job: &Job) {
        match job.state {
            JobState::Waiting => {
                self.waiting.remove(&(job.priority, job.seq, job.id.clone()));
            }
            JobState::Delayed => {
                self.delayed.remove(&(job.available_at, job.seq, job.id.clone()));
            }
            JobState::Active => {
                self.active.remove(&job.id);
            }
            JobState::Completed => self.completed.retain(|id| id != &job.id),
            JobState::Failed => self.failed.retain(|id| id != &job.id),
            JobState::DeadLettered => self.dead.retain(|id| id != &job.id),
        }
    }

    fn history_mut(&mut self, state: JobState) -> Option<&mut VecDeque<JobId>> {
        match state {
            JobState::Completed => Some(&mut self.completed),
            JobState::Failed => Some(&mut self.failed),
            JobState::DeadLettered => Some(&mut self.dead),
            _ => None,
        }
    }

    /// Append to a finished history and evict the oldest entries past `cap`.
    fn push_history(&mut self, state: JobState, id: JobId, cap: usize) {
        let Some(history) = self.history_mut(state) else {
            return;
        };
        history.push_back(id);
        let mut evicted = Vec::new();
        while history.len() > cap {
            if let Some(old) = history.pop_front() {
                evicted.push(old);
            }
        }
        for old in evicted {
            self.jobs.remove(&old);
            debug!(job_id = %old, state = %state, "Evicted job past retention cap");
        }
    }

    /// Take an active job out of the active set after checking ownership.
    fn take_owned(&mut self, job: &Job) -> JobResult<Job> {
        let owned = self.jobs.get(&job.id).is_some_and(|stored| {
            stored.state == JobState::Active && stored.owner.is_some() && stored.owner == job.owner
        });
        if !owned {
            return Err(JobError::LeaseLost(job.id.to_string()));
        }
        self.active.remove(&job.id);
        self.jobs
            .remove(&job.id)
            .ok_or_else(|| JobError::LeaseLost(job.id.to_string()))
    }
}

/// In-memory [`Broker`].
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    seq: AtomicU64,
    clock: Arc<dyn Clock>,
    offline: AtomicBool,
    closed: AtomicBool,
}

impl MemoryBroker {
    /// Create a broker driven by the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a broker driven by a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            clock,
            offline: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every operation fails with `BrokerUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_available(&self) -> JobResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(JobError::BrokerUnavailable("broker handle is closed".into()));
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(JobError::BrokerUnavailable("broker is offline".into()));
        }
        Ok(())
    }

    fn lease_deadline(&self, lease: Duration) -> JobResult<DateTime<Utc>> {
        later(self.clock.now(), lease)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn enqueue(&self, mut job: Job) -> JobResult<Job> {
        self.check_available()?;
        let now = self.clock.now();
        job.seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;

        let mut queues = self.queues.lock();
        let state = queues.entry(job.queue.clone()).or_default();

        if job.state == JobState::DeadLettered {
            job.finished_at = Some(job.finished_at.unwrap_or(now));
            state.jobs.insert(job.id.clone(), job.clone());
            let cap = job.retention.failed;
            state.push_history(JobState::DeadLettered, job.id.clone(), cap);
        } else {
            if job.available_at > now {
                state.push_delayed(&mut job);
            } else {
                state.push_waiting(&mut job);
            }
            state.jobs.insert(job.id.clone(), job.clone());
        }

        Ok(job)
    }

    async fn dequeue_next(
        &self,
        queue: &str,
        owner: &str,
        lease: Duration,
    ) -> JobResult<Option<Job>> {
        self.check_available()?;
        let now = self.clock.now();
        let lease_until = self.lease_deadline(lease)?;

        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };

        state.reclaim_expired(now);
        state.promote_due(now);

        if state.paused {
            return Ok(None);
        }

        let Some((_, _, id)) = state.waiting.pop_first() else {
            return Ok(None);
        };

        let Some(job) = state.jobs.get_mut(&id) else {
            return Err(JobError::Internal(format!("waiting entry without job data: {id}")));
        };
        job.state = JobState::Active;
        job.owner = Some(owner.to_string());
        job.lease_until = Some(lease_until);
        job.started_at = Some(now);
        state.active.insert(id, lease_until);

        Ok(Some(job.clone()))
    }

    async fn extend_lease(&self, job: &Job, lease: Duration) -> JobResult<()> {
        self.check_available()?;
        let lease_until = self.lease_deadline(lease)?;

        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(&job.queue)
            .ok_or_else(|| JobError::LeaseLost(job.id.to_string()))?;

        match state.jobs.get_mut(&job.id) {
            Some(stored) if stored.state == JobState::Active && stored.owner == job.owner => {
                stored.lease_until = Some(lease_until);
                state.active.insert(job.id.clone(), lease_until);
                Ok(())
            }
            _ => Err(JobError::LeaseLost(job.id.to_string())),
        }
    }

    async fn ack_complete(&self, job: &Job) -> JobResult<()> {
        self.check_available()?;
        let now = self.clock.now();

        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(&job.queue)
            .ok_or_else(|| JobError::LeaseLost(job.id.to_string()))?;

        let mut stored = state.take_owned(job)?;
        stored.state = JobState::Completed;
        stored.finished_at = Some(now);
        stored.owner = None;
        stored.lease_until = None;
        let cap = stored.retention.completed;
        state.jobs.insert(stored.id.clone(), stored);
        state.push_history(JobState::Completed, job.id.clone(), cap);
        Ok(())
    }

    async fn ack_retry(&self, job: &Job, available_at: DateTime<Utc>) -> JobResult<()> {
        self.check_available()?;
        let now = self.clock.now();

        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(&job.queue)
            .ok_or_else(|| JobError::LeaseLost(job.id.to_string()))?;

        let mut stored = state.take_owned(job)?;
        stored.attempts_made = job.attempts_made;
        stored.last_error.clone_from(&job.last_error);
        stored.available_at = available_at;
        if available_at > now {
            state.push_delayed(&mut stored);
        } else {
            state.push_waiting(&mut stored);
        }
        state.jobs.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn ack_failed(&self, job: &Job) -> JobResult<()> {
        self.check_available()?;
        let now = self.clock.now();

        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(&job.queue)
            .ok_or_else(|| JobError::LeaseLost(job.id.to_string()))?;

        let mut stored = state.take_owned(job)?;
        stored.state = JobState::Failed;
        stored.attempts_made = job.attempts_made;
        stored.last_error.clone_from(&job.last_error);
        stored.finished_at = Some(now);
        stored.owner = None;
        stored.lease_until = None;
        let cap = stored.retention.failed;
        state.jobs.insert(stored.id.clone(), stored);
        state.push_history(JobState::Failed, job.id.clone(), cap);
        Ok(())
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> JobResult<Option<Job>> {
        self.check_available()?;
        let queues = self.queues.lock();
        Ok(queues.get(queue).and_then(|state| state.jobs.get(id).cloned()))
    }

    async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> JobResult<Vec<Job>> {
        self.check_available()?;
        let queues = self.queues.lock();
        let Some(qs) = queues.get(queue) else {
            return Ok(Vec::new());
        };

        let ids: Vec<&JobId> = match state {
            JobState::Waiting => qs.waiting.iter().map(|(_, _, id)| id).collect(),
            JobState::Delayed => qs.delayed.iter().map(|(_, _, id)| id).collect(),
            JobState::Active => {
                let mut active: Vec<(&DateTime<Utc>, &JobId)> =
                    qs.active.iter().map(|(id, lease)| (lease, id)).collect();
                active.sort();
                active.into_iter().map(|(_, id)| id).collect()
            }
            JobState::Completed => qs.completed.iter().collect(),
            JobState::Failed => qs.failed.iter().collect(),
            JobState::DeadLettered => qs.dead.iter().collect(),
        };

        Ok(ids
            .into_iter()
            .skip(offset)
            .take(limit)
            .filter_map(|id| qs.jobs.get(id).cloned())
            .collect())
    }

    async fn count_by_state(&self, queue: &str) -> JobResult<StateCounts> {
        self.check_available()?;
        let queues = self.queues.lock();
        Ok(queues.get(queue).map_or_else(StateCounts::default, |qs| StateCounts {
            waiting: qs.waiting.len() as u64,
            active: qs.active.len() as u64,
            completed: qs.completed.len() as u64,
            failed: qs.failed.len() as u64,
            delayed: qs.delayed.len() as u64,
            dead_lettered: qs.dead.len() as u64,
            paused: qs.paused,
        }))
    }

    async fn delete(&self, queue: &str, id: &JobId) -> JobResult<bool> {
        self.check_available()?;
        let mut queues = self.queues.lock();
        let Some(state) = queues.get_mut(queue) else {
            return Ok(false);
        };
        let Some(job) = state.jobs.get(id).cloned() else {
            return Ok(false);
        };
        if job.state == JobState::Active {
            return Err(JobError::InvalidState {
                expected: "waiting, delayed or finished".to_string(),
                actual: job.state.to_string(),
            });
        }
        state.unlink(&job);
        state.jobs.remove(id);
        Ok(true)
    }

    async fn promote(&self, queue: &str, id: &JobId) -> JobResult<()> {
        self.check_available()?;
        let now = self.clock.now();
        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let mut job = state
            .jobs
            .remove(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;

        match job.state {
            JobState::Waiting => {}
            JobState::Delayed => {
                state.unlink(&job);
                job.available_at = now;
                state.push_waiting(&mut job);
            }
            other => {
                state.jobs.insert(id.clone(), job);
                return Err(JobError::InvalidState {
                    expected: "waiting or delayed".to_string(),
                    actual: other.to_string(),
                });
            }
        }
        state.jobs.insert(id.clone(), job);
        Ok(())
    }

    async fn pause(&self, queue: &str) -> JobResult<()> {
        self.check_available()?;
        self.queues.lock().entry(queue.to_string()).or_default().paused = true;
        Ok(())
    }

    async fn resume(&self, queue: &str) -> JobResult<()> {
        self.check_available()?;
        self.queues.lock().entry(queue.to_string()).or_default().paused = false;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> JobResult<bool> {
        self.check_available()?;
        Ok(self.queues.lock().get(queue).is_some_and(|qs| qs.paused))
    }

    async fn purge(
        &self,
        queue: &str,
        older_than: DateTime<Utc>,
        limit: usize,
        state: JobState,
    ) -> JobResult<Vec<JobId>> {
        self.check_available()?;
        if !state.is_terminal() {
            return Err(JobError::Configuration(format!(
                "cannot purge jobs in state '{state}'"
            )));
        }

        let mut queues = self.queues.lock();
        let Some(qs) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let max = if limit == 0 { usize::MAX } else { limit };
        let history: Vec<JobId> = qs.history_mut(state).map(|h| h.iter().cloned().collect()).unwrap_or_default();
        let removed: Vec<JobId> = history
            .into_iter()
            .filter(|id| {
                qs.jobs
                    .get(id)
                    .and_then(|job| job.finished_at)
                    .is_some_and(|finished| finished < older_than)
            })
            .take(max)
            .collect();

        if let Some(history) = qs.history_mut(state) {
            history.retain(|id| !removed.contains(id));
        }
        for id in &removed {
            qs.jobs.remove(id);
        }

        Ok(removed)
    }

    async fn health_check(&self) -> JobResult<()> {
        self.check_available()
    }

    async fn close(&self) -> JobResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::broker::ManualClock;
    use crate::job::Retention;

    const LEASE: Duration = Duration::from_secs(30);

    fn new_job(broker: &MemoryBroker, queue: &str, priority: u32, delay_ms: i64) -> Job {
        let now = broker.now();
        Job {
            id: JobId::new(),
            queue: queue.into(),
            name: "notify".into(),
            payload: serde_json::json!({ "n": priority }),
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: 3,
            backoff: Backoff::default(),
            priority,
            seq: 0,
            available_at: now + chrono::Duration::milliseconds(delay_ms),
            created_at: now,
            started_at: None,
            finished_at: None,
            last_error: None,
            retention: Retention::default(),
            owner: None,
            lease_until: None,
        }
    }

    fn manual() -> (Arc<ManualClock>, MemoryBroker) {
        let clock = Arc::new(ManualClock::default());
        let broker = MemoryBroker::with_clock(clock.clone());
        (clock, broker)
    }

    #[tokio::test]
    async fn test_lower_priority_value_dequeued_first() {
        let (_, broker) = manual();
        let b = broker.enqueue(new_job(&broker, "q", 5, 0)).await.unwrap();
        let a = broker.enqueue(new_job(&broker, "q", 1, 0)).await.unwrap();

        let first = broker.dequeue_next("q", "w", LEASE).await.unwrap().unwrap();
        let second = broker.dequeue_next("q", "w", LEASE).await.unwrap().unwrap();
        assert_eq!(first.id, a.id);
        assert_eq!(second.id, b.id);
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let (_, broker) = manual();
        let j1 = broker.enqueue(new_job(&broker, "q", 3, 0)).await.unwrap();
        let j2 = broker.enqueue(new_job(&broker, "q", 3, 0)).await.unwrap();
        assert!(j1.seq < j2.seq);

        let first = broker.dequeue_next("q", "w", LEASE).await.unwrap().unwrap();
        assert_eq!(first.id, j1.id);
        assert_eq!(first.state, JobState::Active);
        assert_eq!(first.owner.as_deref(), Some("w"));
    }

    #[tokio::test]
    async fn test_delayed_job_eligible_exactly_at_available_at() {
        let (clock, broker) = manual();
        let job = broker.enqueue(new_job(&broker, "q", 0, 5000)).await.unwrap();
        assert_eq!(job.state, JobState::Delayed);

        clock.advance(Duration::from_millis(4999));
        assert!(broker.dequeue_next("q", "w", LEASE).await.unwrap().is_none());

        clock.advance(Duration::from_millis(1));
        let got = broker.dequeue_next("q", "w", LEASE).await.unwrap().unwrap();
        assert_eq!(got.id, job.id);
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let (clock, broker) = manual();
        let job = broker.enqueue(new_job(&broker, "q", 0, 0)).await.unwrap();

        let owned = broker.dequeue_next("q", "crashed", LEASE).await.unwrap().unwrap();
        assert!(broker.dequeue_next("q", "other", LEASE).await.unwrap().is_none());

        clock.advance(LEASE);
        let again = broker.dequeue_next("q", "other", LEASE).await.unwrap().unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts_made, 0);

        // The crashed owner can no longer acknowledge.
        let err = broker.ack_complete(&owned).await.unwrap_err();
        assert!(matches!(err, JobError::LeaseLost(_)));
        broker.ack_complete(&again).await.unwrap();
    }

    #[tokio::test]
    async fn test_unrepresentable_lease_is_rejected_before_dequeue() {
        let (_, broker) = manual();
        let job = broker.enqueue(new_job(&broker, "q", 0, 0)).await.unwrap();

        let err = broker
            .dequeue_next("q", "w", Duration::from_secs(1 << 43))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));

        let stored = broker.get_job("q", &job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_extend_lease_keeps_ownership() {
        let (clock, broker) = manual();
        broker.enqueue(new_job(&broker, "q", 0, 0)).await.unwrap();
        let owned = broker.dequeue_next("q", "w", LEASE).await.unwrap().unwrap();

        clock.advance(Duration::from_secs(20));
        broker.extend_lease(&owned, LEASE).await.unwrap();
        clock.advance(Duration::from_secs(20));
        assert!(broker.dequeue_next("q", "x", LEASE).await.unwrap().is_none());
        broker.ack_complete(&owned).await.unwrap();
    }

    #[tokio::test]
    async fn test_ack_retry_moves_to_delayed() {
        let (clock, broker) = manual();
        broker.enqueue(new_job(&broker, "q", 0, 0)).await.unwrap();
        let mut owned = broker.dequeue_next("q", "w", LEASE).await.unwrap().unwrap();
        owned.record_failure(&JobError::transient("smtp 451"));

        let retry_at = broker.now() + chrono::Duration::seconds(5);
        broker.ack_retry(&owned, retry_at).await.unwrap();

        let stored = broker.get_job("q", &owned.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Delayed);
        assert_eq!(stored.attempts_made, 1);
        assert!(stored.owner.is_none());
        assert_eq!(stored.available_at, retry_at);

        clock.advance(Duration::from_secs(5));
        let again = broker.dequeue_next("q", "w2", LEASE).await.unwrap().unwrap();
        assert_eq!(again.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_completed_retention_evicts_oldest() {
        let (_, broker) = manual();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut job = new_job(&broker, "q", 0, 0);
            job.retention.completed = 2;
            ids.push(broker.enqueue(job).await.unwrap().id);
        }
        while let Some(job) = broker.dequeue_next("q", "w", LEASE).await.unwrap() {
            broker.ack_complete(&job).await.unwrap();
        }

        let counts = broker.count_by_state("q").await.unwrap();
        assert_eq!(counts.completed, 2);
        assert!(broker.get_job("q", &ids[0]).await.unwrap().is_none());
        assert!(broker.get_job("q", &ids[2]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_paused_queue_yields_nothing() {
        let (_, broker) = manual();
        broker.enqueue(new_job(&broker, "q", 0, 0)).await.unwrap();
        broker.pause("q").await.unwrap();
        assert!(broker.is_paused("q").await.unwrap());
        assert!(broker.dequeue_next("q", "w", LEASE).await.unwrap().is_none());

        broker.resume("q").await.unwrap();
        assert!(broker.dequeue_next("q", "w", LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_rejects_active_job() {
        let (_, broker) = manual();
        let job = broker.enqueue(new_job(&broker, "q", 0, 0)).await.unwrap();
        broker.dequeue_next("q", "w", LEASE).await.unwrap();

        let err = broker.delete("q", &job.id).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_promote_resets_available_at_only() {
        let (_, broker) = manual();
        let mut job = new_job(&broker, "q", 0, 60_000);
        job.attempts_made = 1;
        let job = broker.enqueue(job).await.unwrap();

        broker.promote("q", &job.id).await.unwrap();
        let got = broker.dequeue_next("q", "w", LEASE).await.unwrap().unwrap();
        assert_eq!(got.id, job.id);
        assert_eq!(got.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_purge_respects_age_and_limit() {
        let (clock, broker) = manual();
        for _ in 0..3 {
            broker.enqueue(new_job(&broker, "q", 0, 0)).await.unwrap();
        }
        while let Some(job) = broker.dequeue_next("q", "w", LEASE).await.unwrap() {
            broker.ack_complete(&job).await.unwrap();
        }
        clock.advance(Duration::from_secs(60));

        let removed = broker
            .purge("q", broker.now(), 2, JobState::Completed)
            .await
            .unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(broker.count_by_state("q").await.unwrap().completed, 1);

        let err = broker.purge("q", broker.now(), 0, JobState::Waiting).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_offline_broker_surfaces_errors() {
        let (_, broker) = manual();
        broker.set_offline(true);
        let err = broker.enqueue(new_job(&broker, "q", 0, 0)).await.unwrap_err();
        assert!(err.is_infrastructure());
    }
}
