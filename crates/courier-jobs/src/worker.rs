//! Workers: concurrency-bounded consumers of one queue.
//!
//! A worker runs one dispatch loop. Each dequeued job gets its own task
//! (a "slot"), so a slow job never blocks its siblings; a semaphore caps the
//! number of slots. Processor outcomes always become a broker transition:
//!
//! ```text
//! success                      -> ack_complete
//! failure, attempts remaining  -> ack_retry(now + backoff)   (delayed)
//! failure, exhausted/permanent -> ack_failed + dead-letter snapshot
//! ```

use crate::backoff::Backoff;
use crate::broker::later;
use crate::config::WorkerConfig;
use crate::dead_letter::DeadLetterSink;
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobState};
use crate::metrics::JobMetrics;
use crate::queue::Queue;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Capacity of a worker's own event channel when none is supplied.
const EVENT_CAPACITY: usize = 1024;

/// Longest accepted visibility timeout.
pub const MAX_LEASE: Duration = Duration::from_secs(24 * 60 * 60);

/// Processes jobs of one queue.
///
/// Processors must tolerate redelivery: a job whose lease expires (for
/// example because its worker crashed) is dispatched again from its original
/// payload. Return [`JobError::Permanent`] to skip remaining attempts.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Process a job.
    async fn process(&self, job: &Job) -> Result<(), JobError>;
}

/// Processor built from an async closure. See [`processor_fn`].
pub struct FnProcessor<F> {
    f: F,
}

/// Wrap an async closure as a [`Processor`].
///
/// ```ignore
/// let processor = processor_fn(|job: Job| async move {
///     let email: Email = job.payload_as()?;
///     send(email).await.map_err(|e| JobError::transient(e.to_string()))
/// });
/// ```
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    FnProcessor { f }
}

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn process(&self, job: &Job) -> Result<(), JobError> {
        (self.f)(job.clone()).await
    }
}

/// Worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Jobs processed in parallel.
    pub concurrency: usize,
    /// Upper bound on an idle wait.
    pub poll_interval: Duration,
    /// Visibility timeout of a dequeued job.
    pub lease: Duration,
    /// Lease extension period while a job runs.
    pub lease_renew: Duration,
    /// First delay after a broker failure.
    pub infra_backoff_initial: Duration,
    /// Cap for broker-failure delays.
    pub infra_backoff_max: Duration,
}

impl WorkerOptions {
    /// Set the concurrency.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the idle poll bound.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the lease and its renewal period.
    pub fn lease(mut self, lease: Duration, renew: Duration) -> Self {
        self.lease = lease;
        self.lease_renew = renew;
        self
    }

    /// Reject settings the dispatch loop cannot run with.
    pub fn validate(&self) -> JobResult<()> {
        if self.concurrency == 0 || u32::try_from(self.concurrency).is_err() {
            return Err(JobError::Configuration(format!(
                "concurrency must be between 1 and {}, got {}",
                u32::MAX,
                self.concurrency
            )));
        }
        if self.lease > MAX_LEASE {
            return Err(JobError::Configuration(format!(
                "lease must be at most {MAX_LEASE:?}, got {:?}",
                self.lease
            )));
        }
        if self.lease_renew.is_zero() || self.lease_renew >= self.lease {
            return Err(JobError::Configuration(
                "lease renewal period must be positive and shorter than the lease".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(JobError::Configuration("poll interval must be positive".into()));
        }
        Ok(())
    }

    fn infra_backoff(&self) -> Backoff {
        Backoff::exponential(self.infra_backoff_initial).with_max_delay(self.infra_backoff_max)
    }
}

impl From<&WorkerConfig> for WorkerOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            poll_interval: config.poll_interval(),
            lease: config.lease(),
            lease_renew: config.lease_renew(),
            infra_backoff_initial: Duration::from_millis(config.infra_backoff_initial_ms),
            infra_backoff_max: Duration::from_millis(config.infra_backoff_max_ms),
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

/// Observable worker transitions.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// An attempt started. `attempt` is 1-based.
    Started {
        queue: String,
        job_id: JobId,
        attempt: u32,
    },
    /// A job completed.
    Completed { job: Job },
    /// An attempt failed.
    Failed {
        job: Job,
        error: String,
        will_retry: bool,
        retry_delay: Option<Duration>,
    },
    /// A failed job was copied into the dead-letter queue.
    DeadLettered { job: Job, entry_id: JobId },
}

impl WorkerEvent {
    /// ID of the job the event is about.
    pub fn job_id(&self) -> &JobId {
        match self {
            WorkerEvent::Started { job_id, .. } => job_id,
            WorkerEvent::Completed { job }
            | WorkerEvent::Failed { job, .. }
            | WorkerEvent::DeadLettered { job, .. } => &job.id,
        }
    }
}

/// Point-in-time worker statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    /// Worker ID.
    pub id: String,
    /// Queue consumed.
    pub queue: String,
    /// Dispatch loop running.
    pub running: bool,
    /// Configured concurrency.
    pub concurrency: usize,
    /// Jobs currently in a slot.
    pub active: usize,
    /// Jobs completed.
    pub processed: u64,
    /// Failed attempts.
    pub failed: u64,
    /// Attempts rescheduled.
    pub retried: u64,
    /// Jobs copied to the dead-letter queue.
    pub dead_lettered: u64,
}

/// Outcome of a graceful drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// All in-flight slots finished before the timeout.
    pub completed_in_time: bool,
    /// Jobs whose slots were aborted. They remain active in the broker
    /// until their lease expires, then become dequeueable again.
    pub abandoned: Vec<JobId>,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Builder for a worker bound to one queue.
pub struct Worker {
    queue: Arc<Queue>,
    processor: Arc<dyn Processor>,
    options: WorkerOptions,
    events: Option<broadcast::Sender<WorkerEvent>>,
    dead_letters: Option<Arc<DeadLetterSink>>,
}

impl Worker {
    /// Create a worker for `queue` with default options.
    pub fn new<P: Processor>(queue: Arc<Queue>, processor: P) -> Self {
        Self {
            queue,
            processor: Arc::new(processor),
            options: WorkerOptions::default(),
            events: None,
            dead_letters: None,
        }
    }

    /// Override the options.
    pub fn options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Publish events on `events` instead of a private channel.
    pub fn events(mut self, events: broadcast::Sender<WorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Copy terminally failed jobs into `sink`.
    pub fn dead_letters(mut self, sink: Arc<DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Start the dispatch loop. Must be called inside a Tokio runtime.
    pub fn spawn(self) -> JobResult<WorkerHandle> {
        self.options.validate()?;

        let events = self
            .events
            .unwrap_or_else(|| broadcast::channel(EVENT_CAPACITY).0);
        let (stop_tx, stop_rx) = watch::channel(false);
        let id = format!("worker-{}-{}", self.queue.name(), Uuid::new_v4());

        let inner = Arc::new(WorkerInner {
            id: id.clone(),
            semaphore: Arc::new(Semaphore::new(self.options.concurrency)),
            queue: self.queue,
            processor: self.processor,
            options: self.options,
            events,
            dead_letters: self.dead_letters,
            in_flight: RwLock::new(HashMap::new()),
            counters: Counters::default(),
            running: AtomicBool::new(true),
            stop_tx,
            loop_task: Mutex::new(None),
        });

        let span = info_span!("worker", worker_id = %id, queue = %inner.queue.name());
        let task = tokio::spawn(inner.clone().run(stop_rx).instrument(span));
        *inner.loop_task.lock() = Some(task);

        info!(
            worker_id = %inner.id,
            queue = %inner.queue.name(),
            concurrency = inner.options.concurrency,
            "Started worker"
        );
        Ok(WorkerHandle { inner })
    }
}

/// Handle to a running worker. Clones refer to the same worker.
#[derive(Clone)]
pub struct WorkerHandle {
    inner: Arc<WorkerInner>,
}

impl WorkerHandle {
    /// Worker ID.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Queue consumed.
    pub fn queue(&self) -> &str {
        self.inner.queue.name()
    }

    /// Configured concurrency.
    pub fn concurrency(&self) -> usize {
        self.inner.options.concurrency
    }

    /// Number of jobs currently in a slot.
    pub fn active_jobs(&self) -> usize {
        self.inner.in_flight.read().len()
    }

    /// Whether the dispatch loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> WorkerStats {
        let c = &self.inner.counters;
        WorkerStats {
            id: self.inner.id.clone(),
            queue: self.queue().to_string(),
            running: self.is_running(),
            concurrency: self.concurrency(),
            active: self.active_jobs(),
            processed: c.processed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
        }
    }

    /// Stop dequeuing. In-flight jobs keep running.
    pub fn stop(&self) {
        if !self.inner.stop_tx.send_replace(true) {
            info!(worker_id = %self.inner.id, "Stopping worker...");
        }
    }

    /// Stop dequeuing and wait up to `drain_timeout` for in-flight jobs.
    ///
    /// Slots still running at the deadline are aborted without acking.
    pub async fn shutdown(&self, drain_timeout: Duration) -> DrainReport {
        let deadline = drain_deadline(drain_timeout);
        self.stop();

        let task = self.inner.loop_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(worker_id = %self.inner.id, error = %e, "Worker loop ended abnormally");
            }
        }

        let permits = u32::try_from(self.inner.options.concurrency).unwrap_or(u32::MAX);
        let drained = tokio::time::timeout_at(deadline, self.inner.semaphore.acquire_many(permits)).await;

        let report = match drained {
            Ok(_) => DrainReport {
                completed_in_time: true,
                abandoned: Vec::new(),
            },
            Err(_) => {
                let abandoned: Vec<JobId> = {
                    let mut in_flight = self.inner.in_flight.write();
                    in_flight
                        .drain()
                        .map(|(id, handle)| {
                            handle.abort();
                            id
                        })
                        .collect()
                };
                warn!(
                    worker_id = %self.inner.id,
                    abandoned = abandoned.len(),
                    "Drain timed out; remaining jobs left for lease expiry"
                );
                DrainReport {
                    completed_in_time: false,
                    abandoned,
                }
            }
        };

        self.inner.running.store(false, Ordering::SeqCst);
        let stats = self.stats();
        info!(
            worker_id = %stats.id,
            processed = stats.processed,
            failed = stats.failed,
            "Worker stopped"
        );
        report
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.inner.id)
            .field("queue", &self.queue())
            .field("running", &self.is_running())
            .finish()
    }
}

struct WorkerInner {
    id: String,
    queue: Arc<Queue>,
    processor: Arc<dyn Processor>,
    options: WorkerOptions,
    events: broadcast::Sender<WorkerEvent>,
    dead_letters: Option<Arc<DeadLetterSink>>,
    semaphore: Arc<Semaphore>,
    in_flight: RwLock<HashMap<JobId, AbortHandle>>,
    counters: Counters,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerInner {
    async fn run(self: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let notify = self.queue.notifier();
        let infra_backoff = self.options.infra_backoff();
        let mut infra_failures = 0u32;

        loop {
            if *stop_rx.borrow() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if *stop_rx.borrow() {
                break;
            }

            let owner = format!("{}:{}", self.id, Uuid::new_v4());
            match self.queue.dequeue_next(&owner, self.options.lease).await {
                Ok(Some(job)) => {
                    infra_failures = 0;
                    self.spawn_slot(job, permit);
                }
                Ok(None) => {
                    infra_failures = 0;
                    drop(permit);
                    tokio::select! {
                        biased;
                        _ = stop_rx.changed() => break,
                        () = notify.notified() => {}
                        () = tokio::time::sleep(self.options.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    infra_failures = infra_failures.saturating_add(1);
                    let delay = infra_backoff.delay_for(infra_failures);
                    JobMetrics::broker_error(self.queue.name());
                    error!(
                        error = %e,
                        failures = infra_failures,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Failed to dequeue job"
                    );
                    tokio::select! {
                        biased;
                        _ = stop_rx.changed() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        debug!(worker_id = %self.id, "Dispatch loop exited");
    }

    fn spawn_slot(self: &Arc<Self>, job: Job, permit: OwnedSemaphorePermit) {
        let inner = self.clone();
        let job_id = job.id.clone();
        let span = info_span!("job", job_id = %job.id, job_name = %job.name);

        // Registration happens under the lock so the task cannot deregister first.
        let mut in_flight = self.in_flight.write();
        let task = tokio::spawn(
            async move {
                let id = job.id.clone();
                inner.execute(job).await;
                inner.in_flight.write().remove(&id);
                drop(permit);
            }
            .instrument(span),
        );
        in_flight.insert(job_id, task.abort_handle());
    }

    async fn execute(&self, job: Job) {
        let started = Instant::now();
        let attempt = job.attempts_made + 1;

        JobMetrics::job_started(&job.queue, &job.name);
        debug!(attempt, max_attempts = job.max_attempts, "Processing job");
        self.emit(WorkerEvent::Started {
            queue: job.queue.clone(),
            job_id: job.id.clone(),
            attempt,
        });

        match self.process_with_lease(&job).await {
            Ok(()) => self.on_success(job, started.elapsed()).await,
            Err(e) => self.on_failure(job, e, started.elapsed()).await,
        }
    }

    /// Run the processor while periodically extending the job's lease.
    async fn process_with_lease(&self, job: &Job) -> Result<(), JobError> {
        let processing = AssertUnwindSafe(self.processor.process(job)).catch_unwind();
        tokio::pin!(processing);

        let period = self.options.lease_renew;
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                outcome = &mut processing => {
                    return outcome.unwrap_or_else(|panic| {
                        Err(JobError::Transient(format!(
                            "processor panicked: {}",
                            panic_message(panic.as_ref())
                        )))
                    });
                }
                _ = renew.tick() => {
                    let extend = self.queue.broker().extend_lease(job, self.options.lease);
                    match timeout(period, extend).await {
                        Ok(Ok(())) => debug!("Extended lease"),
                        Ok(Err(e)) => warn!(error = %e, "Failed to extend lease"),
                        Err(_) => warn!("Timed out extending lease"),
                    }
                }
            }
        }
    }

    async fn on_success(&self, mut job: Job, elapsed: Duration) {
        let broker = self.queue.broker();
        if let Err(e) = broker.ack_complete(&job).await {
            error!(error = %e, "Failed to mark job as complete");
            return;
        }

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        JobMetrics::job_completed(&job.queue, &job.name, elapsed);
        debug!(attempts_made = job.attempts_made, "Job completed successfully");

        job.state = JobState::Completed;
        job.finished_at = Some(broker.now());
        job.owner = None;
        job.lease_until = None;
        self.emit(WorkerEvent::Completed { job });
    }

    async fn on_failure(&self, mut job: Job, error: JobError, elapsed: Duration) {
        let broker = self.queue.broker();
        job.record_failure(&error);
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        JobMetrics::job_failed(&job.queue, &job.name, error.kind(), elapsed);

        let retry = if error.is_retryable() && job.attempts_made < job.max_attempts {
            let delay = job.backoff.delay_for(job.attempts_made);
            match later(broker.now(), delay) {
                Ok(available_at) => Some((delay, available_at)),
                Err(e) => {
                    error!(error = %e, "Cannot schedule retry, failing job");
                    None
                }
            }
        } else {
            None
        };

        if let Some((delay, available_at)) = retry {
            if let Err(e) = broker.ack_retry(&job, available_at).await {
                error!(error = %e, "Failed to schedule job retry");
                return;
            }

            self.counters.retried.fetch_add(1, Ordering::Relaxed);
            JobMetrics::job_retried(&job.queue, &job.name, job.attempts_made);
            warn!(
                error = %error,
                attempt = job.attempts_made,
                max_attempts = job.max_attempts,
                retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Job failed, retry scheduled"
            );

            job.state = if delay.is_zero() {
                JobState::Waiting
            } else {
                JobState::Delayed
            };
            job.available_at = available_at;
            job.owner = None;
            job.lease_until = None;
            if delay.is_zero() {
                self.queue.notifier().notify_one();
            }
            self.emit(WorkerEvent::Failed {
                job,
                error: error.to_string(),
                will_retry: true,
                retry_delay: Some(delay),
            });
            return;
        }

        if let Err(e) = broker.ack_failed(&job).await {
            error!(error = %e, "Failed to mark job as failed");
            return;
        }

        warn!(
            error = %error,
            attempts_made = job.attempts_made,
            permanent = !error.is_retryable(),
            "Job failed terminally"
        );
        job.state = JobState::Failed;
        job.finished_at = Some(broker.now());
        job.owner = None;
        job.lease_until = None;
        self.emit(WorkerEvent::Failed {
            job: job.clone(),
            error: error.to_string(),
            will_retry: false,
            retry_delay: None,
        });

        let Some(sink) = &self.dead_letters else {
            return;
        };
        match sink.record(&job, &error).await {
            Ok(entry) => {
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                let reason = if error.is_retryable() {
                    "exhausted"
                } else {
                    "permanent"
                };
                JobMetrics::job_dead_lettered(&job.queue, &job.name, reason);
                warn!(entry_id = %entry.id, reason, "Moved job to dead letter queue");
                self.emit(WorkerEvent::DeadLettered {
                    job,
                    entry_id: entry.id,
                });
            }
            // The failed state on the original job stays authoritative.
            Err(e) => warn!(error = %e, "Failed to write dead-letter entry"),
        }
    }

    fn emit(&self, event: WorkerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Drain deadline, capped at [`MAX_LEASE`].
pub(crate) fn drain_deadline(drain_timeout: Duration) -> tokio::time::Instant {
    tokio::time::Instant::now() + drain_timeout.min(MAX_LEASE)
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
