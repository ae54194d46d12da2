//! Process-wide registry of queues and workers.

use crate::broker::Broker;
use crate::config::JobsConfig;
use crate::dead_letter::{DeadLetterEntry, DeadLetterSink};
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobId, JobOptions, JobState};
use crate::metrics::{MetricsAggregator, QueueMetrics};
use crate::queue::{FinishedState, Queue, QueueOptions};
use crate::redis::{create_pool, RedisBroker};
use crate::worker::{drain_deadline, Processor, Worker, WorkerEvent, WorkerHandle, WorkerOptions};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

const EVENT_CAPACITY: usize = 4096;

/// Outcome of [`QueueRegistry::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that were stopped.
    pub workers_stopped: usize,
    /// Jobs aborted mid-flight; they return to waiting once their lease expires.
    pub abandoned: Vec<JobId>,
    /// At least one worker missed the drain deadline.
    pub timed_out: bool,
    /// Queues closed.
    pub queues_closed: usize,
}

/// Owns the broker, every named queue, and at most one worker per queue.
///
/// Queues are created lazily on first use and are singletons per name.
/// All workers publish on one event channel (see [`subscribe`](Self::subscribe)).
pub struct QueueRegistry {
    broker: Arc<dyn Broker>,
    config: JobsConfig,
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    workers: RwLock<HashMap<String, WorkerHandle>>,
    dead_letters: Option<Arc<DeadLetterSink>>,
    events: broadcast::Sender<WorkerEvent>,
    aggregator: MetricsAggregator,
    shutting_down: AtomicBool,
}

impl QueueRegistry {
    /// Create a registry over an existing broker.
    pub fn new(broker: Arc<dyn Broker>, config: JobsConfig) -> JobResult<Self> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut queues = HashMap::new();
        let dead_letters = if config.dead_letter.enabled {
            let name = config.dead_letter.queue_name.clone();
            let queue = Arc::new(Queue::new(
                name.clone(),
                QueueOptions::from(&config.queue),
                broker.clone(),
            ));
            queues.insert(name, queue.clone());
            Some(Arc::new(DeadLetterSink::new(queue, config.dead_letter.retention)))
        } else {
            None
        };

        Ok(Self {
            aggregator: MetricsAggregator::new(broker.clone()),
            broker,
            config,
            queues: RwLock::new(queues),
            workers: RwLock::new(HashMap::new()),
            dead_letters,
            events,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Connect to Redis as configured and create a registry over it.
    pub async fn connect(config: JobsConfig) -> JobResult<Self> {
        config.validate()?;
        let pool = create_pool(&config.redis).await?;
        let broker = RedisBroker::new(pool, config.redis.key_prefix.clone());
        Self::new(Arc::new(broker), config)
    }

    /// The configuration the registry was built with.
    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// The shared broker.
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Get or create a queue with the configured default options.
    pub fn queue(&self, name: &str) -> JobResult<Arc<Queue>> {
        self.queue_with(name, QueueOptions::from(&self.config.queue))
    }

    /// Get or create a queue. `options` only apply when the queue is created.
    pub fn queue_with(&self, name: &str, options: QueueOptions) -> JobResult<Arc<Queue>> {
        self.ensure_running()?;
        if name.trim().is_empty() {
            return Err(JobError::Configuration("queue name must not be empty".into()));
        }
        if self.is_dead_letter_queue(name) {
            return Err(JobError::Configuration(format!(
                "queue '{name}' is the dead-letter queue and only holds failed job snapshots"
            )));
        }

        if let Some(queue) = self.queues.read().get(name) {
            return Ok(queue.clone());
        }

        options.validate()?;
        let mut queues = self.queues.write();
        let queue = queues
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(queue = %name, "Created queue");
                Arc::new(Queue::new(name, options, self.broker.clone()))
            })
            .clone();
        Ok(queue)
    }

    /// Look up an existing queue.
    pub fn get_queue(&self, name: &str) -> JobResult<Arc<Queue>> {
        self.queues
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::UnknownQueue(name.to_string()))
    }

    /// Names of all known queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Enqueue a job, creating the queue if needed.
    pub async fn enqueue<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        job_name: &str,
        payload: &T,
        options: JobOptions,
    ) -> JobResult<Job> {
        self.queue(queue)?.enqueue(job_name, payload, options).await
    }

    /// Start a worker for `queue` with the configured worker options.
    ///
    /// Registering again for the same queue is a no-op that returns the
    /// existing worker.
    pub fn register_processor<P: Processor>(
        &self,
        queue: &str,
        processor: P,
        concurrency: usize,
    ) -> JobResult<WorkerHandle> {
        let options = WorkerOptions::from(&self.config.worker).concurrency(concurrency);
        self.register_processor_with(queue, processor, options)
    }

    /// Start a worker for `queue` with explicit options.
    pub fn register_processor_with<P: Processor>(
        &self,
        queue: &str,
        processor: P,
        options: WorkerOptions,
    ) -> JobResult<WorkerHandle> {
        self.ensure_running()?;
        if self.is_dead_letter_queue(queue) {
            return Err(JobError::Configuration(format!(
                "queue '{queue}' is the dead-letter queue and cannot have a processor"
            )));
        }

        let mut workers = self.workers.write();
        if let Some(existing) = workers.get(queue) {
            warn!(queue = %queue, worker_id = %existing.id(), "Processor already registered; ignoring");
            return Ok(existing.clone());
        }

        let queue_handle = self.queue(queue)?;
        let mut worker = Worker::new(queue_handle, processor)
            .options(options)
            .events(self.events.clone());
        if let Some(sink) = &self.dead_letters {
            worker = worker.dead_letters(sink.clone());
        }
        let handle = worker.spawn()?;

        workers.insert(queue.to_string(), handle.clone());
        Ok(handle)
    }

    /// The worker registered for `queue`, if any.
    pub fn worker(&self, queue: &str) -> Option<WorkerHandle> {
        self.workers.read().get(queue).cloned()
    }

    /// Subscribe to events from every worker.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Fetch a job.
    pub async fn get_job(&self, queue: &str, id: &JobId) -> JobResult<Option<Job>> {
        self.get_queue(queue)?.get_job(id).await
    }

    /// List jobs of a queue in one state.
    pub async fn list_jobs(
        &self,
        queue: &str,
        state: JobState,
        offset: usize,
        limit: usize,
    ) -> JobResult<Vec<Job>> {
        self.get_queue(queue)?.list(state, offset, limit).await
    }

    /// Pause a queue.
    pub async fn pause(&self, queue: &str) -> JobResult<()> {
        self.get_queue(queue)?.pause().await
    }

    /// Resume a queue.
    pub async fn resume(&self, queue: &str) -> JobResult<()> {
        self.get_queue(queue)?.resume().await
    }

    /// Make a waiting or delayed job eligible now.
    pub async fn retry_job(&self, queue: &str, id: &JobId) -> JobResult<()> {
        self.get_queue(queue)?.retry_job(id).await
    }

    /// Remove a non-active job.
    pub async fn remove_job(&self, queue: &str, id: &JobId) -> JobResult<bool> {
        self.get_queue(queue)?.remove_job(id).await
    }

    /// Purge old finished jobs from a queue.
    pub async fn clean(
        &self,
        queue: &str,
        older_than: Duration,
        limit: usize,
        state: FinishedState,
    ) -> JobResult<Vec<JobId>> {
        self.get_queue(queue)?.clean(older_than, limit, state).await
    }

    /// Live metrics for one queue.
    pub async fn get_metrics(&self, queue: &str) -> JobResult<QueueMetrics> {
        let queue = self.get_queue(queue)?;
        self.aggregator.collect(queue.name()).await
    }

    /// Live metrics for every known queue.
    pub async fn get_all_metrics(&self) -> JobResult<HashMap<String, QueueMetrics>> {
        let names = self.queue_names();
        self.aggregator
            .collect_all(names.iter().map(String::as_str))
            .await
    }

    /// The dead-letter sink, when enabled.
    pub fn dead_letters(&self) -> Option<Arc<DeadLetterSink>> {
        self.dead_letters.clone()
    }

    /// Re-enqueue a dead-letter entry into its original queue.
    pub async fn replay_dead_letter(&self, entry_id: &JobId) -> JobResult<Job> {
        let sink = self
            .dead_letters
            .as_ref()
            .ok_or_else(|| JobError::Configuration("dead-letter queue is disabled".into()))?;
        let entry: DeadLetterEntry = sink
            .get(entry_id)
            .await?
            .ok_or_else(|| JobError::NotFound(entry_id.to_string()))?;
        let target = self.queue(&entry.original_queue)?;
        sink.replay(entry_id, &target).await
    }

    /// Check broker connectivity.
    pub async fn health_check(&self) -> JobResult<()> {
        self.broker.health_check().await
    }

    /// Whether [`shutdown`](Self::shutdown) has started.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// [`shutdown`](Self::shutdown) with the configured
    /// `worker.shutdown_timeout_secs` as the drain timeout.
    pub async fn shutdown_graceful(&self) -> JobResult<ShutdownReport> {
        self.shutdown(self.config.worker.shutdown_timeout()).await
    }

    /// Stop all workers, close all queues, then close the broker.
    ///
    /// Every worker stops dequeuing immediately; in-flight jobs get until
    /// `drain_timeout` (shared across workers) to finish. Calling this twice
    /// is harmless.
    pub async fn shutdown(&self, drain_timeout: Duration) -> JobResult<ShutdownReport> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(ShutdownReport::default());
        }
        info!("Shutting down job system...");

        let workers: Vec<WorkerHandle> = self.workers.write().drain().map(|(_, w)| w).collect();
        for worker in &workers {
            worker.stop();
        }

        let deadline = drain_deadline(drain_timeout);
        let mut report = ShutdownReport {
            workers_stopped: workers.len(),
            ..ShutdownReport::default()
        };
        for worker in &workers {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let drain = worker.shutdown(remaining).await;
            report.timed_out |= !drain.completed_in_time;
            report.abandoned.extend(drain.abandoned);
        }

        let queues: Vec<Arc<Queue>> = self.queues.read().values().cloned().collect();
        for queue in &queues {
            queue.close();
        }
        report.queues_closed = queues.len();

        self.broker.close().await?;
        info!(
            workers = report.workers_stopped,
            abandoned = report.abandoned.len(),
            timed_out = report.timed_out,
            "Job system shut down"
        );
        Ok(report)
    }

    fn is_dead_letter_queue(&self, name: &str) -> bool {
        self.dead_letters
            .as_ref()
            .is_some_and(|sink| sink.queue().name() == name)
    }

    fn ensure_running(&self) -> JobResult<()> {
        if self.is_shutting_down() {
            return Err(JobError::ShuttingDown);
        }
        Ok(())
    }
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("queues", &self.queue_names())
            .field("workers", &self.workers.read().len())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::worker::processor_fn;
    use serde_json::json;

    fn registry() -> QueueRegistry {
        QueueRegistry::new(Arc::new(MemoryBroker::new()), JobsConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_queue_is_singleton_per_name() {
        let registry = registry();
        let a = registry.queue("mail").unwrap();
        let b = registry.queue("mail").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.queue_names(), vec!["dead-letter", "mail"]);
    }

    #[tokio::test]
    async fn test_unknown_queue_errors() {
        let registry = registry();
        let err = registry.get_metrics("nope").await.unwrap_err();
        assert!(matches!(err, JobError::UnknownQueue(_)));
        let err = registry.pause("nope").await.unwrap_err();
        assert!(matches!(err, JobError::UnknownQueue(_)));
    }

    #[tokio::test]
    async fn test_empty_queue_name_rejected() {
        let registry = registry();
        assert!(matches!(registry.queue(" "), Err(JobError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_dead_letter_queue_cannot_get_processor() {
        let registry = registry();
        let err = registry
            .register_processor("dead-letter", processor_fn(|_job: Job| async { Ok(()) }), 1)
            .unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_dead_letter_queue_rejects_plain_jobs() {
        let registry = registry();
        assert!(matches!(registry.queue("dead-letter"), Err(JobError::Configuration(_))));
        let err = registry
            .enqueue("dead-letter", "welcome", &json!({}), JobOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));

        // Read access to the sink is unaffected.
        assert_eq!(registry.get_metrics("dead-letter").await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_uses_configured_timeout() {
        let mut config = JobsConfig::default();
        config.worker.shutdown_timeout_secs = 0;
        let registry = QueueRegistry::new(Arc::new(MemoryBroker::new()), config).unwrap();
        let worker = registry
            .register_processor(
                "mail",
                processor_fn(|_job: Job| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }),
                1,
            )
            .unwrap();
        let job = registry
            .enqueue("mail", "slow", &json!({}), JobOptions::new())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while worker.active_jobs() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), registry.shutdown_graceful())
            .await
            .unwrap()
            .unwrap();
        assert!(report.timed_out);
        assert_eq!(report.abandoned, vec![job.id]);
    }

    #[tokio::test]
    async fn test_dead_letter_disabled() {
        let mut config = JobsConfig::default();
        config.dead_letter.enabled = false;
        let registry = QueueRegistry::new(Arc::new(MemoryBroker::new()), config).unwrap();
        assert!(registry.dead_letters().is_none());
        assert!(registry.queue_names().is_empty());
        let err = registry.replay_dead_letter(&JobId::new()).await.unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_operations_after_shutdown_are_refused() {
        let registry = registry();
        registry.enqueue("mail", "welcome", &json!({}), JobOptions::new()).await.unwrap();

        let report = registry.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(report.queues_closed, 2);
        assert!(!report.timed_out);

        let err = registry
            .enqueue("mail", "welcome", &json!({}), JobOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::ShuttingDown));
        let err = registry
            .register_processor("mail", processor_fn(|_job: Job| async { Ok(()) }), 1)
            .unwrap_err();
        assert!(matches!(err, JobError::ShuttingDown));

        assert_eq!(registry.shutdown(Duration::from_secs(1)).await.unwrap(), ShutdownReport::default());
    }
}
