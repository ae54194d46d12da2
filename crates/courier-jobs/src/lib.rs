//! Courier Jobs - Durable Background Job Processing
//!
//! A broker-backed job queue with:
//! - Named queues with priority-then-FIFO ordering and delayed jobs
//! - Concurrency-bounded workers with visibility-timeout leases
//! - Retry with fixed, linear or exponential backoff
//! - Dead-letter queue for jobs that exhaust their attempts
//! - Live per-queue metrics and `metrics` facade counters
//! - Graceful shutdown: workers, then queues, then the broker
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        QueueRegistry                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  Producer ──enqueue──▶ Queue ("mail")    Queue ("reports")    │
//! │                          │                     │              │
//! │                          ▼                     ▼              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                 Broker (Redis / memory)                 │  │
//! │  │   waiting ─▶ active ─▶ completed | failed               │  │
//! │  │      ▲          │                                       │  │
//! │  │      └─ delayed ◀┘ (retry with backoff)                  │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                          │                                    │
//! │                          ▼                                    │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐  │
//! │  │ Worker slot 1│   │ Worker slot N│   │ DeadLetterSink   │  │
//! │  └──────┬───────┘   └──────┬───────┘   │ ("dead-letter")  │  │
//! │         └─── WorkerEvent ──┘           └──────────────────┘  │
//! │                                                               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_jobs::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Welcome {
//!     to: String,
//! }
//!
//! let registry = QueueRegistry::connect(JobsConfig::load("config")?).await?;
//!
//! registry.register_processor(
//!     "mail",
//!     processor_fn(|job: Job| async move {
//!         let welcome: Welcome = job.payload_as()?;
//!         send(&welcome.to).await.map_err(|e| JobError::transient(e.to_string()))
//!     }),
//!     4,
//! )?;
//!
//! registry
//!     .enqueue("mail", "welcome", &Welcome { to: "a@example.com".into() }, JobOptions::new())
//!     .await?;
//!
//! registry.shutdown(Duration::from_secs(30)).await?;
//! ```

pub mod backoff;
pub mod broker;
pub mod config;
pub mod dead_letter;
pub mod di;
pub mod error;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod redis;
pub mod registry;
pub mod telemetry;
pub mod worker;

pub use backoff::{Backoff, BackoffKind, MAX_BACKOFF_DELAY_MS};
pub use broker::{Broker, Clock, ManualClock, MemoryBroker, StateCounts, SystemClock};
pub use config::{DeadLetterConfig, JobsConfig, QueueDefaults, RedisConfig, WorkerConfig};
pub use dead_letter::{DeadLetterEntry, DeadLetterSink};
pub use di::JobQueueInterface;
pub use error::{JobError, JobResult};
pub use job::{Job, JobId, JobOptions, JobState, Retention, MAX_PRIORITY};
pub use metrics::{register_metrics, JobMetrics, MetricsAggregator, QueueMetrics};
pub use queue::{FinishedState, Queue, QueueOptions};
pub use redis::RedisBroker;
pub use registry::{QueueRegistry, ShutdownReport};
pub use telemetry::{init_tracing, LogFormat, LoggingConfig};
pub use worker::{
    processor_fn, DrainReport, FnProcessor, Processor, Worker, WorkerEvent, WorkerHandle,
    WorkerOptions, WorkerStats, MAX_LEASE,
};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backoff::Backoff;
    pub use crate::job::{Job, JobOptions, JobState};
    pub use crate::registry::QueueRegistry;
    pub use crate::worker::{processor_fn, Processor, WorkerEvent};
    pub use crate::{JobError, JobId, JobResult, JobsConfig};
    pub use std::time::Duration;
}
