//! Job error types.

use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Processing failed in a way that may succeed on a later attempt.
    #[error("Transient processing error: {0}")]
    Transient(String),

    /// Processing failed and must not be retried.
    #[error("Permanent processing error: {0}")]
    Permanent(String),

    /// The broker could not be reached or rejected the operation.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Queue has never been created in this registry.
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Invalid job state.
    #[error("Invalid job state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The caller no longer owns the job it tried to acknowledge.
    #[error("Lease lost for job {0}")]
    LeaseLost(String),

    /// The registry or queue has been shut down.
    #[error("Job system is shutting down")]
    ShuttingDown,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Creates a retryable processing error.
    pub fn transient(message: impl Into<String>) -> Self {
        JobError::Transient(message.into())
    }

    /// Creates a processing error that skips remaining retries.
    pub fn permanent(message: impl Into<String>) -> Self {
        JobError::Permanent(message.into())
    }

    /// Returns true if a job failing with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            JobError::Permanent(_) | JobError::Configuration(_) | JobError::Serialization(_)
        )
    }

    /// Returns true if this error comes from the broker rather than a processor.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            JobError::BrokerUnavailable(_) | JobError::Redis(_) | JobError::Pool(_)
        )
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Transient(_) => "transient",
            JobError::Permanent(_) => "permanent",
            JobError::BrokerUnavailable(_) | JobError::Redis(_) | JobError::Pool(_) => "broker",
            JobError::Serialization(_) => "serialization",
            JobError::Configuration(_) | JobError::UnknownQueue(_) => "configuration",
            JobError::NotFound(_) => "not_found",
            JobError::InvalidState { .. } => "invalid_state",
            JobError::LeaseLost(_) => "lease_lost",
            JobError::ShuttingDown => "shutting_down",
            JobError::Internal(_) => "internal",
        }
    }
}

impl From<deadpool_redis::CreatePoolError> for JobError {
    fn from(err: deadpool_redis::CreatePoolError) -> Self {
        JobError::Configuration(format!("Failed to create Redis pool: {err}"))
    }
}

impl From<config::ConfigError> for JobError {
    fn from(err: config::ConfigError) -> Self {
        JobError::Configuration(err.to_string())
    }
}
