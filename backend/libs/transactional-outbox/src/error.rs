//! Error types for the transactional outbox library.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for outbox operations.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Errors that can occur during outbox operations.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Database operation failed
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Event not found in outbox, or no longer pending
    #[error("Event not found: {0}")]
    EventNotFound(Uuid),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Payload cannot be turned into a task; retrying will not help
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Status column holds a value outside the known lifecycle
    #[error("Unknown outbox status: {0}")]
    UnknownStatus(String),

    /// Task queue rejected or failed the enqueue
    #[error("Enqueue failed: {0}")]
    EnqueueFailed(String),

    /// A task with this id is already in the queue
    #[error("Task already enqueued: {0}")]
    TaskIdConflict(String),

    /// Broker connection error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Generic error with context
    #[error("Outbox error: {0}")]
    Other(#[from] anyhow::Error),
}

impl OutboxError {
    /// True when the event can never be delivered and should not be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OutboxError::InvalidPayload(_) | OutboxError::SerializationError(_)
        )
    }
}
