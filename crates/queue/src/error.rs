use thiserror::Error;

use pingme_common::error::AppError;

/// Errors raised by the broker and the consumer server.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed task {id}: {reason}")]
    MalformedTask { id: String, reason: String },

    #[error("No handler registered for pattern '{0}'")]
    NoHandler(String),

    #[error("Invalid queue configuration: {0}")]
    Config(String),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Config(msg) => AppError::Config(msg),
            other => AppError::Queue(other.to_string()),
        }
    }
}
