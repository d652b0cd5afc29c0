//! Units of work handed to the broker.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Queue a task lands on when the submitter does not pick one.
pub const DEFAULT_QUEUE: &str = "default";

/// Retry budget applied when the submitter does not set one.
pub const DEFAULT_MAX_RETRY: u32 = 25;

/// Processing deadline applied when the submitter does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// A task about to be submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub kind: String,
    pub payload: Vec<u8>,
    pub queue: String,
    pub max_retry: u32,
    pub timeout: Duration,
}

impl NewTask {
    pub fn new(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            queue: DEFAULT_QUEUE.to_string(),
            max_retry: DEFAULT_MAX_RETRY,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// What the broker reports back after accepting a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    /// Broker-assigned id, used as the notification's transaction id.
    pub id: String,
    pub queue: String,
}

/// A task as fetched by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    /// Message pattern selecting the handler.
    pub kind: String,
    pub payload: Vec<u8>,
    pub queue: String,
    pub max_retry: u32,
    /// Failed attempts so far.
    pub retried: u32,
    pub timeout: Duration,
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    pub(crate) fn from_new(id: String, new: NewTask) -> Self {
        Self {
            id,
            kind: new.kind,
            payload: new.payload,
            queue: new.queue,
            max_retry: new.max_retry,
            retried: 0,
            timeout: new.timeout,
            enqueued_at: Utc::now(),
        }
    }

    /// Whether another failure still leaves retry budget.
    pub fn can_retry(&self) -> bool {
        self.retried < self.max_retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let task = NewTask::new("dispatch-notification", b"{}".to_vec());
        assert_eq!(task.queue, DEFAULT_QUEUE);
        assert_eq!(task.max_retry, DEFAULT_MAX_RETRY);
        assert_eq!(task.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn test_retry_budget() {
        let new = NewTask::new("dispatch-notification", Vec::new()).max_retry(2);
        let mut task = Task::from_new("t-1".to_string(), new);
        assert!(task.can_retry());
        task.retried = 2;
        assert!(!task.can_retry());
    }
}
