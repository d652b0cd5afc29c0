//! Broker capability: at-least-once task delivery with retry and timeout.
//!
//! A dequeued task is leased to its consumer until `now + task.timeout`.
//! A lease that lapses without `complete` or `fail` (crashed worker, lost
//! acknowledgement) counts as a failed attempt: the task goes back to
//! pending while retry budget remains, otherwise to the dead set.

mod memory;
mod redis_broker;

pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;

use crate::error::QueueError;
use crate::task::{NewTask, Task, TaskInfo};

/// Where a failed task went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Back on its pending queue for another attempt.
    Retry,
    /// Retry budget exhausted; parked in the dead set.
    Dead,
    /// The lease had already lapsed and the broker settled the attempt itself.
    Expired,
}

/// Failure reason recorded for an attempt whose lease lapsed.
pub const LEASE_EXPIRED: &str = "lease expired";

/// Task transport shared by producers and consumers.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Submit a task and return the broker-assigned id.
    async fn enqueue(&self, task: NewTask) -> Result<TaskInfo, QueueError>;

    /// Take the next pending task, trying `queues` in the given order, and
    /// lease it for the task's timeout. Expired leases on `queues` are
    /// reclaimed first.
    async fn dequeue(&self, queues: &[&str]) -> Result<Option<Task>, QueueError>;

    /// Acknowledge a task that was handled successfully.
    async fn complete(&self, task: &Task) -> Result<(), QueueError>;

    /// Record a failed attempt; re-queues while retry budget remains.
    async fn fail(&self, task: &Task, reason: &str) -> Result<Disposition, QueueError>;

    /// Settle every lapsed lease on `queues` as a failed attempt.
    /// Returns how many tasks were reclaimed.
    async fn requeue_expired(&self, queues: &[&str]) -> Result<usize, QueueError>;
}
