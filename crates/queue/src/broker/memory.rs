use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::time::Instant;
use uuid::Uuid;

use crate::error::QueueError;
use crate::task::{NewTask, Task, TaskInfo};

use super::{Broker, Disposition, LEASE_EXPIRED};

struct Lease {
    task: Task,
    deadline: Instant,
}

#[derive(Default)]
struct State {
    pending: HashMap<String, VecDeque<Task>>,
    active: HashMap<String, Lease>,
    dead: Vec<(Task, String)>,
    completed: Vec<Task>,
}

impl State {
    fn retry_or_bury(&mut self, task: &Task, reason: &str) -> Disposition {
        let mut failed = task.clone();
        if failed.can_retry() {
            failed.retried += 1;
            self.pending
                .entry(failed.queue.clone())
                .or_default()
                .push_back(failed);
            Disposition::Retry
        } else {
            self.dead.push((failed, reason.to_string()));
            Disposition::Dead
        }
    }

    fn requeue_expired(&mut self, queues: &[&str], now: Instant) -> usize {
        let expired: Vec<String> = self
            .active
            .iter()
            .filter(|(_, lease)| lease.deadline <= now && queues.contains(&lease.task.queue.as_str()))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(lease) = self.active.remove(id) {
                let disposition = self.retry_or_bury(&lease.task, LEASE_EXPIRED);
                tracing::warn!(
                    task_id = %id,
                    queue = %lease.task.queue,
                    disposition = ?disposition,
                    "Task lease expired"
                );
            }
        }

        expired.len()
    }
}

/// In-process broker with the Redis broker's lease and retry semantics.
///
/// Used by the test suites and for running the pipeline without Redis.
/// `set_unavailable(true)` makes every call fail like an unreachable broker.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Tasks waiting on `queue`, next to run first.
    pub fn pending(&self, queue: &str) -> Vec<Task> {
        self.lock()
            .pending
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Tasks currently leased to a consumer.
    pub fn active(&self) -> Vec<Task> {
        self.lock()
            .active
            .values()
            .map(|lease| lease.task.clone())
            .collect()
    }

    /// Tasks whose retry budget ran out, with the last failure reason.
    pub fn dead(&self) -> Vec<(Task, String)> {
        self.lock().dead.clone()
    }

    /// Tasks acknowledged as handled.
    pub fn completed(&self) -> Vec<Task> {
        self.lock().completed.clone()
    }

    /// Re-queue a copy of an already completed task, as a redelivering broker would.
    pub fn redeliver(&self, task: &Task) {
        let mut state = self.lock();
        state
            .pending
            .entry(task.queue.clone())
            .or_default()
            .push_back(task.clone());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(QueueError::Unavailable("in-memory broker switched off".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, task: NewTask) -> Result<TaskInfo, QueueError> {
        self.check_available()?;

        let task = Task::from_new(Uuid::new_v4().to_string(), task);
        let info = TaskInfo {
            id: task.id.clone(),
            queue: task.queue.clone(),
        };
        self.lock()
            .pending
            .entry(task.queue.clone())
            .or_default()
            .push_back(task);

        Ok(info)
    }

    async fn dequeue(&self, queues: &[&str]) -> Result<Option<Task>, QueueError> {
        self.check_available()?;

        let now = Instant::now();
        let mut state = self.lock();
        state.requeue_expired(queues, now);

        for queue in queues {
            let next = state.pending.get_mut(*queue).and_then(VecDeque::pop_front);
            if let Some(task) = next {
                let lease = Lease {
                    task: task.clone(),
                    deadline: now + task.timeout,
                };
                state.active.insert(task.id.clone(), lease);
                return Ok(Some(task));
            }
        }

        Ok(None)
    }

    async fn complete(&self, task: &Task) -> Result<(), QueueError> {
        self.check_available()?;

        let mut state = self.lock();
        state.active.remove(&task.id);
        // Drop any copy a lapsed lease already put back.
        if let Some(pending) = state.pending.get_mut(&task.queue) {
            pending.retain(|t| t.id != task.id);
        }
        state.dead.retain(|(t, _)| t.id != task.id);
        state.completed.push(task.clone());
        Ok(())
    }

    async fn fail(&self, task: &Task, reason: &str) -> Result<Disposition, QueueError> {
        self.check_available()?;

        let mut state = self.lock();
        let Some(lease) = state.active.remove(&task.id) else {
            return Ok(Disposition::Expired);
        };

        Ok(state.retry_or_bury(&lease.task, reason))
    }

    async fn requeue_expired(&self, queues: &[&str]) -> Result<usize, QueueError> {
        self.check_available()?;

        Ok(self.lock().requeue_expired(queues, Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_enqueue_then_dequeue() {
        let broker = MemoryBroker::new();
        let info = broker
            .enqueue(NewTask::new("dispatch-notification", b"{}".to_vec()))
            .await
            .unwrap();
        assert_eq!(info.queue, "default");
        assert!(!info.id.is_empty());

        let task = broker.dequeue(&["critical", "default"]).await.unwrap().unwrap();
        assert_eq!(task.id, info.id);
        assert!(broker.dequeue(&["default"]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dequeue_respects_queue_order() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(NewTask::new("a", Vec::new()).queue("low"))
            .await
            .unwrap();
        broker
            .enqueue(NewTask::new("b", Vec::new()).queue("critical"))
            .await
            .unwrap();

        let first = broker.dequeue(&["low", "critical"]).await.unwrap().unwrap();
        assert_eq!(first.kind, "a");
        let second = broker.dequeue(&["low", "critical"]).await.unwrap().unwrap();
        assert_eq!(second.kind, "b");
    }

    #[tokio::test]
    async fn test_fail_retries_until_budget_exhausted() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(NewTask::new("dispatch-notification", Vec::new()).max_retry(2))
            .await
            .unwrap();

        let mut dispositions = Vec::new();
        while let Some(task) = broker.dequeue(&["default"]).await.unwrap() {
            dispositions.push(broker.fail(&task, "boom").await.unwrap());
        }

        assert_eq!(
            dispositions,
            vec![Disposition::Retry, Disposition::Retry, Disposition::Dead]
        );
        let dead = broker.dead();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0.retried, 2);
        assert_eq!(dead[0].1, "boom");
    }

    #[tokio::test]
    async fn test_unavailable_broker_rejects_enqueue() {
        let broker = MemoryBroker::new();
        broker.set_unavailable(true);

        let err = broker
            .enqueue(NewTask::new("dispatch-notification", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Unavailable(_)));
        assert!(broker.pending("default").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_task_is_redelivered_after_timeout() {
        let broker = MemoryBroker::new();
        let info = broker
            .enqueue(
                NewTask::new("dispatch-notification", Vec::new())
                    .max_retry(3)
                    .timeout(Duration::from_millis(10)),
            )
            .await
            .unwrap();

        // The consumer takes the task and dies without acknowledging it.
        drop(broker.dequeue(&["default"]).await.unwrap().unwrap());
        assert!(broker.dequeue(&["default"]).await.unwrap().is_none());
        assert_eq!(broker.active().len(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;

        let again = broker.dequeue(&["default"]).await.unwrap().unwrap();
        assert_eq!(again.id, info.id);
        assert_eq!(again.retried, 1);
        assert!(broker.dead().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_task_without_budget_is_buried() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(
                NewTask::new("dispatch-notification", Vec::new())
                    .max_retry(0)
                    .timeout(Duration::from_millis(10)),
            )
            .await
            .unwrap();

        broker.dequeue(&["default"]).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(broker.requeue_expired(&["default"]).await.unwrap(), 1);
        assert!(broker.active().is_empty());
        let dead = broker.dead();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].1, LEASE_EXPIRED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_report_after_expiry_is_not_counted_twice() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(
                NewTask::new("dispatch-notification", Vec::new())
                    .max_retry(5)
                    .timeout(Duration::from_millis(10)),
            )
            .await
            .unwrap();

        let task = broker.dequeue(&["default"]).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(broker.requeue_expired(&["default"]).await.unwrap(), 1);

        assert_eq!(broker.fail(&task, "boom").await.unwrap(), Disposition::Expired);
        let pending = broker.pending("default");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retried, 1);

        // A success reported late still retires the re-queued copy.
        broker.complete(&task).await.unwrap();
        assert!(broker.pending("default").is_empty());
        assert_eq!(broker.completed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_lease_is_left_alone() {
        let broker = MemoryBroker::new();
        broker
            .enqueue(NewTask::new("dispatch-notification", Vec::new()).timeout(Duration::from_secs(180)))
            .await
            .unwrap();

        broker.dequeue(&["default"]).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(179)).await;

        assert_eq!(broker.requeue_expired(&["default"]).await.unwrap(), 0);
        assert_eq!(broker.active().len(), 1);
    }
}
