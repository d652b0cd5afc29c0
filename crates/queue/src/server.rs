//! Consumer server: a bounded worker pool multiplexing tasks to handlers.
//!
//! Every worker pulls from the broker using the shared weighted cursor in
//! [`QueuePriorities`], runs the handler registered for the task's message
//! pattern under the task's timeout, and reports the result back to the
//! broker. Retries are entirely the broker's business: a handler error or a
//! timeout is handed to [`Broker::fail`], which re-queues or buries the task.
//! The handler timeout matches the broker lease, so a task whose worker dies
//! is reclaimed by the next `dequeue` once the lease lapses.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, Disposition};
use crate::error::QueueError;
use crate::priority::QueuePriorities;
use crate::task::Task;

/// Handler invoked for every task carrying its message pattern.
///
/// Returning an error asks the broker to apply its retry policy.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> anyhow::Result<()>;
}

/// Routes tasks to handlers by message pattern.
#[derive(Clone, Default)]
pub struct ServeMux {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl ServeMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `pattern`, replacing any previous registration.
    pub fn handle(&mut self, pattern: impl Into<String>, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(pattern.into(), handler);
        self
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Run the handler registered for the task's pattern.
    pub async fn process(&self, task: &Task) -> anyhow::Result<()> {
        let handler = self
            .handlers
            .get(&task.kind)
            .ok_or_else(|| QueueError::NoHandler(task.kind.clone()))?;
        handler.handle(task).await
    }
}

/// Consumer tuning.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Number of concurrent workers.
    pub concurrency: usize,
    pub priorities: QueuePriorities,
    /// Idle wait between fetches when every queue is empty.
    pub poll_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            priorities: QueuePriorities::default(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

struct Inner {
    broker: Arc<dyn Broker>,
    config: ConsumerConfig,
    cursor: AtomicUsize,
}

/// Long-running queue consumer.
#[derive(Clone)]
pub struct ConsumerServer {
    inner: Arc<Inner>,
}

impl ConsumerServer {
    pub fn new(broker: Arc<dyn Broker>, config: ConsumerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                config,
                cursor: AtomicUsize::new(0),
            }),
        }
    }

    /// Run the worker pool until `shutdown` is cancelled.
    ///
    /// Cancellation is observed between tasks; a task already handed to a
    /// handler runs to completion (or to its timeout) first.
    pub async fn run(&self, mux: ServeMux, shutdown: CancellationToken) {
        let mux = Arc::new(mux);
        let concurrency = self.inner.config.concurrency.max(1);

        tracing::info!(
            concurrency,
            queues = ?self.inner.config.priorities.names().collect::<Vec<_>>(),
            patterns = ?mux.patterns().collect::<Vec<_>>(),
            "Consumer server started"
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..concurrency {
            let inner = Arc::clone(&self.inner);
            let mux = Arc::clone(&mux);
            let shutdown = shutdown.clone();
            workers.spawn(async move { inner.work(worker_id, &mux, shutdown).await });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Consumer worker aborted");
            }
        }

        tracing::info!("Consumer server stopped");
    }

    /// Fetch and handle a single task. Returns `false` when every queue was empty.
    pub async fn process_next(&self, mux: &ServeMux) -> Result<bool, QueueError> {
        self.inner.process_next(mux).await
    }
}

impl Inner {
    async fn work(&self, worker_id: usize, mux: &ServeMux, shutdown: CancellationToken) {
        tracing::debug!(worker_id, "Consumer worker started");

        while !shutdown.is_cancelled() {
            match self.process_next(mux).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(worker_id, error = %e, "Broker call failed, backing off");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::debug!(worker_id, "Consumer worker stopped");
    }

    async fn process_next(&self, mux: &ServeMux) -> Result<bool, QueueError> {
        let tick = self.cursor.fetch_add(1, Ordering::Relaxed);
        let order = self.config.priorities.order(tick);

        let Some(task) = self.broker.dequeue(&order).await? else {
            return Ok(false);
        };

        let result = match tokio::time::timeout(task.timeout, mux.process(&task)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "task exceeded its {}s timeout",
                task.timeout.as_secs()
            )),
        };

        match result {
            Ok(()) => {
                self.broker.complete(&task).await?;
                tracing::debug!(task_id = %task.id, kind = %task.kind, queue = %task.queue, "Task completed");
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                match self.broker.fail(&task, &reason).await? {
                    Disposition::Retry => tracing::warn!(
                        task_id = %task.id,
                        kind = %task.kind,
                        retried = task.retried + 1,
                        max_retry = task.max_retry,
                        error = %reason,
                        "Task failed, scheduled for retry"
                    ),
                    Disposition::Dead => tracing::error!(
                        task_id = %task.id,
                        kind = %task.kind,
                        error = %reason,
                        "Task exhausted its retries"
                    ),
                    Disposition::Expired => tracing::warn!(
                        task_id = %task.id,
                        kind = %task.kind,
                        error = %reason,
                        "Task failed after its lease lapsed, already settled by the broker"
                    ),
                }
            }
        }

        Ok(true)
    }
}
