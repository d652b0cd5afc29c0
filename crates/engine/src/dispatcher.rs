//! Dispatcher: turns a notification request into a queued task plus a
//! tracking record.
//!
//! The task is submitted first and the record persisted second. A record
//! therefore never references a transaction id the broker did not accept.
//! The reverse gap (task queued, record write failed) cannot be repaired by
//! the sweeper, so it is logged at error level with the transaction id.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pingme_common::error::AppError;
use pingme_common::store::NotificationStore;
use pingme_common::types::{
    DISPATCH_NOTIFICATION, NewNotification, NotificationPayload, NotificationStatus,
};
use pingme_queue::broker::Broker;
use pingme_queue::task::{DEFAULT_QUEUE, NewTask};

/// Broker retry budget for notification tasks.
pub const DISPATCH_MAX_RETRY: u32 = 10;

/// Broker processing deadline for notification tasks.
pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Inbound notification request. Every field is required.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DispatchRequest {
    pub title: String,
    pub description: String,
    pub link: String,
}

impl DispatchRequest {
    /// Parse a JSON request body.
    pub fn from_slice(body: &[u8]) -> Result<Self, AppError> {
        serde_json::from_slice(body)
            .map_err(|e| AppError::Validation(format!("Invalid notification request: {}", e)))
    }
}

/// Identifiers handed back to the caller after a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReceipt {
    /// Broker transaction id.
    pub task_id: String,
    pub queue: String,
    pub notification_id: i64,
}

/// Submits notification tasks and records them.
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    store: Arc<dyn NotificationStore>,
    queue: String,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn NotificationStore>) -> Self {
        Self {
            broker,
            store,
            queue: DEFAULT_QUEUE.to_string(),
        }
    }

    /// Submit to a queue other than `default`.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Enqueue the notification task, then persist a `Processing` record.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchReceipt, AppError> {
        let DispatchRequest {
            title,
            description,
            link,
        } = request;

        let payload = NotificationPayload {
            title: title.clone(),
            description: description.clone(),
            link,
        }
        .to_bytes()?;

        let task = NewTask::new(DISPATCH_NOTIFICATION, payload.clone())
            .queue(&self.queue)
            .max_retry(DISPATCH_MAX_RETRY)
            .timeout(DISPATCH_TIMEOUT);

        let info = self.broker.enqueue(task).await.map_err(|e| {
            tracing::error!(error = %e, queue = %self.queue, "Failed to enqueue notification task");
            AppError::from(e)
        })?;

        let record = NewNotification {
            title,
            description,
            payload,
            transaction_id: info.id.clone(),
            status: NotificationStatus::Processing,
        };

        let notification_id = match self.store.create(record).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(
                    transaction_id = %info.id,
                    queue = %info.queue,
                    error = %e,
                    "Task enqueued without a tracking record; needs manual follow-up"
                );
                return Err(e);
            }
        };

        tracing::info!(
            transaction_id = %info.id,
            queue = %info.queue,
            notification_id,
            "Notification enqueued"
        );

        Ok(DispatchReceipt {
            task_id: info.id,
            queue: info.queue,
            notification_id,
        })
    }
}
