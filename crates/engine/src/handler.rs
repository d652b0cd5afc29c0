//! Queue-side handler for `dispatch-notification` tasks.
//!
//! The broker may deliver the same task more than once. Every status write
//! goes through the store's conditional update, so a redelivered task whose
//! record is already terminal is a no-op rather than an error.

use std::sync::Arc;

use pingme_common::error::AppError;
use pingme_common::store::NotificationStore;
use pingme_common::types::{NotificationPayload, NotificationStatus, StatusChange};
use pingme_queue::server::TaskHandler;
use pingme_queue::task::Task;

/// Downstream channel that actually reaches the recipient.
#[async_trait::async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn deliver(
        &self,
        transaction_id: &str,
        payload: &NotificationPayload,
    ) -> Result<(), AppError>;
}

/// Delivery channel that only emits a structured log event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogChannel;

#[async_trait::async_trait]
impl DeliveryChannel for LogChannel {
    async fn deliver(
        &self,
        transaction_id: &str,
        payload: &NotificationPayload,
    ) -> Result<(), AppError> {
        tracing::info!(
            transaction_id,
            title = %payload.title,
            description = %payload.description,
            link = %payload.link,
            "Sending notification"
        );
        Ok(())
    }
}

/// Handles notification tasks and records their terminal status.
pub struct NotificationHandler {
    store: Arc<dyn NotificationStore>,
    channel: Arc<dyn DeliveryChannel>,
}

impl NotificationHandler {
    pub fn new(store: Arc<dyn NotificationStore>, channel: Arc<dyn DeliveryChannel>) -> Self {
        Self { store, channel }
    }

    /// Decode, deliver and mark the record.
    ///
    /// - undecodable payload: record marked `Failed`, `AppError::Decode` returned
    /// - no record for the task yet: `AppError::NotFound` without delivering,
    ///   so the broker retries once the dispatcher has persisted it
    /// - record already terminal: nothing is delivered
    /// - delivery error: record left `Processing`, error returned for a broker retry
    pub async fn process(&self, task: &Task) -> Result<StatusChange, AppError> {
        let payload = match NotificationPayload::from_bytes(&task.payload) {
            Ok(payload) => payload,
            Err(decode_err) => {
                match self
                    .store
                    .update_status_by_transaction_id(&task.id, NotificationStatus::Failed)
                    .await
                {
                    Ok(change) => tracing::warn!(
                        transaction_id = %task.id,
                        change = ?change,
                        error = %decode_err,
                        "Undecodable notification payload, marked failed"
                    ),
                    Err(e) => tracing::error!(
                        transaction_id = %task.id,
                        error = %e,
                        "Undecodable notification payload and the failure could not be recorded"
                    ),
                }
                return Err(decode_err);
            }
        };

        let Some(record) = self.store.get_by_transaction_id(&task.id).await? else {
            tracing::warn!(
                transaction_id = %task.id,
                retried = task.retried,
                "No tracking record for task, deferring delivery"
            );
            return Err(AppError::NotFound(format!(
                "No notification record for transaction {}",
                task.id
            )));
        };

        match record.status {
            NotificationStatus::Processing => {}
            NotificationStatus::Success => {
                tracing::debug!(transaction_id = %task.id, "Duplicate delivery, already successful");
                return Ok(StatusChange::Unchanged);
            }
            current @ NotificationStatus::Failed => {
                tracing::warn!(
                    transaction_id = %task.id,
                    current = %current,
                    "Skipping delivery, record is already terminal"
                );
                return Ok(StatusChange::Conflict(current));
            }
        }

        self.channel.deliver(&task.id, &payload).await?;

        let change = self
            .store
            .update_status_by_transaction_id(&task.id, NotificationStatus::Success)
            .await?;

        match change {
            StatusChange::Applied => {
                tracing::info!(transaction_id = %task.id, "Notification delivered");
            }
            StatusChange::Unchanged => {
                tracing::debug!(transaction_id = %task.id, "Concurrent delivery already marked success");
            }
            StatusChange::Conflict(current) => {
                tracing::warn!(
                    transaction_id = %task.id,
                    current = %current,
                    "Delivered a notification whose record turned terminal meanwhile"
                );
            }
            StatusChange::Missing => {
                // Already delivered: retrying would signal the channel again.
                tracing::error!(
                    transaction_id = %task.id,
                    "Notification delivered but its tracking record disappeared"
                );
            }
        }

        Ok(change)
    }
}

#[async_trait::async_trait]
impl TaskHandler for NotificationHandler {
    async fn handle(&self, task: &Task) -> anyhow::Result<()> {
        self.process(task).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use chrono::Utc;
    use pingme_common::store::MemoryNotificationStore;
    use pingme_common::types::{DISPATCH_NOTIFICATION, NewNotification};

    #[derive(Default)]
    struct Recording {
        delivered: Mutex<Vec<String>>,
        refuse: bool,
    }

    #[async_trait::async_trait]
    impl DeliveryChannel for Recording {
        async fn deliver(
            &self,
            transaction_id: &str,
            _payload: &NotificationPayload,
        ) -> Result<(), AppError> {
            if self.refuse {
                return Err(AppError::Internal("channel offline".to_string()));
            }
            self.delivered.lock().unwrap().push(transaction_id.to_string());
            Ok(())
        }
    }

    fn task(id: &str, payload: &[u8]) -> Task {
        Task {
            id: id.to_string(),
            kind: DISPATCH_NOTIFICATION.to_string(),
            payload: payload.to_vec(),
            queue: "default".to_string(),
            max_retry: 10,
            retried: 0,
            timeout: Duration::from_secs(180),
            enqueued_at: Utc::now(),
        }
    }

    const GOOD: &[u8] = br#"{"title":"Alert","description":"disk full","link":"https://x/y"}"#;

    async fn seeded_store(transaction_id: &str) -> Arc<MemoryNotificationStore> {
        let store = Arc::new(MemoryNotificationStore::new());
        store
            .create(NewNotification {
                title: "Alert".to_string(),
                description: "disk full".to_string(),
                payload: GOOD.to_vec(),
                transaction_id: transaction_id.to_string(),
                status: NotificationStatus::Processing,
            })
            .await
            .unwrap();
        store
    }

    fn status(store: &MemoryNotificationStore, transaction_id: &str) -> NotificationStatus {
        store.find_by_transaction_id(transaction_id).unwrap().status
    }

    #[tokio::test]
    async fn test_well_formed_payload_marks_success() {
        let store = seeded_store("tx-1").await;
        let channel = Arc::new(Recording::default());
        let handler = NotificationHandler::new(store.clone(), channel.clone());

        let change = handler.process(&task("tx-1", GOOD)).await.unwrap();

        assert_eq!(change, StatusChange::Applied);
        assert_eq!(status(&store, "tx-1"), NotificationStatus::Success);
        assert_eq!(*channel.delivered.lock().unwrap(), vec!["tx-1".to_string()]);
    }

    #[tokio::test]
    async fn test_malformed_payload_marks_failed_and_errors() {
        let store = seeded_store("tx-1").await;
        let channel = Arc::new(Recording::default());
        let handler = NotificationHandler::new(store.clone(), channel.clone());

        let err = handler.process(&task("tx-1", b"{not json")).await.unwrap_err();

        assert!(matches!(err, AppError::Decode(_)));
        assert_eq!(status(&store, "tx-1"), NotificationStatus::Failed);
        assert!(channel.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_a_no_op() {
        let store = seeded_store("tx-1").await;
        let channel = Arc::new(Recording::default());
        let handler = NotificationHandler::new(store.clone(), channel.clone());

        let first = handler.process(&task("tx-1", GOOD)).await.unwrap();
        let second = handler.process(&task("tx-1", GOOD)).await.unwrap();

        assert_eq!(first, StatusChange::Applied);
        assert_eq!(second, StatusChange::Unchanged);
        assert_eq!(status(&store, "tx-1"), NotificationStatus::Success);
        assert_eq!(channel.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_success_never_overwrites_failed() {
        let store = seeded_store("tx-1").await;
        store
            .update_status_by_transaction_id("tx-1", NotificationStatus::Failed)
            .await
            .unwrap();
        let channel = Arc::new(Recording::default());
        let handler = NotificationHandler::new(store.clone(), channel.clone());

        let change = handler.process(&task("tx-1", GOOD)).await.unwrap();

        assert_eq!(change, StatusChange::Conflict(NotificationStatus::Failed));
        assert_eq!(status(&store, "tx-1"), NotificationStatus::Failed);
        assert!(channel.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delivery_error_leaves_record_processing() {
        let store = seeded_store("tx-1").await;
        let channel = Arc::new(Recording {
            refuse: true,
            ..Recording::default()
        });
        let handler = NotificationHandler::new(store.clone(), channel);

        assert!(handler.process(&task("tx-1", GOOD)).await.is_err());
        assert_eq!(status(&store, "tx-1"), NotificationStatus::Processing);
    }

    #[tokio::test]
    async fn test_missing_record_asks_for_retry_without_delivering() {
        let store = Arc::new(MemoryNotificationStore::new());
        let channel = Arc::new(Recording::default());
        let handler = NotificationHandler::new(store, channel.clone());

        let err = handler.process(&task("tx-unknown", GOOD)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(channel.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_persisted_after_first_attempt_is_delivered_once() {
        let store = Arc::new(MemoryNotificationStore::new());
        let channel = Arc::new(Recording::default());
        let handler = NotificationHandler::new(store.clone(), channel.clone());

        // Consumer wins the race against the dispatcher's insert.
        assert!(handler.process(&task("tx-late", GOOD)).await.is_err());

        store
            .create(NewNotification {
                title: "Alert".to_string(),
                description: "disk full".to_string(),
                payload: GOOD.to_vec(),
                transaction_id: "tx-late".to_string(),
                status: NotificationStatus::Processing,
            })
            .await
            .unwrap();

        assert_eq!(
            handler.process(&task("tx-late", GOOD)).await.unwrap(),
            StatusChange::Applied
        );
        assert_eq!(
            handler.process(&task("tx-late", GOOD)).await.unwrap(),
            StatusChange::Unchanged
        );
        assert_eq!(*channel.delivered.lock().unwrap(), vec!["tx-late".to_string()]);
    }

    #[tokio::test]
    async fn test_task_handler_surface_reports_errors() {
        let store = seeded_store("tx-1").await;
        let handler = NotificationHandler::new(store, Arc::new(LogChannel));

        assert!(handler.handle(&task("tx-1", GOOD)).await.is_ok());
        assert!(handler.handle(&task("tx-1", b"[]")).await.is_err());
    }
}
