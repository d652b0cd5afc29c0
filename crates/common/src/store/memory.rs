use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::types::{NewNotification, NotificationRecord, NotificationStatus, StatusChange};

use super::{NotificationStore, classify_unapplied, ensure_terminal};

/// In-process record store with the same update semantics as Postgres.
///
/// Used by the test suites and for running the pipeline without a database.
#[derive(Default)]
pub struct MemoryNotificationStore {
    records: Mutex<Vec<NotificationRecord>>,
    update_calls: AtomicUsize,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a record's creation time.
    pub fn set_created_at(&self, id: i64, created_at: DateTime<Utc>) -> bool {
        let mut records = self.lock();
        match records.iter_mut().find(|r| r.id == id) {
            Some(record) => {
                record.created_at = created_at;
                true
            }
            None => false,
        }
    }

    /// Look a record up by transaction id.
    pub fn find_by_transaction_id(&self, transaction_id: &str) -> Option<NotificationRecord> {
        self.lock()
            .iter()
            .find(|r| r.transaction_id == transaction_id)
            .cloned()
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `update_status_by_transaction_id` calls received so far.
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<NotificationRecord>> {
        // A poisoned lock only means a test panicked mid-write; the data is still usable.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn create(&self, notification: NewNotification) -> Result<i64, AppError> {
        let mut records = self.lock();

        if records
            .iter()
            .any(|r| r.transaction_id == notification.transaction_id)
        {
            return Err(AppError::Validation(format!(
                "transaction id {} is already tracked",
                notification.transaction_id
            )));
        }

        let id = records.len() as i64 + 1;
        records.push(NotificationRecord {
            id,
            title: notification.title,
            description: notification.description,
            payload: notification.payload,
            transaction_id: notification.transaction_id,
            status: notification.status,
            created_at: Utc::now(),
        });

        Ok(id)
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<NotificationRecord>, AppError> {
        Ok(self.lock().iter().find(|r| r.id == id).cloned())
    }

    async fn get_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<NotificationRecord>, AppError> {
        Ok(self.find_by_transaction_id(transaction_id))
    }

    async fn list_by_status(
        &self,
        status: NotificationStatus,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        let mut matching: Vec<NotificationRecord> = self
            .lock()
            .iter()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.created_at);
        Ok(matching)
    }

    async fn list_stale(
        &self,
        status: NotificationStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<NotificationRecord>, AppError> {
        let mut matching: Vec<NotificationRecord> = self
            .lock()
            .iter()
            .filter(|r| r.status == status && r.created_at < cutoff)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.created_at);
        Ok(matching)
    }

    async fn update_status_by_transaction_id(
        &self,
        transaction_id: &str,
        status: NotificationStatus,
    ) -> Result<StatusChange, AppError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        ensure_terminal(status)?;

        let mut records = self.lock();
        let record = records
            .iter_mut()
            .find(|r| r.transaction_id == transaction_id);

        match record {
            Some(record) if record.status == NotificationStatus::Processing => {
                record.status = status;
                Ok(StatusChange::Applied)
            }
            other => Ok(classify_unapplied(other.map(|r| r.status), status)),
        }
    }
}
