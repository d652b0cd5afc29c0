//! Notification record store.
//!
//! The store is the only shared state between the dispatcher, the queue
//! consumer and the reconciliation sweeper. There is no in-process locking:
//! every writer goes through [`NotificationStore::update_status_by_transaction_id`],
//! which only ever moves a record out of `Processing`, so concurrent writers
//! converge on the first terminal status written.

mod memory;
mod postgres;

pub use memory::MemoryNotificationStore;
pub use postgres::PgNotificationStore;

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::types::{NewNotification, NotificationRecord, NotificationStatus, StatusChange};

/// Persistence capability used by every pipeline component.
#[async_trait::async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert a record and return its store-assigned id.
    async fn create(&self, notification: NewNotification) -> Result<i64, AppError>;

    /// Point lookup by internal id.
    async fn get_by_id(&self, id: i64) -> Result<Option<NotificationRecord>, AppError>;

    /// Lookup by broker transaction id.
    async fn get_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Option<NotificationRecord>, AppError>;

    /// Every record currently in `status`, oldest first.
    async fn list_by_status(
        &self,
        status: NotificationStatus,
    ) -> Result<Vec<NotificationRecord>, AppError>;

    /// Records in `status` created strictly before `cutoff`, oldest first.
    async fn list_stale(
        &self,
        status: NotificationStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<NotificationRecord>, AppError>;

    /// Move the record owning `transaction_id` to a terminal `status`.
    ///
    /// Idempotent and monotonic: repeating the same terminal status is
    /// `Unchanged`, a record already in the other terminal status is reported
    /// as `Conflict` and left alone. Asking for `Processing` is a validation
    /// error.
    async fn update_status_by_transaction_id(
        &self,
        transaction_id: &str,
        status: NotificationStatus,
    ) -> Result<StatusChange, AppError>;
}

/// Reject non-terminal targets before touching the store.
pub(crate) fn ensure_terminal(status: NotificationStatus) -> Result<(), AppError> {
    if status.is_terminal() {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "status update target must be terminal, got {}",
            status
        )))
    }
}

/// Classify a no-op update from the record's current status.
pub(crate) fn classify_unapplied(
    current: Option<NotificationStatus>,
    requested: NotificationStatus,
) -> StatusChange {
    match current {
        None => StatusChange::Missing,
        Some(status) if status == requested => StatusChange::Unchanged,
        Some(status) => StatusChange::Conflict(status),
    }
}
