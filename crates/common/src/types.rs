use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Message pattern routed to the notification handler.
pub const DISPATCH_NOTIFICATION: &str = "dispatch-notification";

/// Lifecycle status of a notification.
///
/// `Processing` is the only non-terminal state. A record moves to
/// `Success` or `Failed` at most once and never leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationStatus {
    Processing,
    Success,
    Failed,
}

impl NotificationStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, NotificationStatus::Processing)
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationStatus::Processing => write!(f, "PROCESSING"),
            NotificationStatus::Success => write!(f, "SUCCESS"),
            NotificationStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Self-contained data a delivery channel needs.
///
/// Travels inside the broker task and is persisted verbatim in the
/// record's `payload` column, so both copies always have the same shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub description: String,
    pub link: String,
}

impl NotificationPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>, AppError> {
        serde_json::to_vec(self).map_err(|e| AppError::Internal(format!("encode payload: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AppError> {
        serde_json::from_slice(bytes).map_err(|e| AppError::Decode(format!("notification payload: {}", e)))
    }
}

/// A durable record tracking one notification's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationRecord {
    pub id: i64,
    pub title: String,
    pub description: String,
    /// JSON encoding of a [`NotificationPayload`].
    pub payload: Vec<u8>,
    /// Broker-assigned task id.
    pub transaction_id: String,
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
}

impl NotificationRecord {
    pub fn decode_payload(&self) -> Result<NotificationPayload, AppError> {
        NotificationPayload::from_bytes(&self.payload)
    }
}

/// Insert parameters for a new record. `id` and `created_at` come from the store.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub title: String,
    pub description: String,
    pub payload: Vec<u8>,
    pub transaction_id: String,
    pub status: NotificationStatus,
}

/// What a conditional status update actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    /// The record moved from `Processing` to the requested status.
    Applied,
    /// The record already had the requested status.
    Unchanged,
    /// The record is terminal with a different status and was left alone.
    Conflict(NotificationStatus),
    /// No record carries this transaction id.
    Missing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!NotificationStatus::Processing.is_terminal());
        assert!(NotificationStatus::Success.is_terminal());
        assert!(NotificationStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(NotificationStatus::Processing.to_string(), "PROCESSING");
        assert_eq!(
            serde_json::to_string(&NotificationStatus::Failed).unwrap(),
            "\"FAILED\""
        );
    }

    #[test]
    fn test_payload_requires_every_field() {
        let err = NotificationPayload::from_bytes(br#"{"title":"Alert","link":"https://x/y"}"#)
            .unwrap_err();
        assert!(matches!(err, AppError::Decode(_)));

        let payload = NotificationPayload::from_bytes(
            br#"{"title":"Alert","description":"disk full","link":"https://x/y"}"#,
        )
        .unwrap();
        assert_eq!(payload.description, "disk full");
    }
}
