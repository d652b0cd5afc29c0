//! Notification intake and lookup routes.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pingme_common::error::AppError;
use pingme_common::types::{NotificationPayload, NotificationRecord, NotificationStatus};
use pingme_engine::dispatcher::DispatchRequest;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/notification", post(send_notification))
        .route("/notification/{id}", get(get_notification))
        .route("/notifications", get(list_notifications))
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub success: bool,
    pub task_id: String,
    pub queue: String,
    pub notification_id: i64,
}

/// A stored record with its payload decoded for display.
#[derive(Debug, Serialize)]
pub struct NotificationView {
    pub id: i64,
    pub title: String,
    pub description: String,
    /// `None` when the stored bytes no longer decode.
    pub payload: Option<NotificationPayload>,
    pub transaction_id: String,
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
}

impl From<NotificationRecord> for NotificationView {
    fn from(record: NotificationRecord) -> Self {
        let payload = record.decode_payload().ok();
        Self {
            id: record.id,
            title: record.title,
            description: record.description,
            payload,
            transaction_id: record.transaction_id,
            status: record.status,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_status")]
    pub status: NotificationStatus,
}

fn default_status() -> NotificationStatus {
    NotificationStatus::Processing
}

/// POST /notification: Enqueue a notification and record it as PROCESSING.
async fn send_notification(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<DispatchResponse>, AppError> {
    let request = DispatchRequest::from_slice(&body)?;
    let receipt = state.dispatcher.dispatch(request).await?;

    Ok(Json(DispatchResponse {
        success: true,
        task_id: receipt.task_id,
        queue: receipt.queue,
        notification_id: receipt.notification_id,
    }))
}

/// GET /notification/{id}: Fetch a single notification record.
async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<NotificationView>, AppError> {
    let record = state
        .store
        .get_by_id(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;
    Ok(Json(record.into()))
}

/// GET /notifications?status=: List records in one status, oldest first.
async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<NotificationView>>, AppError> {
    let records = state.store.list_by_status(query.status).await?;
    Ok(Json(records.into_iter().map(NotificationView::from).collect()))
}
