//! HTTP front door for notification dispatch.
//!
//! Endpoints:
//! - POST /notification: validate, enqueue and record a notification
//! - GET  /notification/{id}: look up a notification's lifecycle status
//! - GET  /notifications?status=: list notifications in one status
//! - GET  /health

pub mod routes;
pub mod state;
