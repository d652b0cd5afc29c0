//! Notification pipeline: dispatch, queue handling and reconciliation.

pub mod dispatcher;
pub mod handler;
pub mod sweeper;
