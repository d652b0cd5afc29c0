//! Shared application state for the Axum gateway.

use std::sync::Arc;

use pingme_common::store::NotificationStore;
use pingme_engine::dispatcher::Dispatcher;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<dyn NotificationStore>,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher, store: Arc<dyn NotificationStore>) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            store,
        }
    }
}
