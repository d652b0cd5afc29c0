//! Wiring for the processor binary: the queue consumer and the stale
//! notification sweeper, both built from [`AppConfig`].

use std::sync::Arc;
use std::time::Duration;

use pingme_common::config::AppConfig;
use pingme_common::store::NotificationStore;
use pingme_common::types::DISPATCH_NOTIFICATION;
use pingme_engine::handler::{DeliveryChannel, NotificationHandler};
use pingme_engine::sweeper::SweeperConfig;
use pingme_queue::priority::QueuePriorities;
use pingme_queue::server::{ConsumerConfig, ServeMux};

/// Consumer settings from the environment-backed config.
pub fn consumer_config(config: &AppConfig) -> anyhow::Result<ConsumerConfig> {
    let priorities = QueuePriorities::new(config.consumer_queues.clone())?;
    Ok(ConsumerConfig {
        concurrency: config.consumer_concurrency,
        priorities,
        poll_interval: Duration::from_millis(config.consumer_poll_interval_ms),
    })
}

pub fn sweeper_config(config: &AppConfig) -> SweeperConfig {
    SweeperConfig {
        interval: Duration::from_secs(config.sweep_interval_secs),
        stale_after: chrono::Duration::hours(config.stale_after_hours as i64),
        max_concurrency: config.sweeper_max_concurrency,
    }
}

/// Route `dispatch-notification` tasks to the notification handler.
pub fn build_mux(store: Arc<dyn NotificationStore>, channel: Arc<dyn DeliveryChannel>) -> ServeMux {
    let mut mux = ServeMux::new();
    mux.handle(
        DISPATCH_NOTIFICATION,
        Arc::new(NotificationHandler::new(store, channel)),
    );
    mux
}
