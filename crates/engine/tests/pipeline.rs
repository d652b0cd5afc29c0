//! End-to-end pipeline tests over the in-memory store and broker.
//!
//! ```bash
//! cargo test -p pingme-engine --test pipeline
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use pingme_common::error::AppError;
use pingme_common::store::{MemoryNotificationStore, NotificationStore};
use pingme_common::types::{DISPATCH_NOTIFICATION, NotificationPayload, NotificationStatus};
use pingme_engine::dispatcher::{DispatchRequest, Dispatcher};
use pingme_engine::handler::{DeliveryChannel, LogChannel, NotificationHandler};
use pingme_engine::sweeper::{SweepOutcome, Sweeper, SweeperConfig};
use pingme_queue::broker::{Broker, MemoryBroker};
use pingme_queue::server::{ConsumerConfig, ConsumerServer, ServeMux};
use pingme_queue::task::NewTask;

// ============================================================
// Helpers
// ============================================================

struct Pipeline {
    broker: Arc<MemoryBroker>,
    store: Arc<MemoryNotificationStore>,
    dispatcher: Dispatcher,
    consumer: ConsumerServer,
    mux: ServeMux,
}

fn pipeline() -> Pipeline {
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(MemoryNotificationStore::new());

    let dispatcher = Dispatcher::new(broker.clone(), store.clone());
    let consumer = ConsumerServer::new(
        broker.clone(),
        ConsumerConfig {
            poll_interval: Duration::from_millis(5),
            ..ConsumerConfig::default()
        },
    );

    let mut mux = ServeMux::new();
    mux.handle(
        DISPATCH_NOTIFICATION,
        Arc::new(NotificationHandler::new(store.clone(), Arc::new(LogChannel))),
    );

    Pipeline {
        broker,
        store,
        dispatcher,
        consumer,
        mux,
    }
}

fn alert() -> DispatchRequest {
    DispatchRequest {
        title: "Alert".to_string(),
        description: "disk full".to_string(),
        link: "https://x/y".to_string(),
    }
}

#[derive(Default)]
struct CountingChannel {
    deliveries: AtomicUsize,
}

#[async_trait::async_trait]
impl DeliveryChannel for CountingChannel {
    async fn deliver(
        &self,
        _transaction_id: &str,
        _payload: &NotificationPayload,
    ) -> Result<(), AppError> {
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn status_of(store: &MemoryNotificationStore, id: i64) -> NotificationStatus {
    store.get_by_id(id).await.unwrap().unwrap().status
}

// ============================================================
// Scenarios
// ============================================================

#[tokio::test]
async fn test_dispatch_then_consume_marks_success() {
    let p = pipeline();

    let receipt = p.dispatcher.dispatch(alert()).await.unwrap();
    assert_eq!(
        status_of(&p.store, receipt.notification_id).await,
        NotificationStatus::Processing
    );

    let task = p.broker.pending("default").remove(0);
    assert_eq!(task.kind, "dispatch-notification");
    assert_eq!(task.max_retry, 10);
    assert_eq!(task.timeout, Duration::from_secs(180));

    assert!(p.consumer.process_next(&p.mux).await.unwrap());
    assert_eq!(
        status_of(&p.store, receipt.notification_id).await,
        NotificationStatus::Success
    );
    assert_eq!(p.broker.completed().len(), 1);
}

#[tokio::test]
async fn test_redelivered_task_keeps_single_success() {
    let p = pipeline();
    let receipt = p.dispatcher.dispatch(alert()).await.unwrap();

    assert!(p.consumer.process_next(&p.mux).await.unwrap());
    let delivered = p.broker.completed().remove(0);
    p.broker.redeliver(&delivered);
    assert!(p.consumer.process_next(&p.mux).await.unwrap());

    assert_eq!(p.broker.completed().len(), 2);
    assert!(p.broker.dead().is_empty());
    assert_eq!(
        status_of(&p.store, receipt.notification_id).await,
        NotificationStatus::Success
    );
}

#[tokio::test]
async fn test_unconsumed_notification_fails_after_a_day() {
    let p = pipeline();
    let receipt = p.dispatcher.dispatch(alert()).await.unwrap();

    let sweeper = Sweeper::new(p.store.clone(), SweeperConfig::default());

    // Still young: the sweep leaves it alone.
    let report = sweeper.sweep(Utc::now()).await.unwrap();
    assert_eq!(report.outcome(), SweepOutcome::Idle);

    // A day and a bit later, nobody consumed the task.
    let later = Utc::now() + chrono::Duration::hours(24) + chrono::Duration::minutes(1);
    let report = sweeper.sweep(later).await.unwrap();
    assert_eq!(report.outcome(), SweepOutcome::AllSucceeded);
    assert_eq!(
        status_of(&p.store, receipt.notification_id).await,
        NotificationStatus::Failed
    );

    // A late consumer cannot resurrect the record.
    assert!(p.consumer.process_next(&p.mux).await.unwrap());
    assert_eq!(
        status_of(&p.store, receipt.notification_id).await,
        NotificationStatus::Failed
    );
}

#[tokio::test]
async fn test_consumer_and_sweeper_run_side_by_side() {
    let p = pipeline();

    let mut ids = Vec::new();
    for _ in 0..25 {
        ids.push(p.dispatcher.dispatch(alert()).await.unwrap().notification_id);
    }

    let shutdown = CancellationToken::new();
    let consumer = {
        let server = p.consumer.clone();
        let mux = p.mux.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server.run(mux, shutdown).await })
    };
    let sweeper = {
        let sweeper = Sweeper::new(
            p.store.clone(),
            SweeperConfig {
                interval: Duration::from_millis(20),
                ..SweeperConfig::default()
            },
        );
        let shutdown = shutdown.clone();
        tokio::spawn(async move { sweeper.run(shutdown).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while p.broker.completed().len() < ids.len() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("consumer did not drain the queue");

    shutdown.cancel();
    consumer.await.unwrap();
    sweeper.await.unwrap();

    for id in ids {
        assert_eq!(status_of(&p.store, id).await, NotificationStatus::Success);
    }
}

#[tokio::test]
async fn test_task_without_tracking_record_is_never_delivered() {
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(MemoryNotificationStore::new());
    let channel = Arc::new(CountingChannel::default());
    let consumer = ConsumerServer::new(broker.clone(), ConsumerConfig::default());

    let mut mux = ServeMux::new();
    mux.handle(
        DISPATCH_NOTIFICATION,
        Arc::new(NotificationHandler::new(store.clone(), channel.clone())),
    );

    // Enqueued, but the dispatcher never managed to persist the record.
    let payload = NotificationPayload {
        title: "Alert".to_string(),
        description: "disk full".to_string(),
        link: "https://x/y".to_string(),
    }
    .to_bytes()
    .unwrap();
    broker
        .enqueue(NewTask::new(DISPATCH_NOTIFICATION, payload).max_retry(10))
        .await
        .unwrap();

    while consumer.process_next(&mux).await.unwrap() {}

    assert_eq!(channel.deliveries.load(Ordering::SeqCst), 0);
    let dead = broker.dead();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].0.retried, 10);
    assert!(store.is_empty());
}
