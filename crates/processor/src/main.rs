//! PingMe processor: queue consumer and stale notification sweeper.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use pingme_common::config::AppConfig;
use pingme_common::db::{create_pool, run_migrations};
use pingme_common::redis_pool::create_redis_pool;
use pingme_common::store::{NotificationStore, PgNotificationStore};
use pingme_engine::handler::LogChannel;
use pingme_engine::sweeper::Sweeper;
use pingme_queue::broker::RedisBroker;
use pingme_queue::server::ConsumerServer;

use pingme_processor::{build_mux, consumer_config, sweeper_config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pingme_processor=info,pingme_engine=info,pingme_queue=info".into()),
        )
        .json()
        .init();

    tracing::info!("PingMe processor starting...");

    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

    let redis = create_redis_pool(&config.redis_url).await?;

    let store: Arc<dyn NotificationStore> = Arc::new(PgNotificationStore::new(pool));
    let broker = Arc::new(RedisBroker::new(redis));

    let mux = build_mux(store.clone(), Arc::new(LogChannel));
    let consumer = ConsumerServer::new(broker, consumer_config(&config)?);
    let sweeper = Sweeper::new(store, sweeper_config(&config));

    let shutdown = CancellationToken::new();

    let consumer_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { consumer.run(mux, shutdown).await })
    };
    let sweeper_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { sweeper.run(shutdown).await })
    };

    tracing::info!(
        concurrency = config.consumer_concurrency,
        sweep_interval_secs = config.sweep_interval_secs,
        "Consumer and sweeper running"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Received shutdown signal, stopping gracefully...");
    shutdown.cancel();

    let (consumer_result, sweeper_result) = tokio::join!(consumer_task, sweeper_task);
    if let Err(e) = consumer_result {
        tracing::error!(error = %e, "Consumer task panicked");
    }
    if let Err(e) = sweeper_result {
        tracing::error!(error = %e, "Sweeper task panicked");
    }

    tracing::info!("PingMe processor stopped.");
    Ok(())
}
