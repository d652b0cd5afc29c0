//! PingMe gateway binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use pingme_common::config::AppConfig;
use pingme_common::db::{create_pool, run_migrations};
use pingme_common::redis_pool::create_redis_pool;
use pingme_common::store::PgNotificationStore;
use pingme_engine::dispatcher::Dispatcher;
use pingme_queue::broker::RedisBroker;

use pingme_gateway::routes::create_router;
use pingme_gateway::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("pingme_gateway=debug,pingme_engine=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting PingMe gateway...");

    let config = AppConfig::from_env()?;

    let pool = create_pool(&config.database_url, config.db_max_connections).await?;
    run_migrations(&pool).await?;

    let redis = create_redis_pool(&config.redis_url).await?;

    let store = Arc::new(PgNotificationStore::new(pool));
    let broker = Arc::new(RedisBroker::new(redis));
    let dispatcher = Dispatcher::new(broker, store.clone());
    let state = AppState::new(dispatcher, store);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.gateway_port));
    tracing::info!("Gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Received shutdown signal, stopping gateway...");
        })
        .await?;

    tracing::info!("Gateway stopped");
    Ok(())
}
