use serde::Deserialize;

/// Global application configuration loaded from environment variables.
///
/// Built once at process start and handed to each component; nothing reads
/// the environment after `from_env` returns.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (task broker)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Port the HTTP gateway binds to (default: 8080)
    pub gateway_port: u16,

    /// Number of concurrent consumer workers (default: 10)
    pub consumer_concurrency: usize,

    /// Weighted consumer queues, highest weight first (default: critical:6, default:3, low:1)
    pub consumer_queues: Vec<(String, u32)>,

    /// How long an idle consumer worker waits before polling again (default: 1000)
    pub consumer_poll_interval_ms: u64,

    /// Reconciliation sweep cadence in seconds (default: 10)
    pub sweep_interval_secs: u64,

    /// Age after which a processing notification is considered stuck (default: 24)
    pub stale_after_hours: u64,

    /// Upper bound on concurrent status updates within one sweep (default: 64)
    pub sweeper_max_concurrency: usize,
}

/// Default weighted queue layout for the consumer.
pub const DEFAULT_CONSUMER_QUEUES: &str = "critical:6,default:3,low:1";

/// Upper bound for `STALE_AFTER_HOURS` (about a century).
pub const MAX_STALE_AFTER_HOURS: u64 = 24 * 365 * 100;

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
            gateway_port: std::env::var("GATEWAY_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("GATEWAY_PORT must be a valid u16"))?,
            consumer_concurrency: std::env::var("CONSUMER_CONCURRENCY")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("CONSUMER_CONCURRENCY must be a valid usize"))?,
            consumer_queues: parse_queue_weights(
                &std::env::var("CONSUMER_QUEUES")
                    .unwrap_or_else(|_| DEFAULT_CONSUMER_QUEUES.to_string()),
            )?,
            consumer_poll_interval_ms: std::env::var("CONSUMER_POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("CONSUMER_POLL_INTERVAL_MS must be a valid u64"))?,
            sweep_interval_secs: std::env::var("SWEEP_INTERVAL_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SWEEP_INTERVAL_SECS must be a valid u64"))?,
            stale_after_hours: std::env::var("STALE_AFTER_HOURS")
                .unwrap_or_else(|_| "24".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("STALE_AFTER_HOURS must be a valid u64"))?,
            sweeper_max_concurrency: std::env::var("SWEEPER_MAX_CONCURRENCY")
                .unwrap_or_else(|_| "64".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("SWEEPER_MAX_CONCURRENCY must be a valid usize"))?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the consumer or the sweeper cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sweep_interval_secs == 0 {
            anyhow::bail!("SWEEP_INTERVAL_SECS must be above zero");
        }
        if self.stale_after_hours == 0 || self.stale_after_hours > MAX_STALE_AFTER_HOURS {
            anyhow::bail!(
                "STALE_AFTER_HOURS must be between 1 and {}",
                MAX_STALE_AFTER_HOURS
            );
        }
        if self.sweeper_max_concurrency == 0 {
            anyhow::bail!("SWEEPER_MAX_CONCURRENCY must be above zero");
        }
        if self.consumer_concurrency == 0 {
            anyhow::bail!("CONSUMER_CONCURRENCY must be above zero");
        }
        if self.consumer_poll_interval_ms == 0 {
            anyhow::bail!("CONSUMER_POLL_INTERVAL_MS must be above zero");
        }
        Ok(())
    }
}

/// Parse a `name:weight` list such as `critical:6,default:3,low:1`.
pub fn parse_queue_weights(raw: &str) -> anyhow::Result<Vec<(String, u32)>> {
    let mut queues = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, weight) = entry
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("queue entry '{}' must look like name:weight", entry))?;
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("queue entry '{}' has an empty name", entry);
        }
        let weight: u32 = weight
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("queue weight in '{}' must be a valid u32", entry))?;
        if weight == 0 {
            anyhow::bail!("queue '{}' must have a weight above zero", name);
        }
        queues.push((name.to_string(), weight));
    }

    if queues.is_empty() {
        anyhow::bail!("at least one consumer queue is required");
    }

    Ok(queues)
}
