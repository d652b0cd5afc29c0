//! Reconciliation sweeper.
//!
//! A notification whose task the broker never resolved stays `Processing`
//! forever. On every tick the sweeper finds `Processing` records older than
//! the staleness threshold and marks them `Failed`, one concurrent update per
//! record. A run waits for all of its updates and never retries inside the
//! same run; anything that failed is picked up again on the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use pingme_common::error::AppError;
use pingme_common::store::NotificationStore;
use pingme_common::types::{NotificationStatus, StatusChange};

/// Sweeper tuning.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// A `Processing` record strictly older than this is stale.
    pub stale_after: chrono::Duration,
    /// Maximum concurrent status updates within one sweep.
    pub max_concurrency: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            stale_after: chrono::Duration::hours(24),
            max_concurrency: 64,
        }
    }
}

/// Whether a record created at `created_at` is stale at `now`.
pub fn is_stale(created_at: DateTime<Utc>, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
    now - created_at > stale_after
}

/// How a sweep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Nothing was stale; no updates were issued.
    Idle,
    /// Every stale record was updated (or was already terminal).
    AllSucceeded,
    /// At least one update failed; it will be retried next tick.
    PartialFailure,
}

/// One update that did not go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepFailure {
    /// `None` when the update task itself aborted.
    pub transaction_id: Option<String>,
    pub error: String,
}

/// Totals for a single sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stale: usize,
    /// Records moved from `Processing` to `Failed`.
    pub marked_failed: usize,
    /// Records that reached a terminal status between the scan and the update.
    pub already_terminal: usize,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    pub fn outcome(&self) -> SweepOutcome {
        if self.stale == 0 {
            SweepOutcome::Idle
        } else if self.failures.is_empty() {
            SweepOutcome::AllSucceeded
        } else {
            SweepOutcome::PartialFailure
        }
    }
}

/// Periodic job failing notifications stuck in `Processing`.
pub struct Sweeper {
    store: Arc<dyn NotificationStore>,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(store: Arc<dyn NotificationStore>, config: SweeperConfig) -> Self {
        Self { store, config }
    }

    /// Tick every `interval` until `shutdown` is cancelled.
    ///
    /// The first sweep runs immediately. A sweep in progress is allowed to
    /// finish before the loop observes cancellation.
    pub async fn run(&self, shutdown: CancellationToken) {
        if self.config.interval.is_zero() {
            tracing::error!("Sweep interval must be above zero, sweeper not started");
            return;
        }

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            stale_after_hours = self.config.stale_after.num_hours(),
            "Reconciliation sweeper started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.sweep(Utc::now()).await {
                tracing::warn!(error = %e, "Sweep could not scan notifications, retrying next tick");
            }
        }

        tracing::info!("Reconciliation sweeper stopped");
    }

    /// Run one sweep as of `now`.
    ///
    /// Only a failed scan is an error. Failed updates are reported in the
    /// returned [`SweepReport`].
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, AppError> {
        let cutoff = now - self.config.stale_after;
        let stale: Vec<_> = self
            .store
            .list_stale(NotificationStatus::Processing, cutoff)
            .await?
            .into_iter()
            .filter(|record| is_stale(record.created_at, now, self.config.stale_after))
            .collect();

        if stale.is_empty() {
            tracing::debug!("No stale processing notifications");
            return Ok(SweepReport::default());
        }

        let mut report = SweepReport {
            stale: stale.len(),
            ..SweepReport::default()
        };

        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut updates = JoinSet::new();

        for record in stale {
            let store = Arc::clone(&self.store);
            let permits = Arc::clone(&permits);
            updates.spawn(async move {
                let _permit = permits.acquire_owned().await;
                tracing::debug!(transaction_id = %record.transaction_id, "Marking stale notification failed");
                let result = store
                    .update_status_by_transaction_id(
                        &record.transaction_id,
                        NotificationStatus::Failed,
                    )
                    .await;
                (record.transaction_id, result)
            });
        }

        while let Some(joined) = updates.join_next().await {
            match joined {
                Ok((_, Ok(StatusChange::Applied))) => report.marked_failed += 1,
                Ok((_, Ok(StatusChange::Unchanged | StatusChange::Conflict(_)))) => {
                    report.already_terminal += 1;
                }
                Ok((transaction_id, Ok(StatusChange::Missing))) => {
                    report.failures.push(SweepFailure {
                        transaction_id: Some(transaction_id),
                        error: "record disappeared before its update".to_string(),
                    });
                }
                Ok((transaction_id, Err(e))) => {
                    tracing::warn!(transaction_id = %transaction_id, error = %e, "Failed to mark notification failed");
                    report.failures.push(SweepFailure {
                        transaction_id: Some(transaction_id),
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Sweep update task aborted");
                    report.failures.push(SweepFailure {
                        transaction_id: None,
                        error: e.to_string(),
                    });
                }
            }
        }

        match report.outcome() {
            SweepOutcome::PartialFailure => tracing::warn!(
                stale = report.stale,
                marked_failed = report.marked_failed,
                failed = report.failures.len(),
                "Some stale notifications failed to update"
            ),
            _ => tracing::info!(
                stale = report.stale,
                marked_failed = report.marked_failed,
                already_terminal = report.already_terminal,
                "All stale notifications marked as failed"
            ),
        }

        Ok(report)
    }
}
