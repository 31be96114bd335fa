//! Retry sweeper
//!
//! Webhook deliveries are acknowledged whether or not dispatch succeeded.
//! Failed events are re-dispatched here with exponential backoff until they
//! succeed or reach the attempt ceiling and are dead-lettered.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::engine::{IngestOutcome, WebhookEngine};
use crate::repos::event_repo;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first delivery included
    pub max_attempts: i32,
    /// Delay after the first failure (doubles on each retry)
    pub initial_backoff: Duration,
    /// Maximum backoff duration to cap exponential growth
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(3600),
        }
    }
}

impl RetryConfig {
    /// Delay before the attempt following `attempt` failed attempts
    pub fn backoff_for(&self, attempt: i32) -> Duration {
        let doublings = (attempt.max(1) - 1).min(30) as u32;
        self.initial_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub processed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
}

/// Re-dispatch one batch of due events
pub async fn sweep_once(engine: &WebhookEngine, batch_size: i64) -> Result<SweepReport, sqlx::Error> {
    let due = event_repo::due_for_retry(engine.pool(), batch_size).await?;
    let mut report = SweepReport::default();

    for event_id in due {
        let outcome = match engine.retry_stored(&event_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(event_id = %event_id, error = %e, "Sweeper could not re-dispatch event");
                report.skipped += 1;
                continue;
            }
        };

        let label = match outcome {
            IngestOutcome::Processed | IngestOutcome::Ignored => {
                report.processed += 1;
                "processed"
            }
            IngestOutcome::Failed => {
                report.failed += 1;
                "failed"
            }
            IngestOutcome::DeadLettered => {
                report.dead_lettered += 1;
                "dead_lettered"
            }
            IngestOutcome::AlreadyProcessed | IngestOutcome::InFlight => {
                report.skipped += 1;
                "skipped"
            }
        };
        engine
            .metrics()
            .sweeper_redispatch_total
            .with_label_values(&[label])
            .inc();
    }

    Ok(report)
}

/// Background task that re-dispatches failed events on a fixed interval
pub async fn run_sweeper(engine: Arc<WebhookEngine>, interval: Duration, batch_size: i64) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match sweep_once(&engine, batch_size).await {
            Ok(report) if report == SweepReport::default() => {}
            Ok(report) => {
                tracing::info!(
                    processed = report.processed,
                    failed = report.failed,
                    dead_lettered = report.dead_lettered,
                    skipped = report.skipped,
                    "Sweeper pass complete"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "Sweeper pass failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_from_initial() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(3600),
        };
        assert_eq!(config.backoff_for(1), Duration::from_secs(30));
        assert_eq!(config.backoff_for(2), Duration::from_secs(60));
        assert_eq!(config.backoff_for(3), Duration::from_secs(120));
        assert_eq!(config.backoff_for(4), Duration::from_secs(240));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff_for(10), Duration::from_secs(3600));
        assert_eq!(config.backoff_for(i32::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn test_backoff_treats_nonpositive_attempts_as_first() {
        let config = RetryConfig::default();
        assert_eq!(config.backoff_for(0), config.initial_backoff);
        assert_eq!(config.backoff_for(-3), config.initial_backoff);
    }
}
