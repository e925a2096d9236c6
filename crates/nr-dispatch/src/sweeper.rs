//! Time-driven pollers: retry sweeper, schedule promoter, rate-limit
//! janitor, and the startup reconciliation pass.
//!
//! Both sweepers re-inject due rows by invoking the processor directly, one
//! at a time per tick. The retry pass is intentionally serial to avoid
//! stampedes; concurrent processing happens only through the queue path.

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use nr_common::{Clock, DeliveryStatus, WorkItem};
use nr_store::{NotificationStore, RateLimitStore, StatePatch, StoreError};

use crate::processor::Processor;
use crate::Result;

/// Periodically sweeps failed rows whose `next_retry_at` has passed.
pub struct RetrySweeper {
    store: Arc<dyn NotificationStore>,
    processor: Arc<Processor>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    batch_size: i64,
}

impl RetrySweeper {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        processor: Arc<Processor>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            processor,
            clock,
            interval,
            batch_size: 100,
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_ms = self.interval.as_millis(), "Retry sweeper started");
        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Retry sweep failed");
                    }
                }
            }
        }
        info!("Retry sweeper stopped");
    }

    /// One sweep. Returns the number of rows re-injected.
    pub async fn tick(&self) -> Result<usize> {
        let due = self
            .store
            .find_due_retries(self.clock.now(), self.batch_size)
            .await?;

        if due.is_empty() {
            return Ok(0);
        }

        metrics::gauge!("sweeper.due_retries").set(due.len() as f64);
        debug!(count = due.len(), "Re-injecting due retries");

        let mut processed = 0;
        for notification in due {
            let item = WorkItem::from_notification(&notification);
            match self.processor.process(&item).await {
                Ok(outcome) => {
                    processed += 1;
                    metrics::counter!("sweeper.retries_processed_total").increment(1);
                    debug!(
                        notification_id = %notification.id,
                        outcome = ?outcome,
                        "Retry processed"
                    );
                }
                Err(e) => {
                    // Leave the row as-is; the next tick picks it up again.
                    error!(
                        notification_id = %notification.id,
                        error = %e,
                        "Retry re-injection failed"
                    );
                }
            }
        }

        Ok(processed)
    }
}

/// Periodically releases future-dated rows whose time has come.
pub struct SchedulePromoter {
    store: Arc<dyn NotificationStore>,
    processor: Arc<Processor>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    batch_size: i64,
}

impl SchedulePromoter {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        processor: Arc<Processor>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            processor,
            clock,
            interval,
            batch_size: 100,
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.interval.as_millis(),
            "Schedule promoter started"
        );
        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Scheduled sweep failed");
                    }
                }
            }
        }
        info!("Schedule promoter stopped");
    }

    /// One sweep: promote each due row scheduled -> queued, then process it
    /// directly, mirroring the retry pass.
    pub async fn tick(&self) -> Result<usize> {
        let due = self
            .store
            .find_due_scheduled(self.clock.now(), self.batch_size)
            .await?;

        if due.is_empty() {
            return Ok(0);
        }

        metrics::gauge!("sweeper.due_scheduled").set(due.len() as f64);

        let mut promoted = 0;
        for notification in due {
            match self
                .store
                .transition(notification.id, DeliveryStatus::Queued, StatePatch::default())
                .await
            {
                Ok(queued) => {
                    promoted += 1;
                    metrics::counter!("sweeper.scheduled_promoted_total").increment(1);
                    let item = WorkItem::from_notification(&queued);
                    if let Err(e) = self.processor.process(&item).await {
                        error!(
                            notification_id = %queued.id,
                            error = %e,
                            "Processing promoted notification failed"
                        );
                    }
                }
                // Lost a promotion race with another instance; that copy
                // owns the row now.
                Err(StoreError::IllegalTransition { .. }) => {
                    debug!(notification_id = %notification.id, "Already promoted elsewhere");
                }
                Err(e) => {
                    error!(notification_id = %notification.id, error = %e, "Promotion failed");
                }
            }
        }

        Ok(promoted)
    }
}

/// Hourly cleanup of rate-limit windows past the retention horizon.
pub struct RateLimitJanitor {
    rate_limits: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    retention: ChronoDuration,
}

impl RateLimitJanitor {
    pub fn new(rate_limits: Arc<dyn RateLimitStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            rate_limits,
            clock,
            interval: Duration::from_secs(3600),
            retention: ChronoDuration::days(7),
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let horizon = self.clock.now() - self.retention;
                    match self.rate_limits.prune(horizon).await {
                        Ok(0) => {}
                        Ok(removed) => info!(removed = removed, "Pruned rate-limit windows"),
                        Err(e) => warn!(error = %e, "Rate-limit prune failed"),
                    }
                }
            }
        }
    }
}

/// Startup pass: queued rows last touched more than a visibility timeout
/// ago most likely lost their enqueue (persist succeeded, publish failed).
/// Stamping `next_retry_at = now` hands them to the retry sweeper.
pub async fn reconcile_on_start(
    store: &dyn NotificationStore,
    clock: &dyn Clock,
    visibility_timeout: Duration,
) -> Result<u64> {
    let cutoff = clock.now()
        - ChronoDuration::from_std(visibility_timeout).unwrap_or_else(|_| ChronoDuration::seconds(30));

    let stamped = store.reconcile_stuck_queued(cutoff).await?;
    if stamped > 0 {
        info!(count = stamped, "Reconciled queued rows with no live queue item");
    }
    Ok(stamped)
}
