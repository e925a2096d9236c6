//! Worker pool: long-polls the queue and runs one processor task per item.
//!
//! Concurrency is bounded by a semaphore sized to the configured worker
//! count. A per-item watchdog extends the visibility timeout when
//! processing approaches 70% of it, so slow provider calls do not cause
//! premature redelivery. Shutdown is graceful: stop polling, drain
//! in-flight tasks for the grace period, then return; anything not acked
//! by then is redelivered by the queue.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use nr_common::ReceivedItem;
use nr_queue::{QueueConsumer, QueueError};

use crate::processor::{ProcessOutcome, Processor};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    pub visibility_timeout_s: u32,
    /// Seconds added on each watchdog extension.
    pub visibility_extension_s: u32,
    pub shutdown_grace: Duration,
    /// Pause between polls that return nothing. The SQS consumer long-polls
    /// server-side; this only matters for non-blocking queue impls.
    pub idle_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            visibility_timeout_s: 30,
            visibility_extension_s: 30,
            shutdown_grace: Duration::from_secs(30),
            idle_backoff: Duration::from_millis(100),
        }
    }
}

pub struct WorkerPool {
    consumer: Arc<dyn QueueConsumer>,
    processor: Arc<Processor>,
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(
        consumer: Arc<dyn QueueConsumer>,
        processor: Arc<Processor>,
        config: WorkerPoolConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        Self {
            consumer,
            processor,
            config,
            semaphore,
        }
    }

    /// Run until the shutdown signal fires, then drain.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            queue = %self.consumer.identifier(),
            concurrency = self.config.concurrency,
            "Worker pool started"
        );

        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            // Reap finished tasks so the set does not grow unbounded.
            while tasks.try_join_next().is_some() {}

            let polled = tokio::select! {
                _ = shutdown.recv() => break,
                polled = self.consumer.poll(self.config.concurrency as u32) => polled,
            };

            match polled {
                Ok(items) if items.is_empty() => {
                    tokio::time::sleep(self.config.idle_backoff).await;
                }
                Ok(items) => {
                    for received in items {
                        let permit = match self.semaphore.clone().acquire_owned().await {
                            Ok(p) => p,
                            Err(_) => return,
                        };

                        let consumer = self.consumer.clone();
                        let processor = self.processor.clone();
                        let visibility = self.config.visibility_timeout_s;
                        let extension = self.config.visibility_extension_s;

                        tasks.spawn(async move {
                            let _permit = permit;
                            handle_item(consumer, processor, received, visibility, extension)
                                .await;
                        });
                    }
                }
                Err(QueueError::Stopped) => break,
                Err(e) => {
                    error!(error = %e, "Queue poll failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!("Worker pool draining");
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                grace_secs = self.config.shutdown_grace.as_secs(),
                "Shutdown grace elapsed with tasks in flight; queue will redeliver them"
            );
            tasks.abort_all();
        }
        info!("Worker pool stopped");
    }
}

/// Process one received item, extending visibility while the handler runs
/// long, then map the outcome onto the queue acknowledgment model.
async fn handle_item(
    consumer: Arc<dyn QueueConsumer>,
    processor: Arc<Processor>,
    received: ReceivedItem,
    visibility_timeout_s: u32,
    extension_s: u32,
) {
    let extend_after = Duration::from_secs_f64(visibility_timeout_s as f64 * 0.7);

    let process_fut = processor.process(&received.item);
    tokio::pin!(process_fut);

    let result = loop {
        tokio::select! {
            result = &mut process_fut => break result,
            _ = tokio::time::sleep(extend_after) => {
                debug!(
                    notification_id = %received.item.notification_id,
                    extension_s = extension_s,
                    "Handler approaching visibility timeout, extending"
                );
                if let Err(e) = consumer
                    .extend_visibility(&received.receipt_handle, extension_s)
                    .await
                {
                    warn!(error = %e, "Failed to extend visibility");
                }
            }
        }
    };

    match result {
        Ok(ProcessOutcome::RateLimited { delay_seconds }) => {
            if let Err(e) = consumer
                .defer(&received.receipt_handle, Some(delay_seconds))
                .await
            {
                error!(error = %e, "Failed to defer rate-limited item");
            }
        }
        Ok(ProcessOutcome::FailedPermanently) => {
            // Deliberately left unacked: visibility expiry redelivers it and
            // the queue's redrive policy moves it to the DLQ.
            debug!(
                notification_id = %received.item.notification_id,
                "Terminal failure, leaving item for DLQ routing"
            );
        }
        Ok(outcome) => {
            debug_assert!(outcome.should_ack());
            if let Err(e) = consumer.ack(&received.receipt_handle).await {
                error!(
                    notification_id = %received.item.notification_id,
                    error = %e,
                    "Failed to ack processed item"
                );
            }
        }
        Err(e) => {
            // Internal error (store outage etc): leave unacked so the queue
            // retries after the visibility timeout.
            error!(
                notification_id = %received.item.notification_id,
                trace_id = %received.item.trace_id,
                error = %e,
                "Processor failed, item will be redelivered"
            );
        }
    }
}
