//! Message processor: the send path's single writer.
//!
//! Input is a [`WorkItem`]; the processor rechecks the per-recipient rate
//! limit, moves the row to `processing` with a CAS transition, performs the
//! provider send, and records exactly one delivery-log row per attempt.
//! Every failure is classified before it touches state: transient failures
//! with remaining budget get a `next_retry_at`, everything else fails the
//! row terminally.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use async_trait::async_trait;
use nr_common::{backoff::RetryPolicy, Clock, DeliveryStatus, NotificationPayload, WorkItem};
use nr_store::{NewDeliveryLog, NotificationStore, RateLimitStore, StatePatch, StoreError};
use nr_whatsapp::{SendError, SendReceipt, WhatsAppClient};

use crate::Result;

/// Outbound provider seam. The worker binary plugs in [`WhatsAppClient`];
/// tests plug in scripted fakes.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(
        &self,
        recipient: &str,
        payload: &NotificationPayload,
    ) -> std::result::Result<SendReceipt, SendError>;
}

#[async_trait]
impl Sender for WhatsAppClient {
    async fn send(
        &self,
        recipient: &str,
        payload: &NotificationPayload,
    ) -> std::result::Result<SendReceipt, SendError> {
        WhatsAppClient::send(self, recipient, payload).await
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub retry_policy: RetryPolicy,
    /// Per-recipient hourly cap rechecked before every send.
    pub rate_limit_per_hour: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            rate_limit_per_hour: 10,
        }
    }
}

/// What the queue layer should do with the delivered item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Accepted by the provider; ack.
    Sent,
    /// Row already advanced past the send (duplicate delivery); ack.
    Duplicate,
    /// Row no longer exists; nothing to do; ack.
    Skipped,
    /// Transient failure, retry scheduled through the sweeper; ack.
    RetryScheduled { next_retry_at: DateTime<Utc> },
    /// Recipient over quota; defer until the window rolls over.
    RateLimited { delay_seconds: u32 },
    /// Terminal failure. Not acked: visibility redeliveries route the
    /// item to the DLQ for out-of-band review.
    FailedPermanently,
}

impl ProcessOutcome {
    pub fn should_ack(&self) -> bool {
        matches!(
            self,
            ProcessOutcome::Sent
                | ProcessOutcome::Duplicate
                | ProcessOutcome::Skipped
                | ProcessOutcome::RetryScheduled { .. }
        )
    }
}

pub struct Processor {
    store: Arc<dyn NotificationStore>,
    rate_limits: Arc<dyn RateLimitStore>,
    sender: Arc<dyn Sender>,
    clock: Arc<dyn Clock>,
    config: ProcessorConfig,
}

impl Processor {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        rate_limits: Arc<dyn RateLimitStore>,
        sender: Arc<dyn Sender>,
        clock: Arc<dyn Clock>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            rate_limits,
            sender,
            clock,
            config,
        }
    }

    pub async fn process(&self, item: &WorkItem) -> Result<ProcessOutcome> {
        let Some(current) = self.store.find_by_id(item.notification_id).await? else {
            warn!(
                notification_id = %item.notification_id,
                trace_id = %item.trace_id,
                "Work item references a missing notification, dropping"
            );
            return Ok(ProcessOutcome::Skipped);
        };

        // In-flight duplicate policy: anything at or past `sent` is done;
        // a terminally failed row stays unacked so the queue can DLQ it.
        match current.status {
            DeliveryStatus::Sent | DeliveryStatus::Delivered | DeliveryStatus::Read => {
                debug!(
                    notification_id = %current.id,
                    status = %current.status,
                    "Duplicate delivery for an already-sent notification"
                );
                return Ok(ProcessOutcome::Duplicate);
            }
            DeliveryStatus::Failed if current.is_terminally_failed() => {
                return Ok(ProcessOutcome::FailedPermanently);
            }
            _ => {}
        }

        // CAS into processing. Losing the race means another worker
        // advanced the row in the meantime; treat like a duplicate.
        let current = match self
            .store
            .transition(current.id, DeliveryStatus::Processing, StatePatch::default())
            .await
        {
            Ok(n) => n,
            Err(StoreError::IllegalTransition { .. }) => {
                debug!(notification_id = %item.notification_id, "Lost transition race, skipping");
                return Ok(ProcessOutcome::Duplicate);
            }
            Err(e) => return Err(e.into()),
        };

        if !self
            .rate_limits
            .check(&current.recipient, self.config.rate_limit_per_hour)
            .await?
        {
            return self.defer_rate_limited(&current).await;
        }

        let started = Instant::now();
        let send_result = self.sender.send(&current.recipient, &current.payload).await;
        let latency_ms = started.elapsed().as_millis() as i64;

        let attempt = current.attempt_number + 1;
        let now = self.clock.now();

        match send_result {
            Ok(receipt) => {
                self.store
                    .append_log(NewDeliveryLog {
                        notification_id: current.id,
                        attempt,
                        status: DeliveryStatus::Sent,
                        provider_message_id: Some(receipt.provider_message_id.clone()),
                        error_code: None,
                        error_message: None,
                        latency_ms: Some(latency_ms),
                        response: Some(receipt.raw_response.clone()),
                    })
                    .await?;

                self.store
                    .transition(
                        current.id,
                        DeliveryStatus::Sent,
                        StatePatch {
                            provider_message_id: Some(receipt.provider_message_id.clone()),
                            sent_at: Some(now),
                            // A retried row carries a stale retry time.
                            next_retry_at: Some(None),
                            increment_attempt: true,
                            ..Default::default()
                        },
                    )
                    .await?;

                metrics::counter!("dispatch.sent_total").increment(1);
                info!(
                    notification_id = %current.id,
                    trace_id = %current.trace_id,
                    provider_message_id = %receipt.provider_message_id,
                    attempt = attempt,
                    latency_ms = latency_ms,
                    "Notification sent"
                );
                Ok(ProcessOutcome::Sent)
            }
            Err(e) => {
                self.store
                    .append_log(NewDeliveryLog {
                        notification_id: current.id,
                        attempt,
                        status: DeliveryStatus::Failed,
                        provider_message_id: None,
                        error_code: e.code().map(|c| c.to_string()),
                        error_message: Some(e.message().to_string()),
                        latency_ms: Some(latency_ms),
                        response: e.raw_response().cloned(),
                    })
                    .await?;

                if e.is_transient() && attempt < current.max_attempts {
                    self.schedule_retry(&current, &e, attempt, now).await
                } else {
                    self.fail_permanently(&current, &e, attempt, now).await
                }
            }
        }
    }

    async fn defer_rate_limited(
        &self,
        current: &nr_common::Notification,
    ) -> Result<ProcessOutcome> {
        let delay_seconds = self
            .rate_limits
            .retry_after_seconds(&current.recipient, self.config.rate_limit_per_hour)
            .await?
            .unwrap_or(3600)
            .clamp(1, 3600) as u32;

        self.store
            .append_log(NewDeliveryLog {
                notification_id: current.id,
                attempt: current.attempt_number,
                status: DeliveryStatus::RateLimited,
                provider_message_id: None,
                error_code: None,
                error_message: Some(format!(
                    "recipient over {} messages/hour",
                    self.config.rate_limit_per_hour
                )),
                latency_ms: None,
                response: None,
            })
            .await?;

        self.store
            .transition(current.id, DeliveryStatus::RateLimited, StatePatch::default())
            .await?;

        metrics::counter!("dispatch.rate_limited_total").increment(1);
        warn!(
            notification_id = %current.id,
            recipient = %current.recipient,
            delay_seconds = delay_seconds,
            "Recipient rate limited, deferring"
        );
        Ok(ProcessOutcome::RateLimited { delay_seconds })
    }

    async fn schedule_retry(
        &self,
        current: &nr_common::Notification,
        error: &SendError,
        attempt: i32,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome> {
        // attempt_number is the zero-based exponent: the first failure
        // schedules the base delay.
        let delay = self
            .config
            .retry_policy
            .delay_for_attempt(current.attempt_number as u32);
        let next_retry_at = now
            + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(3600));

        self.store
            .transition(
                current.id,
                DeliveryStatus::Failed,
                StatePatch {
                    next_retry_at: Some(Some(next_retry_at)),
                    last_error_code: error.code().map(|c| c.to_string()),
                    last_error_message: Some(error.message().to_string()),
                    increment_attempt: true,
                    ..Default::default()
                },
            )
            .await?;

        metrics::counter!("dispatch.retry_scheduled_total").increment(1);
        info!(
            notification_id = %current.id,
            trace_id = %current.trace_id,
            attempt = attempt,
            next_retry_at = %next_retry_at,
            error = %error.message(),
            "Transient failure, retry scheduled"
        );
        Ok(ProcessOutcome::RetryScheduled { next_retry_at })
    }

    async fn fail_permanently(
        &self,
        current: &nr_common::Notification,
        error: &SendError,
        attempt: i32,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome> {
        self.store
            .transition(
                current.id,
                DeliveryStatus::Failed,
                StatePatch {
                    failed_at: Some(now),
                    next_retry_at: Some(None),
                    last_error_code: error.code().map(|c| c.to_string()),
                    last_error_message: Some(error.message().to_string()),
                    increment_attempt: true,
                    ..Default::default()
                },
            )
            .await?;

        metrics::counter!("dispatch.failed_total").increment(1);
        warn!(
            notification_id = %current.id,
            trace_id = %current.trace_id,
            attempt = attempt,
            error_code = ?error.code(),
            error = %error.message(),
            transient = error.is_transient(),
            "Notification failed permanently"
        );
        Ok(ProcessOutcome::FailedPermanently)
    }
}
