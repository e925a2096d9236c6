//! Ingestion service: validate -> admit -> persist -> enqueue.
//!
//! Persist and enqueue do not share a transaction; if the publish fails
//! after the row is written, the row stays `queued` and the worker's
//! startup reconciliation stamps it for the retry sweeper. That preserves
//! at-least-once delivery without a cross-system commit.

use governor::{clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::{debug, info, warn};

use nr_common::{idempotent_id, new_id, new_trace_id, Clock, DeliveryStatus, WorkItem,
    DEFAULT_MAX_ATTEMPTS};
use nr_queue::QueuePublisher;
use nr_store::{NewNotification, NotificationStore, RateLimitStore, Tenant};

use crate::dto::{BulkEntryResult, CreateNotificationRequest};
use crate::error::{ApiError, Result};

type TenantLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

pub struct IngestionService {
    store: Arc<dyn NotificationStore>,
    rate_limits: Arc<dyn RateLimitStore>,
    publisher: Arc<dyn QueuePublisher>,
    clock: Arc<dyn Clock>,
    default_recipient_limit: u32,
    tenant_limiter: TenantLimiter,
}

/// Outcome of a create call: `created` is false on an idempotency replay.
#[derive(Debug, Clone)]
pub struct Admission {
    pub id: uuid::Uuid,
    pub status: DeliveryStatus,
    pub created: bool,
}

impl IngestionService {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        rate_limits: Arc<dyn RateLimitStore>,
        publisher: Arc<dyn QueuePublisher>,
        clock: Arc<dyn Clock>,
        default_recipient_limit: u32,
        tenant_per_minute: u32,
    ) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(tenant_per_minute).unwrap_or(nonzero!(100u32)),
        );

        Self {
            store,
            rate_limits,
            publisher,
            clock,
            default_recipient_limit,
            tenant_limiter: RateLimiter::keyed(quota),
        }
    }

    pub async fn create(
        &self,
        tenant: &Tenant,
        request: &CreateNotificationRequest,
        idempotency_key: Option<&str>,
    ) -> Result<Admission> {
        let payload = request.validate()?;

        if self.tenant_limiter.check_key(&tenant.id).is_err() {
            metrics::counter!("ingest.tenant_limited_total").increment(1);
            return Err(ApiError::RateLimited {
                retry_after_seconds: 60,
            });
        }

        let id = match idempotency_key {
            Some(key) => idempotent_id(&tenant.id, key),
            None => new_id(),
        };

        // Idempotency replay: same key maps to the same id; hand back the
        // existing row instead of creating a duplicate.
        if idempotency_key.is_some() {
            if let Some(existing) = self.store.find_by_id(id).await? {
                debug!(notification_id = %id, "Idempotency replay, returning existing row");
                return Ok(Admission {
                    id: existing.id,
                    status: existing.status,
                    created: false,
                });
            }
        }

        let recipient = &request.recipient.phone_number;
        let limit = tenant
            .rate_limit_per_hour
            .unwrap_or(self.default_recipient_limit);

        if !self.rate_limits.check(recipient, limit).await? {
            let retry_after_seconds = self
                .rate_limits
                .retry_after_seconds(recipient, limit)
                .await?
                .unwrap_or(3600)
                .max(1);

            metrics::counter!("ingest.recipient_limited_total").increment(1);
            return Err(ApiError::RateLimited {
                retry_after_seconds,
            });
        }

        let now = self.clock.now();
        let status = match request.scheduled_for {
            Some(at) if at > now => DeliveryStatus::Scheduled,
            _ => DeliveryStatus::Queued,
        };

        let notification = self
            .store
            .create(NewNotification {
                id,
                tenant_id: tenant.id.clone(),
                event_type: request.event_type.clone(),
                recipient: recipient.clone(),
                country_code: request.recipient.country_code.clone(),
                payload,
                metadata: request.metadata.clone(),
                priority: request.priority.unwrap_or_default(),
                status,
                scheduled_for: (status == DeliveryStatus::Scheduled)
                    .then_some(request.scheduled_for)
                    .flatten(),
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                trace_id: new_trace_id(),
            })
            .await?;

        self.rate_limits.increment(recipient).await?;

        if status == DeliveryStatus::Queued {
            let item = WorkItem::from_notification(&notification);
            if let Err(e) = self.publisher.publish(&item).await {
                // Row is already durable; the reconciliation pass will route
                // it through the retry sweeper.
                warn!(
                    notification_id = %notification.id,
                    trace_id = %notification.trace_id,
                    error = %e,
                    "Enqueue failed after persist; row left for reconciliation"
                );
                metrics::counter!("ingest.enqueue_failures_total").increment(1);
            }
        }

        metrics::counter!("ingest.accepted_total").increment(1);
        info!(
            notification_id = %notification.id,
            tenant_id = %tenant.id,
            trace_id = %notification.trace_id,
            event_type = %notification.event_type,
            status = %notification.status,
            "Notification accepted"
        );

        Ok(Admission {
            id: notification.id,
            status: notification.status,
            created: true,
        })
    }

    /// Bulk path: per-entry success/failure, no all-or-nothing semantics.
    pub async fn create_bulk(
        &self,
        tenant: &Tenant,
        requests: &[CreateNotificationRequest],
    ) -> Vec<BulkEntryResult> {
        let mut results = Vec::with_capacity(requests.len());

        for (index, request) in requests.iter().enumerate() {
            match self.create(tenant, request, None).await {
                Ok(admission) => results.push(BulkEntryResult {
                    index,
                    id: Some(admission.id),
                    status: Some(admission.status),
                    error: None,
                }),
                Err(e) => results.push(BulkEntryResult {
                    index,
                    id: None,
                    status: None,
                    error: Some(e.to_string()),
                }),
            }
        }

        results
    }
}
