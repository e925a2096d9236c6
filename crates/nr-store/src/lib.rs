//! Persistence traits for notifications, delivery logs, rate-limit windows
//! and API keys, with PostgreSQL and in-memory implementations.
//!
//! Every state mutation is compare-and-set against the central transition
//! table in `nr-common`: an update only applies when the current status is a
//! legal predecessor of the target, otherwise `StoreError::IllegalTransition`
//! is returned. Components receive stores as `Arc<dyn ...>` constructor
//! parameters so tests substitute the in-memory implementations.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use nr_common::{DeliveryLog, DeliveryStatus, Notification, NotificationPayload, Priority};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::StoreError;

pub type Result<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Notification Store
// ============================================================================

/// Fields supplied by ingestion when creating a row.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub id: Uuid,
    pub tenant_id: String,
    pub event_type: String,
    pub recipient: String,
    pub country_code: Option<String>,
    pub payload: NotificationPayload,
    pub metadata: Option<serde_json::Value>,
    pub priority: Priority,
    /// `Queued` or `Scheduled`.
    pub status: DeliveryStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub max_attempts: i32,
    pub trace_id: String,
}

/// Optional field updates applied together with a state transition.
///
/// Timestamps and `provider_message_id` are write-once: the store keeps an
/// existing value rather than overwriting it. `next_retry_at` uses the outer
/// `Option` to distinguish "leave alone" from "set/clear".
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub provider_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub increment_attempt: bool,
}

/// Fields for one append-only delivery log row.
#[derive(Debug, Clone)]
pub struct NewDeliveryLog {
    pub notification_id: Uuid,
    pub attempt: i32,
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub latency_ms: Option<i64>,
    pub response: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct NotificationFilter {
    pub status: Option<DeliveryStatus>,
    pub event_type: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: i64,
    pub limit: i64,
}

impl Page {
    pub fn offset(&self) -> i64 {
        (self.page.max(1) - 1) * self.limit
    }
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 1, limit: 50 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusCount {
    pub status: DeliveryStatus,
    pub count: i64,
}

/// Aggregates for the analytics endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantStats {
    pub total: i64,
    pub by_status: Vec<StatusCount>,
    pub average_send_latency_ms: Option<f64>,
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn create(&self, new: NewNotification) -> Result<Notification>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Notification>>;

    async fn find_by_provider_message_id(&self, pmid: &str) -> Result<Option<Notification>>;

    /// Atomic CAS transition: applies `patch` and moves to `to` only when
    /// the current status is a legal predecessor.
    async fn transition(
        &self,
        id: Uuid,
        to: DeliveryStatus,
        patch: StatePatch,
    ) -> Result<Notification>;

    /// Apply timestamp/error patches without changing status. Used by the
    /// callback handler when a status arrives out of order and the state
    /// must not move backward.
    async fn patch(&self, id: Uuid, patch: StatePatch) -> Result<Notification>;

    /// Failed rows whose retry is due, plus reconciled queued rows that were
    /// stamped with a retry time at startup. Ordered by `next_retry_at` ASC.
    async fn find_due_retries(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Notification>>;

    /// Scheduled rows whose release time has passed, ordered by
    /// `scheduled_for` ASC.
    async fn find_due_scheduled(&self, now: DateTime<Utc>, limit: i64)
        -> Result<Vec<Notification>>;

    async fn list_by_tenant(
        &self,
        tenant_id: &str,
        filter: NotificationFilter,
        page: Page,
    ) -> Result<Vec<Notification>>;

    async fn tenant_stats(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<TenantStats>;

    /// Stamp `next_retry_at = now` on queued rows last touched before
    /// `older_than`, so rows whose enqueue was lost after persistence are
    /// picked up by the retry sweeper. Returns the number of rows stamped.
    async fn reconcile_stuck_queued(&self, older_than: DateTime<Utc>) -> Result<u64>;

    async fn append_log(&self, log: NewDeliveryLog) -> Result<DeliveryLog>;

    /// Most recent logs first.
    async fn logs_for(&self, notification_id: Uuid, limit: i64) -> Result<Vec<DeliveryLog>>;
}

// ============================================================================
// Rate-Limit Store
// ============================================================================

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// True when the sum of counts across windows overlapping the trailing
    /// hour is strictly below `limit_per_hour`.
    ///
    /// `check` followed by `increment` is not atomic; an overshoot of one
    /// message per concurrent caller is accepted.
    async fn check(&self, recipient: &str, limit_per_hour: u32) -> Result<bool>;

    /// Upsert the current hour-aligned window, incrementing its count.
    async fn increment(&self, recipient: &str) -> Result<()>;

    /// Seconds until the earliest window rollover that would admit the next
    /// message; `None` when not currently limited.
    async fn retry_after_seconds(&self, recipient: &str, limit_per_hour: u32)
        -> Result<Option<i64>>;

    /// Remove windows that ended before `older_than`. Returns rows removed.
    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// Truncate to the containing hour-aligned window start.
pub fn window_start_for(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(ChronoDuration::hours(1))
        .expect("hour truncation cannot overflow")
}

/// Given the windows overlapping the trailing hour (as `(window_end, count)`
/// pairs) and the configured limit, compute seconds until the earliest
/// rollover that would admit one more message.
pub fn rollover_seconds(
    now: DateTime<Utc>,
    limit_per_hour: u32,
    mut windows: Vec<(DateTime<Utc>, i64)>,
) -> Option<i64> {
    let total: i64 = windows.iter().map(|(_, c)| c).sum();
    if total < limit_per_hour as i64 {
        return None;
    }

    windows.sort_by_key(|(end, _)| *end);
    let mut remaining = total;
    for (end, count) in windows {
        remaining -= count;
        if remaining < limit_per_hour as i64 {
            return Some((end - now).num_seconds().max(1));
        }
    }
    None
}

// ============================================================================
// API Keys & Tenants
// ============================================================================

/// A tenant resolved from an API key. Distinct from the key itself so
/// analytics and scoping never leak credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    /// Per-recipient hourly override; falls back to the global default.
    pub rate_limit_per_hour: Option<u32>,
}

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn resolve(&self, api_key: &str) -> Result<Option<Tenant>>;
}

/// Env-list backed key store: each accepted key becomes its own tenant,
/// identified by a digest of the key rather than the key itself.
pub struct StaticApiKeys {
    tenants: std::collections::HashMap<String, Tenant>,
}

impl StaticApiKeys {
    pub fn new(keys: &[String]) -> Self {
        use sha2::{Digest, Sha256};

        let tenants = keys
            .iter()
            .map(|key| {
                let digest = hex::encode(Sha256::digest(key.as_bytes()));
                let tenant = Tenant {
                    id: format!("tenant-{}", &digest[..12]),
                    name: format!("tenant-{}", &digest[..12]),
                    rate_limit_per_hour: None,
                };
                (key.clone(), tenant)
            })
            .collect();

        Self { tenants }
    }
}

#[async_trait]
impl ApiKeyStore for StaticApiKeys {
    async fn resolve(&self, api_key: &str) -> Result<Option<Tenant>> {
        Ok(self.tenants.get(api_key).cloned())
    }
}
