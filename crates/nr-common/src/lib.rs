use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

pub mod backoff;
pub mod logging;
pub mod phone;

// ============================================================================
// Delivery State Machine
// ============================================================================

/// Delivery state of a notification.
///
/// Initial states are `Scheduled` and `Queued`; terminal states are `Read`
/// and `Failed` without a retry budget. All transitions go through
/// [`DeliveryStatus::can_transition`] so the state machine is enforced in
/// one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Scheduled,
    Queued,
    Processing,
    RateLimited,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Scheduled => "scheduled",
            DeliveryStatus::Queued => "queued",
            DeliveryStatus::Processing => "processing",
            DeliveryStatus::RateLimited => "rate_limited",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(DeliveryStatus::Scheduled),
            "queued" => Some(DeliveryStatus::Queued),
            "processing" => Some(DeliveryStatus::Processing),
            "rate_limited" => Some(DeliveryStatus::RateLimited),
            "sent" => Some(DeliveryStatus::Sent),
            "delivered" => Some(DeliveryStatus::Delivered),
            "read" => Some(DeliveryStatus::Read),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }

    /// States from which a transition into `to` is legal.
    ///
    /// The only backward edge is `failed -> queued`/`failed -> processing`
    /// for a scheduled retry; `processing -> processing` is the in-flight
    /// takeover no-op for duplicate queue deliveries.
    pub fn allowed_predecessors(to: DeliveryStatus) -> &'static [DeliveryStatus] {
        use DeliveryStatus::*;
        match to {
            Scheduled => &[],
            Queued => &[Scheduled, Failed, RateLimited],
            Processing => &[Queued, Failed, Scheduled, RateLimited, Processing],
            RateLimited => &[Processing],
            Sent => &[Processing],
            Delivered => &[Sent],
            Read => &[Sent, Delivered],
            Failed => &[Processing, Sent, Delivered],
        }
    }

    pub fn can_transition(from: DeliveryStatus, to: DeliveryStatus) -> bool {
        Self::allowed_predecessors(to).contains(&from)
    }

    /// Position along the provider-confirmed forward path
    /// (`sent < delivered < read`). Used to apply out-of-order status
    /// callbacks monotonically. `None` for states outside that path.
    pub fn forward_rank(&self) -> Option<u8> {
        match self {
            DeliveryStatus::Sent => Some(0),
            DeliveryStatus::Delivered => Some(1),
            DeliveryStatus::Read => Some(2),
            _ => None,
        }
    }

    /// Terminal states never leave through the outbound path. A `Failed`
    /// row is terminal only once its retry schedule is cleared, which the
    /// store tracks via `next_retry_at`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Read)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Notification Payload
// ============================================================================

/// Message content: exactly one of an approved template reference or a
/// free-text body. Serialized as a discriminated record so the queue
/// payload stays typed end to end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationPayload {
    Template {
        name: String,
        language: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        parameters: Vec<TemplateParameter>,
    },
    Text {
        body: String,
    },
}

/// Maximum length of a free-text body.
pub const MAX_TEXT_BODY_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TemplateParameterKind {
    Text,
    Currency,
    DateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TemplateParameter {
    #[serde(rename = "type")]
    pub kind: TemplateParameterKind,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Priority::High),
            "normal" => Some(Priority::Normal),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

// ============================================================================
// Notification
// ============================================================================

/// Durable record of one notification, attempt log excluded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub tenant_id: String,
    pub event_type: String,
    /// Recipient phone in E.164.
    pub recipient: String,
    pub country_code: Option<String>,
    pub payload: NotificationPayload,
    /// Opaque client blob, stored but never interpreted.
    pub metadata: Option<serde_json::Value>,
    pub priority: Priority,
    pub status: DeliveryStatus,
    /// Assigned on first successful send, never cleared.
    pub provider_message_id: Option<String>,
    pub attempt_number: i32,
    pub max_attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub trace_id: String,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Default attempt cap.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

impl Notification {
    /// A failed row with retry budget left and a retry time on the books.
    pub fn has_pending_retry(&self) -> bool {
        self.status == DeliveryStatus::Failed
            && self.next_retry_at.is_some()
            && self.attempt_number < self.max_attempts
    }

    /// Terminal failure: attempts exhausted or a permanent error recorded.
    pub fn is_terminally_failed(&self) -> bool {
        self.status == DeliveryStatus::Failed && self.next_retry_at.is_none()
    }
}

// ============================================================================
// Delivery Log
// ============================================================================

/// Append-only audit row, one per attempt or provider status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLog {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub attempt: i32,
    pub status: DeliveryStatus,
    pub provider_message_id: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub latency_ms: Option<i64>,
    /// Raw provider response snapshot.
    pub response: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Work Item (queue payload)
// ============================================================================

/// The payload that travels through the work queue. Carries everything the
/// processor needs so a send does not depend on a store read surviving the
/// queue hop. Field names are camelCase on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub notification_id: Uuid,
    pub tenant_id: String,
    pub recipient: String,
    pub payload: NotificationPayload,
    pub attempt_number: i32,
    pub max_attempts: i32,
    pub trace_id: String,
}

impl WorkItem {
    pub fn from_notification(n: &Notification) -> Self {
        Self {
            notification_id: n.id,
            tenant_id: n.tenant_id.clone(),
            recipient: n.recipient.clone(),
            payload: n.payload.clone(),
            attempt_number: n.attempt_number,
            max_attempts: n.max_attempts,
            trace_id: n.trace_id.clone(),
        }
    }

    /// Queue deduplication id; also the provider-side dedup key.
    pub fn dedup_id(&self) -> String {
        self.notification_id.to_string()
    }

    /// Message group id for FIFO-capable queues: per-recipient ordering.
    pub fn group_id(&self) -> &str {
        &self.recipient
    }
}

/// A work item received from a queue, with delivery tracking metadata.
#[derive(Debug, Clone)]
pub struct ReceivedItem {
    pub item: WorkItem,
    pub receipt_handle: String,
    pub broker_message_id: Option<String>,
    pub queue_identifier: String,
}

// ============================================================================
// Identifier & Time Source
// ============================================================================

/// Namespace for hashing client idempotency keys into notification ids.
pub const IDEMPOTENCY_NAMESPACE: Uuid = Uuid::from_bytes([
    0x8f, 0x2a, 0x51, 0xc4, 0x7b, 0x1e, 0x4d, 0x0a, 0x9c, 0x63, 0x5d, 0x94, 0x1b, 0x7f, 0xe2, 0x30,
]);

pub fn new_id() -> Uuid {
    Uuid::new_v4()
}

pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Derive a stable notification id from a tenant + idempotency key, so a
/// replayed request maps onto the same row.
pub fn idempotent_id(tenant_id: &str, idempotency_key: &str) -> Uuid {
    Uuid::new_v5(
        &IDEMPOTENCY_NAMESPACE,
        format!("{}:{}", tenant_id, idempotency_key).as_bytes(),
    )
}

/// Wall-clock abstraction so sweepers and the rate limiter are testable
/// without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_state_machine() {
        use DeliveryStatus::*;

        assert!(DeliveryStatus::can_transition(Scheduled, Queued));
        assert!(DeliveryStatus::can_transition(Queued, Processing));
        assert!(DeliveryStatus::can_transition(Processing, Sent));
        assert!(DeliveryStatus::can_transition(Processing, Failed));
        assert!(DeliveryStatus::can_transition(Processing, RateLimited));
        assert!(DeliveryStatus::can_transition(Failed, Queued));
        assert!(DeliveryStatus::can_transition(Sent, Delivered));
        assert!(DeliveryStatus::can_transition(Delivered, Read));
        // Out-of-order read receipt skips delivered.
        assert!(DeliveryStatus::can_transition(Sent, Read));
        // Provider failure callback after acceptance.
        assert!(DeliveryStatus::can_transition(Delivered, Failed));
        // Duplicate in-flight delivery is a takeover no-op.
        assert!(DeliveryStatus::can_transition(Processing, Processing));

        // No backward edges besides the retry path.
        assert!(!DeliveryStatus::can_transition(Sent, Queued));
        assert!(!DeliveryStatus::can_transition(Read, Delivered));
        assert!(!DeliveryStatus::can_transition(Read, Failed));
        assert!(!DeliveryStatus::can_transition(Queued, Scheduled));
        assert!(!DeliveryStatus::can_transition(Sent, Processing));
    }

    #[test]
    fn forward_rank_orders_provider_path() {
        assert!(DeliveryStatus::Sent.forward_rank() < DeliveryStatus::Delivered.forward_rank());
        assert!(DeliveryStatus::Delivered.forward_rank() < DeliveryStatus::Read.forward_rank());
        assert_eq!(DeliveryStatus::Queued.forward_rank(), None);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            DeliveryStatus::Scheduled,
            DeliveryStatus::Queued,
            DeliveryStatus::Processing,
            DeliveryStatus::RateLimited,
            DeliveryStatus::Sent,
            DeliveryStatus::Delivered,
            DeliveryStatus::Read,
            DeliveryStatus::Failed,
        ] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DeliveryStatus::parse("bogus"), None);
    }

    #[test]
    fn work_item_serializes_camel_case_with_tagged_payload() {
        let item = WorkItem {
            notification_id: Uuid::nil(),
            tenant_id: "acme".to_string(),
            recipient: "+14155552671".to_string(),
            payload: NotificationPayload::Template {
                name: "order_confirmation".to_string(),
                language: "en".to_string(),
                parameters: vec![TemplateParameter {
                    kind: TemplateParameterKind::Text,
                    value: "12345".to_string(),
                }],
            },
            attempt_number: 0,
            max_attempts: 5,
            trace_id: "abc".to_string(),
        };

        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["notificationId"], "00000000-0000-0000-0000-000000000000");
        assert_eq!(json["payload"]["type"], "template");
        assert_eq!(json["payload"]["parameters"][0]["type"], "text");

        let back: WorkItem = serde_json::from_value(json).unwrap();
        assert_eq!(back.payload, item.payload);
    }

    #[test]
    fn idempotent_id_is_stable_and_tenant_scoped() {
        let a = idempotent_id("acme", "order-1");
        let b = idempotent_id("acme", "order-1");
        let c = idempotent_id("globex", "order-1");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
