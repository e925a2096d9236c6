//! Provider status callbacks (C10).
//!
//! The provider posts message-status batches asynchronously and out of
//! order. Each status entry is applied monotonically along the forward path
//! `sent -> delivered -> read`: a status that would move the row backward
//! only records its timestamp. A `failed` callback is terminal and never
//! schedules a retry; the outbound send was already accepted, the failure
//! is on the recipient side.

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use nr_common::{Clock, DeliveryStatus};
use nr_store::{NewDeliveryLog, NotificationStore, StatePatch, StoreError};

use crate::error::Result;

/// Header carrying the callback body signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

// ---------------------------------------------------------------------------
// Provider payload shape
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ProviderWebhookPayload {
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookChange {
    pub value: WebhookValue,
}

#[derive(Debug, Deserialize)]
pub struct WebhookValue {
    #[serde(default)]
    pub statuses: Vec<StatusEntry>,
}

#[derive(Debug, Deserialize)]
pub struct StatusEntry {
    /// Provider message id (`wamid...`).
    pub id: String,
    pub status: String,
    /// Epoch seconds, as a string on the wire.
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub errors: Vec<StatusError>,
}

#[derive(Debug, Deserialize)]
pub struct StatusError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl StatusEntry {
    fn occurred_at(&self, fallback: DateTime<Utc>) -> DateTime<Utc> {
        self.timestamp
            .as_deref()
            .and_then(|t| t.parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or(fallback)
    }
}

// ---------------------------------------------------------------------------
// Signature verification
// ---------------------------------------------------------------------------

type HmacSha256 = Hmac<Sha256>;

/// Verify an `X-Hub-Signature-256: sha256=<hex>` header over the raw body.
/// Comparison is constant-time.
pub fn verify_signature(app_secret: &str, body: &[u8], header_value: &str) -> bool {
    let Some(hex_digest) = header_value.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac =
        HmacSha256::new_from_slice(app_secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(body);
    let actual = mac.finalize().into_bytes();

    actual.ct_eq(expected.as_slice()).into()
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct CallbackService {
    store: Arc<dyn NotificationStore>,
    clock: Arc<dyn Clock>,
}

impl CallbackService {
    pub fn new(store: Arc<dyn NotificationStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Apply every status entry in the payload. Unknown message ids and
    /// unknown status tags are logged and dropped; one bad entry never
    /// fails the batch.
    pub async fn process(&self, payload: &ProviderWebhookPayload) -> Result<usize> {
        let mut applied = 0;

        for entry in &payload.entry {
            for change in &entry.changes {
                for status in &change.value.statuses {
                    match self.apply_status(status).await {
                        Ok(true) => applied += 1,
                        Ok(false) => {}
                        Err(e) => {
                            warn!(
                                provider_message_id = %status.id,
                                error = %e,
                                "Failed to apply status callback"
                            );
                        }
                    }
                }
            }
        }

        metrics::counter!("callbacks.statuses_applied_total").increment(applied as u64);
        Ok(applied)
    }

    async fn apply_status(&self, entry: &StatusEntry) -> Result<bool> {
        let Some(target) = parse_provider_status(&entry.status) else {
            debug!(status = %entry.status, "Unknown provider status, dropping");
            return Ok(false);
        };

        let Some(notification) = self.store.find_by_provider_message_id(&entry.id).await? else {
            debug!(
                provider_message_id = %entry.id,
                "Callback for unknown message id, dropping"
            );
            return Ok(false);
        };

        let occurred_at = entry.occurred_at(self.clock.now());
        let mut patch = StatePatch::default();
        match target {
            DeliveryStatus::Sent => patch.sent_at = Some(occurred_at),
            DeliveryStatus::Delivered => patch.delivered_at = Some(occurred_at),
            DeliveryStatus::Read => patch.read_at = Some(occurred_at),
            DeliveryStatus::Failed => {
                patch.failed_at = Some(occurred_at);
                patch.next_retry_at = Some(None);
                if let Some(error) = entry.errors.first() {
                    patch.last_error_code = error.code.map(|c| c.to_string());
                    patch.last_error_message = error
                        .message
                        .clone()
                        .or_else(|| error.title.clone());
                }
            }
            _ => return Ok(false),
        }

        // Advance only along the forward path; a late `delivered` after
        // `read` records its timestamp without moving the state back.
        let advances = match (notification.status.forward_rank(), target.forward_rank()) {
            (Some(current), Some(new)) => new > current,
            _ => DeliveryStatus::can_transition(notification.status, target),
        };

        let updated = if advances {
            match self
                .store
                .transition(notification.id, target, patch.clone())
                .await
            {
                Ok(n) => n,
                // Raced with another callback; still record the timestamps.
                Err(StoreError::IllegalTransition { .. }) => {
                    self.store.patch(notification.id, patch).await?
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            self.store.patch(notification.id, patch).await?
        };

        self.store
            .append_log(NewDeliveryLog {
                notification_id: notification.id,
                attempt: updated.attempt_number,
                status: target,
                provider_message_id: Some(entry.id.clone()),
                error_code: entry
                    .errors
                    .first()
                    .and_then(|e| e.code.map(|c| c.to_string())),
                error_message: entry
                    .errors
                    .first()
                    .and_then(|e| e.message.clone().or_else(|| e.title.clone())),
                latency_ms: None,
                response: None,
            })
            .await?;

        info!(
            notification_id = %notification.id,
            trace_id = %notification.trace_id,
            provider_message_id = %entry.id,
            from = %notification.status,
            to = %target,
            advanced = advances,
            "Provider status applied"
        );
        Ok(true)
    }
}

fn parse_provider_status(s: &str) -> Option<DeliveryStatus> {
    match s {
        "sent" => Some(DeliveryStatus::Sent),
        "delivered" => Some(DeliveryStatus::Delivered),
        "read" => Some(DeliveryStatus::Read),
        "failed" => Some(DeliveryStatus::Failed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trip() {
        let secret = "app-secret";
        let body = br#"{"entry":[]}"#;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let header = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verify_signature(secret, body, &header));
        assert!(!verify_signature(secret, b"tampered", &header));
        assert!(!verify_signature("wrong-secret", body, &header));
        assert!(!verify_signature(secret, body, "sha256=zz"));
        assert!(!verify_signature(secret, body, "md5=abc"));
    }

    #[test]
    fn status_entry_timestamp_parses_epoch_seconds() {
        let entry = StatusEntry {
            id: "wamid.X".to_string(),
            status: "delivered".to_string(),
            timestamp: Some("1714567890".to_string()),
            errors: vec![],
        };
        let fallback = Utc::now();
        let at = entry.occurred_at(fallback);
        assert_eq!(at.timestamp(), 1714567890);

        let bad = StatusEntry {
            id: "wamid.X".to_string(),
            status: "delivered".to_string(),
            timestamp: Some("not-a-number".to_string()),
            errors: vec![],
        };
        assert_eq!(bad.occurred_at(fallback), fallback);
    }
}
