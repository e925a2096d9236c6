//! Public request/response DTOs and request validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use nr_common::{
    phone, DeliveryLog, DeliveryStatus, Notification, NotificationPayload, Priority,
    TemplateParameter, TemplateParameterKind, MAX_TEXT_BODY_LEN,
};

use crate::error::ApiError;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RecipientDto {
    pub phone_number: String,
    #[serde(default)]
    pub country_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct TemplateParameterDto {
    #[serde(rename = "type")]
    pub kind: TemplateParameterKind,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct TemplateDto {
    pub name: String,
    pub language: String,
    #[serde(default)]
    pub parameters: Vec<TemplateParameterDto>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct MessageDto {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateNotificationRequest {
    pub event_type: String,
    pub recipient: RecipientDto,
    #[serde(default)]
    pub template: Option<TemplateDto>,
    #[serde(default)]
    pub message: Option<MessageDto>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl CreateNotificationRequest {
    /// Validate and convert into the domain payload. Errors carry the
    /// offending field path.
    pub fn validate(&self) -> Result<NotificationPayload, ApiError> {
        if self.event_type.is_empty() || self.event_type.len() > 100 {
            return Err(ApiError::validation(
                "event_type",
                "must be 1..100 characters",
            ));
        }

        if !phone::is_valid_e164(&self.recipient.phone_number) {
            return Err(ApiError::validation(
                "recipient.phone_number",
                "must be E.164 (+<country><subscriber>)",
            ));
        }

        if let Some(cc) = &self.recipient.country_code {
            if cc.len() != 2 || !cc.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(ApiError::validation(
                    "recipient.country_code",
                    "must be ISO-3166 alpha-2",
                ));
            }
        }

        match (&self.template, &self.message) {
            (Some(template), None) => {
                if template.name.is_empty() {
                    return Err(ApiError::validation("template.name", "must not be empty"));
                }
                if template.language.len() != 2 {
                    return Err(ApiError::validation(
                        "template.language",
                        "must be a 2-character language code",
                    ));
                }
                Ok(NotificationPayload::Template {
                    name: template.name.clone(),
                    language: template.language.clone(),
                    parameters: template
                        .parameters
                        .iter()
                        .map(|p| TemplateParameter {
                            kind: p.kind,
                            value: p.value.clone(),
                        })
                        .collect(),
                })
            }
            (None, Some(message)) => {
                if message.text.is_empty() || message.text.chars().count() > MAX_TEXT_BODY_LEN {
                    return Err(ApiError::validation(
                        "message.text",
                        format!("must be 1..{MAX_TEXT_BODY_LEN} characters"),
                    ));
                }
                Ok(NotificationPayload::Text {
                    body: message.text.clone(),
                })
            }
            _ => Err(ApiError::validation(
                "template",
                "exactly one of template or message is required",
            )),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BulkCreateRequest {
    pub notifications: Vec<CreateNotificationRequest>,
}

/// Bulk requests are capped to keep a single call bounded.
pub const MAX_BULK_ENTRIES: usize = 100;

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateNotificationResponse {
    pub id: Uuid,
    pub status: DeliveryStatus,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BulkEntryResult {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DeliveryStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BulkCreateResponse {
    pub results: Vec<BulkEntryResult>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeliveryLogDto {
    pub attempt: i32,
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl From<DeliveryLog> for DeliveryLogDto {
    fn from(log: DeliveryLog) -> Self {
        Self {
            attempt: log.attempt,
            status: log.status,
            provider_message_id: log.provider_message_id,
            error_code: log.error_code,
            error_message: log.error_message,
            latency_ms: log.latency_ms,
            created_at: log.created_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct NotificationStatusResponse {
    pub id: Uuid,
    pub event_type: String,
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    pub attempt_number: i32,
    pub max_attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub trace_id: String,
    pub delivery_logs: Vec<DeliveryLogDto>,
}

impl NotificationStatusResponse {
    pub fn from_notification(n: Notification, logs: Vec<DeliveryLog>) -> Self {
        Self {
            id: n.id,
            event_type: n.event_type,
            status: n.status,
            provider_message_id: n.provider_message_id,
            attempt_number: n.attempt_number,
            max_attempts: n.max_attempts,
            next_retry_at: n.next_retry_at,
            scheduled_for: n.scheduled_for,
            sent_at: n.sent_at,
            delivered_at: n.delivered_at,
            read_at: n.read_at,
            failed_at: n.failed_at,
            last_error_code: n.last_error_code,
            last_error_message: n.last_error_message,
            created_at: n.created_at,
            trace_id: n.trace_id,
            delivery_logs: logs.into_iter().map(DeliveryLogDto::from).collect(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct NotificationSummaryDto {
    pub id: Uuid,
    pub event_type: String,
    pub recipient: String,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
}

impl From<Notification> for NotificationSummaryDto {
    fn from(n: Notification) -> Self {
        Self {
            id: n.id,
            event_type: n.event_type,
            recipient: n.recipient,
            status: n.status,
            created_at: n.created_at,
        }
    }
}
