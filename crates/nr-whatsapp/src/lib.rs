//! WhatsApp Business Cloud API client.
//!
//! One outbound operation: [`WhatsAppClient::send`]. The client never
//! retries; it classifies every failure as transient or permanent and the
//! processor decides what to do with that. All requests are bounded by the
//! configured timeout (30 s by default).

use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use nr_common::{NotificationPayload, TemplateParameter, TemplateParameterKind};
use nr_config::ProviderConfig;

/// Provider error codes that are worth retrying: auth token refresh races,
/// temporary send throttling, service unavailability and pair rate limits.
const TRANSIENT_PROVIDER_CODES: &[i64] = &[1, 2, 4, 80007];

/// Successful send: the provider-assigned message id plus the raw response
/// for the delivery-log snapshot.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub provider_message_id: String,
    pub raw_response: serde_json::Value,
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("transient provider error ({code:?}): {message}")]
    Transient {
        code: Option<i64>,
        message: String,
        raw_response: Option<serde_json::Value>,
    },

    #[error("permanent provider error ({code:?}): {message}")]
    Permanent {
        code: Option<i64>,
        message: String,
        raw_response: Option<serde_json::Value>,
    },
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient { .. })
    }

    pub fn code(&self) -> Option<i64> {
        match self {
            SendError::Transient { code, .. } | SendError::Permanent { code, .. } => *code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            SendError::Transient { message, .. } | SendError::Permanent { message, .. } => message,
        }
    }

    pub fn raw_response(&self) -> Option<&serde_json::Value> {
        match self {
            SendError::Transient { raw_response, .. }
            | SendError::Permanent { raw_response, .. } => raw_response.as_ref(),
        }
    }
}

/// Transient iff the HTTP status is 408/429/5xx, or the provider error code
/// is a known-transient one. Unknown codes default to permanent.
pub fn is_transient_failure(status: u16, provider_code: Option<i64>) -> bool {
    if status == 408 || status == 429 || (500..600).contains(&status) {
        return true;
    }
    provider_code
        .map(|c| TRANSIENT_PROVIDER_CODES.contains(&c))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Graph API wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct OutboundMessage<'a> {
    messaging_product: &'static str,
    recipient_type: &'static str,
    to: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<TextBody<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    template: Option<TemplateBody<'a>>,
}

#[derive(Debug, Serialize)]
struct TextBody<'a> {
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct TemplateBody<'a> {
    name: &'a str,
    language: LanguageRef<'a>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    components: Vec<TemplateComponent>,
}

#[derive(Debug, Serialize)]
struct LanguageRef<'a> {
    code: &'a str,
}

#[derive(Debug, Serialize)]
struct TemplateComponent {
    #[serde(rename = "type")]
    kind: &'static str,
    parameters: Vec<serde_json::Value>,
}

fn render_parameter(p: &TemplateParameter) -> serde_json::Value {
    match p.kind {
        TemplateParameterKind::Text => serde_json::json!({
            "type": "text",
            "text": p.value,
        }),
        TemplateParameterKind::Currency => serde_json::json!({
            "type": "currency",
            "currency": { "fallback_value": p.value },
        }),
        TemplateParameterKind::DateTime => serde_json::json!({
            "type": "date_time",
            "date_time": { "fallback_value": p.value },
        }),
    }
}

fn build_message<'a>(to: &'a str, payload: &'a NotificationPayload) -> OutboundMessage<'a> {
    match payload {
        NotificationPayload::Text { body } => OutboundMessage {
            messaging_product: "whatsapp",
            recipient_type: "individual",
            to,
            kind: "text",
            text: Some(TextBody { body }),
            template: None,
        },
        NotificationPayload::Template {
            name,
            language,
            parameters,
        } => {
            let components = if parameters.is_empty() {
                Vec::new()
            } else {
                vec![TemplateComponent {
                    kind: "body",
                    parameters: parameters.iter().map(render_parameter).collect(),
                }]
            };

            OutboundMessage {
                messaging_product: "whatsapp",
                recipient_type: "individual",
                to,
                kind: "template",
                text: None,
                template: Some(TemplateBody {
                    name,
                    language: LanguageRef { code: language },
                    components,
                }),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct WhatsAppClient {
    client: Client,
    messages_url: String,
    access_token: String,
}

impl WhatsAppClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let messages_url = format!(
            "{}/{}/{}/messages",
            config.base_url.trim_end_matches('/'),
            config.api_version,
            config.phone_number_id,
        );

        Ok(Self {
            client,
            messages_url,
            access_token: config.access_token.clone(),
        })
    }

    /// Send one message. Returns the provider message id on acceptance, or
    /// a classified error. Duplicate sends for the same notification are
    /// suppressed provider-side via the dedup id carried by the queue, not
    /// here.
    pub async fn send(
        &self,
        recipient: &str,
        payload: &NotificationPayload,
    ) -> Result<SendReceipt, SendError> {
        let message = build_message(recipient, payload);

        let response = self
            .client
            .post(&self.messages_url)
            .bearer_auth(&self.access_token)
            .json(&message)
            .send()
            .await
            .map_err(|e| {
                let message = if e.is_timeout() {
                    "request timeout".to_string()
                } else if e.is_connect() {
                    format!("connection error: {e}")
                } else {
                    format!("request failed: {e}")
                };
                SendError::Transient {
                    code: None,
                    message,
                    raw_response: None,
                }
            })?;

        let status = response.status().as_u16();
        let body: serde_json::Value = response.json().await.unwrap_or_default();

        if (200..300).contains(&status) {
            let provider_message_id = body
                .get("messages")
                .and_then(|m| m.get(0))
                .and_then(|m| m.get("id"))
                .and_then(|id| id.as_str())
                .map(String::from);

            return match provider_message_id {
                Some(id) => {
                    debug!(provider_message_id = %id, "Message accepted by provider");
                    Ok(SendReceipt {
                        provider_message_id: id,
                        raw_response: body,
                    })
                }
                // A 2xx without a message id is a provider anomaly; retrying
                // is safe because of provider-side dedup.
                None => Err(SendError::Transient {
                    code: None,
                    message: "provider response missing message id".to_string(),
                    raw_response: Some(body),
                }),
            };
        }

        let code = body
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|c| c.as_i64());
        let message = body
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .map(String::from)
            .unwrap_or_else(|| format!("HTTP {status}"));

        warn!(status = status, code = ?code, error = %message, "Provider rejected send");

        if is_transient_failure(status, code) {
            Err(SendError::Transient {
                code,
                message,
                raw_response: Some(body),
            })
        } else {
            Err(SendError::Permanent {
                code,
                message,
                raw_response: Some(body),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nr_config::ProviderConfig;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_config(base_url: String) -> ProviderConfig {
        ProviderConfig {
            base_url,
            api_version: "v20.0".to_string(),
            phone_number_id: "123456".to_string(),
            access_token: "secret-token".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    fn text_payload() -> NotificationPayload {
        NotificationPayload::Text {
            body: "Your order shipped".to_string(),
        }
    }

    #[test]
    fn classification_ladder() {
        assert!(is_transient_failure(503, None));
        assert!(is_transient_failure(429, None));
        assert!(is_transient_failure(408, None));
        assert!(is_transient_failure(400, Some(80007)));
        assert!(is_transient_failure(400, Some(4)));
        assert!(!is_transient_failure(400, Some(131026))); // invalid phone
        assert!(!is_transient_failure(400, None));
        assert!(!is_transient_failure(403, Some(999_999))); // unknown -> permanent
    }

    #[test]
    fn template_message_body_shape() {
        let payload = NotificationPayload::Template {
            name: "order_confirmation".to_string(),
            language: "en".to_string(),
            parameters: vec![TemplateParameter {
                kind: TemplateParameterKind::Text,
                value: "12345".to_string(),
            }],
        };

        let body = serde_json::to_value(build_message("+14155552671", &payload)).unwrap();
        assert_eq!(body["messaging_product"], "whatsapp");
        assert_eq!(body["type"], "template");
        assert_eq!(body["template"]["name"], "order_confirmation");
        assert_eq!(body["template"]["language"]["code"], "en");
        assert_eq!(
            body["template"]["components"][0]["parameters"][0]["text"],
            "12345"
        );
        assert!(body.get("text").is_none());
    }

    #[tokio::test]
    async fn send_returns_provider_message_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v20.0/123456/messages"))
            .and(header("Authorization", "Bearer secret-token"))
            .and(body_partial_json(serde_json::json!({
                "messaging_product": "whatsapp",
                "to": "+14155552671",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messaging_product": "whatsapp",
                "messages": [{"id": "wamid.HBgL"}],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = WhatsAppClient::new(&provider_config(server.uri())).unwrap();
        let receipt = client.send("+14155552671", &text_payload()).await.unwrap();
        assert_eq!(receipt.provider_message_id, "wamid.HBgL");
    }

    #[tokio::test]
    async fn http_503_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = WhatsAppClient::new(&provider_config(server.uri())).unwrap();
        let err = client
            .send("+14155552671", &text_payload())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn invalid_phone_code_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {
                    "message": "Invalid WhatsApp number",
                    "code": 131026,
                }
            })))
            .mount(&server)
            .await;

        let client = WhatsAppClient::new(&provider_config(server.uri())).unwrap();
        let err = client
            .send("+14155552671", &text_payload())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.code(), Some(131026));
    }

    #[tokio::test]
    async fn transient_provider_code_on_4xx_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {
                    "message": "Rate limit hit",
                    "code": 80007,
                }
            })))
            .mount(&server)
            .await;

        let client = WhatsAppClient::new(&provider_config(server.uri())).unwrap();
        let err = client
            .send("+14155552671", &text_payload())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
