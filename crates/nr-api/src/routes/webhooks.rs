//! Provider webhook endpoints: subscription verification and inbound
//! status callbacks.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::callbacks::{verify_signature, ProviderWebhookPayload, SIGNATURE_HEADER};
use crate::error::{ApiError, Result};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/v1/webhooks/provider",
        get(verify_subscription).post(receive_callbacks),
    )
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Provider subscription handshake: echo the challenge iff the mode is
/// `subscribe` and the verify token matches; 403 otherwise.
#[utoipa::path(
    get,
    path = "/v1/webhooks/provider",
    responses(
        (status = 200, description = "Challenge echoed"),
        (status = 403, description = "Verification failed"),
    ),
)]
pub async fn verify_subscription(
    State(state): State<Arc<AppState>>,
    Query(query): Query<VerifyQuery>,
) -> impl IntoResponse {
    let token_matches = query.verify_token.as_deref() == Some(state.webhook_verify_token.as_str());

    if query.mode.as_deref() == Some("subscribe") && token_matches {
        (StatusCode::OK, query.challenge.unwrap_or_default())
    } else {
        tracing::warn!("Webhook verification rejected");
        (StatusCode::FORBIDDEN, String::new())
    }
}

/// Inbound status batch. When an app secret is configured the HMAC header
/// is verified over the raw body before anything is parsed or persisted.
#[utoipa::path(
    post,
    path = "/v1/webhooks/provider",
    request_body = String,
    responses(
        (status = 200, description = "Batch processed"),
        (status = 400, description = "Malformed payload"),
        (status = 403, description = "Signature verification failed"),
    ),
)]
pub async fn receive_callbacks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode> {
    if let Some(secret) = &state.webhook_app_secret {
        let header = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Forbidden)?;

        if !verify_signature(secret, &body, header) {
            return Err(ApiError::Forbidden);
        }
    }

    let payload: ProviderWebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| ApiError::validation("body", format!("invalid payload: {e}")))?;

    state.callbacks.process(&payload).await?;
    Ok(StatusCode::OK)
}
