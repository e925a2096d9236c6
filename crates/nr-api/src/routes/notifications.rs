//! Notification ingestion and status endpoints.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::AuthedTenant;
use crate::dto::{
    BulkCreateRequest, BulkCreateResponse, CreateNotificationRequest, CreateNotificationResponse,
    NotificationStatusResponse, MAX_BULK_ENTRIES,
};
use crate::error::{ApiError, Result};
use crate::AppState;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/notifications", post(create_notification))
        .route("/v1/notifications/bulk", post(create_bulk))
        .route("/v1/notifications/:id/status", get(notification_status))
}

/// Create one notification. Replaying a request with the same
/// `Idempotency-Key` returns the prior record with 200 instead of creating
/// a duplicate.
#[utoipa::path(
    post,
    path = "/v1/notifications",
    request_body = CreateNotificationRequest,
    responses(
        (status = 201, description = "Notification accepted", body = CreateNotificationResponse),
        (status = 200, description = "Idempotency replay", body = CreateNotificationResponse),
        (status = 400, description = "Validation failure", body = crate::error::ErrorResponse),
        (status = 401, description = "Missing or invalid API key"),
        (status = 429, description = "Rate limited", body = crate::error::ErrorResponse),
    ),
)]
pub async fn create_notification(
    State(state): State<Arc<AppState>>,
    tenant: AuthedTenant,
    headers: HeaderMap,
    Json(request): Json<CreateNotificationRequest>,
) -> Result<impl IntoResponse> {
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    let admission = state
        .ingestion
        .create(&tenant, &request, idempotency_key)
        .await?;

    let status = if admission.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((
        status,
        Json(CreateNotificationResponse {
            id: admission.id,
            status: admission.status,
        }),
    ))
}

/// Create up to 100 notifications; returns per-entry outcomes.
#[utoipa::path(
    post,
    path = "/v1/notifications/bulk",
    request_body = BulkCreateRequest,
    responses(
        (status = 200, description = "Per-entry results", body = BulkCreateResponse),
        (status = 400, description = "Batch shape invalid", body = crate::error::ErrorResponse),
        (status = 401, description = "Missing or invalid API key"),
    ),
)]
pub async fn create_bulk(
    State(state): State<Arc<AppState>>,
    tenant: AuthedTenant,
    Json(request): Json<BulkCreateRequest>,
) -> Result<Json<BulkCreateResponse>> {
    if request.notifications.is_empty() || request.notifications.len() > MAX_BULK_ENTRIES {
        return Err(ApiError::validation(
            "notifications",
            format!("must contain 1..{MAX_BULK_ENTRIES} entries"),
        ));
    }

    let results = state
        .ingestion
        .create_bulk(&tenant, &request.notifications)
        .await;

    Ok(Json(BulkCreateResponse { results }))
}

/// Tenant-scoped status including the latest delivery logs.
#[utoipa::path(
    get,
    path = "/v1/notifications/{id}/status",
    params(("id" = Uuid, Path, description = "Notification id")),
    responses(
        (status = 200, description = "Current status", body = NotificationStatusResponse),
        (status = 403, description = "Cross-tenant access"),
        (status = 404, description = "Unknown notification"),
    ),
)]
pub async fn notification_status(
    State(state): State<Arc<AppState>>,
    tenant: AuthedTenant,
    Path(id): Path<Uuid>,
) -> Result<Json<NotificationStatusResponse>> {
    let notification = state
        .store
        .find_by_id(id)
        .await?
        .ok_or(ApiError::NotFound)?;

    if notification.tenant_id != tenant.id {
        return Err(ApiError::Forbidden);
    }

    let logs = state.store.logs_for(id, 20).await?;
    Ok(Json(NotificationStatusResponse::from_notification(
        notification,
        logs,
    )))
}
