//! Tenant-scoped analytics: aggregate stats and paginated listings.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::sync::Arc;

use nr_common::DeliveryStatus;
use nr_store::{NotificationFilter, Page, TenantStats};

use crate::auth::AuthedTenant;
use crate::dto::NotificationSummaryDto;
use crate::error::{ApiError, Result};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/analytics/stats", get(stats))
        .route("/v1/analytics/notifications", get(list_notifications))
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(rename = "startDate")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(rename = "endDate")]
    pub end_date: Option<DateTime<Utc>>,
}

pub async fn stats(
    State(state): State<Arc<AppState>>,
    tenant: AuthedTenant,
    Query(query): Query<StatsQuery>,
) -> Result<Json<TenantStats>> {
    let end = query.end_date.unwrap_or_else(Utc::now);
    let start = query.start_date.unwrap_or(end - ChronoDuration::days(30));

    if start > end {
        return Err(ApiError::validation("startDate", "must not be after endDate"));
    }

    let stats = state.store.tenant_stats(&tenant.id, start, end).await?;
    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    #[serde(rename = "eventType")]
    pub event_type: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    tenant: AuthedTenant,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<NotificationSummaryDto>>> {
    let status = query
        .status
        .as_deref()
        .map(|s| DeliveryStatus::parse(s).ok_or_else(|| ApiError::validation("status", "unknown status")))
        .transpose()?;

    let page = Page {
        page: query.page.unwrap_or(1).max(1),
        limit: query.limit.unwrap_or(50).clamp(1, 100),
    };

    let notifications = state
        .store
        .list_by_tenant(
            &tenant.id,
            NotificationFilter {
                status,
                event_type: query.event_type.clone(),
            },
            page,
        )
        .await?;

    Ok(Json(
        notifications
            .into_iter()
            .map(NotificationSummaryDto::from)
            .collect(),
    ))
}
