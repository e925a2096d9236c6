//! Liveness and dependency health endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::AppState;

/// A dependency the readiness probe exercises (database ping, queue
/// health). Binaries register concrete checks at wiring time.
#[async_trait]
pub trait DependencyCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Up,
    Down,
    Degraded,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub version: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<HealthCheckResult>,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(liveness))
        .route("/v1/health", get(readiness))
}

async fn liveness() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn readiness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut checks = Vec::with_capacity(state.dependency_checks.len());
    let mut failures = 0;

    for check in &state.dependency_checks {
        let started = Instant::now();
        let result = check.check().await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => checks.push(HealthCheckResult {
                name: check.name().to_string(),
                status: HealthStatus::Up,
                message: None,
                duration_ms,
            }),
            Err(message) => {
                failures += 1;
                checks.push(HealthCheckResult {
                    name: check.name().to_string(),
                    status: HealthStatus::Down,
                    message: Some(message),
                    duration_ms,
                });
            }
        }
    }

    let status = match failures {
        0 => HealthStatus::Up,
        n if n == checks.len() && !checks.is_empty() => HealthStatus::Down,
        _ => HealthStatus::Degraded,
    };

    let http_status = if status == HealthStatus::Down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        http_status,
        Json(HealthResponse {
            status,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION"),
            checks,
        }),
    )
}
