//! HTTP surface: ingestion, status, analytics, provider webhooks, health.
//!
//! All components arrive through [`AppState`] as trait objects so the
//! binaries wire PostgreSQL + SQS and the tests wire the in-memory
//! implementations.

use axum::Router;
use std::sync::Arc;
use utoipa::OpenApi;

use nr_store::{ApiKeyStore, NotificationStore};

pub mod auth;
pub mod callbacks;
pub mod dto;
pub mod error;
pub mod ingestion;
pub mod routes;

pub use callbacks::CallbackService;
pub use error::{ApiError, ErrorResponse};
pub use ingestion::IngestionService;
pub use routes::health::DependencyCheck;

pub struct AppState {
    pub store: Arc<dyn NotificationStore>,
    pub api_keys: Arc<dyn ApiKeyStore>,
    pub ingestion: IngestionService,
    pub callbacks: CallbackService,
    pub webhook_verify_token: String,
    pub webhook_app_secret: Option<String>,
    pub dependency_checks: Vec<Arc<dyn DependencyCheck>>,
}

/// Assemble the full API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::notifications::router())
        .merge(routes::analytics::router())
        .merge(routes::webhooks::router())
        .merge(routes::health::router())
        .with_state(state)
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "NotifyRelay API",
        description = "Multi-tenant WhatsApp notification relay",
    ),
    paths(
        routes::notifications::create_notification,
        routes::notifications::create_bulk,
        routes::notifications::notification_status,
        routes::webhooks::verify_subscription,
        routes::webhooks::receive_callbacks,
    ),
    components(schemas(
        dto::CreateNotificationRequest,
        dto::RecipientDto,
        dto::TemplateDto,
        dto::TemplateParameterDto,
        dto::MessageDto,
        dto::BulkCreateRequest,
        dto::BulkCreateResponse,
        dto::BulkEntryResult,
        dto::CreateNotificationResponse,
        dto::NotificationStatusResponse,
        dto::DeliveryLogDto,
        error::ErrorResponse,
    )),
)]
pub struct ApiDoc;
