//! NotifyRelay API server.
//!
//! Hosts the ingestion surface, analytics, provider webhooks and health
//! endpoints. Dispatch runs in the separate `nr-worker` process; the two
//! share the database and the work queue.
//!
//! Configuration is environment-driven; see `nr-config` for the full
//! variable table.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_sqs::types::QueueAttributeName;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;

use nr_api::{AppState, CallbackService, DependencyCheck, IngestionService};
use nr_common::SystemClock;
use nr_config::AppConfig;
use nr_queue::sqs::SqsQueuePublisher;
use nr_store::postgres::{PgApiKeyStore, PgNotificationStore, PgRateLimitStore};
use nr_store::{ApiKeyStore, StaticApiKeys};

struct DatabaseCheck {
    pool: PgPool,
}

#[async_trait]
impl DependencyCheck for DatabaseCheck {
    fn name(&self) -> &str {
        "database"
    }

    async fn check(&self) -> Result<(), String> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

struct QueueCheck {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

#[async_trait]
impl DependencyCheck for QueueCheck {
    fn name(&self) -> &str {
        "queue"
    }

    async fn check(&self) -> Result<(), String> {
        self.client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    nr_common::logging::init_logging("nr-server");

    let config = AppConfig::from_env()?;
    info!("Starting NotifyRelay API server");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    let store = Arc::new(PgNotificationStore::new(pool.clone()));
    store.init_schema().await?;
    let rate_limits = Arc::new(PgRateLimitStore::new(pool.clone()));
    rate_limits.init_schema().await?;

    let api_keys: Arc<dyn ApiKeyStore> = if config.api_keys.is_empty() {
        let pg_keys = PgApiKeyStore::new(pool.clone());
        pg_keys.init_schema().await?;
        info!("API keys resolved from the api_keys table");
        Arc::new(pg_keys)
    } else {
        info!(count = config.api_keys.len(), "API keys resolved from the environment");
        Arc::new(StaticApiKeys::new(&config.api_keys))
    };

    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let sqs_client = aws_sdk_sqs::Client::new(&aws_config);
    let publisher = Arc::new(SqsQueuePublisher::new(
        sqs_client.clone(),
        config.queue_url.clone(),
    ));

    let clock = Arc::new(SystemClock);
    let ingestion = IngestionService::new(
        store.clone(),
        rate_limits.clone(),
        publisher,
        clock.clone(),
        config.rate_limit_recipient_per_hour,
        config.rate_limit_tenant_per_minute,
    );
    let callbacks = CallbackService::new(store.clone(), clock);

    let state = Arc::new(AppState {
        store,
        api_keys,
        ingestion,
        callbacks,
        webhook_verify_token: config.webhook_verify_token.clone(),
        webhook_app_secret: config.webhook_app_secret.clone(),
        dependency_checks: vec![
            Arc::new(DatabaseCheck { pool }),
            Arc::new(QueueCheck {
                client: sqs_client,
                queue_url: config.queue_url.clone(),
            }),
        ],
    });

    let app = nr_api::router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.http_host, config.http_port).parse()?;
    info!(%addr, "API server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("API server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
