//! NotifyRelay dispatch worker.
//!
//! Consumes work items from the queue, sends them through the WhatsApp
//! client, and runs the time-driven sweepers: retry re-injection (60 s),
//! scheduled release (30 s) and rate-limit window pruning (hourly). A
//! startup reconciliation pass hands orphaned `queued` rows to the retry
//! sweeper.
//!
//! Configuration is environment-driven; see `nr-config` for the full
//! variable table.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

use nr_common::{backoff::RetryPolicy, SystemClock};
use nr_config::AppConfig;
use nr_dispatch::{
    sweeper::reconcile_on_start, Processor, ProcessorConfig, RateLimitJanitor, RetrySweeper,
    SchedulePromoter, WorkerPool, WorkerPoolConfig,
};
use nr_queue::{sqs::SqsQueueConsumer, QueueConsumer};
use nr_store::postgres::{PgNotificationStore, PgRateLimitStore};
use nr_whatsapp::WhatsAppClient;

#[tokio::main]
async fn main() -> Result<()> {
    nr_common::logging::init_logging("nr-worker");

    let config = AppConfig::from_env()?;
    info!("Starting NotifyRelay worker");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    let store = Arc::new(PgNotificationStore::new(pool.clone()));
    store.init_schema().await?;
    let rate_limits = Arc::new(PgRateLimitStore::new(pool.clone()));
    rate_limits.init_schema().await?;

    let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let sqs_client = aws_sdk_sqs::Client::new(&aws_config);
    let consumer = Arc::new(SqsQueueConsumer::new(
        sqs_client,
        config.queue_url.clone(),
        config.worker_visibility_timeout_s as i32,
    ));

    let whatsapp = Arc::new(WhatsAppClient::new(&config.provider)?);
    let clock = Arc::new(SystemClock);

    let processor = Arc::new(Processor::new(
        store.clone(),
        rate_limits.clone(),
        whatsapp,
        clock.clone(),
        ProcessorConfig {
            retry_policy: RetryPolicy {
                base: config.retry_base,
                ..Default::default()
            },
            rate_limit_per_hour: config.rate_limit_recipient_per_hour,
        },
    ));

    // Rows whose enqueue was lost get handed to the retry sweeper.
    reconcile_on_start(
        store.as_ref(),
        clock.as_ref(),
        Duration::from_secs(config.worker_visibility_timeout_s as u64),
    )
    .await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let pool_task = {
        let worker_pool = WorkerPool::new(
            consumer.clone(),
            processor.clone(),
            WorkerPoolConfig {
                concurrency: config.worker_concurrency,
                visibility_timeout_s: config.worker_visibility_timeout_s,
                visibility_extension_s: config.worker_visibility_timeout_s,
                ..Default::default()
            },
        );
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { worker_pool.run(shutdown_rx).await })
    };

    let retry_task = {
        let sweeper = RetrySweeper::new(
            store.clone(),
            processor.clone(),
            clock.clone(),
            config.retry_sweep_interval,
        );
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { sweeper.run(shutdown_rx).await })
    };

    let promoter_task = {
        let promoter = SchedulePromoter::new(
            store.clone(),
            processor.clone(),
            clock.clone(),
            config.scheduled_sweep_interval,
        );
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { promoter.run(shutdown_rx).await })
    };

    let janitor_task = {
        let janitor = RateLimitJanitor::new(rate_limits.clone(), clock.clone());
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move { janitor.run(shutdown_rx).await })
    };

    // Health/metrics sidecar port for probes.
    let health_addr = SocketAddr::from(([0, 0, 0, 0], config.health_port));
    let health_app = axum::Router::new()
        .route("/health", axum::routing::get(health_handler))
        .route("/metrics", axum::routing::get(metrics_handler));
    let health_listener = tokio::net::TcpListener::bind(health_addr).await?;
    let health_task = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(health_listener, health_app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };
    info!(%health_addr, "Worker health endpoint listening");

    shutdown_signal().await;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
    consumer.stop().await;

    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        let _ = pool_task.await;
        let _ = retry_task.await;
        let _ = promoter_task.await;
        let _ = janitor_task.await;
        let _ = health_task.await;
    })
    .await;

    info!("Worker shutdown complete");
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

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_handler() -> String {
    "# HELP nr_worker_up Worker is up\n# TYPE nr_worker_up gauge\nnr_worker_up 1\n".to_string()
}
