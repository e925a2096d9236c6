//! Environment-driven configuration.
//!
//! Both processes read the same variable set; defaults match the deployment
//! contract.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `DATABASE_URL` | - | PostgreSQL connection URL (required) |
//! | `QUEUE_URL` | - | Main work queue URL (required) |
//! | `QUEUE_DLQ_URL` | - | Dead-letter queue URL (optional, informational) |
//! | `PROVIDER_BASE_URL` | `https://graph.facebook.com` | Messaging API base |
//! | `PROVIDER_API_VERSION` | `v20.0` | Messaging API version segment |
//! | `PROVIDER_PHONE_NUMBER_ID` | - | Sender phone-number id (required) |
//! | `PROVIDER_ACCESS_TOKEN` | - | Bearer credential (required) |
//! | `PROVIDER_TIMEOUT_MS` | `30000` | Outbound send timeout |
//! | `API_KEYS` | empty | Comma-separated accepted API keys |
//! | `RATE_LIMIT_RECIPIENT_PER_HOUR` | `10` | Per-recipient hourly cap |
//! | `RATE_LIMIT_TENANT_PER_MINUTE` | `100` | Per-tenant ingestion cap |
//! | `WORKER_CONCURRENCY` | `10` | Concurrent processor tasks |
//! | `WORKER_VISIBILITY_TIMEOUT_S` | `30` | Queue visibility timeout |
//! | `RETRY_SWEEP_INTERVAL_MS` | `60000` | Retry sweeper tick |
//! | `SCHEDULED_SWEEP_INTERVAL_MS` | `30000` | Schedule promoter tick |
//! | `RETRY_BASE_MS` | `60000` | Backoff baseline (`1000` in test mode) |
//! | `WEBHOOK_VERIFY_TOKEN` | - | Provider webhook verify token (required) |
//! | `WEBHOOK_APP_SECRET` | - | HMAC secret for callback signatures (optional) |
//! | `HTTP_HOST` / `HTTP_PORT` | `0.0.0.0` / `8080` | API bind address |
//! | `HEALTH_PORT` | `9090` | Worker health/metrics port |

use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    MissingVar(&'static str),

    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVar(key))
}

/// Messaging-provider settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_version: String,
    pub phone_number_id: String,
    pub access_token: String,
    pub timeout: Duration,
}

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub queue_url: String,
    pub queue_dlq_url: Option<String>,
    pub provider: ProviderConfig,
    /// Accepted API keys; each key maps to its own tenant unless a keyed
    /// tenant lookup is provisioned in the database.
    pub api_keys: Vec<String>,
    pub rate_limit_recipient_per_hour: u32,
    pub rate_limit_tenant_per_minute: u32,
    pub worker_concurrency: usize,
    pub worker_visibility_timeout_s: u32,
    pub retry_sweep_interval: Duration,
    pub scheduled_sweep_interval: Duration,
    pub retry_base: Duration,
    pub webhook_verify_token: String,
    pub webhook_app_secret: Option<String>,
    pub http_host: String,
    pub http_port: u16,
    pub health_port: u16,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_keys = env_or("API_KEYS", "")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            database_url: env_required("DATABASE_URL")?,
            queue_url: env_required("QUEUE_URL")?,
            queue_dlq_url: env::var("QUEUE_DLQ_URL").ok(),
            provider: ProviderConfig {
                base_url: env_or("PROVIDER_BASE_URL", "https://graph.facebook.com"),
                api_version: env_or("PROVIDER_API_VERSION", "v20.0"),
                phone_number_id: env_required("PROVIDER_PHONE_NUMBER_ID")?,
                access_token: env_required("PROVIDER_ACCESS_TOKEN")?,
                timeout: Duration::from_millis(env_or_parse("PROVIDER_TIMEOUT_MS", 30_000u64)),
            },
            api_keys,
            rate_limit_recipient_per_hour: env_or_parse("RATE_LIMIT_RECIPIENT_PER_HOUR", 10),
            rate_limit_tenant_per_minute: env_or_parse("RATE_LIMIT_TENANT_PER_MINUTE", 100),
            worker_concurrency: env_or_parse("WORKER_CONCURRENCY", 10),
            worker_visibility_timeout_s: env_or_parse("WORKER_VISIBILITY_TIMEOUT_S", 30),
            retry_sweep_interval: Duration::from_millis(env_or_parse(
                "RETRY_SWEEP_INTERVAL_MS",
                60_000u64,
            )),
            scheduled_sweep_interval: Duration::from_millis(env_or_parse(
                "SCHEDULED_SWEEP_INTERVAL_MS",
                30_000u64,
            )),
            retry_base: Duration::from_millis(env_or_parse("RETRY_BASE_MS", 60_000u64)),
            webhook_verify_token: env_required("WEBHOOK_VERIFY_TOKEN")?,
            webhook_app_secret: env::var("WEBHOOK_APP_SECRET").ok(),
            http_host: env_or("HTTP_HOST", "0.0.0.0"),
            http_port: env_or_parse("HTTP_PORT", 8080),
            health_port: env_or_parse("HEALTH_PORT", 9090),
        })
    }
}
