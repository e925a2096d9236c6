//! PostgreSQL store implementations.
//!
//! Payload and metadata are stored as JSON text; status and priority as
//! their string tags. State transitions are single-statement conditional
//! updates (`UPDATE ... WHERE id = $1 AND status = ANY(predecessors)
//! RETURNING ...`) so no long-lived transaction spans an outbound send.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};
use tracing::debug;
use uuid::Uuid;

use nr_common::{DeliveryLog, DeliveryStatus, Notification, Priority};

use crate::{
    error::StoreError, rollover_seconds, window_start_for, ApiKeyStore, NewDeliveryLog,
    NewNotification, NotificationFilter, NotificationStore, Page, RateLimitStore, Result,
    StatePatch, StatusCount, Tenant, TenantStats,
};

const NOTIFICATION_COLUMNS: &str = "id, tenant_id, event_type, recipient_phone, country_code, \
     payload, metadata, priority, status, provider_message_id, attempt_number, max_attempts, \
     next_retry_at, last_error_code, last_error_message, trace_id, scheduled_for, sent_at, \
     delivered_at, read_at, failed_at, created_at, updated_at";

const LOG_COLUMNS: &str = "id, notification_id, attempt, status, provider_message_id, \
     error_code, error_message, latency_ms, response, created_at";

pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and the indices the sweepers and lookups depend on.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                recipient_phone TEXT NOT NULL,
                country_code TEXT,
                payload TEXT NOT NULL,
                metadata TEXT,
                priority TEXT NOT NULL DEFAULT 'normal',
                status TEXT NOT NULL,
                provider_message_id TEXT,
                attempt_number INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 5,
                next_retry_at TIMESTAMPTZ,
                last_error_code TEXT,
                last_error_message TEXT,
                trace_id TEXT NOT NULL,
                scheduled_for TIMESTAMPTZ,
                sent_at TIMESTAMPTZ,
                delivered_at TIMESTAMPTZ,
                read_at TIMESTAMPTZ,
                failed_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS delivery_logs (
                id UUID PRIMARY KEY,
                notification_id UUID NOT NULL,
                attempt INTEGER NOT NULL,
                status TEXT NOT NULL,
                provider_message_id TEXT,
                error_code TEXT,
                error_message TEXT,
                latency_ms BIGINT,
                response TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_notifications_tenant_status \
             ON notifications (tenant_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_notifications_next_retry \
             ON notifications (next_retry_at) WHERE next_retry_at IS NOT NULL",
            "CREATE INDEX IF NOT EXISTS idx_notifications_scheduled \
             ON notifications (scheduled_for) WHERE scheduled_for IS NOT NULL",
            "CREATE INDEX IF NOT EXISTS idx_notifications_provider_message \
             ON notifications (provider_message_id)",
            "CREATE INDEX IF NOT EXISTS idx_delivery_logs_notification \
             ON delivery_logs (notification_id, created_at DESC)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    fn parse_row(row: &PgRow) -> Result<Notification> {
        let status_tag: String = row.get("status");
        let status = DeliveryStatus::parse(&status_tag)
            .ok_or_else(|| StoreError::Database(format!("unknown status tag: {status_tag}")))?;

        let priority_tag: String = row.get("priority");
        let priority = Priority::parse(&priority_tag).unwrap_or_default();

        let metadata: Option<String> = row.get("metadata");
        let metadata = metadata
            .map(|m| serde_json::from_str(&m))
            .transpose()?;

        Ok(Notification {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            event_type: row.get("event_type"),
            recipient: row.get("recipient_phone"),
            country_code: row.get("country_code"),
            payload: serde_json::from_str(row.get("payload"))?,
            metadata,
            priority,
            status,
            provider_message_id: row.get("provider_message_id"),
            attempt_number: row.get("attempt_number"),
            max_attempts: row.get("max_attempts"),
            next_retry_at: row.get("next_retry_at"),
            last_error_code: row.get("last_error_code"),
            last_error_message: row.get("last_error_message"),
            trace_id: row.get("trace_id"),
            scheduled_for: row.get("scheduled_for"),
            sent_at: row.get("sent_at"),
            delivered_at: row.get("delivered_at"),
            read_at: row.get("read_at"),
            failed_at: row.get("failed_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn parse_log_row(row: &PgRow) -> Result<DeliveryLog> {
        let status_tag: String = row.get("status");
        let status = DeliveryStatus::parse(&status_tag)
            .ok_or_else(|| StoreError::Database(format!("unknown status tag: {status_tag}")))?;

        let response: Option<String> = row.get("response");
        let response = response
            .map(|r| serde_json::from_str(&r))
            .transpose()?;

        Ok(DeliveryLog {
            id: row.get("id"),
            notification_id: row.get("notification_id"),
            attempt: row.get("attempt"),
            status,
            provider_message_id: row.get("provider_message_id"),
            error_code: row.get("error_code"),
            error_message: row.get("error_message"),
            latency_ms: row.get("latency_ms"),
            response,
            created_at: row.get("created_at"),
        })
    }

    /// Shared SET clause for `transition` and `patch`. Timestamps and the
    /// provider message id are write-once; error fields overwrite when
    /// provided; `next_retry_at` is updated only when the patch carries it.
    async fn apply_update(
        &self,
        id: Uuid,
        new_status: Option<DeliveryStatus>,
        patch: &StatePatch,
        predecessors: Option<Vec<String>>,
    ) -> Result<Option<Notification>> {
        let (set_retry, retry_value) = match patch.next_retry_at {
            Some(value) => (true, value),
            None => (false, None),
        };

        let query = format!(
            r#"
            UPDATE notifications SET
                status = COALESCE($2, status),
                provider_message_id = COALESCE(provider_message_id, $3),
                sent_at = COALESCE(sent_at, $4),
                delivered_at = COALESCE(delivered_at, $5),
                read_at = COALESCE(read_at, $6),
                failed_at = COALESCE(failed_at, $7),
                next_retry_at = CASE WHEN $8 THEN $9 ELSE next_retry_at END,
                last_error_code = COALESCE($10, last_error_code),
                last_error_message = COALESCE($11, last_error_message),
                attempt_number = attempt_number + CASE WHEN $12 THEN 1 ELSE 0 END,
                updated_at = now()
            WHERE id = $1 {}
            RETURNING {}
            "#,
            if predecessors.is_some() {
                "AND status = ANY($13)"
            } else {
                ""
            },
            NOTIFICATION_COLUMNS,
        );

        let mut q = sqlx::query(&query)
            .bind(id)
            .bind(new_status.map(|s| s.as_str()))
            .bind(&patch.provider_message_id)
            .bind(patch.sent_at)
            .bind(patch.delivered_at)
            .bind(patch.read_at)
            .bind(patch.failed_at)
            .bind(set_retry)
            .bind(retry_value)
            .bind(&patch.last_error_code)
            .bind(&patch.last_error_message)
            .bind(patch.increment_attempt);

        if let Some(preds) = &predecessors {
            q = q.bind(preds);
        }

        let row = q.fetch_optional(&self.pool).await?;
        row.map(|r| Self::parse_row(&r)).transpose()
    }
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn create(&self, new: NewNotification) -> Result<Notification> {
        let payload = serde_json::to_string(&new.payload)?;
        let metadata = new
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let query = format!(
            r#"
            INSERT INTO notifications (
                id, tenant_id, event_type, recipient_phone, country_code, payload,
                metadata, priority, status, max_attempts, trace_id, scheduled_for
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        );

        let row = sqlx::query(&query)
            .bind(new.id)
            .bind(&new.tenant_id)
            .bind(&new.event_type)
            .bind(&new.recipient)
            .bind(&new.country_code)
            .bind(payload)
            .bind(metadata)
            .bind(new.priority.as_str())
            .bind(new.status.as_str())
            .bind(new.max_attempts)
            .bind(&new.trace_id)
            .bind(new.scheduled_for)
            .fetch_one(&self.pool)
            .await?;

        debug!(notification_id = %new.id, status = %new.status, "Notification persisted");
        Self::parse_row(&row)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Notification>> {
        let query = format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = $1");
        let row = sqlx::query(&query).bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| Self::parse_row(&r)).transpose()
    }

    async fn find_by_provider_message_id(&self, pmid: &str) -> Result<Option<Notification>> {
        let query = format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE provider_message_id = $1"
        );
        let row = sqlx::query(&query)
            .bind(pmid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::parse_row(&r)).transpose()
    }

    async fn transition(
        &self,
        id: Uuid,
        to: DeliveryStatus,
        patch: StatePatch,
    ) -> Result<Notification> {
        let predecessors: Vec<String> = DeliveryStatus::allowed_predecessors(to)
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        match self
            .apply_update(id, Some(to), &patch, Some(predecessors))
            .await?
        {
            Some(updated) => Ok(updated),
            None => {
                // Distinguish a missing row from an illegal transition.
                match self.find_by_id(id).await? {
                    Some(current) => Err(StoreError::IllegalTransition {
                        id,
                        from: current.status,
                        to,
                    }),
                    None => Err(StoreError::NotFound(id)),
                }
            }
        }
    }

    async fn patch(&self, id: Uuid, patch: StatePatch) -> Result<Notification> {
        self.apply_update(id, None, &patch, None)
            .await?
            .ok_or(StoreError::NotFound(id))
    }

    async fn find_due_retries(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Notification>> {
        let query = format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS} FROM notifications
            WHERE status IN ('failed', 'queued')
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= $1
              AND attempt_number < max_attempts
            ORDER BY next_retry_at ASC
            LIMIT $2
            "#
        );

        let rows = sqlx::query(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn find_due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>> {
        let query = format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS} FROM notifications
            WHERE status = 'scheduled' AND scheduled_for <= $1
            ORDER BY scheduled_for ASC
            LIMIT $2
            "#
        );

        let rows = sqlx::query(&query)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn list_by_tenant(
        &self,
        tenant_id: &str,
        filter: NotificationFilter,
        page: Page,
    ) -> Result<Vec<Notification>> {
        let mut builder: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE tenant_id = "
        ));
        builder.push_bind(tenant_id);

        if let Some(status) = filter.status {
            builder.push(" AND status = ");
            builder.push_bind(status.as_str());
        }
        if let Some(event_type) = &filter.event_type {
            builder.push(" AND event_type = ");
            builder.push_bind(event_type);
        }

        builder.push(" ORDER BY created_at DESC LIMIT ");
        builder.push_bind(page.limit);
        builder.push(" OFFSET ");
        builder.push_bind(page.offset());

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::parse_row).collect()
    }

    async fn tenant_stats(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<TenantStats> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count FROM notifications
            WHERE tenant_id = $1 AND created_at >= $2 AND created_at <= $3
            GROUP BY status
            "#,
        )
        .bind(tenant_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let mut by_status = Vec::with_capacity(rows.len());
        let mut total = 0i64;
        for row in &rows {
            let tag: String = row.get("status");
            let count: i64 = row.get("count");
            if let Some(status) = DeliveryStatus::parse(&tag) {
                total += count;
                by_status.push(StatusCount { status, count });
            }
        }

        let average_send_latency_ms: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT AVG(dl.latency_ms)::float8 FROM delivery_logs dl
            JOIN notifications n ON n.id = dl.notification_id
            WHERE n.tenant_id = $1
              AND dl.status = 'sent'
              AND dl.created_at >= $2 AND dl.created_at <= $3
            "#,
        )
        .bind(tenant_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;

        Ok(TenantStats {
            total,
            by_status,
            average_send_latency_ms,
        })
    }

    async fn reconcile_stuck_queued(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE notifications SET next_retry_at = now(), updated_at = now()
            WHERE status = 'queued' AND next_retry_at IS NULL AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn append_log(&self, log: NewDeliveryLog) -> Result<DeliveryLog> {
        let response = log
            .response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let query = format!(
            r#"
            INSERT INTO delivery_logs (
                id, notification_id, attempt, status, provider_message_id,
                error_code, error_message, latency_ms, response
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {LOG_COLUMNS}
            "#
        );

        let row = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(log.notification_id)
            .bind(log.attempt)
            .bind(log.status.as_str())
            .bind(&log.provider_message_id)
            .bind(&log.error_code)
            .bind(&log.error_message)
            .bind(log.latency_ms)
            .bind(response)
            .fetch_one(&self.pool)
            .await?;

        Self::parse_log_row(&row)
    }

    async fn logs_for(&self, notification_id: Uuid, limit: i64) -> Result<Vec<DeliveryLog>> {
        let query = format!(
            r#"
            SELECT {LOG_COLUMNS} FROM delivery_logs
            WHERE notification_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#
        );

        let rows = sqlx::query(&query)
            .bind(notification_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::parse_log_row).collect()
    }
}

// ============================================================================
// Rate Limits
// ============================================================================

pub struct PgRateLimitStore {
    pool: PgPool,
}

impl PgRateLimitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_limits (
                recipient_phone TEXT NOT NULL,
                window_start TIMESTAMPTZ NOT NULL,
                window_end TIMESTAMPTZ NOT NULL,
                message_count BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (recipient_phone, window_start)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn overlapping_windows(&self, recipient: &str) -> Result<Vec<(DateTime<Utc>, i64)>> {
        let horizon = Utc::now() - ChronoDuration::hours(1);
        let rows = sqlx::query(
            r#"
            SELECT window_end, message_count FROM rate_limits
            WHERE recipient_phone = $1 AND window_end > $2
            "#,
        )
        .bind(recipient)
        .bind(horizon)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| (r.get("window_end"), r.get("message_count")))
            .collect())
    }
}

#[async_trait]
impl RateLimitStore for PgRateLimitStore {
    async fn check(&self, recipient: &str, limit_per_hour: u32) -> Result<bool> {
        let windows = self.overlapping_windows(recipient).await?;
        let total: i64 = windows.iter().map(|(_, c)| c).sum();
        Ok(total < limit_per_hour as i64)
    }

    async fn increment(&self, recipient: &str) -> Result<()> {
        let window_start = window_start_for(Utc::now());
        let window_end = window_start + ChronoDuration::hours(1);

        sqlx::query(
            r#"
            INSERT INTO rate_limits (recipient_phone, window_start, window_end, message_count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (recipient_phone, window_start)
            DO UPDATE SET message_count = rate_limits.message_count + 1
            "#,
        )
        .bind(recipient)
        .bind(window_start)
        .bind(window_end)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn retry_after_seconds(
        &self,
        recipient: &str,
        limit_per_hour: u32,
    ) -> Result<Option<i64>> {
        let windows = self.overlapping_windows(recipient).await?;
        Ok(rollover_seconds(Utc::now(), limit_per_hour, windows))
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE window_end < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// API Keys
// ============================================================================

pub struct PgApiKeyStore {
    pool: PgPool,
}

impl PgApiKeyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS api_keys (
                api_key TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                tenant_name TEXT NOT NULL,
                rate_limit_per_hour INTEGER,
                active BOOLEAN NOT NULL DEFAULT TRUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ApiKeyStore for PgApiKeyStore {
    async fn resolve(&self, api_key: &str) -> Result<Option<Tenant>> {
        let row = sqlx::query(
            r#"
            SELECT tenant_id, tenant_name, rate_limit_per_hour FROM api_keys
            WHERE api_key = $1 AND active
            "#,
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Tenant {
            id: r.get("tenant_id"),
            name: r.get("tenant_name"),
            rate_limit_per_hour: r
                .get::<Option<i32>, _>("rate_limit_per_hour")
                .map(|v| v as u32),
        }))
    }
}
