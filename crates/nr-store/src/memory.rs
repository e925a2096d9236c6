//! In-memory store implementations.
//!
//! Used by tests and embedded/dev mode. Semantics mirror the PostgreSQL
//! implementations exactly: CAS transitions, write-once timestamps, atomic
//! attempt increments. A [`ManualClock`] lets tests move time forward
//! instead of sleeping.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use nr_common::{Clock, DeliveryLog, DeliveryStatus, Notification, SystemClock};

use crate::{
    error::StoreError, rollover_seconds, window_start_for, NewDeliveryLog, NewNotification,
    NotificationFilter, NotificationStore, Page, RateLimitStore, Result, StatePatch, StatusCount,
    TenantStats,
};

/// Clock whose time is advanced explicitly.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.write();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

// ============================================================================
// Notification Store
// ============================================================================

pub struct MemoryNotificationStore {
    notifications: RwLock<HashMap<Uuid, Notification>>,
    logs: RwLock<Vec<DeliveryLog>>,
    clock: Arc<dyn Clock>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            notifications: RwLock::new(HashMap::new()),
            logs: RwLock::new(Vec::new()),
            clock,
        }
    }

    fn apply_patch(n: &mut Notification, patch: &StatePatch, now: DateTime<Utc>) {
        if n.provider_message_id.is_none() {
            n.provider_message_id = patch.provider_message_id.clone();
        }
        if n.sent_at.is_none() {
            n.sent_at = patch.sent_at;
        }
        if n.delivered_at.is_none() {
            n.delivered_at = patch.delivered_at;
        }
        if n.read_at.is_none() {
            n.read_at = patch.read_at;
        }
        if n.failed_at.is_none() {
            n.failed_at = patch.failed_at;
        }
        if let Some(retry) = patch.next_retry_at {
            n.next_retry_at = retry;
        }
        if patch.last_error_code.is_some() {
            n.last_error_code = patch.last_error_code.clone();
        }
        if patch.last_error_message.is_some() {
            n.last_error_message = patch.last_error_message.clone();
        }
        if patch.increment_attempt {
            n.attempt_number += 1;
        }
        n.updated_at = now;
    }
}

impl Default for MemoryNotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn create(&self, new: NewNotification) -> Result<Notification> {
        let now = self.clock.now();
        let notification = Notification {
            id: new.id,
            tenant_id: new.tenant_id,
            event_type: new.event_type,
            recipient: new.recipient,
            country_code: new.country_code,
            payload: new.payload,
            metadata: new.metadata,
            priority: new.priority,
            status: new.status,
            provider_message_id: None,
            attempt_number: 0,
            max_attempts: new.max_attempts,
            next_retry_at: None,
            last_error_code: None,
            last_error_message: None,
            trace_id: new.trace_id,
            scheduled_for: new.scheduled_for,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            failed_at: None,
            created_at: now,
            updated_at: now,
        };

        self.notifications
            .write()
            .insert(notification.id, notification.clone());
        Ok(notification)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Notification>> {
        Ok(self.notifications.read().get(&id).cloned())
    }

    async fn find_by_provider_message_id(&self, pmid: &str) -> Result<Option<Notification>> {
        Ok(self
            .notifications
            .read()
            .values()
            .find(|n| n.provider_message_id.as_deref() == Some(pmid))
            .cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        to: DeliveryStatus,
        patch: StatePatch,
    ) -> Result<Notification> {
        let now = self.clock.now();
        let mut notifications = self.notifications.write();
        let n = notifications.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if !DeliveryStatus::can_transition(n.status, to) {
            return Err(StoreError::IllegalTransition {
                id,
                from: n.status,
                to,
            });
        }

        n.status = to;
        Self::apply_patch(n, &patch, now);
        Ok(n.clone())
    }

    async fn patch(&self, id: Uuid, patch: StatePatch) -> Result<Notification> {
        let now = self.clock.now();
        let mut notifications = self.notifications.write();
        let n = notifications.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        Self::apply_patch(n, &patch, now);
        Ok(n.clone())
    }

    async fn find_due_retries(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Notification>> {
        let mut due: Vec<Notification> = self
            .notifications
            .read()
            .values()
            .filter(|n| {
                matches!(n.status, DeliveryStatus::Failed | DeliveryStatus::Queued)
                    && n.next_retry_at.map(|at| at <= now).unwrap_or(false)
                    && n.attempt_number < n.max_attempts
            })
            .cloned()
            .collect();

        due.sort_by_key(|n| n.next_retry_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn find_due_scheduled(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Notification>> {
        let mut due: Vec<Notification> = self
            .notifications
            .read()
            .values()
            .filter(|n| {
                n.status == DeliveryStatus::Scheduled
                    && n.scheduled_for.map(|at| at <= now).unwrap_or(false)
            })
            .cloned()
            .collect();

        due.sort_by_key(|n| n.scheduled_for);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn list_by_tenant(
        &self,
        tenant_id: &str,
        filter: NotificationFilter,
        page: Page,
    ) -> Result<Vec<Notification>> {
        let mut matching: Vec<Notification> = self
            .notifications
            .read()
            .values()
            .filter(|n| n.tenant_id == tenant_id)
            .filter(|n| filter.status.map(|s| n.status == s).unwrap_or(true))
            .filter(|n| {
                filter
                    .event_type
                    .as_ref()
                    .map(|e| &n.event_type == e)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit.max(0) as usize)
            .collect())
    }

    async fn tenant_stats(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<TenantStats> {
        let notifications = self.notifications.read();
        let mut counts: HashMap<DeliveryStatus, i64> = HashMap::new();
        let mut tenant_ids = Vec::new();

        for n in notifications.values() {
            if n.tenant_id == tenant_id && n.created_at >= start && n.created_at <= end {
                *counts.entry(n.status).or_insert(0) += 1;
            }
            if n.tenant_id == tenant_id {
                tenant_ids.push(n.id);
            }
        }

        let total = counts.values().sum();
        let by_status = counts
            .into_iter()
            .map(|(status, count)| StatusCount { status, count })
            .collect();

        let logs = self.logs.read();
        let latencies: Vec<i64> = logs
            .iter()
            .filter(|l| {
                l.status == DeliveryStatus::Sent
                    && tenant_ids.contains(&l.notification_id)
                    && l.created_at >= start
                    && l.created_at <= end
            })
            .filter_map(|l| l.latency_ms)
            .collect();

        let average_send_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<i64>() as f64 / latencies.len() as f64)
        };

        Ok(TenantStats {
            total,
            by_status,
            average_send_latency_ms,
        })
    }

    async fn reconcile_stuck_queued(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let now = self.clock.now();
        let mut notifications = self.notifications.write();
        let mut stamped = 0u64;

        for n in notifications.values_mut() {
            if n.status == DeliveryStatus::Queued
                && n.next_retry_at.is_none()
                && n.updated_at < older_than
            {
                n.next_retry_at = Some(now);
                n.updated_at = now;
                stamped += 1;
            }
        }

        Ok(stamped)
    }

    async fn append_log(&self, log: NewDeliveryLog) -> Result<DeliveryLog> {
        let row = DeliveryLog {
            id: Uuid::new_v4(),
            notification_id: log.notification_id,
            attempt: log.attempt,
            status: log.status,
            provider_message_id: log.provider_message_id,
            error_code: log.error_code,
            error_message: log.error_message,
            latency_ms: log.latency_ms,
            response: log.response,
            created_at: self.clock.now(),
        };

        self.logs.write().push(row.clone());
        Ok(row)
    }

    async fn logs_for(&self, notification_id: Uuid, limit: i64) -> Result<Vec<DeliveryLog>> {
        let logs = self.logs.read();
        let mut matching: Vec<DeliveryLog> = logs
            .iter()
            .filter(|l| l.notification_id == notification_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }
}

// ============================================================================
// Rate-Limit Store
// ============================================================================

pub struct MemoryRateLimitStore {
    windows: RwLock<HashMap<(String, DateTime<Utc>), i64>>,
    clock: Arc<dyn Clock>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            clock,
        }
    }

    fn overlapping(&self, recipient: &str) -> Vec<(DateTime<Utc>, i64)> {
        let horizon = self.clock.now() - ChronoDuration::hours(1);
        self.windows
            .read()
            .iter()
            .filter(|((r, start), _)| {
                r == recipient && (*start + ChronoDuration::hours(1)) > horizon
            })
            .map(|((_, start), count)| (*start + ChronoDuration::hours(1), *count))
            .collect()
    }
}

impl Default for MemoryRateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn check(&self, recipient: &str, limit_per_hour: u32) -> Result<bool> {
        let total: i64 = self.overlapping(recipient).iter().map(|(_, c)| c).sum();
        Ok(total < limit_per_hour as i64)
    }

    async fn increment(&self, recipient: &str) -> Result<()> {
        let start = window_start_for(self.clock.now());
        *self
            .windows
            .write()
            .entry((recipient.to_string(), start))
            .or_insert(0) += 1;
        Ok(())
    }

    async fn retry_after_seconds(
        &self,
        recipient: &str,
        limit_per_hour: u32,
    ) -> Result<Option<i64>> {
        Ok(rollover_seconds(
            self.clock.now(),
            limit_per_hour,
            self.overlapping(recipient),
        ))
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut windows = self.windows.write();
        let before = windows.len();
        windows.retain(|(_, start), _| (*start + ChronoDuration::hours(1)) >= older_than);
        Ok((before - windows.len()) as u64)
    }
}
