//! In-memory queue for tests and embedded dev mode.
//!
//! Reproduces the broker contract the pipeline depends on: at-least-once
//! delivery, dedup-id suppression over a window, visibility-timeout
//! redelivery, and dead-letter routing after the receive cap.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use nr_common::{Clock, ReceivedItem, SystemClock, WorkItem};

use crate::{QueueConsumer, QueueDepth, QueueError, QueuePublisher, Result, MAX_PUBLISH_BATCH};

const DEFAULT_VISIBILITY_SECONDS: u32 = 30;
const DEFAULT_MAX_RECEIVE_COUNT: u32 = 3;
const DEDUP_WINDOW_MINUTES: i64 = 5;

struct Entry {
    item: WorkItem,
    message_id: String,
    visible_at: DateTime<Utc>,
    receive_count: u32,
    receipt_handle: Option<String>,
}

struct Inner {
    entries: Vec<Entry>,
    dedup_seen: HashMap<String, DateTime<Utc>>,
    dead_letters: Vec<WorkItem>,
}

/// Combined publisher + consumer over a shared in-process queue.
pub struct MemoryWorkQueue {
    name: String,
    inner: Mutex<Inner>,
    visibility_seconds: u32,
    max_receive_count: u32,
    running: AtomicBool,
    total_published: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl MemoryWorkQueue {
    pub fn new(name: &str) -> Self {
        Self::with_clock(name, Arc::new(SystemClock))
    }

    pub fn with_clock(name: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                dedup_seen: HashMap::new(),
                dead_letters: Vec::new(),
            }),
            visibility_seconds: DEFAULT_VISIBILITY_SECONDS,
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
            running: AtomicBool::new(true),
            total_published: AtomicU64::new(0),
            clock,
        }
    }

    pub fn with_visibility_seconds(mut self, seconds: u32) -> Self {
        self.visibility_seconds = seconds;
        self
    }

    pub fn with_max_receive_count(mut self, count: u32) -> Self {
        self.max_receive_count = count;
        self
    }

    /// Items routed to the dead-letter target after the receive cap.
    pub fn dead_letters(&self) -> Vec<WorkItem> {
        self.inner.lock().dead_letters.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

#[async_trait]
impl QueuePublisher for MemoryWorkQueue {
    fn identifier(&self) -> &str {
        &self.name
    }

    async fn publish(&self, item: &WorkItem) -> Result<String> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        // Dedup-id suppression over the trailing window.
        let dedup_id = item.dedup_id();
        inner
            .dedup_seen
            .retain(|_, seen| *seen > now - ChronoDuration::minutes(DEDUP_WINDOW_MINUTES));
        if let Some(seen) = inner.dedup_seen.get(&dedup_id) {
            debug!(queue = %self.name, dedup_id = %dedup_id, seen = %seen, "Duplicate publish suppressed");
            return Ok(format!("dedup-{dedup_id}"));
        }
        inner.dedup_seen.insert(dedup_id, now);

        let message_id = Uuid::new_v4().to_string();
        inner.entries.push(Entry {
            item: item.clone(),
            message_id: message_id.clone(),
            visible_at: now,
            receive_count: 0,
            receipt_handle: None,
        });

        self.total_published.fetch_add(1, Ordering::Relaxed);
        Ok(message_id)
    }

    async fn publish_batch(&self, items: &[WorkItem]) -> Result<Vec<String>> {
        if items.len() > MAX_PUBLISH_BATCH {
            return Err(QueueError::Sqs(format!(
                "batch of {} exceeds limit of {}",
                items.len(),
                MAX_PUBLISH_BATCH
            )));
        }

        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            ids.push(self.publish(item).await?);
        }
        Ok(ids)
    }
}

#[async_trait]
impl QueueConsumer for MemoryWorkQueue {
    fn identifier(&self) -> &str {
        &self.name
    }

    async fn poll(&self, max_messages: u32) -> Result<Vec<ReceivedItem>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let now = self.clock.now();
        let visibility = ChronoDuration::seconds(self.visibility_seconds as i64);
        let mut inner = self.inner.lock();
        let max_receive_count = self.max_receive_count;

        // Route entries past the receive cap to the DLQ first.
        let mut dead = Vec::new();
        inner.entries.retain(|e| {
            if e.visible_at <= now && e.receive_count >= max_receive_count {
                dead.push(e.item.clone());
                false
            } else {
                true
            }
        });
        inner.dead_letters.extend(dead);

        let mut delivered = Vec::new();
        for entry in inner.entries.iter_mut() {
            if delivered.len() >= max_messages as usize {
                break;
            }
            if entry.visible_at > now {
                continue;
            }

            let receipt = Uuid::new_v4().to_string();
            entry.receive_count += 1;
            entry.visible_at = now + visibility;
            entry.receipt_handle = Some(receipt.clone());

            delivered.push(ReceivedItem {
                item: entry.item.clone(),
                receipt_handle: receipt,
                broker_message_id: Some(entry.message_id.clone()),
                queue_identifier: self.name.clone(),
            });
        }

        Ok(delivered)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|e| e.receipt_handle.as_deref() != Some(receipt_handle));

        if inner.entries.len() == before {
            return Err(QueueError::UnknownReceipt(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| QueueError::UnknownReceipt(receipt_handle.to_string()))?;

        entry.visible_at = now + ChronoDuration::seconds(delay_seconds.unwrap_or(0) as i64);
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| QueueError::UnknownReceipt(receipt_handle.to_string()))?;

        entry.visible_at = now + ChronoDuration::seconds(seconds as i64);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn depth(&self) -> Result<Option<QueueDepth>> {
        let now = self.clock.now();
        let inner = self.inner.lock();
        let pending = inner.entries.iter().filter(|e| e.visible_at <= now).count() as u64;
        let in_flight = inner.entries.len() as u64 - pending;

        Ok(Some(QueueDepth {
            pending,
            in_flight,
            queue_identifier: self.name.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use nr_common::NotificationPayload;
    use parking_lot::RwLock;

    #[derive(Clone)]
    struct TestClock(Arc<RwLock<DateTime<Utc>>>);

    impl TestClock {
        fn new() -> Self {
            Self(Arc::new(RwLock::new(Utc::now())))
        }

        fn advance_secs(&self, secs: i64) {
            *self.0.write() += ChronoDuration::seconds(secs);
        }
    }

    impl Clock for TestClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.read()
        }
    }

    fn work_item(id: Uuid) -> WorkItem {
        WorkItem {
            notification_id: id,
            tenant_id: "acme".to_string(),
            recipient: "+14155552671".to_string(),
            payload: NotificationPayload::Text {
                body: "hi".to_string(),
            },
            attempt_number: 0,
            max_attempts: 5,
            trace_id: "t".to_string(),
        }
    }

    #[tokio::test]
    async fn publish_poll_ack_round_trip() {
        let queue = MemoryWorkQueue::new("main");
        queue.publish(&work_item(Uuid::new_v4())).await.unwrap();

        let items = queue.poll(10).await.unwrap();
        assert_eq!(items.len(), 1);

        queue.ack(&items[0].receipt_handle).await.unwrap();
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test]
    async fn duplicate_publish_is_suppressed_by_dedup_id() {
        let queue = MemoryWorkQueue::new("main");
        let item = work_item(Uuid::new_v4());

        queue.publish(&item).await.unwrap();
        queue.publish(&item).await.unwrap();

        assert_eq!(queue.pending_len(), 1);
    }

    #[tokio::test]
    async fn unacked_item_redelivers_after_visibility_timeout() {
        let clock = TestClock::new();
        let queue =
            MemoryWorkQueue::with_clock("main", Arc::new(clock.clone())).with_visibility_seconds(30);
        queue.publish(&work_item(Uuid::new_v4())).await.unwrap();

        let first = queue.poll(10).await.unwrap();
        assert_eq!(first.len(), 1);

        // Hidden while in flight.
        assert!(queue.poll(10).await.unwrap().is_empty());

        clock.advance_secs(31);
        let second = queue.poll(10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].receipt_handle, second[0].receipt_handle);
    }

    #[tokio::test]
    async fn item_routes_to_dlq_after_receive_cap() {
        let clock = TestClock::new();
        let queue = MemoryWorkQueue::with_clock("main", Arc::new(clock.clone()))
            .with_visibility_seconds(30)
            .with_max_receive_count(3);
        let id = Uuid::new_v4();
        queue.publish(&work_item(id)).await.unwrap();

        for _ in 0..3 {
            assert_eq!(queue.poll(10).await.unwrap().len(), 1);
            clock.advance_secs(31);
        }

        assert!(queue.poll(10).await.unwrap().is_empty());
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].notification_id, id);
    }

    #[tokio::test]
    async fn defer_delays_redelivery_without_dlq_credit() {
        let clock = TestClock::new();
        let queue = MemoryWorkQueue::with_clock("main", Arc::new(clock.clone()))
            .with_max_receive_count(2);
        queue.publish(&work_item(Uuid::new_v4())).await.unwrap();

        let items = queue.poll(10).await.unwrap();
        queue.defer(&items[0].receipt_handle, Some(60)).await.unwrap();

        clock.advance_secs(59);
        assert!(queue.poll(10).await.unwrap().is_empty());

        clock.advance_secs(2);
        assert_eq!(queue.poll(10).await.unwrap().len(), 1);
    }
}
