//! End-to-end pipeline tests over the in-memory store and queue.
//!
//! Covers the happy path, transient-then-success retries, permanent
//! failures, scheduled promotion, per-recipient rate limiting and
//! duplicate-delivery tolerance.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use nr_common::{
    backoff::RetryPolicy, Clock, DeliveryStatus, NotificationPayload, Priority, WorkItem,
    DEFAULT_MAX_ATTEMPTS,
};
use nr_dispatch::{
    ProcessOutcome, Processor, ProcessorConfig, RetrySweeper, SchedulePromoter, Sender,
    WorkerPool, WorkerPoolConfig,
};
use nr_queue::{memory::MemoryWorkQueue, QueuePublisher};
use nr_store::{
    memory::{ManualClock, MemoryNotificationStore, MemoryRateLimitStore},
    NewNotification, NotificationStore, RateLimitStore,
};
use nr_whatsapp::{SendError, SendReceipt};

/// Sender that replays a scripted sequence of provider outcomes.
struct ScriptedSender {
    script: Mutex<VecDeque<Result<SendReceipt, SendError>>>,
}

impl ScriptedSender {
    fn new(script: Vec<Result<SendReceipt, SendError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }

    fn accepted(id: &str) -> Result<SendReceipt, SendError> {
        Ok(SendReceipt {
            provider_message_id: id.to_string(),
            raw_response: serde_json::json!({"messages": [{"id": id}]}),
        })
    }

    fn transient(code: Option<i64>, message: &str) -> Result<SendReceipt, SendError> {
        Err(SendError::Transient {
            code,
            message: message.to_string(),
            raw_response: None,
        })
    }

    fn permanent(code: i64, message: &str) -> Result<SendReceipt, SendError> {
        Err(SendError::Permanent {
            code: Some(code),
            message: message.to_string(),
            raw_response: None,
        })
    }
}

#[async_trait]
impl Sender for ScriptedSender {
    async fn send(
        &self,
        _recipient: &str,
        _payload: &NotificationPayload,
    ) -> Result<SendReceipt, SendError> {
        self.script
            .lock()
            .pop_front()
            .expect("sender called more times than scripted")
    }
}

struct Harness {
    clock: ManualClock,
    store: Arc<MemoryNotificationStore>,
    rate_limits: Arc<MemoryRateLimitStore>,
    processor: Arc<Processor>,
}

fn harness(script: Vec<Result<SendReceipt, SendError>>) -> Harness {
    let clock = ManualClock::new(Utc::now());
    let store = Arc::new(MemoryNotificationStore::with_clock(Arc::new(clock.clone())));
    let rate_limits = Arc::new(MemoryRateLimitStore::with_clock(Arc::new(clock.clone())));
    let processor = Arc::new(Processor::new(
        store.clone(),
        rate_limits.clone(),
        Arc::new(ScriptedSender::new(script)),
        Arc::new(clock.clone()),
        ProcessorConfig {
            retry_policy: RetryPolicy::new(
                Duration::from_secs(1),
                Duration::from_secs(3600),
                DEFAULT_MAX_ATTEMPTS as u32,
            ),
            rate_limit_per_hour: 10,
        },
    ));

    Harness {
        clock,
        store,
        rate_limits,
        processor,
    }
}

async fn seed_notification(
    store: &MemoryNotificationStore,
    status: DeliveryStatus,
    scheduled_for: Option<chrono::DateTime<Utc>>,
) -> nr_common::Notification {
    store
        .create(NewNotification {
            id: Uuid::new_v4(),
            tenant_id: "acme".to_string(),
            event_type: "order.placed".to_string(),
            recipient: "+14155552671".to_string(),
            country_code: Some("US".to_string()),
            payload: NotificationPayload::Template {
                name: "order_confirmation".to_string(),
                language: "en".to_string(),
                parameters: vec![],
            },
            metadata: None,
            priority: Priority::Normal,
            status,
            scheduled_for,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            trace_id: "trace-1".to_string(),
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn happy_path_sends_and_logs_once() {
    let h = harness(vec![ScriptedSender::accepted("wamid.X")]);
    let n = seed_notification(&h.store, DeliveryStatus::Queued, None).await;

    let outcome = h
        .processor
        .process(&WorkItem::from_notification(&n))
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Sent);

    let stored = h.store.find_by_id(n.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Sent);
    assert_eq!(stored.provider_message_id.as_deref(), Some("wamid.X"));
    assert_eq!(stored.attempt_number, 1);
    assert!(stored.sent_at.is_some());

    let logs = h.store.logs_for(n.id, 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, DeliveryStatus::Sent);
    assert_eq!(logs[0].attempt, 1);
    assert!(logs[0].latency_ms.is_some());
}

#[tokio::test]
async fn transient_failure_then_success_via_sweeper() {
    let h = harness(vec![
        ScriptedSender::transient(None, "HTTP 503"),
        ScriptedSender::accepted("wamid.Y"),
    ]);
    let n = seed_notification(&h.store, DeliveryStatus::Queued, None).await;
    let started = h.clock.now();

    let outcome = h
        .processor
        .process(&WorkItem::from_notification(&n))
        .await
        .unwrap();
    let ProcessOutcome::RetryScheduled { next_retry_at } = outcome else {
        panic!("expected a scheduled retry, got {outcome:?}");
    };

    // First retry lands at least one base delay out, stretched by up to 25%.
    let delay_ms = (next_retry_at - started).num_milliseconds();
    assert!(
        (1000..=1250).contains(&delay_ms),
        "first retry delay {delay_ms}ms outside [base, base * 1.25]"
    );

    let failed = h.store.find_by_id(n.id).await.unwrap().unwrap();
    assert_eq!(failed.status, DeliveryStatus::Failed);
    assert_eq!(failed.attempt_number, 1);
    assert!(failed.has_pending_retry());

    // Sweeper finds nothing before the retry is due.
    let sweeper = RetrySweeper::new(
        h.store.clone(),
        h.processor.clone(),
        Arc::new(h.clock.clone()),
        Duration::from_secs(60),
    );
    assert_eq!(sweeper.tick().await.unwrap(), 0);

    h.clock.advance(ChronoDuration::seconds(2));
    assert_eq!(sweeper.tick().await.unwrap(), 1);

    let sent = h.store.find_by_id(n.id).await.unwrap().unwrap();
    assert_eq!(sent.status, DeliveryStatus::Sent);
    assert_eq!(sent.attempt_number, 2);
    assert_eq!(sent.provider_message_id.as_deref(), Some("wamid.Y"));
    assert!(sent.next_retry_at.is_none());

    let logs = h.store.logs_for(n.id, 10).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].status, DeliveryStatus::Sent);
    assert_eq!(logs[0].attempt, 2);
    assert_eq!(logs[1].status, DeliveryStatus::Failed);
    assert_eq!(logs[1].attempt, 1);
}

#[tokio::test]
async fn permanent_provider_code_fails_terminally() {
    let h = harness(vec![ScriptedSender::permanent(131026, "Invalid WhatsApp number")]);
    let n = seed_notification(&h.store, DeliveryStatus::Queued, None).await;

    let outcome = h
        .processor
        .process(&WorkItem::from_notification(&n))
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::FailedPermanently);

    let stored = h.store.find_by_id(n.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Failed);
    assert!(stored.failed_at.is_some());
    assert!(stored.next_retry_at.is_none());
    assert_eq!(stored.last_error_code.as_deref(), Some("131026"));

    assert_eq!(h.store.logs_for(n.id, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn exhausted_budget_fails_terminally() {
    // Four transient failures then one more: attempts cap at five.
    let script = (0..DEFAULT_MAX_ATTEMPTS)
        .map(|_| ScriptedSender::transient(None, "HTTP 502"))
        .collect();
    let h = harness(script);
    let n = seed_notification(&h.store, DeliveryStatus::Queued, None).await;

    let mut outcome = h
        .processor
        .process(&WorkItem::from_notification(&n))
        .await
        .unwrap();
    for _ in 1..DEFAULT_MAX_ATTEMPTS {
        h.clock.advance(ChronoDuration::hours(2));
        let current = h.store.find_by_id(n.id).await.unwrap().unwrap();
        outcome = h
            .processor
            .process(&WorkItem::from_notification(&current))
            .await
            .unwrap();
    }

    assert_eq!(outcome, ProcessOutcome::FailedPermanently);
    let stored = h.store.find_by_id(n.id).await.unwrap().unwrap();
    assert_eq!(stored.attempt_number, DEFAULT_MAX_ATTEMPTS);
    assert!(stored.is_terminally_failed());
    assert_eq!(
        h.store.logs_for(n.id, 10).await.unwrap().len(),
        DEFAULT_MAX_ATTEMPTS as usize
    );
}

#[tokio::test]
async fn backoff_delays_grow_between_attempts() {
    let script = (0..3)
        .map(|_| ScriptedSender::transient(None, "HTTP 503"))
        .collect();
    let h = harness(script);
    let n = seed_notification(&h.store, DeliveryStatus::Queued, None).await;

    let mut delays = Vec::new();
    for _ in 0..3 {
        let before = h.clock.now();
        let current = h.store.find_by_id(n.id).await.unwrap().unwrap();
        let outcome = h
            .processor
            .process(&WorkItem::from_notification(&current))
            .await
            .unwrap();
        let ProcessOutcome::RetryScheduled { next_retry_at } = outcome else {
            panic!("expected retry");
        };
        delays.push((next_retry_at - before).num_milliseconds());
        h.clock.advance(ChronoDuration::hours(1));
    }

    assert!(delays[0] < delays[1] && delays[1] < delays[2], "{delays:?}");
}

#[tokio::test]
async fn scheduled_notification_promotes_and_sends() {
    let h = harness(vec![ScriptedSender::accepted("wamid.S")]);
    let due_at = h.clock.now() + ChronoDuration::minutes(2);
    let n = seed_notification(&h.store, DeliveryStatus::Scheduled, Some(due_at)).await;

    let promoter = SchedulePromoter::new(
        h.store.clone(),
        h.processor.clone(),
        Arc::new(h.clock.clone()),
        Duration::from_secs(30),
    );

    // Not due yet.
    assert_eq!(promoter.tick().await.unwrap(), 0);
    assert_eq!(
        h.store.find_by_id(n.id).await.unwrap().unwrap().status,
        DeliveryStatus::Scheduled
    );

    h.clock.advance(ChronoDuration::minutes(3));
    assert_eq!(promoter.tick().await.unwrap(), 1);

    let stored = h.store.find_by_id(n.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Sent);
    assert_eq!(stored.provider_message_id.as_deref(), Some("wamid.S"));
}

#[tokio::test]
async fn over_quota_recipient_is_deferred() {
    let h = harness(vec![]);
    let n = seed_notification(&h.store, DeliveryStatus::Queued, None).await;

    for _ in 0..10 {
        h.rate_limits.increment(&n.recipient).await.unwrap();
    }

    let outcome = h
        .processor
        .process(&WorkItem::from_notification(&n))
        .await
        .unwrap();
    let ProcessOutcome::RateLimited { delay_seconds } = outcome else {
        panic!("expected rate limiting, got {outcome:?}");
    };
    assert!(delay_seconds > 0);

    let stored = h.store.find_by_id(n.id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::RateLimited);

    let logs = h.store.logs_for(n.id, 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, DeliveryStatus::RateLimited);
}

#[tokio::test]
async fn duplicate_delivery_does_not_resend() {
    let h = harness(vec![ScriptedSender::accepted("wamid.D")]);
    let n = seed_notification(&h.store, DeliveryStatus::Queued, None).await;
    let item = WorkItem::from_notification(&n);

    assert_eq!(h.processor.process(&item).await.unwrap(), ProcessOutcome::Sent);
    // Redelivery of the same queue item: the scripted sender would panic if
    // a second send happened.
    assert_eq!(
        h.processor.process(&item).await.unwrap(),
        ProcessOutcome::Duplicate
    );

    assert_eq!(h.store.logs_for(n.id, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn missing_notification_is_skipped() {
    let h = harness(vec![]);
    let item = WorkItem {
        notification_id: Uuid::new_v4(),
        tenant_id: "acme".to_string(),
        recipient: "+14155552671".to_string(),
        payload: NotificationPayload::Text {
            body: "orphan".to_string(),
        },
        attempt_number: 0,
        max_attempts: 5,
        trace_id: "t".to_string(),
    };

    assert_eq!(
        h.processor.process(&item).await.unwrap(),
        ProcessOutcome::Skipped
    );
}

#[tokio::test]
async fn pool_acks_successful_items() {
    let h = harness(vec![ScriptedSender::accepted("wamid.P")]);
    let n = seed_notification(&h.store, DeliveryStatus::Queued, None).await;

    let queue = Arc::new(MemoryWorkQueue::new("main"));
    queue.publish(&WorkItem::from_notification(&n)).await.unwrap();

    let pool = WorkerPool::new(
        queue.clone(),
        h.processor.clone(),
        WorkerPoolConfig {
            concurrency: 2,
            shutdown_grace: Duration::from_secs(5),
            ..Default::default()
        },
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(async move { pool.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();

    assert_eq!(
        h.store.find_by_id(n.id).await.unwrap().unwrap().status,
        DeliveryStatus::Sent
    );
    assert_eq!(queue.pending_len(), 0, "successful item must be acked");
}

#[tokio::test]
async fn pool_leaves_terminal_failures_for_dlq() {
    let h = harness(vec![ScriptedSender::permanent(131026, "Invalid number")]);
    let n = seed_notification(&h.store, DeliveryStatus::Queued, None).await;

    let queue = Arc::new(MemoryWorkQueue::new("main"));
    queue.publish(&WorkItem::from_notification(&n)).await.unwrap();

    let pool = WorkerPool::new(
        queue.clone(),
        h.processor.clone(),
        WorkerPoolConfig {
            concurrency: 2,
            shutdown_grace: Duration::from_secs(5),
            ..Default::default()
        },
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(async move { pool.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();

    let stored = h.store.find_by_id(n.id).await.unwrap().unwrap();
    assert!(stored.is_terminally_failed());
    assert_eq!(
        queue.pending_len(),
        1,
        "terminal failure stays unacked for DLQ routing"
    );
}
