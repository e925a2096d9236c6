//! HTTP-level tests over the assembled router with in-memory stores.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{Duration as ChronoDuration, Utc};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;
use uuid::Uuid;

use nr_api::{router, AppState, CallbackService, IngestionService};
use nr_common::{Clock, DeliveryStatus, NotificationPayload, Priority, DEFAULT_MAX_ATTEMPTS};
use nr_queue::memory::MemoryWorkQueue;
use nr_store::{
    memory::{ManualClock, MemoryNotificationStore, MemoryRateLimitStore},
    ApiKeyStore, NewNotification, NotificationStore, RateLimitStore, StatePatch, StaticApiKeys,
};

const KEY_A: &str = "test-key-a";
const KEY_B: &str = "test-key-b";
const VERIFY_TOKEN: &str = "verify-me";

struct TestApp {
    router: axum::Router,
    store: Arc<MemoryNotificationStore>,
    rate_limits: Arc<MemoryRateLimitStore>,
    queue: Arc<MemoryWorkQueue>,
    api_keys: Arc<StaticApiKeys>,
    clock: ManualClock,
}

fn test_app(webhook_app_secret: Option<String>) -> TestApp {
    let clock = ManualClock::new(Utc::now());
    let store = Arc::new(MemoryNotificationStore::with_clock(Arc::new(clock.clone())));
    let rate_limits = Arc::new(MemoryRateLimitStore::with_clock(Arc::new(clock.clone())));
    let queue = Arc::new(MemoryWorkQueue::with_clock("main", Arc::new(clock.clone())));
    let api_keys = Arc::new(StaticApiKeys::new(&[KEY_A.to_string(), KEY_B.to_string()]));

    let ingestion = IngestionService::new(
        store.clone(),
        rate_limits.clone(),
        queue.clone(),
        Arc::new(clock.clone()),
        10,
        100,
    );
    let callbacks = CallbackService::new(store.clone(), Arc::new(clock.clone()));

    let state = Arc::new(AppState {
        store: store.clone(),
        api_keys: api_keys.clone(),
        ingestion,
        callbacks,
        webhook_verify_token: VERIFY_TOKEN.to_string(),
        webhook_app_secret,
        dependency_checks: vec![],
    });

    TestApp {
        router: router(state),
        store,
        rate_limits,
        queue,
        api_keys,
        clock,
    }
}

async fn tenant_id(app: &TestApp, key: &str) -> String {
    app.api_keys.resolve(key).await.unwrap().unwrap().id
}

fn create_body() -> Value {
    json!({
        "event_type": "order.placed",
        "recipient": { "phone_number": "+14155552671" },
        "template": { "name": "order_confirmation", "language": "en" },
    })
}

fn post_json(uri: &str, key: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("x-api-key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn response_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn rejects_missing_api_key() {
    let app = test_app(None);
    let response = app
        .router
        .oneshot(post_json("/v1/notifications", None, &create_body()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn creates_notification_and_enqueues_work_item() {
    let app = test_app(None);
    let response = app
        .router
        .clone()
        .oneshot(post_json("/v1/notifications", Some(KEY_A), &create_body()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    assert_eq!(body["status"], "queued");
    let id: Uuid = body["id"].as_str().unwrap().parse().unwrap();

    let stored = app.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Queued);
    assert_eq!(stored.tenant_id, tenant_id(&app, KEY_A).await);
    assert_eq!(app.queue.pending_len(), 1);
}

#[tokio::test]
async fn rejects_invalid_phone_with_field_path() {
    let app = test_app(None);
    let mut body = create_body();
    body["recipient"]["phone_number"] = json!("0123");

    let response = app
        .router
        .oneshot(post_json("/v1/notifications", Some(KEY_A), &body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert_eq!(body["error"], "VALIDATION_ERROR");
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("recipient.phone_number"));
}

#[tokio::test]
async fn eleventh_message_in_hour_is_rate_limited_without_a_row() {
    let app = test_app(None);
    for _ in 0..10 {
        app.rate_limits.increment("+14155552671").await.unwrap();
    }

    let response = app
        .router
        .clone()
        .oneshot(post_json("/v1/notifications", Some(KEY_A), &create_body()))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
    let body = response_json(response).await;
    assert!(body["retryAfterSeconds"].as_i64().unwrap() > 0);

    // No notification row was created and nothing was enqueued.
    assert_eq!(app.queue.pending_len(), 0);
    let listed = app
        .store
        .list_by_tenant(
            &tenant_id(&app, KEY_A).await,
            Default::default(),
            Default::default(),
        )
        .await
        .unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn idempotency_key_replay_returns_existing_row() {
    let app = test_app(None);
    let request = |key: &'static str| {
        let mut req = post_json("/v1/notifications", Some(KEY_A), &create_body());
        req.headers_mut()
            .insert("idempotency-key", key.parse().unwrap());
        req
    };

    let first = app.router.clone().oneshot(request("order-42")).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let first_body = response_json(first).await;

    let second = app.router.clone().oneshot(request("order-42")).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second_body = response_json(second).await;

    assert_eq!(first_body["id"], second_body["id"]);
    let listed = app
        .store
        .list_by_tenant(
            &tenant_id(&app, KEY_A).await,
            Default::default(),
            Default::default(),
        )
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn future_scheduled_notification_is_not_enqueued() {
    let app = test_app(None);
    let mut body = create_body();
    body["scheduled_for"] = json!((Utc::now() + ChronoDuration::minutes(2)).to_rfc3339());

    let response = app
        .router
        .oneshot(post_json("/v1/notifications", Some(KEY_A), &body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    assert_eq!(body["status"], "scheduled");
    assert_eq!(app.queue.pending_len(), 0);
}

#[tokio::test]
async fn bulk_returns_per_entry_results() {
    let app = test_app(None);
    let mut bad_entry = create_body();
    bad_entry["recipient"]["phone_number"] = json!("nope");

    let body = json!({ "notifications": [create_body(), bad_entry] });
    let response = app
        .router
        .oneshot(post_json("/v1/notifications/bulk", Some(KEY_A), &body))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["status"], "queued");
    assert!(results[0]["error"].is_null());
    assert!(results[1]["error"].as_str().unwrap().contains("phone_number"));
}

#[tokio::test]
async fn status_endpoint_is_tenant_scoped() {
    let app = test_app(None);
    let response = app
        .router
        .clone()
        .oneshot(post_json("/v1/notifications", Some(KEY_A), &create_body()))
        .await
        .unwrap();
    let id = response_json(response).await["id"]
        .as_str()
        .unwrap()
        .to_string();

    let own = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/v1/notifications/{id}/status"))
                .header("x-api-key", KEY_A)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(own.status(), StatusCode::OK);

    let other = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/v1/notifications/{id}/status"))
                .header("x-api-key", KEY_B)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn webhook_verification_echoes_challenge_only_for_valid_token() {
    let app = test_app(None);

    let ok = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/v1/webhooks/provider?hub.mode=subscribe&hub.verify_token={VERIFY_TOKEN}&hub.challenge=12345"
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);
    let bytes = ok.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], &b"12345"[..]);

    let bad = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/webhooks/provider?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=12345")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(bad.status(), StatusCode::FORBIDDEN);
}

async fn seed_sent_notification(app: &TestApp, pmid: &str) -> Uuid {
    let id = Uuid::new_v4();
    app.store
        .create(NewNotification {
            id,
            tenant_id: tenant_id(app, KEY_A).await,
            event_type: "order.placed".to_string(),
            recipient: "+14155552671".to_string(),
            country_code: None,
            payload: NotificationPayload::Text {
                body: "hi".to_string(),
            },
            metadata: None,
            priority: Priority::Normal,
            status: DeliveryStatus::Queued,
            scheduled_for: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            trace_id: "trace".to_string(),
        })
        .await
        .unwrap();
    app.store
        .transition(id, DeliveryStatus::Processing, StatePatch::default())
        .await
        .unwrap();
    app.store
        .transition(
            id,
            DeliveryStatus::Sent,
            StatePatch {
                provider_message_id: Some(pmid.to_string()),
                sent_at: Some(app.clock.now()),
                increment_attempt: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    id
}

fn status_callback(pmid: &str, status: &str, epoch: i64) -> Value {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "WABA_ID",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "statuses": [{
                        "id": pmid,
                        "status": status,
                        "timestamp": epoch.to_string(),
                        "recipient_id": "14155552671",
                    }],
                }
            }]
        }]
    })
}

#[tokio::test]
async fn out_of_order_callbacks_resolve_monotonically() {
    let app = test_app(None);
    let id = seed_sent_notification(&app, "wamid.OOO").await;

    let read_at = Utc::now().timestamp();
    let delivered_at = read_at - 30;

    // `read` first, then the late `delivered`.
    for (status, epoch) in [("read", read_at), ("delivered", delivered_at)] {
        let response = app
            .router
            .clone()
            .oneshot(post_json(
                "/v1/webhooks/provider",
                None,
                &status_callback("wamid.OOO", status, epoch),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let stored = app.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Read);
    let delivered = stored.delivered_at.unwrap();
    let read = stored.read_at.unwrap();
    assert!(delivered <= read);

    // One log row per callback on top of none from seeding.
    assert_eq!(app.store.logs_for(id, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn failed_callback_is_terminal_without_retry() {
    let app = test_app(None);
    let id = seed_sent_notification(&app, "wamid.FAIL").await;

    let mut payload = status_callback("wamid.FAIL", "failed", Utc::now().timestamp());
    payload["entry"][0]["changes"][0]["value"]["statuses"][0]["errors"] =
        json!([{ "code": 131053, "title": "Media upload error" }]);

    let response = app
        .router
        .clone()
        .oneshot(post_json("/v1/webhooks/provider", None, &payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stored = app.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Failed);
    assert!(stored.failed_at.is_some());
    assert!(stored.next_retry_at.is_none());
    assert_eq!(stored.last_error_code.as_deref(), Some("131053"));
}

#[tokio::test]
async fn callback_for_unknown_message_id_is_dropped() {
    let app = test_app(None);
    let response = app
        .router
        .oneshot(post_json(
            "/v1/webhooks/provider",
            None,
            &status_callback("wamid.UNKNOWN", "delivered", Utc::now().timestamp()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn signed_webhook_rejects_bad_signature() {
    let app = test_app(Some("app-secret".to_string()));
    let payload = status_callback("wamid.X", "delivered", Utc::now().timestamp());

    // Missing header.
    let unsigned = app
        .router
        .clone()
        .oneshot(post_json("/v1/webhooks/provider", None, &payload))
        .await
        .unwrap();
    assert_eq!(unsigned.status(), StatusCode::FORBIDDEN);

    // Wrong signature.
    let mut request = post_json("/v1/webhooks/provider", None, &payload);
    request
        .headers_mut()
        .insert("x-hub-signature-256", "sha256=deadbeef".parse().unwrap());
    let forged = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(forged.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn health_endpoint_reports_up() {
    let app = test_app(None);
    let response = app
        .router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["status"], "UP");
}

#[tokio::test]
async fn analytics_stats_counts_by_status() {
    let app = test_app(None);
    app.router
        .clone()
        .oneshot(post_json("/v1/notifications", Some(KEY_A), &create_body()))
        .await
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/analytics/stats")
                .header("x-api-key", KEY_A)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["total"], 1);
}
