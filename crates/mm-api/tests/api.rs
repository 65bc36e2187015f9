//! Router-level tests over in-memory queues, records and storage.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use serde_json::{json, Value};
use tower::ServiceExt;

use mm_api::{create_router, ApiConfig, AppState, JwtKeys};
use mm_models::GenerationParams;
use mm_queue::{
    JobBroker, MemoryBroker, MemoryBucketStore, MemoryJobStore, MemoryProgressBus, QueueJob,
    QueueKind, QueueManager, RateLimitConfig, RateLimiter, RetryPolicy,
};
use mm_storage::{MemoryStore, ObjectStore};

const SECRET: &str = "test-secret";

struct TestApp {
    router: Router,
    broker: Arc<MemoryBroker>,
    objects: Arc<MemoryStore>,
    keys: JwtKeys,
}

impl TestApp {
    fn new(capacity: u32) -> Self {
        let config = ApiConfig {
            jwt_secret: SECRET.to_string(),
            rate_limit: RateLimitConfig {
                capacity,
                window: Duration::from_secs(60),
                key_prefix: "rate_limit".to_string(),
            },
            ..ApiConfig::default()
        };
        let broker = Arc::new(MemoryBroker::new(RetryPolicy::new(1, Duration::from_millis(10))));
        let objects = Arc::new(MemoryStore::new());
        let manager = QueueManager::new(broker.clone(), Arc::new(MemoryJobStore::new()));
        let limiter = RateLimiter::new(Arc::new(MemoryBucketStore::new()), config.rate_limit.clone());
        let state = AppState::new(
            config,
            manager,
            limiter,
            objects.clone(),
            Arc::new(MemoryProgressBus::default()),
        );

        Self {
            router: create_router(state, None),
            broker,
            objects,
            keys: JwtKeys::new(SECRET),
        }
    }

    fn token(&self, user: &str, role: Option<&str>) -> String {
        self.keys.issue(user, role, Duration::from_secs(300)).unwrap()
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(Value::Null)
        };
        (status, headers, value)
    }

    async fn create_job(&self, token: Option<&str>, body: Value) -> (StatusCode, axum::http::HeaderMap, Value) {
        let mut builder = Request::post("/api/jobs").header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap()).await
    }

    async fn get(&self, uri: &str, token: Option<&str>) -> (StatusCode, axum::http::HeaderMap, Value) {
        let mut builder = Request::get(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    async fn delete(&self, uri: &str, token: &str) -> (StatusCode, axum::http::HeaderMap, Value) {
        let request = Request::delete(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    async fn ready(&self, kind: QueueKind) -> u64 {
        self.broker.stats(kind).await.unwrap().ready
    }
}

#[tokio::test]
async fn health_is_public_and_carries_security_headers() {
    let app = TestApp::new(10);
    let (status, headers, body) = app.get("/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(headers["X-Content-Type-Options"], "nosniff");
    assert!(headers.contains_key("X-Request-ID"));

    let (status, _, body) = app.get("/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["redis"]["status"], "ok");
    assert_eq!(body["checks"]["storage"]["status"], "ok");
}

#[tokio::test]
async fn prompt_job_is_admitted_and_queryable() {
    let app = TestApp::new(10);
    let token = app.token("user-1", None);

    let (status, headers, body) = app
        .create_job(Some(&token), json!({ "prompt": "a knight at dawn", "style": "shonen" }))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(headers["X-RateLimit-Limit"], "10");
    assert_eq!(headers["X-RateLimit-Remaining"], "9");
    assert!(headers.contains_key("X-RateLimit-Reset"));
    assert_eq!(body["status"], "queued");
    assert_eq!(body["progress"], 0);

    let job_id = body["jobId"].as_str().unwrap().to_string();
    assert_eq!(app.ready(QueueKind::Compute).await, 1);
    assert_eq!(app.ready(QueueKind::Scan).await, 0);

    let (status, _, body) = app.get(&format!("/api/jobs/{}/status", job_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobId"], job_id.as_str());
    assert_eq!(body["status"], "queued");
    assert_eq!(body["scan"], "not_required");
}

#[tokio::test]
async fn uploaded_file_goes_to_scan_queue() {
    let app = TestApp::new(10);
    app.objects
        .put("uploads/user-1/page.png", Bytes::from_static(b"\x89PNG"))
        .await
        .unwrap();
    let token = app.token("user-1", None);

    let (status, _, _) = app
        .create_job(
            Some(&token),
            json!({ "fileRef": "uploads/user-1/page.png", "prompt": "make it rain" }),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(app.ready(QueueKind::Scan).await, 1);
    assert_eq!(app.ready(QueueKind::Compute).await, 0);

    let scans = app
        .broker
        .consume(QueueKind::Scan, "t", None, 1)
        .await
        .unwrap();
    match scans[0].job() {
        QueueJob::Scan(scan) => assert_eq!(scan.file_refs, vec!["uploads/user-1/page.png".to_string()]),
        other => panic!("unexpected payload {:?}", other),
    }
}

#[tokio::test]
async fn invalid_requests_are_rejected_and_never_enqueued() {
    let app = TestApp::new(10);
    let token = app.token("user-1", None);

    for body in [
        json!({ "prompt": "   " }),
        json!({ "prompt": "x".repeat(2001) }),
        json!({ "prompt": ";;;" }),
        json!({}),
        json!({ "fileRef": "../etc/passwd" }),
        json!({ "fileRef": "uploads/user-1/missing.png" }),
        json!({ "prompt": "ok", "style": "bad style!" }),
    ] {
        let (status, _, response) = app.create_job(Some(&token), body.clone()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body} -> {response}");
        assert_eq!(response["code"], "validation_error");
    }

    assert_eq!(app.ready(QueueKind::Compute).await, 0);
    assert_eq!(app.ready(QueueKind::Scan).await, 0);
}

#[tokio::test]
async fn exhausted_bucket_returns_429_with_retry_after() {
    let app = TestApp::new(2);
    let token = app.token("user-1", None);

    for _ in 0..2 {
        let (status, _, _) = app.create_job(Some(&token), json!({ "prompt": "robot" })).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    let (status, headers, body) = app.create_job(Some(&token), json!({ "prompt": "robot" })).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers["X-RateLimit-Limit"], "2");
    assert_eq!(headers["X-RateLimit-Remaining"], "0");
    let retry_after = body["retryAfter"].as_u64().unwrap();
    assert!((1..=30).contains(&retry_after), "retryAfter = {retry_after}");
    assert_eq!(app.ready(QueueKind::Compute).await, 2);

    // Another identity has its own bucket.
    let other = app.token("user-2", None);
    let (status, _, _) = app.create_job(Some(&other), json!({ "prompt": "robot" })).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn anonymous_requests_are_limited_by_forwarded_address() {
    let app = TestApp::new(1);
    let request = |ip: &str| {
        Request::post("/api/jobs")
            .header(header::CONTENT_TYPE, "application/json")
            .header("X-Forwarded-For", ip)
            .body(Body::from(json!({ "prompt": "robot" }).to_string()))
            .unwrap()
    };

    assert_eq!(app.send(request("198.51.100.1")).await.0, StatusCode::ACCEPTED);
    assert_eq!(app.send(request("198.51.100.1")).await.0, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(app.send(request("198.51.100.2")).await.0, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn anonymous_requests_without_forwarding_are_limited_by_peer_address() {
    let app = TestApp::new(1);
    let request = |peer: &str| {
        let addr: SocketAddr = peer.parse().unwrap();
        Request::post("/api/jobs")
            .header(header::CONTENT_TYPE, "application/json")
            .extension(ConnectInfo(addr))
            .body(Body::from(json!({ "prompt": "robot" }).to_string()))
            .unwrap()
    };

    assert_eq!(app.send(request("192.0.2.10:40000")).await.0, StatusCode::ACCEPTED);
    assert_eq!(
        app.send(request("192.0.2.10:40001")).await.0,
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(app.send(request("192.0.2.11:40000")).await.0, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn my_jobs_lists_only_the_callers_jobs() {
    let app = TestApp::new(20);
    let alice = app.token("alice", None);
    let bob = app.token("bob", None);

    let mut alice_jobs = Vec::new();
    for prompt in ["first panel", "second panel", "third panel"] {
        let (status, _, body) = app.create_job(Some(&alice), json!({ "prompt": prompt })).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        alice_jobs.push(body["jobId"].as_str().unwrap().to_string());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    app.create_job(Some(&bob), json!({ "prompt": "not yours" })).await;
    app.create_job(None, json!({ "prompt": "nobody's" })).await;

    let (status, _, _) = app.get("/api/me/jobs", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, body) = app.get("/api/me/jobs", Some(&alice)).await;
    assert_eq!(status, StatusCode::OK);
    let listed: Vec<&str> = body["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|j| j["jobId"].as_str().unwrap())
        .collect();
    let newest_first: Vec<&str> = alice_jobs.iter().rev().map(String::as_str).collect();
    assert_eq!(listed, newest_first);
    assert_eq!(body["jobs"][0]["prompt"], "third panel");
    assert_eq!(body["jobs"][0]["status"], "queued");
    assert_eq!(body["pagination"], json!({ "page": 1, "limit": 20, "total": 3, "pages": 1 }));

    let (_, _, body) = app.get("/api/me/jobs?page=2&limit=2", Some(&alice)).await;
    assert_eq!(body["jobs"].as_array().unwrap().len(), 1);
    assert_eq!(body["jobs"][0]["jobId"], alice_jobs[0].as_str());
    assert_eq!(body["pagination"]["pages"], 2);

    let (_, _, body) = app.get("/api/me/jobs?status=failed&limit=500", Some(&alice)).await;
    assert!(body["jobs"].as_array().unwrap().is_empty());
    assert_eq!(body["pagination"]["limit"], 100);

    let (status, _, _) = app.get("/api/me/jobs?status=bogus", Some(&alice)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn status_of_unknown_or_malformed_job() {
    let app = TestApp::new(10);
    let (status, _, _) = app
        .get("/api/jobs/550e8400-e29b-41d4-a716-446655440000/status", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = app.get("/api/jobs/not-a-uuid/status", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn websocket_handshake_requires_a_valid_token() {
    let app = TestApp::new(10);

    let (status, _, _) = app.get("/ws", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, _) = app.get("/ws?token=garbage", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let forged = JwtKeys::new("other-secret")
        .issue("user-1", None, Duration::from_secs(60))
        .unwrap();
    let (status, _, _) = app.get("/ws", Some(&forged)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // A valid token passes authentication; a plain GET is then not an upgrade.
    let token = app.token("user-1", None);
    let (status, _, _) = app.get(&format!("/ws?token={}", token), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = app.get("/api/ws/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalConnections"], 0);
}

#[tokio::test]
async fn admin_endpoints_require_admin_role() {
    let app = TestApp::new(10);
    let user = app.token("user-1", None);

    let (status, _, _) = app.get("/api/admin/queues", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _, _) = app.get("/api/admin/queues", Some(&user)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _, _) = app.delete("/api/admin/rate-limit/user-1", &user).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn admin_can_inspect_and_reset_rate_limits() {
    let app = TestApp::new(10);
    let admin = app.token("ops", Some("admin"));
    let user = app.token("user-1", None);

    app.create_job(Some(&user), json!({ "prompt": "robot" })).await;
    let (status, _, body) = app.get("/api/admin/rate-limit/user-1", Some(&admin)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["limit"], 10);
    assert_eq!(body["remaining"], 9);

    let (status, _, body) = app.delete("/api/admin/rate-limit/user-1", &admin).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reset"], true);

    let (_, _, body) = app.get("/api/admin/rate-limit/user-1", Some(&admin)).await;
    assert_eq!(body["remaining"], 10);
}

#[tokio::test]
async fn admin_queue_depth_and_dead_letter_purge() {
    let app = TestApp::new(10);
    let admin = app.token("ops", Some("admin"));

    let job = mm_models::Job::new(
        mm_models::InputRef::prompt("robot"),
        None,
        GenerationParams::default(),
    );
    app.broker.enqueue(QueueJob::compute(job.clone())).await.unwrap();
    let delivery = app
        .broker
        .consume(QueueKind::Compute, "t", None, 1)
        .await
        .unwrap()
        .remove(0);
    assert!(app.broker.fail(&delivery, "boom").await.unwrap().is_dead_lettered());

    let (status, _, body) = app.get("/api/admin/queues", Some(&admin)).await;
    assert_eq!(status, StatusCode::OK);
    let queues = body["queues"].as_array().unwrap();
    assert_eq!(queues.len(), 2);
    assert_eq!(queues[0]["queue"], "scan");
    assert_eq!(queues[1]["queue"], "compute");
    assert_eq!(queues[1]["dead_lettered"], 1);

    let uri = format!("/api/admin/dead-letter/compute/{}", job.id);
    let (status, _, body) = app.delete(&uri, &admin).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 1);

    let (status, _, _) = app.delete(&uri, &admin).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = app
        .delete(&format!("/api/admin/dead-letter/render/{}", job.id), &admin)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
