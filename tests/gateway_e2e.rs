//! End-to-end gateway tests.
//!
//! The full router is driven with `tower::ServiceExt::oneshot` against
//! wiremock upstreams, with an in-memory cache and configuration store.

use api_relay_gateway::{
    api::{build_router, AppState},
    core::{
        models::{ApiKeyRecord, Group, GroupProvider, Provider, SelectionStrategy, StoredApiKey},
        AppConfig, CredentialVault, LogBackend, LogEvent, LogSink, MemoryCache, StaticConfigStore,
    },
    services::Gateway,
};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

// ============================================================================
// Test Helpers
// ============================================================================

const ADMIN_KEY: &str = "admin-secret";

#[derive(Default)]
struct RecordingBackend {
    events: Mutex<Vec<LogEvent>>,
}

#[async_trait]
impl LogBackend for RecordingBackend {
    async fn write(&self, events: Vec<LogEvent>) -> anyhow::Result<()> {
        self.events.lock().unwrap().extend(events);
        Ok(())
    }
}

struct TestGateway {
    app: Router,
    gateway: Gateway,
    store: Arc<StaticConfigStore>,
    sink: LogSink,
    backend: Arc<RecordingBackend>,
}

impl TestGateway {
    fn new() -> Self {
        let store = Arc::new(StaticConfigStore::new());
        let backend = Arc::new(RecordingBackend::default());
        let sink = LogSink::start(backend.clone(), 1024);
        let gateway = Gateway::new(
            store.clone(),
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryCache::new()),
            reqwest::Client::new(),
            sink.clone(),
        );
        let config = AppConfig {
            admin_key: Some(ADMIN_KEY.to_string()),
            ..AppConfig::default()
        };
        let app = build_router(AppState::new(gateway.clone()), &config);

        Self {
            app,
            gateway,
            store,
            sink,
            backend,
        }
    }

    fn group(&self, id: i64, slug: &str, strategy: SelectionStrategy) {
        self.store.insert_group(Group {
            id,
            slug: slug.to_string(),
            name: slug.to_uppercase(),
            enabled: true,
            strategy,
        });
    }

    fn provider(&self, group_id: i64, id: i64, base_url: &str, priority: u32, timeout_ms: u64) {
        self.store.add_member(
            group_id,
            GroupProvider {
                provider: Provider {
                    id,
                    name: format!("p{}", id),
                    base_url: base_url.to_string(),
                    credential: Some(format!("sk-p{}", id)),
                    enabled: true,
                    priority,
                    timeout_ms,
                },
                priority,
                enabled: true,
            },
        );
    }

    fn key(&self, id: i64, secret: &str, group_id: Option<i64>, rate_limit: u32) {
        self.key_with(id, secret, group_id, rate_limit, |_| {});
    }

    fn key_with(
        &self,
        id: i64,
        secret: &str,
        group_id: Option<i64>,
        rate_limit: u32,
        adjust: impl FnOnce(&mut ApiKeyRecord),
    ) {
        let mut record = ApiKeyRecord {
            id,
            name: format!("key-{}", id),
            group_id,
            enabled: true,
            rate_limit,
            expires_at: None,
        };
        adjust(&mut record);
        self.store.insert_api_key(StoredApiKey {
            record,
            key_hash: CredentialVault::hash_secret_with_cost(secret, 4).unwrap(),
        });
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.unwrap()
    }

    async fn proxy(&self, uri: &str, key: Option<&str>) -> Response {
        let mut builder = Request::builder().method("POST").uri(uri);
        if let Some(key) = key {
            builder = builder.header("authorization", format!("Bearer {}", key));
        }
        self.send(builder.body(Body::from("{\"prompt\":\"hi\"}")).unwrap())
            .await
    }

    async fn request_events(&self) -> Vec<api_relay_gateway::core::request_logger::RequestLogRecord> {
        self.sink.shutdown(Duration::from_secs(2)).await;
        self.backend
            .events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                LogEvent::Request(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn header_str<'a>(response: &'a Response, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .unwrap_or_else(|| panic!("missing header {}", name))
        .to_str()
        .unwrap()
}

// ============================================================================
// Successful Routing
// ============================================================================

#[tokio::test]
async fn test_proxy_success_sets_gateway_headers() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat"))
        .and(header("authorization", "Bearer sk-p1"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-upstream", "yes")
                .set_body_string("hello"),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let gw = TestGateway::new();
    gw.group(1, "g1", SelectionStrategy::WeightedRandom);
    gw.provider(1, 1, &format!("{}/v1/", upstream.uri()), 100, 5000);
    gw.key(1, "gw-global", None, 60);

    let response = gw.proxy("/api/proxy/g1/chat?stream=false&n=2", Some("gw-global")).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "x-proxy-provider"), "p1");
    assert_eq!(header_str(&response, "x-proxy-provider-id"), "1");
    assert_eq!(header_str(&response, "x-ratelimit-limit"), "60");
    assert_eq!(header_str(&response, "x-ratelimit-remaining"), "59");
    assert_eq!(header_str(&response, "x-upstream"), "yes");
    assert!(header_str(&response, "x-proxy-response-time").parse::<u64>().is_ok());
    assert!(header_str(&response, "x-proxy-total-time").parse::<u64>().is_ok());
    assert!(!header_str(&response, "x-request-id").is_empty());
    assert_eq!(body_text(response).await, "hello");

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].url.query(), Some("stream=false&n=2"));
    assert_eq!(received[0].body, b"{\"prompt\":\"hi\"}".to_vec());
}

#[tokio::test]
async fn test_gateway_credentials_are_not_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let gw = TestGateway::new();
    gw.group(1, "g1", SelectionStrategy::WeightedRandom);
    gw.provider(1, 1, &upstream.uri(), 100, 5000);
    gw.key(1, "gw-header-key", None, 60);

    let response = gw
        .send(
            Request::builder()
                .method("GET")
                .uri("/api/proxy/g1/models")
                .header("x-api-key", "gw-header-key")
                .header("x-trace", "abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let received = upstream.received_requests().await.unwrap();
    let headers = &received[0].headers;
    assert!(headers.get("x-api-key").is_none());
    assert_eq!(headers.get("authorization").unwrap(), "Bearer sk-p1");
    assert_eq!(headers.get("x-trace").unwrap(), "abc");
    assert_eq!(received[0].url.path(), "/models");
}

#[tokio::test]
async fn test_group_root_forwards_to_slash() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&upstream)
        .await;

    let gw = TestGateway::new();
    gw.group(1, "g1", SelectionStrategy::PriorityFailover);
    gw.provider(1, 1, &upstream.uri(), 100, 5000);
    gw.key(1, "gw-global", None, 60);

    let response = gw.proxy("/api/proxy/g1", Some("gw-global")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_weighted_selection_favors_higher_priority() {
    let p1 = MockServer::start().await;
    let p2 = MockServer::start().await;
    for server in [&p1, &p2] {
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }

    let gw = TestGateway::new();
    gw.group(1, "g1", SelectionStrategy::WeightedRandom);
    gw.provider(1, 1, &p1.uri(), 150, 5000);
    gw.provider(1, 2, &p2.uri(), 50, 5000);
    gw.key(1, "gw-global", None, 10_000);

    const TRIALS: usize = 600;
    for _ in 0..TRIALS {
        let response = gw.proxy("/api/proxy/g1/x", Some("gw-global")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let hits_p1 = p1.received_requests().await.unwrap().len();
    let hits_p2 = p2.received_requests().await.unwrap().len();
    assert_eq!(hits_p1 + hits_p2, TRIALS);

    // 190 / (190 + 90) ≈ 0.68
    let share = hits_p1 as f64 / TRIALS as f64;
    assert!(share > 0.6 && share < 0.76, "p1 share was {}", share);
}

// ============================================================================
// Authentication and Authorization
// ============================================================================

#[tokio::test]
async fn test_scoped_key_forbidden_on_other_group() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstream)
        .await;

    let gw = TestGateway::new();
    gw.group(1, "g1", SelectionStrategy::WeightedRandom);
    gw.group(2, "g2", SelectionStrategy::WeightedRandom);
    gw.provider(1, 1, &upstream.uri(), 100, 5000);
    gw.provider(2, 2, &upstream.uri(), 100, 5000);
    gw.key(7, "gw-scoped", Some(2), 60);

    let forbidden = gw.proxy("/api/proxy/g1/x", Some("gw-scoped")).await;
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);
    let body = body_json(forbidden).await;
    assert_eq!(body["error"]["type"], "permission_error");
    assert_eq!(body["error"]["code"], 403);

    let allowed = gw.proxy("/api/proxy/g2/x", Some("gw-scoped")).await;
    assert_eq!(allowed.status(), StatusCode::OK);
    assert_eq!(header_str(&allowed, "x-proxy-provider"), "p2");
}

#[tokio::test]
async fn test_unauthenticated_requests() {
    let gw = TestGateway::new();
    gw.group(1, "g1", SelectionStrategy::WeightedRandom);
    gw.key(1, "gw-valid", None, 60);
    gw.key_with(2, "gw-disabled", None, 60, |r| r.enabled = false);
    gw.key_with(3, "gw-expired", None, 60, |r| {
        r.expires_at = Some(Utc::now() - ChronoDuration::hours(1))
    });

    for key in [None, Some("gw-wrong"), Some("gw-disabled"), Some("gw-expired")] {
        let response = gw.proxy("/api/proxy/g1/x", key).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "key {:?}", key);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "authentication_error");
        assert_eq!(body["error"]["message"], "Unauthorized: Invalid or missing API key");
    }
}

#[tokio::test]
async fn test_unknown_and_disabled_groups_are_not_found() {
    let gw = TestGateway::new();
    gw.store.insert_group(Group {
        id: 3,
        slug: "off".to_string(),
        name: "Off".to_string(),
        enabled: false,
        strategy: SelectionStrategy::WeightedRandom,
    });
    gw.key(1, "gw-global", None, 60);

    let missing = gw.proxy("/api/proxy/nope/x", Some("gw-global")).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(missing).await["error"]["type"], "not_found_error");

    let disabled = gw.proxy("/api/proxy/off/x", Some("gw-global")).await;
    assert_eq!(disabled.status(), StatusCode::NOT_FOUND);
}

// ============================================================================
// Rate Limiting
// ============================================================================

#[tokio::test]
async fn test_rate_limit_rejects_request_over_limit() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&upstream)
        .await;

    let gw = TestGateway::new();
    gw.group(1, "g1", SelectionStrategy::WeightedRandom);
    gw.provider(1, 1, &upstream.uri(), 100, 5000);
    gw.key(1, "gw-limited", None, 3);

    for expected_remaining in ["2", "1", "0"] {
        let response = gw.proxy("/api/proxy/g1/x", Some("gw-limited")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_str(&response, "x-ratelimit-remaining"), expected_remaining);
    }

    let limited = gw.proxy("/api/proxy/g1/x", Some("gw-limited")).await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header_str(&limited, "x-ratelimit-limit"), "3");
    assert_eq!(header_str(&limited, "x-ratelimit-remaining"), "0");
    assert!(header_str(&limited, "x-ratelimit-reset").parse::<i64>().unwrap() > Utc::now().timestamp_millis());
    assert_eq!(body_json(limited).await["error"]["type"], "rate_limit_error");
}

// ============================================================================
// Health Feedback and Failures
// ============================================================================

#[tokio::test]
async fn test_unhealthy_only_provider_is_still_selected() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(6)
        .mount(&upstream)
        .await;

    let gw = TestGateway::new();
    gw.group(1, "g1", SelectionStrategy::WeightedRandom);
    gw.provider(1, 3, &upstream.uri(), 100, 5000);
    gw.key(1, "gw-global", None, 60);

    for _ in 0..5 {
        let response = gw.proxy("/api/proxy/g1/x", Some("gw-global")).await;
        // Upstream statuses are relayed, not rewritten.
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    let health = gw.gateway.health_store().get(3).await;
    assert!(!health.healthy);
    assert_eq!(health.consecutive_failures, 5);

    let sixth = gw.proxy("/api/proxy/g1/x", Some("gw-global")).await;
    assert_eq!(sixth.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(header_str(&sixth, "x-proxy-provider"), "p3");
    assert_eq!(gw.gateway.health_store().get(3).await.consecutive_failures, 6);
}

#[tokio::test]
async fn test_failover_skips_unhealthy_primary() {
    let primary = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(5)
        .mount(&primary)
        .await;
    let backup = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&backup)
        .await;

    let gw = TestGateway::new();
    gw.group(1, "g1", SelectionStrategy::PriorityFailover);
    gw.provider(1, 1, &primary.uri(), 900, 5000);
    gw.provider(1, 2, &backup.uri(), 100, 5000);
    gw.key(1, "gw-global", None, 60);

    for _ in 0..5 {
        let response = gw.proxy("/api/proxy/g1/x", Some("gw-global")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    let response = gw.proxy("/api/proxy/g1/x", Some("gw-global")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header_str(&response, "x-proxy-provider"), "p2");
}

#[tokio::test]
async fn test_unreachable_upstream_returns_bad_gateway() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let gw = TestGateway::new();
    gw.group(1, "g1", SelectionStrategy::WeightedRandom);
    gw.provider(1, 1, &format!("http://{}", addr), 100, 5000);
    gw.key(1, "gw-global", None, 60);

    let response = gw.proxy("/api/proxy/g1/x", Some("gw-global")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(header_str(&response, "x-ratelimit-remaining"), "59");
    assert_eq!(body_json(response).await["error"]["type"], "upstream_error");
    assert_eq!(gw.gateway.health_store().get(1).await.consecutive_failures, 1);
}

#[tokio::test]
async fn test_upstream_timeout_returns_bad_gateway() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(1000)))
        .mount(&upstream)
        .await;

    let gw = TestGateway::new();
    gw.group(1, "g1", SelectionStrategy::WeightedRandom);
    gw.provider(1, 1, &upstream.uri(), 100, 100);
    gw.key(1, "gw-global", None, 60);

    let response = gw.proxy("/api/proxy/g1/x", Some("gw-global")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert!(body["error"]["message"].as_str().unwrap().contains("timed out"));
    assert_eq!(gw.gateway.health_store().get(1).await.consecutive_failures, 1);
}

#[tokio::test]
async fn test_group_without_providers_returns_bad_gateway() {
    let gw = TestGateway::new();
    gw.group(1, "empty", SelectionStrategy::WeightedRandom);
    gw.key(1, "gw-global", None, 60);

    let response = gw.proxy("/api/proxy/empty/x", Some("gw-global")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["error"]["message"], "No providers available for group: empty");
}

// ============================================================================
// Log Events
// ============================================================================

#[tokio::test]
async fn test_one_log_event_per_terminal_state() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let gw = TestGateway::new();
    gw.group(1, "g1", SelectionStrategy::WeightedRandom);
    gw.provider(1, 1, &upstream.uri(), 100, 5000);
    gw.key(4, "gw-global", None, 60);

    gw.send(
        Request::builder()
            .method("POST")
            .uri("/api/proxy/g1/v1/chat?x=1")
            .header("authorization", "Bearer gw-global")
            .header("x-forwarded-for", "203.0.113.9")
            .header("user-agent", "e2e-test")
            .header("x-request-id", "req-ok")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    gw.proxy("/api/proxy/g1/x", None).await;
    gw.proxy("/api/proxy/missing/x", Some("gw-global")).await;

    let events = gw.request_events().await;
    assert_eq!(events.len(), 3);

    let ok = events.iter().find(|e| e.request_id == "req-ok").unwrap();
    assert_eq!(ok.group_slug, "g1");
    assert_eq!(ok.group_id, Some(1));
    assert_eq!(ok.provider_id, Some(1));
    assert_eq!(ok.provider_name.as_deref(), Some("p1"));
    assert_eq!(ok.api_key_id, Some(4));
    assert_eq!(ok.method, "POST");
    assert_eq!(ok.path, "/v1/chat?x=1");
    assert_eq!(ok.status_code, 200);
    assert!(ok.success);
    assert!(ok.upstream_latency_ms.is_some());
    assert_eq!(ok.client_addr, "203.0.113.9");
    assert_eq!(ok.user_agent.as_deref(), Some("e2e-test"));

    let unauthenticated = events.iter().find(|e| e.status_code == 401).unwrap();
    assert!(!unauthenticated.success);
    assert_eq!(unauthenticated.api_key_id, None);
    assert!(unauthenticated.error_message.is_some());

    let missing = events.iter().find(|e| e.status_code == 404).unwrap();
    assert_eq!(missing.group_slug, "missing");
    assert_eq!(missing.group_id, None);
    assert_eq!(missing.api_key_id, Some(4));
}

// ============================================================================
// Service and Admin Endpoints
// ============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let gw = TestGateway::new();
    let response = gw
        .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["cache"], "ok");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let gw = TestGateway::new();
    gw.proxy("/api/proxy/g1/x", None).await;

    let response = gw
        .send(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_text(response).await.contains("gateway_requests_total"));
}

#[tokio::test]
async fn test_admin_group_health() {
    let gw = TestGateway::new();
    gw.group(1, "g1", SelectionStrategy::WeightedRandom);
    gw.provider(1, 1, "http://p1.local", 150, 5000);
    gw.provider(1, 2, "http://p2.local", 50, 5000);

    let denied = gw
        .send(
            Request::builder()
                .uri("/admin/v1/groups/g1/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    let response = gw
        .send(
            Request::builder()
                .uri("/admin/v1/groups/g1/health")
                .header("authorization", format!("Bearer {}", ADMIN_KEY))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["group"], "g1");
    assert_eq!(body["strategy"], "weighted-random");
    assert_eq!(body["healthy_providers"], 2);
    assert_eq!(body["providers"][0]["weight"], 190.0);
    assert_eq!(body["providers"][1]["weight"], 90.0);
}

#[tokio::test]
async fn test_admin_rate_limit_reset() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let gw = TestGateway::new();
    gw.group(1, "g1", SelectionStrategy::WeightedRandom);
    gw.provider(1, 1, &upstream.uri(), 100, 5000);
    gw.key(5, "gw-once", None, 1);

    assert_eq!(gw.proxy("/api/proxy/g1/x", Some("gw-once")).await.status(), StatusCode::OK);
    assert_eq!(
        gw.proxy("/api/proxy/g1/x", Some("gw-once")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    let reset = gw
        .send(
            Request::builder()
                .method("DELETE")
                .uri("/admin/v1/rate-limits/5")
                .header("authorization", format!("Bearer {}", ADMIN_KEY))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(reset.status(), StatusCode::OK);
    assert_eq!(body_json(reset).await["reset"], true);

    assert_eq!(gw.proxy("/api/proxy/g1/x", Some("gw-once")).await.status(), StatusCode::OK);
}
