//! End-to-end pipeline tests against a scripted in-process upstream.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use glm_proxy::config::ProxyConfig;
use glm_proxy::server::{app, AppState};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone)]
struct MockUpstream {
    hits: Arc<AtomicUsize>,
    auths: Arc<Mutex<Vec<String>>>,
    /// Requests answered with `fail_status` before the first success.
    fail_first: usize,
    fail_status: u16,
    /// Serve an event-stream body instead of JSON.
    stream: bool,
}

impl MockUpstream {
    fn new(fail_first: usize, stream: bool) -> Self {
        Self {
            hits: Arc::new(AtomicUsize::new(0)),
            auths: Arc::new(Mutex::new(Vec::new())),
            fail_first,
            fail_status: 429,
            stream,
        }
    }

    fn with_fail_status(mut self, status: u16) -> Self {
        self.fail_status = status;
        self
    }

    fn distinct_auths(&self) -> usize {
        let auths = self.auths.lock().unwrap();
        auths.iter().collect::<std::collections::HashSet<_>>().len()
    }
}

const SSE_BODY: &str = "event: message_start\ndata: {\"type\":\"message_start\"}\n\n\
event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"hi\"}}\n\n\
event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n";

async fn mock_messages(
    State(mock): State<MockUpstream>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let hit = mock.hits.fetch_add(1, Ordering::SeqCst);
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        mock.auths.lock().unwrap().push(auth.to_string());
    }
    if hit < mock.fail_first {
        let mut builder = Response::builder()
            .status(mock.fail_status)
            .header("content-type", "application/json");
        if mock.fail_status == 429 {
            builder = builder.header("retry-after", "1");
        }
        return builder
            .body(Body::from(r#"{"error":{"type":"upstream_error"}}"#))
            .unwrap();
    }
    if mock.stream {
        return Response::builder()
            .status(200)
            .header("content-type", "text/event-stream")
            .header("x-request-id", "req_upstream_sse")
            .body(Body::from(SSE_BODY))
            .unwrap();
    }
    let parsed: Value = serde_json::from_slice(&body).unwrap_or_default();
    Response::builder()
        .status(200)
        .header("content-type", "application/json")
        .header("x-request-id", "req_upstream_1")
        .body(Body::from(
            json!({
                "id": "msg_1",
                "model": parsed["model"],
                "content": [{"type": "text", "text": "ok"}]
            })
            .to_string(),
        ))
        .unwrap()
}

async fn spawn_server(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn spawn_proxy(upstream: SocketAddr, keys: usize) -> SocketAddr {
    let mut config = ProxyConfig::default();
    config.keys = (0..keys).map(|i| format!("test-secret-{i}")).collect();
    config.upstream.base_url = format!("http://{upstream}");
    config.retry.base_delay_ms = 10;
    config.router.overrides_file = "/nonexistent/glm-proxy-flow-overrides.json".into();
    config.router.trace.sampling_rate = 0.0;
    let state = AppState::build(config);
    spawn_server(app(state)).await
}

fn opus_body(stream: bool) -> Value {
    json!({
        "model": "claude-3-opus-20240229",
        "max_tokens": 8192,
        "stream": stream,
        "messages": [{"role": "user", "content": "hi"}]
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn two_429s_then_success_rotates_keys() {
    let mock = MockUpstream::new(2, false);
    let upstream = spawn_server(
        Router::new().route("/v1/messages", post(mock_messages)).with_state(mock.clone()),
    )
    .await;
    let proxy = spawn_proxy(upstream, 3).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{proxy}/v1/messages"))
        .json(&opus_body(false))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers().get("x-request-id").unwrap(), "req_upstream_1");
    let body: Value = resp.json().await.unwrap();
    // The model on the wire was substituted with a provider model.
    let served = body["model"].as_str().unwrap();
    assert!(served.starts_with("glm-"), "unexpected model {served}");

    assert_eq!(mock.hits.load(Ordering::SeqCst), 3, "two 429s then one success");
    assert!(
        mock.distinct_auths() >= 2,
        "rate-limited keys are excluded; expected at least two distinct keys"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn event_stream_is_relayed_byte_for_byte() {
    let mock = MockUpstream::new(0, true);
    let upstream = spawn_server(
        Router::new().route("/v1/messages", post(mock_messages)).with_state(mock.clone()),
    )
    .await;
    let proxy = spawn_proxy(upstream, 1).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{proxy}/v1/messages"))
        .json(&opus_body(true))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap().to_str().unwrap(),
        "text/event-stream"
    );
    assert_eq!(resp.headers().get("x-request-id").unwrap(), "req_upstream_sse");
    let text = resp.text().await.unwrap();
    assert_eq!(text, SSE_BODY, "stream is passed through untouched");
}

#[tokio::test(flavor = "multi_thread")]
async fn server_errors_escalate_key_cooldown() {
    // Upstream 500s forever; a 5xx must climb the per-key cooldown ladder
    // in addition to feeding the circuit breaker.
    let mock = MockUpstream::new(usize::MAX, false).with_fail_status(500);
    let upstream = spawn_server(
        Router::new().route("/v1/messages", post(mock_messages)).with_state(mock.clone()),
    )
    .await;
    let proxy = spawn_proxy(upstream, 1).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{proxy}/v1/messages"))
        .json(&opus_body(false))
        .send()
        .await
        .unwrap();

    // The only key burned on the 500 and was excluded; nothing left to try.
    assert_eq!(resp.status().as_u16(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["errorType"], "no_keys_available");
    assert_eq!(mock.hits.load(Ordering::SeqCst), 1);

    let stats: Value =
        client.get(format!("http://{proxy}/stats")).send().await.unwrap().json().await.unwrap();
    let key = &stats["keys"][0];
    assert!(
        key["cooldownRemainingMs"].as_u64().unwrap() > 0,
        "5xx did not escalate the key cooldown ladder: {key:?}"
    );
    assert!(key["circuit"]["failure_count"].as_u64().unwrap() >= 1, "breaker also observed it");
    assert!(key["errorCount"].as_u64().unwrap() >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn no_keys_yields_502_envelope() {
    let mock = MockUpstream::new(0, false);
    let upstream = spawn_server(
        Router::new().route("/v1/messages", post(mock_messages)).with_state(mock),
    )
    .await;
    let proxy = spawn_proxy(upstream, 0).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{proxy}/v1/messages"))
        .json(&opus_body(false))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 502);
    assert!(resp.headers().contains_key("retry-after"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["errorType"], "no_keys_available");
    assert_eq!(body["retryable"], true);
    assert!(body["requestId"].is_string());
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_body_is_a_client_fault() {
    let mock = MockUpstream::new(0, false);
    let upstream = spawn_server(
        Router::new().route("/v1/messages", post(mock_messages)).with_state(mock.clone()),
    )
    .await;
    let proxy = spawn_proxy(upstream, 1).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{proxy}/v1/messages"))
        .header("content-type", "application/json")
        .body("this is not json")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["errorType"], "malformed_body");
    assert_eq!(body["retryable"], false);
    assert_eq!(mock.hits.load(Ordering::SeqCst), 0, "nothing was sent upstream");
}

#[tokio::test(flavor = "multi_thread")]
async fn stats_reflect_served_traffic() {
    let mock = MockUpstream::new(0, false);
    let upstream = spawn_server(
        Router::new().route("/v1/messages", post(mock_messages)).with_state(mock),
    )
    .await;
    let proxy = spawn_proxy(upstream, 2).await;

    let client = reqwest::Client::new();
    for _ in 0..3 {
        let resp = client
            .post(format!("http://{proxy}/v1/messages"))
            .json(&opus_body(false))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
    }

    let stats: Value =
        client.get(format!("http://{proxy}/stats")).send().await.unwrap().json().await.unwrap();
    assert_eq!(stats["proxy"]["totalRequests"], 3);
    assert_eq!(stats["proxy"]["successes"], 3);
    // Every slot was released once the responses were consumed.
    for (_tier, models) in stats["pools"].as_object().unwrap() {
        for model in models.as_array().unwrap() {
            assert_eq!(model["inFlight"], 0, "slot leak on {model:?}");
        }
    }
}
