//! Transparent-proxy tests against a fake remote SSE tool server: endpoint
//! harvest ordering, POST forwarding with upstream auth, error relay, and
//! clean termination on client disconnect.

mod common;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode as AxStatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use common::{SseStream, no_auth, spawn_gateway, sse_config, sse_service};
use mcpmux_gateway::catalog::MemoryCatalog;
use mcpmux_gateway::config::SessionSection;
use mcpmux_gateway::models::UpstreamAuth;
use reqwest::StatusCode;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;

const STREAM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Default)]
struct UpstreamState {
    /// (path-and-query, headers, body) of every request the upstream saw.
    requests: Arc<Mutex<Vec<(String, HeaderMap, String)>>>,
}

impl UpstreamState {
    async fn record(&self, uri: &Uri, headers: HeaderMap, body: String) {
        self.requests
            .lock()
            .await
            .push((uri.to_string(), headers, body));
    }

    async fn find(&self, path_prefix: &str) -> Option<(String, HeaderMap, String)> {
        self.requests
            .lock()
            .await
            .iter()
            .find(|(uri, _, _)| uri.starts_with(path_prefix))
            .cloned()
    }
}

async fn upstream_sse(
    State(state): State<UpstreamState>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    state.record(&uri, headers, String::new()).await;
    let body = concat!(
        "event: endpoint\n",
        "data: /messages/?session_id=ABC123XY\n",
        "\n",
        "event: message\n",
        "data: {\"hello\":true}\n",
        "\n",
    );
    Response::builder()
        .status(AxStatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("x-upstream-extra", "yes")
        .body(Body::from(body))
        .unwrap()
}

/// Emits one session id quickly, then two more after generous delays, so a
/// disconnected client's proxy loop has died before the last one appears.
async fn upstream_slow_sse(State(state): State<UpstreamState>, uri: Uri) -> Response {
    state.record(&uri, HeaderMap::new(), String::new()).await;
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(4);
    tokio::spawn(async move {
        let _ = tx
            .send(Ok(Bytes::from_static(
                b"data: /messages/?session_id=SLOWSESSION0001\n\n",
            )))
            .await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        let _ = tx
            .send(Ok(Bytes::from_static(
                b"data: /messages/?session_id=SLOWSESSION0002\n\n",
            )))
            .await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        let _ = tx
            .send(Ok(Bytes::from_static(
                b"data: /messages/?session_id=SLOWSESSION0003\n\n",
            )))
            .await;
    });
    Response::builder()
        .status(AxStatusCode::OK)
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap()
}

async fn upstream_messages(
    State(state): State<UpstreamState>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    state.record(&uri, headers, body).await;
    Response::builder()
        .status(AxStatusCode::ACCEPTED)
        .header("x-upstream-reply", "yes")
        .body(Body::from("Accepted"))
        .unwrap()
}

async fn upstream_unavailable() -> Response {
    (AxStatusCode::SERVICE_UNAVAILABLE, "upstream down").into_response()
}

async fn spawn_upstream() -> (String, UpstreamState) {
    let state = UpstreamState::default();
    let app = Router::new()
        .route("/sse", get(upstream_sse))
        .route("/slow-sse", get(upstream_slow_sse))
        .route("/unavailable-sse", get(upstream_unavailable))
        .route("/messages/", post(upstream_messages))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}"), state)
}

/// Scenario: endpoint harvest, then a POST forwarded upstream with the
/// configured auth applied.
#[tokio::test]
async fn endpoint_harvest_and_post_forwarding() {
    let (upstream_url, upstream_state) = spawn_upstream().await;

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_service(sse_service("svc_c"));
    catalog.add_sse_config(sse_config(
        "svc_c",
        &upstream_url,
        "/sse",
        UpstreamAuth::BearerToken {
            token: "s3cret".into(),
        },
    ));
    let gw = spawn_gateway(catalog, no_auth(), SessionSection::default()).await;

    let resp = gw
        .client
        .get(format!(
            "{}/mcp-server/sse?server_id=svc_c&foo=bar",
            gw.base_url
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    // Upstream response headers are relayed.
    assert_eq!(
        resp.headers()
            .get("x-upstream-extra")
            .and_then(|v| v.to_str().ok()),
        Some("yes")
    );

    let mut stream = SseStream::new(resp);
    let line = stream
        .wait_for_line_containing("session_id=", STREAM_TIMEOUT)
        .await
        .expect("endpoint line relayed");
    assert_eq!(line, "data: /messages/?session_id=ABC123XY");

    // The record was made before the line was flushed: now that the client
    // has observed it, the session must route.
    let snapshot = gw.router.snapshot();
    assert_eq!(snapshot.sessions["ABC123XY"].server_id, "svc_c");

    // The upstream GET carried the configured auth and default headers, and
    // server_id was stripped while other params were preserved.
    let (uri, headers, _) = upstream_state.find("/sse").await.expect("upstream saw GET");
    assert!(uri.contains("foo=bar"));
    assert!(!uri.contains("server_id"));
    assert_eq!(
        headers.get("authorization").and_then(|v| v.to_str().ok()),
        Some("Bearer s3cret")
    );
    assert_eq!(
        headers.get("x-default").and_then(|v| v.to_str().ok()),
        Some("1")
    );

    // POST leg: forwarded verbatim with upstream auth, reply relayed.
    let resp = gw
        .client
        .post(format!(
            "{}/messages/?session_id=ABC123XY",
            gw.base_url
        ))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    assert_eq!(
        resp.headers()
            .get("x-upstream-reply")
            .and_then(|v| v.to_str().ok()),
        Some("yes")
    );
    assert_eq!(resp.text().await.unwrap(), "Accepted");

    let (uri, headers, body) = upstream_state
        .find("/messages/")
        .await
        .expect("upstream saw POST");
    assert_eq!(uri, "/messages/?session_id=ABC123XY");
    assert_eq!(
        headers.get("authorization").and_then(|v| v.to_str().ok()),
        Some("Bearer s3cret")
    );
    assert!(body.contains("tools/list"));
}

#[tokio::test]
async fn non_200_upstream_status_is_relayed() {
    let (upstream_url, _) = spawn_upstream().await;

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_service(sse_service("svc_d"));
    catalog.add_sse_config(sse_config(
        "svc_d",
        &upstream_url,
        "/unavailable-sse",
        UpstreamAuth::None,
    ));
    let gw = spawn_gateway(catalog, no_auth(), SessionSection::default()).await;

    let resp = gw
        .client
        .get(format!("{}/mcp-server/sse?server_id=svc_d", gw.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(resp.text().await.unwrap(), "upstream down");
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_service(sse_service("svc_e"));
    // Port 9 is discard; nothing is listening on this address.
    catalog.add_sse_config(sse_config(
        "svc_e",
        "http://127.0.0.1:9",
        "/sse",
        UpstreamAuth::None,
    ));
    let gw = spawn_gateway(catalog, no_auth(), SessionSection::default()).await;

    let resp = gw
        .client
        .get(format!("{}/mcp-server/sse?server_id=svc_e", gw.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

/// Scenario: client disconnect mid-stream terminates the proxy loop; ids the
/// upstream emits well after the disconnect are never recorded.
#[tokio::test]
async fn client_disconnect_stops_the_harvest() {
    let (upstream_url, _) = spawn_upstream().await;

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_service(sse_service("svc_f"));
    catalog.add_sse_config(sse_config(
        "svc_f",
        &upstream_url,
        "/slow-sse",
        UpstreamAuth::None,
    ));
    let gw = spawn_gateway(catalog, no_auth(), SessionSection::default()).await;

    let resp = gw
        .client
        .get(format!("{}/mcp-server/sse?server_id=svc_f", gw.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let mut stream = SseStream::new(resp);
    assert!(
        stream
            .wait_for_line_containing("SLOWSESSION0001", STREAM_TIMEOUT)
            .await
            .is_some()
    );
    // Disconnect after the first event.
    drop(stream);

    // Give the proxy time to notice the disconnect and the upstream time to
    // emit the final id.
    tokio::time::sleep(Duration::from_millis(1300)).await;

    let snapshot = gw.router.snapshot();
    assert!(snapshot.sessions.contains_key("SLOWSESSION0001"));
    // The id emitted ~1s after the disconnect was never read or recorded.
    assert!(!snapshot.sessions.contains_key("SLOWSESSION0003"));
}
