//! SSE transparent proxy for remote-sse servers.
//!
//! Forwards the initial GET stream bit-for-bit while scanning each line for a
//! session-id token. A harvested id is recorded in the router's session
//! registry *before* the line is handed downstream, so a client acting on the
//! endpoint event cannot race the record with its first POST.

use crate::models::HttpSession;
use crate::router::{SessionRouter, is_valid_session_id};
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderName, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::TryStreamExt as _;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;

const LINE_CHANNEL_CAPACITY: usize = 16;

/// Headers never copied between the proxied legs.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.iter().any(|h| name.as_str() == *h)
}

pub async fn proxy_remote_sse(
    router: Arc<SessionRouter>,
    server_id: &str,
    req: Request,
) -> Response {
    let cfg = match router.catalog().sse_config(server_id).await {
        Ok(cfg) => cfg,
        Err(e) => return e.into_response(),
    };

    let (parts, body) = req.into_parts();

    // Upstream URL: base + path, keeping every inbound query parameter except
    // server_id.
    let mut remote_url = format!("{}{}", cfg.base_url, cfg.sse_path);
    let forwarded: Vec<(String, String)> =
        url::form_urlencoded::parse(parts.uri.query().unwrap_or("").as_bytes())
            .filter(|(k, _)| k != "server_id")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
    if !forwarded.is_empty() {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &forwarded {
            serializer.append_pair(k, v);
        }
        let sep = if remote_url.contains('?') { '&' } else { '?' };
        remote_url = format!("{remote_url}{sep}{}", serializer.finish());
    }

    // SSE initial legs are GETs even when a client POSTs with an
    // event-stream Accept header; a GET never forwards a body.
    let accept = parts
        .headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let method = if accept.contains("text/event-stream") || parts.method == Method::GET {
        Method::GET
    } else {
        parts.method.clone()
    };

    let mut headers = parts.headers.clone();
    headers.remove(header::HOST);
    headers.remove(header::CONNECTION);
    headers.remove(header::CONTENT_LENGTH);
    cfg.auth.apply(&mut headers);
    for (name, value) in &cfg.headers {
        if let Ok(n) = HeaderName::from_bytes(name.as_bytes())
            && let Ok(v) = axum::http::HeaderValue::from_str(value)
        {
            headers.insert(n, v);
        }
    }

    tracing::debug!(server_id, url = %remote_url, method = %method, "proxying SSE request");

    let redirect = if cfg.follow_redirects {
        reqwest::redirect::Policy::limited(cfg.max_redirects.max(1) as usize)
    } else {
        reqwest::redirect::Policy::none()
    };
    let mut builder = reqwest::Client::builder()
        .connect_timeout(cfg.connect_timeout)
        .redirect(redirect);
    if let Some(ua) = &cfg.user_agent {
        builder = builder.user_agent(ua.clone());
    }
    let client = match builder.build() {
        Ok(client) => client,
        Err(e) => {
            return crate::error::GatewayError::UpstreamUnavailable(format!(
                "build HTTP client: {e}"
            ))
            .into_response();
        }
    };

    let mut request = client.request(method.clone(), &remote_url).headers(headers);
    if method != Method::GET {
        let bytes = match axum::body::to_bytes(body, 4 * 1024 * 1024).await {
            Ok(b) => b,
            Err(_) => {
                return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response();
            }
        };
        request = request.body(bytes);
    }

    let resp = match request.send().await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(server_id, error = %e, "failed to connect to remote SSE service");
            return crate::error::GatewayError::UpstreamUnavailable(format!(
                "failed to connect to remote service: {e}"
            ))
            .into_response();
        }
    };

    let status = resp.status();
    tracing::debug!(server_id, status = %status, "connected to remote SSE service");

    // Non-200: relay status and body, then stop.
    if status != StatusCode::OK {
        tracing::error!(server_id, status = %status, "remote SSE service refused the stream");
        let bytes = resp.bytes().await.unwrap_or_default();
        return Response::builder()
            .status(status)
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
    }

    let mut response = Response::builder().status(StatusCode::OK);
    for (name, value) in resp.headers() {
        if is_hop_by_hop(name) {
            continue;
        }
        response = response.header(name, value);
    }

    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(LINE_CHANNEL_CAPACITY);
    let server_id = server_id.to_string();
    tokio::spawn(async move {
        let stream = resp.bytes_stream().map_err(io::Error::other);
        let mut reader = BufReader::new(StreamReader::new(stream));
        let mut line: Vec<u8> = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => {
                    tracing::info!(server_id, "remote SSE stream ended");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(server_id, error = %e, "error reading from remote SSE stream");
                    break;
                }
            }

            if let Some(session_id) = extract_session_token(&String::from_utf8_lossy(&line)) {
                tracing::info!(server_id, session_id, "extracted session id from SSE stream");
                router.record_session(HttpSession::new(
                    server_id.clone(),
                    session_id,
                    Some(cfg.clone()),
                ));
            }

            // Recorded before the line is flushed downstream. A failed send
            // means the client is gone; stop reading and drop the upstream.
            if tx.send(Ok(Bytes::copy_from_slice(&line))).await.is_err() {
                tracing::info!(server_id, "downstream client disconnected; closing SSE proxy");
                break;
            }
        }
    });

    response
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// Scan one SSE line for a `session_id` / `sessionId` / `sessionid` token and
/// return its value when it has a routable format.
pub(crate) fn extract_session_token(line: &str) -> Option<String> {
    for token in ["session_id=", "sessionId=", "sessionid="] {
        let Some(pos) = line.find(token) else {
            continue;
        };
        let rest = &line[pos + token.len()..];
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
            .unwrap_or(rest.len());
        let id = rest[..end].trim();
        if is_valid_session_id(id) {
            return Some(id.to_string());
        }
    }
    None
}
