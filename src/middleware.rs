//! Request ID middleware for correlating logs with requests.
//!
//! Generates an 8-byte random request ID for each incoming request, stores it
//! in the request extensions under a private key, and logs one record when the
//! request arrives and one when the response leaves. The inner service runs in
//! a `request` span carrying the same `trace` value, so every log line emitted
//! by a handler can be correlated with both records.

use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use axum::{
    body::HttpBody,
    extract::{ConnectInfo, FromRequestParts, Request},
    http::{header::CONTENT_LENGTH, request::Parts, Uri},
    middleware::Next,
    response::Response,
};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::Instrument;

/// Opaque per-request token.
///
/// Displayed as two groups of four upper-case hex bytes, e.g. `A3F1B2C4-9D0E7F12`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId([u8; 8]);

impl RequestId {
    /// Draw a new ID from the operating system's random source.
    ///
    /// If the source fails the request still proceeds with whatever bytes
    /// were produced; the failure is logged.
    pub fn new() -> Self {
        let mut bytes = [0u8; 8];
        if let Err(e) = OsRng.try_fill_bytes(&mut bytes) {
            tracing::warn!(error = %e, "Random source failed while generating request ID");
        }
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{:02X}", b)?;
        }
        f.write_str("-")?;
        for b in &self.0[4..] {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

/// Extension key for the request ID. Not exported, so nothing outside this
/// module can insert or overwrite it.
#[derive(Clone, Copy, Debug)]
struct TraceKey(RequestId);

/// Request ID attached by [`trace_layer`], if any.
pub fn request_id<B>(request: &http::Request<B>) -> Option<RequestId> {
    request.extensions().get::<TraceKey>().map(|key| key.0)
}

/// Formatted request ID, or an empty string when the request was not traced.
pub fn trace<B>(request: &http::Request<B>) -> String {
    request_id(request)
        .map(|id| id.to_string())
        .unwrap_or_default()
}

/// Extractor giving handlers the formatted request ID.
///
/// Never rejects: untraced requests yield an empty string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trace(pub String);

impl<S> FromRequestParts<S> for Trace
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let trace = parts
            .extensions
            .get::<TraceKey>()
            .map(|key| key.0.to_string())
            .unwrap_or_default();
        Ok(Trace(trace))
    }
}

/// Declared request body length, or -1 when it is not known up front.
fn content_length(request: &Request) -> i64 {
    if let Some(len) = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
    {
        return len;
    }
    request
        .body()
        .size_hint()
        .exact()
        .and_then(|n| i64::try_from(n).ok())
        .unwrap_or(-1)
}

/// Path and query as sent on an HTTP/1 request line, whatever the protocol.
fn request_uri(uri: &Uri) -> &str {
    uri.path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path())
}

/// Middleware that generates a request ID and logs the request lifecycle.
///
/// This should be the outermost middleware layer so the span wraps
/// all request processing, including other middleware and handlers.
pub async fn trace_layer(mut request: Request, next: Next) -> Response {
    let request_id = RequestId::new();
    request.extensions_mut().insert(TraceKey(request_id));

    let trace = request_id.to_string();
    let url = request_uri(request.uri()).to_string();
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default();

    tracing::info!(
        method = %request.method(),
        url = %url,
        len = content_length(&request),
        ip = %ip,
        trace = %trace,
        "<- Request"
    );

    let span = tracing::info_span!("request", trace = %trace);
    let start = Instant::now();
    let response = next.run(request).instrument(span).await;

    tracing::info!(
        url = %url,
        trace = %trace,
        elapsed = ?start.elapsed(),
        "-> Response"
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    use axum::{body::Body, middleware, routing::get, Router};
    use tower::ServiceExt;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn records(&self) -> Vec<serde_json::Value> {
            let bytes = self.0.lock().unwrap().clone();
            String::from_utf8(bytes)
                .unwrap()
                .lines()
                .map(|line| serde_json::from_str(line).unwrap())
                .collect()
        }
    }

    fn is_trace_format(s: &str) -> bool {
        let parts: Vec<&str> = s.split('-').collect();
        parts.len() == 2
            && parts.iter().all(|p| {
                p.len() == 8 && p.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
            })
    }

    #[test]
    fn test_request_id_format() {
        for _ in 0..100 {
            let id = RequestId::new().to_string();
            assert!(is_trace_format(&id), "bad format: {id}");
        }
    }

    #[test]
    fn test_request_id_display_groups_bytes() {
        let id = RequestId::from_bytes([0xA3, 0xF1, 0xB2, 0xC4, 0x9D, 0x0E, 0x7F, 0x12]);
        assert_eq!(id.to_string(), "A3F1B2C4-9D0E7F12");

        let zero = RequestId::from_bytes([0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(zero.to_string(), "00010203-04050607");
    }

    #[test]
    fn test_request_ids_differ() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn test_trace_empty_without_middleware() {
        let request = http::Request::builder().uri("/").body(()).unwrap();
        assert_eq!(trace(&request), "");
        assert!(request_id(&request).is_none());
    }

    #[tokio::test]
    async fn test_trace_propagates_to_handler_and_logs() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let app = Router::new()
            .route("/ping", get(|Trace(trace): Trace| async move { trace }))
            .layer(middleware::from_fn(trace_layer));

        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/ping?x=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let handler_trace = String::from_utf8(body.to_vec()).unwrap();
        assert!(is_trace_format(&handler_trace));

        let records = captured.records();
        let start: Vec<_> = records
            .iter()
            .filter(|r| r["message"] == "<- Request")
            .collect();
        let end: Vec<_> = records
            .iter()
            .filter(|r| r["message"] == "-> Response")
            .collect();
        assert_eq!(start.len(), 1);
        assert_eq!(end.len(), 1);

        assert_eq!(start[0]["trace"], handler_trace.as_str());
        assert_eq!(end[0]["trace"], handler_trace.as_str());
        assert_eq!(start[0]["method"], "GET");
        assert_eq!(start[0]["url"], "/ping?x=1");
        assert_eq!(start[0]["len"], 0);
        assert_eq!(start[0]["ip"], "");
        assert!(end[0]["elapsed"].is_string());
    }

    #[test]
    fn test_request_uri_is_path_and_query() {
        let absolute: Uri = "https://example.com:8443/a/b?c=1".parse().unwrap();
        assert_eq!(request_uri(&absolute), "/a/b?c=1");

        let origin: Uri = "/a/b?c=1".parse().unwrap();
        assert_eq!(request_uri(&origin), "/a/b?c=1");
    }

    #[tokio::test]
    async fn test_absolute_uri_logs_path_only() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        // HTTP/2 requests carry scheme and authority in the URI
        let app = Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(middleware::from_fn(trace_layer));
        app.oneshot(
            http::Request::builder()
                .uri("https://example.com/ping?x=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

        let records = captured.records();
        for message in ["<- Request", "-> Response"] {
            let record = records
                .iter()
                .find(|r| r["message"] == message)
                .unwrap();
            assert_eq!(record["url"], "/ping?x=1");
        }
    }

    #[tokio::test]
    async fn test_each_request_gets_its_own_trace() {
        let app = Router::new()
            .route("/", get(|Trace(trace): Trace| async move { trace }))
            .layer(middleware::from_fn(trace_layer));

        let mut seen = Vec::new();
        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(http::Request::builder().uri("/").body(Body::empty()).unwrap())
                .await
                .unwrap();
            let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
            seen.push(String::from_utf8(body.to_vec()).unwrap());
        }
        seen.dedup();
        assert_eq!(seen.len(), 3);
    }

    #[tokio::test]
    async fn test_content_length_header_is_logged() {
        let request = http::Request::builder()
            .method("POST")
            .uri("/")
            .header(CONTENT_LENGTH, "11")
            .body(Body::from("hello world"))
            .unwrap();
        assert_eq!(content_length(&request), 11);

        let request = http::Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap();
        assert_eq!(content_length(&request), 0);
    }
}
