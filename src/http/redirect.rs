//! Redirect handlers.
//!
//! - [`redirect_all`] answers every request with a 301 to a fixed host,
//!   keeping the original path and query. Used by `start_redirect_all`.
//! - [`redirect_to_https`] is the fallback of the ACME companion listener on
//!   port 80: GET and HEAD are sent to the https origin, anything else is
//!   refused.

use axum::{
    extract::OriginalUri,
    http::{header::LOCATION, Method, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use axum_extra::extract::Host;

/// Path and query of the request, `/` when the URI has neither.
fn request_uri(uri: &http::Uri) -> &str {
    uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/")
}

/// Host with any `:port` suffix removed. Bracketed IPv6 literals keep their brackets.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}

/// Router that redirects every request to `<host><request-uri>` with a 301.
///
/// The host is used verbatim: no scheme is added or trailing slash removed.
pub fn redirect_all(host: impl Into<String>) -> Router {
    let host = host.into();
    Router::new().fallback(move |OriginalUri(uri): OriginalUri| {
        let target = format!("{}{}", host, request_uri(&uri));
        async move {
            tracing::debug!(from = %uri, to = %target, "Redirecting request");
            (StatusCode::MOVED_PERMANENTLY, [(LOCATION, target)]).into_response()
        }
    })
}

/// Send plaintext GET/HEAD requests to the same path on https.
pub async fn redirect_to_https(
    Host(host): Host,
    method: Method,
    OriginalUri(uri): OriginalUri,
) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return (StatusCode::BAD_REQUEST, "Use HTTPS").into_response();
    }

    let https_url = format!("https://{}{}", strip_port(&host), request_uri(&uri));
    tracing::debug!(from = %uri, to = %https_url, "Redirecting HTTP to HTTPS");

    (StatusCode::FOUND, [(LOCATION, https_url)]).into_response()
}
