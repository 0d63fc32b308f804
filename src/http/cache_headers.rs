//! Cache headers for fingerprinted static assets.
//!
//! Sets `Cache-Control`, `Expires` and `ETag` so intermediaries and browsers
//! can hold a static resource for a number of days. `Cache-Control` uses
//! `max-age=<seconds>`; older releases wrote `max-age:<seconds>`, which most
//! clients silently ignored.

use axum::http::header::{HeaderMap, HeaderValue, CACHE_CONTROL, ETAG, EXPIRES};
use axum::response::{IntoResponseParts, ResponseParts};
use chrono::{Duration, Utc};

/// Seconds in a day
pub const SECONDS_PER_DAY: i64 = 86400;

/// `Expires` layout, e.g. `Mon, 2 Jan 2006 15:04:05 UTC`
pub const EXPIRES_FORMAT: &str = "%a, %-d %b %Y %H:%M:%S UTC";

/// Set `Cache-Control`, `Expires` and `ETag` for a resource cached `days` days.
///
/// The hash is quoted verbatim; a hash that cannot be carried in a header
/// leaves `ETag` unset.
pub fn add_cache_headers(headers: &mut HeaderMap, days: u32, hash: &str) {
    let seconds = i64::from(days) * SECONDS_PER_DAY;
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_str(&format!("max-age={}", seconds))
            .unwrap_or_else(|_| HeaderValue::from_static("no-cache")),
    );

    let expires = (Utc::now() + Duration::days(i64::from(days)))
        .format(EXPIRES_FORMAT)
        .to_string();
    if let Ok(value) = HeaderValue::from_str(&expires) {
        headers.insert(EXPIRES, value);
    }

    match HeaderValue::from_str(&format!("\"{}\"", hash)) {
        Ok(value) => {
            headers.insert(ETAG, value);
        }
        Err(_) => {
            tracing::debug!(hash = %hash, "ETag hash is not a valid header value");
        }
    }
}

/// Response part applying [`add_cache_headers`].
///
/// ```ignore
/// async fn style() -> impl IntoResponse {
///     (CacheHeaders::new(30, "a1b2c3"), STYLE_CSS)
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CacheHeaders {
    pub days: u32,
    pub hash: String,
}

impl CacheHeaders {
    pub fn new(days: u32, hash: impl Into<String>) -> Self {
        Self {
            days,
            hash: hash.into(),
        }
    }
}

impl IntoResponseParts for CacheHeaders {
    type Error = std::convert::Infallible;

    fn into_response_parts(self, mut res: ResponseParts) -> Result<ResponseParts, Self::Error> {
        add_cache_headers(res.headers_mut(), self.days, &self.hash);
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use chrono::NaiveDateTime;

    fn parse_expires(value: &str) -> chrono::DateTime<Utc> {
        NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S UTC")
            .unwrap()
            .and_utc()
    }

    #[test]
    fn test_thirty_days() {
        let mut headers = HeaderMap::new();
        add_cache_headers(&mut headers, 30, "abc123");

        let cache_control = headers.get(CACHE_CONTROL).unwrap().to_str().unwrap();
        assert!(cache_control.contains("2592000"));
        assert_eq!(cache_control, "max-age=2592000");

        assert_eq!(headers.get(ETAG).unwrap(), "\"abc123\"");

        let expires = parse_expires(headers.get(EXPIRES).unwrap().to_str().unwrap());
        let expected = Utc::now() + Duration::days(30);
        let drift = (expires - expected).num_seconds().abs();
        assert!(drift <= 5, "expires drifted by {drift}s");
    }

    #[test]
    fn test_zero_days() {
        let mut headers = HeaderMap::new();
        add_cache_headers(&mut headers, 0, "x");
        assert_eq!(headers.get(CACHE_CONTROL).unwrap(), "max-age=0");
    }

    #[test]
    fn test_invalid_hash_skips_etag() {
        let mut headers = HeaderMap::new();
        add_cache_headers(&mut headers, 1, "bad\nhash");
        assert!(headers.get(ETAG).is_none());
        assert!(headers.get(CACHE_CONTROL).is_some());
    }

    #[test]
    fn test_expires_day_is_not_zero_padded() {
        let date = chrono::NaiveDate::from_ymd_opt(2006, 1, 2)
            .unwrap()
            .and_hms_opt(15, 4, 5)
            .unwrap()
            .and_utc();
        assert_eq!(
            date.format(EXPIRES_FORMAT).to_string(),
            "Mon, 2 Jan 2006 15:04:05 UTC"
        );
    }

    #[test]
    fn test_response_parts() {
        let response = (CacheHeaders::new(7, "deadbeef"), "body").into_response();
        assert_eq!(response.headers().get(CACHE_CONTROL).unwrap(), "max-age=604800");
        assert_eq!(response.headers().get(ETAG).unwrap(), "\"deadbeef\"");
        assert!(response.headers().get(EXPIRES).is_some());
    }
}
