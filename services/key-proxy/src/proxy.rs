//! HTTP proxy logic
//!
//! For each inbound request: take one key from the pool, strip hop-by-hop
//! headers and any client-supplied credential, inject the pooled key, and
//! forward to the upstream URL. The upstream response is returned verbatim
//! (including error status codes from upstream).

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use key_pool::Pool;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

use crate::keys::KeyRing;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Response header naming the pool label used for the request.
pub const KEY_ID_HEADER: &str = "x-proxy-key-id";

/// How the pooled key is presented upstream
#[derive(Debug, Clone)]
pub struct AuthInjection {
    pub header: HeaderName,
    /// Prefix placed before the key; empty sends the raw key.
    pub scheme: String,
}

impl AuthInjection {
    fn header_value(
        &self,
        key: &str,
    ) -> Result<HeaderValue, axum::http::header::InvalidHeaderValue> {
        let mut value = if self.scheme.is_empty() {
            HeaderValue::from_str(key)?
        } else {
            HeaderValue::from_str(&format!("{} {key}", self.scheme))?
        };
        value.set_sensitive(true);
        Ok(value)
    }
}

/// Shared state passed to the proxy handler via axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub auth: AuthInjection,
    pub pool: Arc<Pool>,
    pub keys: Arc<KeyRing>,
    pub timeout: Duration,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

/// Keeps `in_flight` accurate on every return path, including early errors.
struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// JSON error response: {"error":{"type":"proxy_error","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": "proxy_error",
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// 429 with Retry-After when every key is cooling down.
fn exhausted_response(retry_after: Duration, message: &str, request_id: &str) -> Response {
    let retry_after_secs = key_pool::ceil_secs(retry_after);
    let body = serde_json::json!({
        "error": {
            "type": "pool_exhausted",
            "message": message,
            "request_id": request_id,
            "retry_after_secs": retry_after_secs,
        }
    });
    (
        StatusCode::TOO_MANY_REQUESTS,
        [
            (
                axum::http::header::CONTENT_TYPE,
                "application/json".to_string(),
            ),
            (axum::http::header::RETRY_AFTER, retry_after_secs.to_string()),
        ],
        body.to_string(),
    )
        .into_response()
}

/// Proxy an inbound request to upstream using the next key from the pool.
///
/// Exactly one key is acquired per inbound request; timeout retries reuse it.
/// Retry strategy: upstream timeouts get 2 retries with 100ms fixed backoff.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlightGuard::enter(&state.in_flight);

    let key_id = match state.pool.acquire() {
        Ok(id) => id,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            return match e.retry_after() {
                Some(retry_after) => exhausted_response(retry_after, &e.to_string(), &request_id),
                None => error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &e.to_string(),
                    &request_id,
                ),
            };
        }
    };
    debug!(key_id = %key_id, "forwarding with pooled key");

    let auth_value = match state
        .keys
        .get(&key_id)
        .ok_or("key missing from key ring")
        .and_then(|key| {
            state
                .auth
                .header_value(key.expose())
                .map_err(|_| "key is not a valid header value")
        }) {
        Ok(v) => v,
        Err(reason) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(key_id = %key_id, reason, "cannot build auth header");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, reason, &request_id);
        }
    };

    let method = request.method().clone();
    let uri = request.uri().clone();

    // Build the upstream URL by appending the request path and query
    let upstream_url = if let Some(pq) = uri.path_and_query() {
        format!("{}{}", state.upstream_url.trim_end_matches('/'), pq)
    } else {
        state.upstream_url.clone()
    };

    // Collect request headers, stripping hop-by-hop, Host, and client credentials
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in request.headers() {
        if !is_hop_by_hop(name.as_str())
            && *name != axum::http::header::HOST
            && *name != state.auth.header
        {
            headers.append(name.clone(), value.clone());
        }
    }
    headers.insert(state.auth.header.clone(), auth_value);

    let body_bytes = match axum::body::to_bytes(request.into_body(), 10 * 1024 * 1024).await {
        Ok(b) => b,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {e}"),
                &request_id,
            );
        }
    };

    // Retry loop: up to 2 retries (3 total attempts) for timeouts only
    let max_attempts = 3u32;
    let retry_delay = Duration::from_millis(100);

    for attempt in 0..max_attempts {
        if attempt > 0 {
            warn!(attempt, key_id = %key_id, "retrying after upstream timeout");
            tokio::time::sleep(retry_delay).await;
        }

        let req = state
            .client
            .request(method.clone(), &upstream_url)
            .headers(headers.clone())
            .timeout(state.timeout)
            .body(body_bytes.clone());

        match req.send().await {
            Ok(upstream_response) => {
                let status = upstream_response.status();
                let resp_headers = upstream_response.headers().clone();

                match upstream_response.bytes().await {
                    Ok(resp_body) => {
                        let mut response = Response::builder()
                            .status(status)
                            .header(KEY_ID_HEADER, key_id.as_str());
                        for (name, value) in &resp_headers {
                            if !is_hop_by_hop(name.as_str()) {
                                response = response.header(name, value);
                            }
                        }
                        return response
                            .body(axum::body::Body::from(resp_body))
                            .unwrap_or_else(|e| {
                                error_response(
                                    StatusCode::INTERNAL_SERVER_ERROR,
                                    &format!("response build error: {e}"),
                                    &request_id,
                                )
                            });
                    }
                    Err(e) => {
                        state.errors_total.fetch_add(1, Ordering::Relaxed);
                        crate::metrics::record_upstream_error("body_read");
                        error!(error = %e, "failed to read upstream response body");
                        return error_response(
                            StatusCode::BAD_GATEWAY,
                            &format!("upstream response read error: {e}"),
                            &request_id,
                        );
                    }
                }
            }
            Err(e) if e.is_timeout() && attempt < max_attempts - 1 => {
                crate::metrics::record_upstream_error("timeout");
                continue;
            }
            Err(e) if e.is_timeout() => {
                state.errors_total.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_upstream_error("timeout");
                error!(error = %e, attempts = max_attempts, "upstream timeout after all retries");
                return error_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    &format!(
                        "upstream timeout after {}s ({max_attempts} attempts)",
                        state.timeout.as_secs()
                    ),
                    &request_id,
                );
            }
            Err(e) => {
                state.errors_total.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_upstream_error("connection");
                error!(error = %e, "upstream request failed");
                return error_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("upstream error: {e}"),
                    &request_id,
                );
            }
        }
    }

    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "unexpected retry exhaustion",
        &request_id,
    )
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("Proxy-Authorization"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
    }

    #[test]
    fn test_bearer_header_value_is_sensitive() {
        let auth = AuthInjection {
            header: HeaderName::from_static("authorization"),
            scheme: "Bearer".into(),
        };
        let value = auth.header_value("gsk_abc").unwrap();
        assert_eq!(value, "Bearer gsk_abc");
        assert!(value.is_sensitive());
    }

    #[test]
    fn test_empty_scheme_sends_raw_key() {
        let auth = AuthInjection {
            header: HeaderName::from_static("x-api-key"),
            scheme: String::new(),
        };
        assert_eq!(auth.header_value("gsk_abc").unwrap(), "gsk_abc");
    }

    #[test]
    fn test_key_with_newline_is_rejected() {
        let auth = AuthInjection {
            header: HeaderName::from_static("authorization"),
            scheme: "Bearer".into(),
        };
        assert!(auth.header_value("gsk\nabc").is_err());
    }

    #[test]
    fn test_exhausted_response_rounds_retry_after_up() {
        let resp = exhausted_response(Duration::from_millis(1_500), "all keys cooling", "req_1");
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[axum::http::header::RETRY_AFTER], "2");
    }

    #[test]
    fn test_in_flight_guard_balances() {
        let counter = Arc::new(AtomicU64::new(0));
        {
            let _a = InFlightGuard::enter(&counter);
            let _b = InFlightGuard::enter(&counter);
            assert_eq!(counter.load(Ordering::Relaxed), 2);
        }
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_error_response_format() {
        let resp = error_response(
            StatusCode::GATEWAY_TIMEOUT,
            "upstream timeout after 60s",
            "req_abc123",
        );
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
