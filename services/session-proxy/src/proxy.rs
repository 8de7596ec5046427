//! Authorizing reverse proxy
//!
//! Strips hop-by-hop headers, stamps the request with the next session ticket
//! from the pool, and forwards it to the upstream API. Upstream responses,
//! error statuses included, are returned verbatim.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use axum::response::Response;
use tracing::{debug, error, instrument, warn};
use ubi_pool::AuthorizationProvider;

use crate::error::ProxyError;

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

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Shared state passed to the proxy handler
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream_url: String,
    pub timeout: Duration,
    pub provider: Arc<AuthorizationProvider>,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

/// Decrements the in-flight gauge when the request finishes, however it ends.
struct InFlight(Arc<AtomicU64>);

impl InFlight {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Proxy one inbound request upstream.
///
/// Upstream timeouts are retried twice, 100ms apart.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
    request_id: String,
) -> Response {
    let _in_flight = InFlight::enter(&state.in_flight);
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let started = Instant::now();
    let method = request.method().clone();

    let response = match forward(state, request).await {
        Ok(response) => response,
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            match &e {
                ProxyError::PoolExhausted(_) | ProxyError::NotReady(_) => {
                    warn!(error = %e, "cannot authorize request")
                }
                _ => error!(error = %e, "proxy request failed"),
            }
            e.into_response_with_id(&request_id)
        }
    };

    crate::metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn forward(
    state: &ProxyState,
    request: axum::http::Request<axum::body::Body>,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();

    let upstream_url = match parts.uri.path_and_query() {
        Some(pq) => format!("{}{}", state.upstream_url.trim_end_matches('/'), pq),
        None => state.upstream_url.clone(),
    };

    let headers = state.provider.authorize(forwardable_headers(&parts.headers))?;

    let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid request body: {e}")))?;

    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            warn!(attempt, "retrying after upstream timeout");
            tokio::time::sleep(RETRY_DELAY).await;
        }

        let sent = state
            .client
            .request(parts.method.clone(), &upstream_url)
            .headers(headers.clone())
            .timeout(state.timeout)
            .body(body_bytes.clone())
            .send()
            .await;

        match sent {
            Ok(upstream_response) => return relay(upstream_response).await,
            Err(e) if e.is_timeout() => {
                debug!(attempt, error = %e, "upstream timed out");
                continue;
            }
            Err(e) => {
                crate::metrics::record_upstream_error(if e.is_connect() {
                    "connection"
                } else {
                    "other"
                });
                return Err(ProxyError::Upstream(e.to_string()));
            }
        }
    }

    crate::metrics::record_upstream_error("timeout");
    Err(ProxyError::UpstreamTimeout {
        secs: state.timeout.as_secs(),
        attempts: MAX_ATTEMPTS,
    })
}

async fn relay(upstream_response: reqwest::Response) -> Result<Response, ProxyError> {
    let status = upstream_response.status();
    let upstream_headers = upstream_response.headers().clone();
    let body = upstream_response.bytes().await.map_err(|e| {
        crate::metrics::record_upstream_error("body");
        ProxyError::Upstream(format!("upstream response read error: {e}"))
    })?;

    let mut response = Response::builder().status(status);
    for (name, value) in &upstream_headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response
        .body(axum::body::Body::from(body))
        .map_err(|e| ProxyError::Upstream(format!("response build error: {e}")))
}

/// Copy inbound headers, dropping hop-by-hop ones and `host`.
pub fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if !is_hop_by_hop(name.as_str()) && name != axum::http::header::HOST {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
