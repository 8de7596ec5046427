//! Per-request proxy errors and their HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failures the proxy handler turns into JSON error responses.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("no live credentials: {0}")]
    PoolExhausted(String),

    #[error("credentials still warming up: {0}")]
    NotReady(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upstream timeout after {secs}s ({attempts} attempts)")]
    UpstreamTimeout { secs: u64, attempts: u32 },

    #[error("upstream error: {0}")]
    Upstream(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::PoolExhausted(_) | ProxyError::NotReady(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Value of `error.type` in the response body.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::PoolExhausted(_) => "pool_exhausted",
            ProxyError::NotReady(_) => "not_ready",
            ProxyError::InvalidRequest(_) => "invalid_request",
            ProxyError::UpstreamTimeout { .. } | ProxyError::Upstream(_) => "proxy_error",
        }
    }

    /// JSON error response: `{"error":{"type":..,"message":..,"request_id":..}}`
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": self.kind(),
                "message": self.to_string(),
                "request_id": request_id,
            }
        });
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

impl From<ubi_pool::Error> for ProxyError {
    fn from(e: ubi_pool::Error) -> Self {
        match e {
            ubi_pool::Error::PoolExhausted(msg) => ProxyError::PoolExhausted(msg),
            ubi_pool::Error::NotReady(msg) => ProxyError::NotReady(msg),
            ubi_pool::Error::InvalidHeader(msg) => ProxyError::Upstream(msg),
        }
    }
}
