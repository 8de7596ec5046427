//! Login response classification
//!
//! Maps one login attempt to the transition it drives in the refresh state
//! machine. Only a 401 is treated as rejected credentials; a 429 with a
//! readable retry instant is throttling; everything else (other statuses,
//! unreadable bodies, transport failures) is a transient failure that counts
//! against the retry budget.

use chrono::{DateTime, Utc};
use transport::HttpResponse;
use ubi_auth::{LoginResponse, RateLimitResponse, Session};

/// Result of one login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// 200 with a usable ticket and expiry
    Success(Session),
    /// 401: credentials rejected, do not retry
    Rejected,
    /// 429: wait until `retry_at`, not counted as a failed attempt
    RateLimited {
        retry_at: DateTime<Utc>,
        message: String,
        error_code: Option<i64>,
    },
    /// Anything else: counted failure, retried after the fixed interval
    Failed(String),
}

impl LoginOutcome {
    /// Label for metrics and logging.
    pub fn label(&self) -> &'static str {
        match self {
            LoginOutcome::Success(_) => "success",
            LoginOutcome::Rejected => "rejected",
            LoginOutcome::RateLimited { .. } => "rate_limited",
            LoginOutcome::Failed(_) => "failed",
        }
    }
}

/// Classify the result of `ubi_auth::login`, including transport failures.
pub fn classify_login(result: ubi_auth::Result<HttpResponse>) -> LoginOutcome {
    match result {
        Ok(response) => classify_response(&response),
        Err(e) => LoginOutcome::Failed(format!("login request failed: {e}")),
    }
}

/// Classify a login response by status and body.
pub fn classify_response(response: &HttpResponse) -> LoginOutcome {
    match response.status {
        200 => {
            let session = response
                .json::<LoginResponse>()
                .map_err(ubi_auth::Error::from)
                .and_then(LoginResponse::into_session);
            match session {
                Ok(session) => LoginOutcome::Success(session),
                Err(e) => LoginOutcome::Failed(e.to_string()),
            }
        }
        401 => LoginOutcome::Rejected,
        429 => {
            let limit = match response.json::<RateLimitResponse>() {
                Ok(limit) => limit,
                Err(e) => return LoginOutcome::Failed(format!("unreadable rate limit body: {e}")),
            };
            match limit.retry_at() {
                Ok(retry_at) => LoginOutcome::RateLimited {
                    retry_at,
                    message: limit.message.unwrap_or_default(),
                    error_code: limit.error_code,
                },
                Err(e) => LoginOutcome::Failed(format!("rate limited without retry instant: {e}")),
            }
        }
        status => LoginOutcome::Failed(format!("unexpected login status {status}")),
    }
}
