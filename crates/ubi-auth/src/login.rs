//! Session login request and response bodies
//!
//! A login is a `POST` to the sessions endpoint carrying the identity token as
//! a Basic `Authorization` header and `{"rememberMe":true}` as the body. The
//! service answers with a session ticket and its absolute expiry, or with a
//! rate-limit body naming the instant after which to retry.
//!
//! Timestamps come in two shapes: `expiration` is RFC 3339 with up to seven
//! fractional digits, `moreInfo` is a naive UTC date-time.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use transport::{HeaderMap, HeaderName, HeaderValue, HttpRequest, HttpResponse, Transport};

use crate::codec::IdentityToken;
use crate::constants::{APP_ID, APP_ID_HEADER, LOGIN_URL, SESSION_SCHEME};
use crate::error::{Error, Result};

/// Naive formats accepted after RFC 3339, interpreted as UTC.
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Location of the session endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginEndpoint {
    url: String,
}

impl LoginEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Default for LoginEndpoint {
    fn default() -> Self {
        Self::new(LOGIN_URL)
    }
}

#[derive(Serialize)]
struct LoginBody {
    #[serde(rename = "rememberMe")]
    remember_me: bool,
}

/// Success body from the session endpoint. Only the fields the pool needs.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub ticket: Option<String>,
    pub expiration: Option<String>,
    pub profile_id: Option<String>,
}

/// A live session ticket and its absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub ticket: String,
    pub expires_at: DateTime<Utc>,
    pub profile_id: Option<String>,
}

impl LoginResponse {
    /// Validate the body: `ticket` and `expiration` must be present and
    /// non-empty, and `expiration` must parse.
    pub fn into_session(self) -> Result<Session> {
        let ticket = self
            .ticket
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::MalformedResponse("missing ticket".into()))?;
        let expiration = self
            .expiration
            .filter(|e| !e.is_empty())
            .ok_or_else(|| Error::MalformedResponse("missing expiration".into()))?;
        Ok(Session {
            ticket,
            expires_at: parse_timestamp(&expiration)?,
            profile_id: self.profile_id,
        })
    }
}

/// Body of a 429 from the session endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResponse {
    pub message: Option<String>,
    pub more_info: Option<String>,
    pub error_code: Option<i64>,
}

impl RateLimitResponse {
    /// The instant after which the service accepts logins again.
    pub fn retry_at(&self) -> Result<DateTime<Utc>> {
        let more_info = self
            .more_info
            .as_deref()
            .ok_or_else(|| Error::MalformedResponse("rate limit body has no moreInfo".into()))?;
        parse_timestamp(more_info)
    }
}

/// Parse a service timestamp: RFC 3339 first, then naive date-times as UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(Error::Date(format!("unrecognized timestamp {value:?}")))
}

/// Set the three headers every request to the service carries:
/// application id, `Authorization`, and a JSON content type.
pub fn apply_session_headers(headers: &mut HeaderMap, authorization: &str) -> Result<()> {
    let authorization = HeaderValue::from_str(authorization)
        .map_err(|e| Error::InvalidHeader(format!("authorization: {e}")))?;
    headers.insert(
        HeaderName::from_static(APP_ID_HEADER),
        HeaderValue::from_static(APP_ID),
    );
    headers.insert(transport::header::AUTHORIZATION, authorization);
    headers.insert(
        transport::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    Ok(())
}

/// `Authorization` value for a session ticket.
pub fn session_authorization(ticket: &str) -> String {
    format!("{SESSION_SCHEME} t={ticket}")
}

/// Build the login request for one identity.
pub fn login_request(endpoint: &LoginEndpoint, identity: &IdentityToken) -> Result<HttpRequest> {
    let mut request = HttpRequest::post(endpoint.url()).json(&LoginBody { remember_me: true })?;
    apply_session_headers(&mut request.headers, identity.as_str())?;
    Ok(request)
}

/// Send one login attempt and return the raw response for classification.
pub async fn login(
    transport: &dyn Transport,
    endpoint: &LoginEndpoint,
    identity: &IdentityToken,
) -> Result<HttpResponse> {
    let request = login_request(endpoint, identity)?;
    debug!(identifier = %identity.identifier(), url = endpoint.url(), "sending login request");
    let response = transport.send(request).await?;
    debug!(identifier = %identity.identifier(), status = response.status, "login response");
    Ok(response)
}
