//! Scripted session service for pool tests

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use parking_lot::Mutex;
use transport::{HttpRequest, HttpResponse, Transport, TransportError};
use ubi_auth::IdentityToken;

type Reply = transport::Result<HttpResponse>;
type Fallback = Box<dyn Fn(&HttpRequest) -> Reply + Send + Sync>;

static ISSUED: AtomicUsize = AtomicUsize::new(0);

/// Answers login requests from a queue, then from a fallback closure.
pub struct ScriptedTransport {
    queue: Mutex<VecDeque<Reply>>,
    fallback: Fallback,
    calls: AtomicUsize,
    last_url: Mutex<Option<String>>,
}

impl ScriptedTransport {
    pub fn with_fallback(
        fallback: impl Fn(&HttpRequest) -> Reply + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: Box::new(fallback),
            calls: AtomicUsize::new(0),
            last_url: Mutex::new(None),
        })
    }

    pub fn always_succeeding() -> Arc<Self> {
        Self::with_fallback(success_for)
    }

    /// Queue a reply ahead of the fallback.
    pub fn push(&self, reply: Reply) {
        self.queue.lock().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_url(&self) -> Option<String> {
        self.last_url.lock().clone()
    }
}

impl Transport for ScriptedTransport {
    fn send(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = transport::Result<HttpResponse>> + Send + '_>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_url.lock() = Some(request.url.clone());
        let queued = self.queue.lock().pop_front();
        let reply = queued.unwrap_or_else(|| (self.fallback)(&request));
        Box::pin(async move { reply })
    }
}

/// The ticket `success_for` issues to an identity.
pub fn ticket_for(identity: &IdentityToken) -> String {
    let payload = identity.as_str().trim_start_matches("Basic ");
    format!("TICKET-{payload}")
}

fn presented_identity(request: &HttpRequest) -> IdentityToken {
    let header = request
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    IdentityToken::from_encoded(header)
}

pub fn reply(status: u16, body: &str) -> Reply {
    Ok(HttpResponse::new(status, body))
}

pub fn fail(message: &str) -> Reply {
    Err(TransportError::Http(message.to_string()))
}

pub fn rejected() -> Reply {
    reply(401, r#"{"message":"Invalid credentials","errorCode":1}"#)
}

/// 429 asking the caller to come back `after` from now.
pub fn throttled(after: Duration) -> Reply {
    let retry_at = Utc::now() + TimeDelta::seconds(after.as_secs() as i64);
    let body = serde_json::json!({
        "message": "Too many calls per profile",
        "errorCode": 1100,
        "moreInfo": retry_at.format("%Y-%m-%d %H:%M:%S").to_string(),
    });
    reply(429, &body.to_string())
}

/// 200 with a deterministic ticket valid for one hour.
pub fn success_for(request: &HttpRequest) -> Reply {
    let identity = presented_identity(request);
    let body = serde_json::json!({
        "ticket": ticket_for(&identity),
        "expiration": (Utc::now() + TimeDelta::hours(1)).to_rfc3339(),
        "profileId": "profile",
    });
    reply(200, &body.to_string())
}

/// 200 with a fresh ticket on every call, valid for `ttl`.
pub fn success_expiring(request: &HttpRequest, ttl: Duration) -> Reply {
    let identity = presented_identity(request);
    let serial = ISSUED.fetch_add(1, Ordering::SeqCst);
    let body = serde_json::json!({
        "ticket": format!("{}-{serial}", ticket_for(&identity)),
        "expiration": (Utc::now() + TimeDelta::seconds(ttl.as_secs() as i64)).to_rfc3339(),
    });
    reply(200, &body.to_string())
}
