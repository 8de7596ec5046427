//! Authorization provider: credential registry, ticket cache, round-robin dispatch
//!
//! The provider holds the ordered registry of identity tokens and a cache of
//! live session tickets keyed by registry entry. Background tasks (see
//! `refresh`) keep the cache warm; `authorize` only ever reads it, so after
//! `init()` it never waits on the network.
//!
//! Registry and cache share one `RwLock` so a refresh can check membership and
//! write its ticket atomically; the round-robin cursor is a separate atomic.
//!
//! Every registry entry carries an [`EntryId`] that is never reused. A refresh
//! task is bound to the entry it was spawned for, so removing credentials and
//! adding the same ones back yields a new entry and a new task, never two
//! tasks on one entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use transport::{AuthorizableRequest, Transport};
use ubi_auth::{CredentialSet, IdentityToken, LoginEndpoint};

use crate::error::{Error, Result};
use crate::refresh::{Readiness, RefreshPolicy, run_identity};

/// Why an identity was dropped from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    /// The session service answered 401
    InvalidCredentials,
    /// Every attempt in the retry budget failed
    RetryLimit,
    /// Removed by an operator
    Removed,
}

impl InvalidationReason {
    pub fn label(&self) -> &'static str {
        match self {
            InvalidationReason::InvalidCredentials => "invalid_credentials",
            InvalidationReason::RetryLimit => "retry_limit",
            InvalidationReason::Removed => "removed",
        }
    }
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationReason::InvalidCredentials => write!(f, "Invalid credentials provided"),
            InvalidationReason::RetryLimit => write!(f, "Retry limit reached"),
            InvalidationReason::Removed => write!(f, "Removed from rotation"),
        }
    }
}

/// Identity of one registry entry, unique for the life of the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EntryId(u64);

/// A cached session ticket.
#[derive(Debug, Clone)]
struct CachedTicket {
    ticket: String,
    expires_at: Instant,
    expires_at_utc: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    id: EntryId,
    identity: IdentityToken,
    /// Refresh task, once spawned
    task: Option<AbortHandle>,
}

#[derive(Debug, Default)]
struct PoolState {
    registry: Vec<Entry>,
    cache: HashMap<EntryId, CachedTicket>,
    initialized: bool,
}

impl PoolState {
    fn position(&self, id: EntryId) -> Option<usize> {
        self.registry.iter().position(|entry| entry.id == id)
    }

    fn remove_at(&mut self, position: usize) -> Entry {
        let entry = self.registry.remove(position);
        self.cache.remove(&entry.id);
        entry
    }
}

/// State shared between the provider and its refresh tasks.
pub(crate) struct Shared {
    state: RwLock<PoolState>,
    cursor: AtomicUsize,
    next_id: AtomicU64,
    transport: Arc<dyn Transport>,
    endpoint: LoginEndpoint,
    policy: RefreshPolicy,
}

impl Shared {
    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub(crate) fn endpoint(&self) -> &LoginEndpoint {
        &self.endpoint
    }

    pub(crate) fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    fn entry(&self, identity: IdentityToken) -> Entry {
        Entry {
            id: EntryId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            identity,
            task: None,
        }
    }

    pub(crate) fn is_registered(&self, id: EntryId) -> bool {
        self.state.read().position(id).is_some()
    }

    /// Cache a ticket, replacing any previous one for this entry.
    ///
    /// Returns false without writing if the entry is no longer registered,
    /// so a login racing an invalidation cannot resurrect it.
    pub(crate) fn store(
        &self,
        id: EntryId,
        ticket: String,
        expires_at: Instant,
        expires_at_utc: DateTime<Utc>,
    ) -> bool {
        let mut state = self.state.write();
        if state.position(id).is_none() {
            return false;
        }
        state.cache.insert(
            id,
            CachedTicket {
                ticket,
                expires_at,
                expires_at_utc,
            },
        );
        true
    }

    /// Drop an entry on behalf of its own refresh task, which ends by itself.
    pub(crate) fn invalidate_entry(&self, id: EntryId, reason: InvalidationReason) {
        let removed = {
            let mut state = self.state.write();
            state
                .position(id)
                .map(|position| (state.remove_at(position), state.registry.len()))
        };
        match removed {
            Some((entry, remaining)) => record_removal(&entry, reason, remaining),
            None => debug!(?id, %reason, "entry already invalidated"),
        }
    }

    /// Drop the first entry for `identity` and stop its refresh task.
    /// Returns false if no entry matched.
    fn invalidate_identity(&self, identity: &IdentityToken, reason: InvalidationReason) -> bool {
        self.invalidate_first(|entry| entry.identity == *identity, reason)
    }

    fn invalidate_first(
        &self,
        matches: impl Fn(&Entry) -> bool,
        reason: InvalidationReason,
    ) -> bool {
        let removed = {
            let mut state = self.state.write();
            state
                .registry
                .iter()
                .position(matches)
                .map(|position| (state.remove_at(position), state.registry.len()))
        };
        let Some((entry, remaining)) = removed else {
            return false;
        };
        if let Some(task) = &entry.task {
            task.abort();
        }
        record_removal(&entry, reason, remaining);
        true
    }

    /// Attach a freshly spawned task to its entry, or stop it if the entry
    /// was removed before the handle got here.
    fn attach_task(&self, id: EntryId, task: AbortHandle) {
        let mut state = self.state.write();
        match state.position(id) {
            Some(position) => state.registry[position].task = Some(task),
            None => task.abort(),
        }
    }

    /// Pick the next primed entry round-robin and return its authorization value.
    ///
    /// Registry entries without a cached ticket yet (freshly added) are
    /// skipped; the cursor moves past whichever entry was used.
    fn next_authorization(&self) -> Result<String> {
        let state = self.state.read();
        let len = state.registry.len();
        if len == 0 {
            return Err(Error::PoolExhausted("no live credentials in rotation".into()));
        }

        let mut current = self.cursor.load(Ordering::Acquire);
        loop {
            let start = current % len;
            let selected = (0..len).map(|offset| (start + offset) % len).find_map(|index| {
                state
                    .cache
                    .get(&state.registry[index].id)
                    .map(|cached| (index, cached))
            });
            let Some((index, cached)) = selected else {
                return Err(Error::NotReady(format!(
                    "none of {len} registered identities has a session yet"
                )));
            };

            match self.cursor.compare_exchange_weak(
                current,
                (index + 1) % len,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(ubi_auth::session_authorization(&cached.ticket)),
                Err(actual) => current = actual,
            }
        }
    }
}

fn record_removal(entry: &Entry, reason: InvalidationReason, remaining: usize) {
    warn!(
        identifier = %entry.identity.identifier(),
        %reason,
        remaining,
        "credentials invalidated and removed from rotation"
    );
    crate::metrics::record_invalidation(reason.label());
    crate::metrics::set_pool_size(remaining);
}

/// Builder for [`AuthorizationProvider`].
pub struct ProviderBuilder {
    credentials: Vec<CredentialSet>,
    transport: Arc<dyn Transport>,
    endpoint: LoginEndpoint,
    policy: RefreshPolicy,
}

impl ProviderBuilder {
    pub fn credentials(mut self, credentials: Vec<CredentialSet>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn login_endpoint(mut self, endpoint: LoginEndpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn policy(mut self, policy: RefreshPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> AuthorizationProvider {
        let shared = Shared {
            state: RwLock::new(PoolState::default()),
            cursor: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            transport: self.transport,
            endpoint: self.endpoint,
            policy: self.policy,
        };
        let registry: Vec<Entry> = self
            .credentials
            .iter()
            .map(|credentials| shared.entry(IdentityToken::encode(credentials)))
            .collect();
        info!(identities = registry.len(), "session pool constructed");
        crate::metrics::set_pool_size(registry.len());
        shared.state.write().registry = registry;

        AuthorizationProvider {
            shared: Arc::new(shared),
        }
    }
}

/// Distributes requests across multiple credential sets and keeps a session
/// ticket cached for each one for its whole lifetime.
///
/// Call [`init`](Self::init) once before [`authorize`](Self::authorize).
/// Dropping the provider stops all background refresh tasks.
pub struct AuthorizationProvider {
    shared: Arc<Shared>,
}

impl AuthorizationProvider {
    /// Provider with default endpoint and policy. Performs no I/O.
    pub fn new(credentials: Vec<CredentialSet>, transport: Arc<dyn Transport>) -> Self {
        Self::builder(transport).credentials(credentials).build()
    }

    pub fn builder(transport: Arc<dyn Transport>) -> ProviderBuilder {
        ProviderBuilder {
            credentials: Vec::new(),
            transport,
            endpoint: LoginEndpoint::default(),
            policy: RefreshPolicy::default(),
        }
    }

    /// Log in every registered identity and wait until each one either has a
    /// cached ticket or has been dropped. Never fails; an all-invalid pool
    /// simply ends up empty.
    ///
    /// Calling `init` again is a no-op.
    pub async fn init(&self) {
        let entries: Vec<(EntryId, IdentityToken)> = {
            let mut state = self.shared.state.write();
            if state.initialized {
                debug!("session pool already initialized");
                return;
            }
            state.initialized = true;
            state
                .registry
                .iter()
                .map(|entry| (entry.id, entry.identity.clone()))
                .collect()
        };

        let total = entries.len();
        let pending: Vec<_> = entries
            .into_iter()
            .map(|(id, identity)| self.spawn_refresh(id, identity))
            .collect();
        let outcomes = join_all(pending).await;
        let ready = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Ok(Readiness::Ready)))
            .count();

        if ready == 0 && total > 0 {
            warn!(total, "session pool initialized with no usable credentials");
        } else {
            info!(ready, dropped = total - ready, "session pool initialized");
        }
    }

    /// Add a credential set to the rotation.
    ///
    /// After `init`, its first login starts in the background and this returns
    /// immediately; until that login succeeds `authorize` skips it.
    ///
    /// Before `init`, the identity is only registered: no login happens until
    /// `init` is called, and a provider that is never initialized never logs
    /// it in.
    pub fn add(&self, credentials: CredentialSet) {
        let entry = self.shared.entry(IdentityToken::encode(&credentials));
        let (id, identity) = (entry.id, entry.identity.clone());
        let (initialized, size) = {
            let mut state = self.shared.state.write();
            state.registry.push(entry);
            (state.initialized, state.registry.len())
        };
        info!(identifier = %credentials.identifier(), "credentials added to rotation");
        crate::metrics::set_pool_size(size);

        if initialized {
            // Readiness is not awaited; the receiver is dropped
            drop(self.spawn_refresh(id, identity));
        }
    }

    /// Stamp `request` with the application id, the next session ticket in
    /// round-robin order, and a JSON content type.
    ///
    /// Fails with `PoolExhausted` if no credentials remain, or `NotReady` if
    /// every registered identity is still waiting for its first ticket.
    pub fn authorize<R: AuthorizableRequest>(&self, mut request: R) -> Result<R> {
        let authorization = self.shared.next_authorization()?;
        ubi_auth::apply_session_headers(request.headers_mut(), &authorization)
            .map_err(|e| Error::InvalidHeader(e.to_string()))?;
        Ok(request)
    }

    /// Remove the first entry for an identity from rotation and stop its
    /// refresh. Idempotent.
    pub fn invalidate(&self, identity: &IdentityToken, reason: InvalidationReason) {
        if !self.shared.invalidate_identity(identity, reason) {
            debug!(identifier = %identity.identifier(), %reason, "identity already invalidated");
        }
    }

    /// Remove the first identity with this identifier. Returns whether one was found.
    pub fn remove(&self, identifier: &str) -> bool {
        self.shared.invalidate_first(
            |entry| entry.identity.identifier() == identifier,
            InvalidationReason::Removed,
        )
    }

    /// Number of identities in rotation, primed or not.
    pub fn len(&self) -> usize {
        self.shared.state.read().registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identifiers in rotation order.
    pub fn identifiers(&self) -> Vec<String> {
        self.shared
            .state
            .read()
            .registry
            .iter()
            .map(|entry| entry.identity.identifier())
            .collect()
    }

    /// Pool health summary. Never includes secrets or tickets.
    ///
    /// Status: every identity primed → healthy, some → degraded,
    /// none (or empty pool) → unhealthy.
    pub fn health(&self) -> serde_json::Value {
        let state = self.shared.state.read();
        let now = Instant::now();

        let mut ready_count = 0usize;
        let accounts: Vec<serde_json::Value> = state
            .registry
            .iter()
            .map(|entry| match state.cache.get(&entry.id) {
                Some(cached) => {
                    ready_count += 1;
                    serde_json::json!({
                        "identifier": entry.identity.identifier(),
                        "status": "ready",
                        "expires_in_secs": cached.expires_at.saturating_duration_since(now).as_secs(),
                        "expires_at": cached.expires_at_utc.to_rfc3339(),
                    })
                }
                None => serde_json::json!({
                    "identifier": entry.identity.identifier(),
                    "status": "pending",
                }),
            })
            .collect();

        let total = state.registry.len();
        let status = if ready_count == total && total > 0 {
            "healthy"
        } else if ready_count > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "identities_total": total,
            "identities_ready": ready_count,
            "identities_pending": total - ready_count,
            "identities": accounts,
        })
    }

    fn spawn_refresh(&self, id: EntryId, identity: IdentityToken) -> oneshot::Receiver<Readiness> {
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(run_identity(self.shared.clone(), id, identity, tx));
        self.shared.attach_task(id, handle.abort_handle());
        rx
    }
}

impl Drop for AuthorizationProvider {
    fn drop(&mut self) {
        for entry in &self.shared.state.read().registry {
            if let Some(task) = &entry.task {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        ScriptedTransport, fail, reply, rejected, success_expiring, success_for, throttled,
        ticket_for,
    };
    use std::sync::{OnceLock, Weak};
    use std::time::Duration;
    use transport::{HeaderMap, HttpRequest};

    fn creds(identifier: &str) -> CredentialSet {
        CredentialSet::new(identifier, format!("pw-{identifier}")).unwrap()
    }

    fn expected(credentials: &CredentialSet) -> String {
        format!("Ubi_v1 t={}", ticket_for(&IdentityToken::encode(credentials)))
    }

    fn authorization(provider: &AuthorizationProvider) -> Result<String> {
        let headers = provider.authorize(HeaderMap::new())?;
        Ok(headers["authorization"].to_str().unwrap().to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn authorize_adds_session_headers() {
        let transport = ScriptedTransport::always_succeeding();
        let provider = AuthorizationProvider::new(vec![creds("a@example.com")], transport.clone());
        provider.init().await;

        let request = provider
            .authorize(HttpRequest::get("https://example.com"))
            .unwrap();
        assert_eq!(request.headers["ubi-appid"], ubi_auth::APP_ID);
        assert!(
            request.headers["authorization"]
                .to_str()
                .unwrap()
                .starts_with("Ubi_v1 t=TICKET-")
        );
        assert_eq!(request.headers["content-type"], "application/json");
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn round_robin_switches_credentials() {
        let transport = ScriptedTransport::always_succeeding();
        let provider = AuthorizationProvider::new(
            vec![creds("a@example.com"), creds("b@example.com")],
            transport,
        );
        provider.init().await;

        let first = authorization(&provider).unwrap();
        let second = authorization(&provider).unwrap();
        let third = authorization(&provider).unwrap();

        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[tokio::test(start_paused = true)]
    async fn round_robin_follows_registry_order() {
        let transport = ScriptedTransport::always_succeeding();
        let a = creds("a@example.com");
        let b = creds("b@example.com");
        let c = creds("c@example.com");
        let provider =
            AuthorizationProvider::new(vec![a.clone(), b.clone(), c.clone()], transport);
        provider.init().await;

        for credentials in [&a, &b, &c, &a] {
            assert_eq!(authorization(&provider).unwrap(), expected(credentials));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_soft_failure_then_succeeds() {
        let transport = ScriptedTransport::always_succeeding();
        transport.push(reply(201, ""));
        let provider = AuthorizationProvider::new(vec![creds("a@example.com")], transport.clone());

        provider.init().await;

        assert_eq!(transport.calls(), 2);
        assert!(authorization(&provider).unwrap().starts_with("Ubi_v1 t=TICKET-"));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_malformed_success_body() {
        let transport = ScriptedTransport::always_succeeding();
        transport.push(reply(200, r#"{"ticket":"half"}"#));
        let provider = AuthorizationProvider::new(vec![creds("a@example.com")], transport.clone());

        provider.init().await;

        assert_eq!(transport.calls(), 2);
        assert!(!authorization(&provider).unwrap().contains("half"));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transport_errors() {
        let transport = ScriptedTransport::always_succeeding();
        transport.push(fail("connection reset"));
        let provider = AuthorizationProvider::new(vec![creds("a@example.com")], transport.clone());

        provider.init().await;

        assert_eq!(transport.calls(), 2);
        assert!(authorization(&provider).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_retry_limit() {
        let transport = ScriptedTransport::with_fallback(|_| reply(500, "oops"));
        let provider = AuthorizationProvider::new(vec![creds("a@example.com")], transport.clone());

        provider.init().await;

        assert_eq!(transport.calls(), ubi_auth::RETRY_LIMIT as usize);
        assert!(provider.is_empty());
        assert!(matches!(authorization(&provider), Err(Error::PoolExhausted(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_identity_is_never_selected() {
        let bad = creds("bad@example.com");
        let bad_value = expected(&bad);
        let bad_header = IdentityToken::encode(&bad).as_str().to_string();
        let transport = ScriptedTransport::with_fallback(move |request| {
            if request.headers["authorization"] == bad_header.as_str() {
                reply(503, "")
            } else {
                success_for(request)
            }
        });
        let provider =
            AuthorizationProvider::new(vec![bad, creds("good@example.com")], transport);

        provider.init().await;

        assert_eq!(provider.identifiers(), vec!["good@example.com"]);
        for _ in 0..4 {
            let value = authorization(&provider).unwrap();
            assert_ne!(value, bad_value);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_invalidates_without_retry() {
        let transport = ScriptedTransport::with_fallback(|_| rejected());
        let provider = AuthorizationProvider::new(vec![creds("a@example.com")], transport.clone());

        provider.init().await;

        assert_eq!(transport.calls(), 1);
        assert!(matches!(authorization(&provider), Err(Error::PoolExhausted(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_and_is_not_counted() {
        let transport = ScriptedTransport::always_succeeding();
        // More throttles than the retry budget allows failures
        for _ in 0..(ubi_auth::RETRY_LIMIT + 2) {
            transport.push(throttled(Duration::from_secs(5)));
        }
        let provider = AuthorizationProvider::new(vec![creds("a@example.com")], transport.clone());

        let started = Instant::now();
        provider.init().await;

        assert_eq!(transport.calls(), ubi_auth::RETRY_LIMIT as usize + 3);
        assert!(authorization(&provider).is_ok());
        // Each throttle waits at least until moreInfo (second precision) plus the buffer
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn single_throttle_then_success_is_two_attempts() {
        let transport = ScriptedTransport::always_succeeding();
        transport.push(throttled(Duration::from_secs(2)));
        let provider = AuthorizationProvider::new(vec![creds("a@example.com")], transport.clone());

        provider.init().await;

        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_pool_is_exhausted() {
        let provider =
            AuthorizationProvider::new(vec![], ScriptedTransport::always_succeeding());
        provider.init().await;
        let err = provider.authorize(HeaderMap::new()).unwrap_err();
        assert!(err.to_string().starts_with("pool exhausted"), "got: {err}");
    }

    #[tokio::test(start_paused = true)]
    async fn renews_before_expiry() {
        let transport = ScriptedTransport::with_fallback(|request| {
            // Expires in two minutes: renewal is due after one
            success_expiring(request, Duration::from_secs(120))
        });
        let provider = AuthorizationProvider::new(vec![creds("a@example.com")], transport.clone());
        provider.init().await;
        let first = authorization(&provider).unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.calls(), 1);

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(transport.calls(), 2);
        let renewed = authorization(&provider).unwrap();
        assert_ne!(first, renewed);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidated_identity_is_not_renewed() {
        let transport = ScriptedTransport::with_fallback(|request| {
            success_expiring(request, Duration::from_secs(120))
        });
        let a = creds("a@example.com");
        let provider = AuthorizationProvider::new(vec![a.clone()], transport.clone());
        provider.init().await;

        provider.invalidate(&IdentityToken::encode(&a), InvalidationReason::Removed);
        tokio::time::sleep(Duration::from_secs(300)).await;

        assert_eq!(transport.calls(), 1);
        assert!(matches!(authorization(&provider), Err(Error::PoolExhausted(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn readding_removed_identity_runs_one_refresh_loop() {
        let transport = ScriptedTransport::with_fallback(|request| {
            success_expiring(request, Duration::from_secs(120))
        });
        let a = creds("a@example.com");
        let provider = AuthorizationProvider::new(vec![a.clone()], transport.clone());
        provider.init().await;

        assert!(provider.remove("a@example.com"));
        provider.add(a);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.calls(), 2);

        // Only the re-added entry renews, once per minute
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(transport.calls(), 3);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.calls(), 4);
        assert_eq!(provider.len(), 1);
        assert!(authorization(&provider).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn removal_during_login_discards_ticket() {
        let slot: Arc<OnceLock<Weak<AuthorizationProvider>>> = Arc::default();
        let hook = slot.clone();
        let transport = ScriptedTransport::with_fallback(move |request| {
            // The operator removes the identity while its login is in flight
            if let Some(provider) = hook.get().and_then(Weak::upgrade) {
                provider.remove("a@example.com");
            }
            success_for(request)
        });
        let provider = Arc::new(AuthorizationProvider::new(
            vec![creds("a@example.com")],
            transport.clone(),
        ));
        slot.set(Arc::downgrade(&provider)).unwrap();

        provider.init().await;

        assert_eq!(transport.calls(), 1);
        assert!(provider.is_empty());
        assert!(provider.shared.state.read().cache.is_empty());
        assert!(matches!(authorization(&provider), Err(Error::PoolExhausted(_))));

        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn removal_during_throttle_wait_stops_refresh() {
        let transport = ScriptedTransport::always_succeeding();
        transport.push(throttled(Duration::from_secs(10)));
        let provider = AuthorizationProvider::new(vec![], transport.clone());
        provider.init().await;

        provider.add(creds("a@example.com"));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.calls(), 1);

        assert!(provider.remove("a@example.com"));
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(transport.calls(), 1);
        assert!(provider.shared.state.read().cache.is_empty());
        assert!(matches!(authorization(&provider), Err(Error::PoolExhausted(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_is_idempotent() {
        let a = creds("a@example.com");
        let provider = AuthorizationProvider::new(
            vec![a.clone(), creds("b@example.com")],
            ScriptedTransport::always_succeeding(),
        );
        let identity = IdentityToken::encode(&a);

        provider.invalidate(&identity, InvalidationReason::Removed);
        provider.invalidate(&identity, InvalidationReason::Removed);

        assert_eq!(provider.identifiers(), vec!["b@example.com"]);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_credentials_are_separate_entries() {
        let transport = ScriptedTransport::always_succeeding();
        let a = creds("a@example.com");
        let provider = AuthorizationProvider::new(vec![a.clone(), a], transport.clone());

        provider.init().await;

        assert_eq!(provider.len(), 2);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn freshly_added_identity_is_skipped_until_primed() {
        let transport = ScriptedTransport::always_succeeding();
        let a = creds("a@example.com");
        let b = creds("b@example.com");
        let provider = AuthorizationProvider::new(vec![a.clone()], transport.clone());
        provider.init().await;

        provider.add(b.clone());
        assert_eq!(provider.len(), 2);

        // b's first login has not run yet: every call lands on a
        let a_value = expected(&a);
        assert_eq!(authorization(&provider).unwrap(), a_value);
        assert_eq!(authorization(&provider).unwrap(), a_value);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.calls(), 2);

        let values = [authorization(&provider).unwrap(), authorization(&provider).unwrap()];
        let b_value = expected(&b);
        assert!(values.contains(&a_value));
        assert!(values.contains(&b_value));
    }

    #[tokio::test(start_paused = true)]
    async fn only_unprimed_identities_is_not_ready() {
        let transport = ScriptedTransport::always_succeeding();
        let provider = AuthorizationProvider::new(vec![], transport);
        provider.init().await;

        provider.add(creds("a@example.com"));
        assert!(matches!(authorization(&provider), Err(Error::NotReady(_))));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(authorization(&provider).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn add_before_init_is_primed_by_init() {
        let transport = ScriptedTransport::always_succeeding();
        let provider = AuthorizationProvider::new(vec![], transport.clone());

        provider.add(creds("a@example.com"));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.calls(), 0);

        provider.init().await;
        assert_eq!(transport.calls(), 1);
        assert!(authorization(&provider).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn init_twice_does_not_log_in_again() {
        let transport = ScriptedTransport::always_succeeding();
        let provider = AuthorizationProvider::new(vec![creds("a@example.com")], transport.clone());

        provider.init().await;
        provider.init().await;

        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_by_identifier() {
        let provider = AuthorizationProvider::new(
            vec![creds("a@example.com"), creds("b@example.com")],
            ScriptedTransport::always_succeeding(),
        );

        assert!(provider.remove("a@example.com"));
        assert!(!provider.remove("a@example.com"));
        assert_eq!(provider.identifiers(), vec!["b@example.com"]);
    }

    #[tokio::test(start_paused = true)]
    async fn health_reports_ready_and_pending() {
        let transport = ScriptedTransport::always_succeeding();
        let provider = AuthorizationProvider::new(vec![creds("a@example.com")], transport);
        assert_eq!(provider.health()["status"], "unhealthy");

        provider.init().await;
        let health = provider.health();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["identities_ready"], 1);
        assert_eq!(health["identities"][0]["identifier"], "a@example.com");
        assert!(health["identities"][0]["expires_in_secs"].as_u64().unwrap() > 3000);

        provider.add(creds("b@example.com"));
        let health = provider.health();
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["identities"][1]["status"], "pending");

        let rendered = health.to_string();
        assert!(!rendered.contains("pw-"), "health leaked a secret: {rendered}");
        assert!(!rendered.contains("TICKET"), "health leaked a ticket: {rendered}");
    }

    #[tokio::test(start_paused = true)]
    async fn custom_endpoint_and_policy() {
        let transport = ScriptedTransport::with_fallback(|_| reply(500, ""));
        let provider = AuthorizationProvider::builder(transport.clone())
            .credentials(vec![creds("a@example.com")])
            .login_endpoint(LoginEndpoint::new("http://127.0.0.1:1/v3/profiles/sessions"))
            .policy(RefreshPolicy {
                retry_limit: 2,
                ..RefreshPolicy::default()
            })
            .build();

        provider.init().await;

        assert_eq!(transport.calls(), 2);
        assert_eq!(
            transport.last_url().as_deref(),
            Some("http://127.0.0.1:1/v3/profiles/sessions")
        );
    }

    #[test]
    fn concurrent_authorize_is_strictly_round_robin() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let a = creds("a@example.com");
        let provider = Arc::new(AuthorizationProvider::new(
            vec![a.clone(), creds("b@example.com")],
            ScriptedTransport::always_succeeding(),
        ));
        runtime.block_on(provider.init());

        let a_value = expected(&a);
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let provider = provider.clone();
                let a_value = a_value.clone();
                std::thread::spawn(move || {
                    (0..250)
                        .filter(|_| authorization(&provider).unwrap() == a_value)
                        .count()
                })
            })
            .collect();
        let a_count: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();

        assert_eq!(a_count, 500);
    }
}
