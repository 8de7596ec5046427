//! Per-identity refresh state machine
//!
//! Every registered identity is driven by one background task:
//!
//! ```text
//! Attempting ─┬─ 200 + ticket ──> Success ── sleep until expiry − headstart ──> Attempting
//!             ├─ 401 ───────────> Invalidated (removed, task ends)
//!             ├─ 429 ───────────> RateLimited ── sleep until retry + buffer ──> Attempting (uncounted)
//!             └─ other ─────────> Retry ── sleep retry interval, attempt += 1 ──> Attempting
//! attempt == retry limit ───────> Invalidated (removed, task ends)
//! ```
//!
//! The first Success or Invalidated resolves the task's readiness signal, which
//! is what `init()` joins on. Login attempts for one identity never overlap.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use ubi_auth::IdentityToken;

use crate::outcome::{LoginOutcome, classify_login};
use crate::provider::{EntryId, InvalidationReason, Shared};

/// Timing and retry budget for the refresh state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Renew this long before the ticket expires
    pub headstart: Duration,
    /// Delay after a failed attempt
    pub retry_interval: Duration,
    /// Failed attempts before the identity is dropped
    pub retry_limit: u32,
    /// Added to the server's retry-after instant when throttled
    pub throttle_buffer: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            headstart: ubi_auth::HEADSTART,
            retry_interval: ubi_auth::RETRY_INTERVAL,
            retry_limit: ubi_auth::RETRY_LIMIT,
            throttle_buffer: ubi_auth::THROTTLE_BUFFER,
        }
    }
}

impl RefreshPolicy {
    /// When to start renewing a ticket that expires at `expires_at`.
    ///
    /// Never earlier than one retry interval from now, so a service handing
    /// out near-expired tickets cannot spin the task.
    pub fn renewal_instant(&self, expires_at: Instant) -> Instant {
        let earliest = Instant::now() + self.retry_interval;
        expires_at
            .checked_sub(self.headstart)
            .map_or(earliest, |at| at.max(earliest))
    }
}

/// First terminal outcome of an identity's task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A ticket is cached
    Ready,
    /// The identity was removed from the pool
    Dropped,
}

/// How one refresh cycle ended.
#[derive(Debug)]
enum Cycle {
    Cached { renew_at: Instant },
    Invalidated,
    Unregistered,
}

/// Drive one registry entry for as long as it stays registered.
pub(crate) async fn run_identity(
    shared: Arc<Shared>,
    id: EntryId,
    identity: IdentityToken,
    ready: oneshot::Sender<Readiness>,
) {
    let mut ready = Some(ready);
    loop {
        match refresh_cycle(&shared, id, &identity).await {
            Cycle::Cached { renew_at } => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Readiness::Ready);
                }
                tokio::time::sleep_until(renew_at).await;
            }
            Cycle::Invalidated | Cycle::Unregistered => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Readiness::Dropped);
                }
                return;
            }
        }
    }
}

/// Attempt logins until a ticket is cached or the identity is dropped.
async fn refresh_cycle(shared: &Shared, id: EntryId, identity: &IdentityToken) -> Cycle {
    let policy = shared.policy();
    let mut attempt = 0u32;

    loop {
        if attempt >= policy.retry_limit {
            shared.invalidate_entry(id, InvalidationReason::RetryLimit);
            return Cycle::Invalidated;
        }
        if !shared.is_registered(id) {
            debug!(identifier = %identity.identifier(), "identity no longer registered, stopping refresh");
            return Cycle::Unregistered;
        }

        let result = ubi_auth::login(shared.transport(), shared.endpoint(), identity).await;
        let outcome = classify_login(result);
        crate::metrics::record_login_attempt(outcome.label());

        match outcome {
            LoginOutcome::Success(session) => {
                let remaining = (session.expires_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                let expires_at = Instant::now() + remaining;
                if !shared.store(id, session.ticket, expires_at, session.expires_at) {
                    debug!(identifier = %identity.identifier(), "identity invalidated during login, discarding ticket");
                    return Cycle::Unregistered;
                }
                let renew_at = policy.renewal_instant(expires_at);
                info!(
                    identifier = %identity.identifier(),
                    expires_in_secs = remaining.as_secs(),
                    renew_in_secs = renew_at.saturating_duration_since(Instant::now()).as_secs(),
                    "session ticket cached"
                );
                return Cycle::Cached { renew_at };
            }
            LoginOutcome::Rejected => {
                shared.invalidate_entry(id, InvalidationReason::InvalidCredentials);
                return Cycle::Invalidated;
            }
            LoginOutcome::RateLimited {
                retry_at,
                message,
                error_code,
            } => {
                let wait = (retry_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
                    + policy.throttle_buffer;
                warn!(
                    identifier = %identity.identifier(),
                    reason = %message,
                    error_code,
                    retry_in_ms = wait.as_millis() as u64,
                    "session service is rate limiting logins"
                );
                tokio::time::sleep(wait).await;
            }
            LoginOutcome::Failed(reason) => {
                attempt += 1;
                warn!(
                    identifier = %identity.identifier(),
                    attempt,
                    retry_limit = policy.retry_limit,
                    reason = %reason,
                    "login attempt failed"
                );
                tokio::time::sleep(policy.retry_interval).await;
            }
        }
    }
}
