//! Session ticket pool for Ubisoft services
//!
//! Keeps one session ticket per registered credential set alive in the
//! background and hands them out round-robin to outgoing requests:
//!
//! ```ignore
//! let provider = AuthorizationProvider::new(credentials, transport);
//! provider.init().await;
//! let request = provider.authorize(request)?;
//! ```
//!
//! Credentials the session service rejects (401), or that keep failing past
//! the retry budget, are dropped from rotation for good.

pub mod error;
pub mod metrics;
pub mod outcome;
pub mod provider;
pub mod refresh;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
pub use outcome::{LoginOutcome, classify_login, classify_response};
pub use provider::{AuthorizationProvider, InvalidationReason, ProviderBuilder};
pub use refresh::{Readiness, RefreshPolicy};
