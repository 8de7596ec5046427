//! Pool metrics
//!
//! - `ubi_login_attempts_total` (counter): label `outcome`
//! - `ubi_identities_invalidated_total` (counter): label `reason`
//! - `ubi_pool_identities` (gauge): registered identities

/// Record one login attempt and how it was classified.
pub fn record_login_attempt(outcome: &'static str) {
    metrics::counter!("ubi_login_attempts_total", "outcome" => outcome).increment(1);
}

/// Record an identity being dropped from the pool.
pub fn record_invalidation(reason: &'static str) {
    metrics::counter!("ubi_identities_invalidated_total", "reason" => reason).increment(1);
}

/// Publish the current registry size.
pub fn set_pool_size(identities: usize) {
    metrics::gauge!("ubi_pool_identities").set(identities as f64);
}
