//! Credential sets for session logins
//!
//! A `CredentialSet` is one account's identifier (email) and password. It is
//! validated on construction so it can always be encoded as a Basic
//! credential and decoded back.

use common::Secret;
use serde::Deserialize;

use crate::error::{Error, Result};

/// One account's login credentials.
///
/// The secret is held in `Secret` so it never shows up in Debug output or logs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawCredentialSet")]
pub struct CredentialSet {
    identifier: String,
    secret: Secret<String>,
}

impl CredentialSet {
    /// Build a credential set.
    ///
    /// The identifier must be non-empty and must not contain `:`, which is the
    /// separator inside a Basic credential. The secret may contain anything.
    pub fn new(identifier: impl Into<String>, secret: impl Into<Secret<String>>) -> Result<Self> {
        let identifier = identifier.into();
        if identifier.is_empty() {
            return Err(Error::InvalidCredentials("identifier is empty".into()));
        }
        if identifier.contains(':') {
            return Err(Error::InvalidCredentials(format!(
                "identifier {identifier} contains ':'"
            )));
        }
        Ok(Self {
            identifier,
            secret: secret.into(),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn secret(&self) -> &Secret<String> {
        &self.secret
    }
}

#[derive(Deserialize)]
struct RawCredentialSet {
    identifier: String,
    secret: Secret<String>,
}

impl TryFrom<RawCredentialSet> for CredentialSet {
    type Error = Error;

    fn try_from(raw: RawCredentialSet) -> Result<Self> {
        CredentialSet::new(raw.identifier, raw.secret)
    }
}
