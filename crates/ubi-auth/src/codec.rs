//! Identity token codec
//!
//! An identity token is the Basic credential for a `CredentialSet`:
//! `Basic base64(identifier ":" secret)`. It is deterministic and reversible,
//! so it serves both as the pool's registry key and as the `Authorization`
//! header presented to the login endpoint. `decode` splits at the first `:`;
//! `CredentialSet` forbids `:` in identifiers, so every valid set round-trips.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use zeroize::Zeroize;

use crate::credentials::CredentialSet;
use crate::error::{Error, Result};

const BASIC_PREFIX: &str = "Basic ";

/// Opaque, reversible encoding of one credential set.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct IdentityToken(String);

impl IdentityToken {
    /// Encode a credential set as a Basic credential.
    pub fn encode(credentials: &CredentialSet) -> Self {
        let mut payload = format!(
            "{}:{}",
            credentials.identifier(),
            credentials.secret().expose()
        );
        let token = format!("{BASIC_PREFIX}{}", STANDARD.encode(payload.as_bytes()));
        payload.zeroize();
        Self(token)
    }

    /// Wrap an already-encoded Basic credential.
    pub fn from_encoded(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Recover the credential set this token was encoded from.
    pub fn decode(&self) -> Result<CredentialSet> {
        let encoded = self
            .0
            .strip_prefix(BASIC_PREFIX)
            .ok_or_else(|| Error::Codec("missing Basic prefix".into()))?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| Error::Codec(format!("invalid base64: {e}")))?;
        let mut payload =
            String::from_utf8(bytes).map_err(|e| Error::Codec(format!("invalid UTF-8: {e}")))?;
        let decoded = match payload.split_once(':') {
            Some((identifier, secret)) => CredentialSet::new(identifier, secret),
            None => Err(Error::Codec("missing ':' separator".into())),
        };
        payload.zeroize();
        decoded
    }

    /// Identifier for log lines; never the secret.
    pub fn identifier(&self) -> String {
        match self.decode() {
            Ok(credentials) => credentials.identifier().to_string(),
            Err(_) => "<undecodable>".to_string(),
        }
    }

    /// The full `Basic ...` header value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("IdentityToken")
            .field(&self.identifier())
            .finish()
    }
}

impl Drop for IdentityToken {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}
