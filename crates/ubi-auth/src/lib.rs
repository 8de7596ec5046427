//! Ubisoft session authentication library
//!
//! Provides credential sets, the identity-token codec, login request
//! construction and login/rate-limit response parsing for the session pool.
//! This crate performs no scheduling of its own; `ubi-pool` drives logins.
//!
//! Credential flow:
//! 1. Caller builds a `CredentialSet` (identifier + secret)
//! 2. `IdentityToken::encode()` turns it into a Basic credential
//! 3. `login::login()` posts it to the session endpoint
//! 4. `LoginResponse::into_session()` yields the ticket and its expiry
//! 5. `login::session_authorization()` formats the ticket for API requests

pub mod codec;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod login;

pub use codec::IdentityToken;
pub use constants::*;
pub use credentials::CredentialSet;
pub use error::{Error, Result};
pub use login::{
    LoginEndpoint, LoginResponse, RateLimitResponse, Session, apply_session_headers, login,
    login_request, parse_timestamp, session_authorization,
};
