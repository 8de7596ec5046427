//! Error types for session authentication operations

/// Errors from credential handling and login operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("identity token decode failed: {0}")]
    Codec(String),

    #[error("timestamp parse error: {0}")]
    Date(String),

    #[error("malformed login response: {0}")]
    MalformedResponse(String),

    #[error("invalid header value: {0}")]
    InvalidHeader(String),

    #[error(transparent)]
    Transport(#[from] transport::TransportError),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
