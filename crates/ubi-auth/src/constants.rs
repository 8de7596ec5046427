//! Ubisoft session service constants
//!
//! The application id identifies the public client application; it is not a
//! secret. Timing constants drive the refresh state machine in `ubi-pool`.

use std::time::Duration;

/// Application id sent as `Ubi-AppId` on every request
pub const APP_ID: &str = "39baebad-39e5-4552-8c25-2c9b919064e2";

/// Session (login) endpoint
pub const LOGIN_URL: &str = "https://public-ubiservices.ubi.com/v3/profiles/sessions";

/// Base URL of the public services API
pub const API_BASE_URL: &str = "https://public-ubiservices.ubi.com";

/// Header carrying the application id
pub const APP_ID_HEADER: &str = "ubi-appid";

/// Authorization scheme for session tickets: `Ubi_v1 t=<ticket>`
pub const SESSION_SCHEME: &str = "Ubi_v1";

/// Renew a session this long before it expires
pub const HEADSTART: Duration = Duration::from_millis(60_000);

/// Fixed delay between failed login attempts
pub const RETRY_INTERVAL: Duration = Duration::from_millis(1_000);

/// Failed login attempts before an identity is dropped
pub const RETRY_LIMIT: u32 = 5;

/// Added on top of the server's retry-after instant when throttled
pub const THROTTLE_BUFFER: Duration = Duration::from_millis(1_000);
