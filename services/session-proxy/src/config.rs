//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Credential secrets are read from an env var (`secret_env`) or a file
//! (`secret_file`), never stored in the TOML directly.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use ubi_auth::{CredentialSet, LoginEndpoint};
use ubi_pool::RefreshPolicy;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub admin: Option<AdminConfig>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub credentials: Vec<CredentialEntry>,
    /// Credential sets resolved from `credentials` during `load`
    #[serde(skip)]
    pub credential_sets: Vec<CredentialSet>,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Admin listener settings. The admin API is off unless this section exists.
#[derive(Debug, Deserialize)]
pub struct AdminConfig {
    pub listen_addr: SocketAddr,
}

/// Session service endpoint and refresh timing
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub login_url: String,
    pub headstart_ms: u64,
    pub retry_interval_ms: u64,
    pub retry_limit: u32,
    pub throttle_buffer_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        let policy = RefreshPolicy::default();
        Self {
            login_url: ubi_auth::LOGIN_URL.to_string(),
            headstart_ms: policy.headstart.as_millis() as u64,
            retry_interval_ms: policy.retry_interval.as_millis() as u64,
            retry_limit: policy.retry_limit,
            throttle_buffer_ms: policy.throttle_buffer.as_millis() as u64,
        }
    }
}

impl AuthConfig {
    pub fn policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            headstart: Duration::from_millis(self.headstart_ms),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            retry_limit: self.retry_limit,
            throttle_buffer: Duration::from_millis(self.throttle_buffer_ms),
        }
    }

    pub fn login_endpoint(&self) -> LoginEndpoint {
        LoginEndpoint::new(self.login_url.clone())
    }
}

/// One `[[credentials]]` entry
#[derive(Debug, Deserialize)]
pub struct CredentialEntry {
    pub identifier: String,
    /// Name of the env var holding the secret
    #[serde(default)]
    pub secret_env: Option<String>,
    /// Path to a file holding the secret
    #[serde(default)]
    pub secret_file: Option<PathBuf>,
}

impl CredentialEntry {
    fn resolve(&self) -> common::Result<CredentialSet> {
        let secret = match (&self.secret_env, &self.secret_file) {
            (Some(var), None) => std::env::var(var).map_err(|_| {
                common::Error::Config(format!(
                    "secret_env {var} for {} is not set",
                    self.identifier
                ))
            })?,
            (None, Some(path)) => std::fs::read_to_string(path)
                .map_err(|e| {
                    common::Error::Config(format!(
                        "failed to read secret_file {}: {e}",
                        path.display()
                    ))
                })?
                .trim()
                .to_owned(),
            (Some(_), Some(_)) => {
                return Err(common::Error::Config(format!(
                    "credentials for {} set both secret_env and secret_file",
                    self.identifier
                )));
            }
            (None, None) => {
                return Err(common::Error::Config(format!(
                    "credentials for {} need secret_env or secret_file",
                    self.identifier
                )));
            }
        };

        if secret.is_empty() {
            return Err(common::Error::Config(format!(
                "secret for {} is empty",
                self.identifier
            )));
        }

        CredentialSet::new(self.identifier.clone(), Secret::new(secret))
            .map_err(|e| common::Error::Config(e.to_string()))
    }
}

fn default_upstream_url() -> String {
    ubi_auth::API_BASE_URL.to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

fn validate_http_url(field: &str, url: &str) -> common::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {url}"
        )))
    }
}

impl Config {
    /// Load configuration from a TOML file and resolve credential secrets.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        validate_http_url("upstream_url", &config.proxy.upstream_url)?;
        validate_http_url("login_url", &config.auth.login_url)?;

        if config.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.auth.retry_limit == 0 {
            return Err(common::Error::Config(
                "retry_limit must be greater than 0".into(),
            ));
        }

        config.credential_sets = config
            .credentials
            .iter()
            .map(CredentialEntry::resolve)
            .collect::<common::Result<_>>()?;

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("ubi-session-proxy.toml")
    }
}
