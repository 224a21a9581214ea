//! Configuration for the proxy.
//!
//! Configuration is read from environment variables:
//! - `AS_COOKIE` - Required unless `AS_COOKIE_FILE` is set. Comma-separated session credentials.
//! - `AS_COOKIE_FILE` - Optional. File of credentials (one per line or comma separated), re-read periodically.
//! - `API_SECRET` - Optional. Comma-separated bearer keys accepted on `/v1/*`. Unset means open access.
//! - `HOST` - Optional. Server host. Defaults to `0.0.0.0`.
//! - `PORT` - Optional. Server port. Defaults to `7055`.
//! - `UPSTREAM_URL` - Optional. Vendor streaming endpoint.
//! - `PROXY_URL` - Optional. Outbound proxy for upstream calls.
//! - `USER_AGENT` - Optional. Outbound user agent.
//! - `RATE_LIMIT_COOKIE_LOCK_DURATION` - Optional. Seconds a rate-limited credential is skipped. Defaults to `600`.
//! - `COOKIE_REFRESH_INTERVAL` - Optional. Seconds between pool maintenance passes. Defaults to `60`.
//! - `DEBUG` - Optional. `true` enables debug logging by default.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::credentials::{parse_credentials, Credential};
use crate::refresh::CredentialSource;

pub const DEFAULT_UPSTREAM_URL: &str = "https://api.alexcodes.app/call_assistant";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Session credentials loaded at startup
    pub credentials: Vec<Credential>,

    /// Where the refresh task re-reads credentials from
    pub credential_source: CredentialSource,

    /// Accepted bearer keys; empty disables the check
    pub api_keys: Vec<String>,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    pub upstream_url: String,

    pub proxy_url: Option<String>,

    pub user_agent: String,

    /// How long a rate-limited credential stays excluded
    pub rate_limit_lock: Duration,

    /// Interval between background pool maintenance passes
    pub refresh_interval: Duration,

    pub debug: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if no credentials are configured.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |name: &str| var(name).filter(|v| !v.trim().is_empty());

        let cookie_file = non_empty("AS_COOKIE_FILE").map(PathBuf::from);
        let pinned = non_empty("AS_COOKIE")
            .map(|raw| parse_credentials(&raw))
            .unwrap_or_default();
        let mut credentials = pinned.clone();
        if let Some(path) = &cookie_file {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                ConfigError::InvalidValue("AS_COOKIE_FILE".to_string(), format!("{}", e))
            })?;
            for credential in parse_credentials(&raw) {
                if !credentials.contains(&credential) {
                    credentials.push(credential);
                }
            }
        }
        if credentials.is_empty() {
            return Err(ConfigError::MissingEnvVar("AS_COOKIE".to_string()));
        }

        let api_keys = non_empty("API_SECRET")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let host = non_empty("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = parse_var(&non_empty, "PORT", 7055u16)?;
        let lock_secs = parse_var(&non_empty, "RATE_LIMIT_COOKIE_LOCK_DURATION", 600u64)?;
        let refresh_secs = parse_var(&non_empty, "COOKIE_REFRESH_INTERVAL", 60u64)?;
        if refresh_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "COOKIE_REFRESH_INTERVAL".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let debug = non_empty("DEBUG")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            credentials,
            credential_source: match cookie_file {
                Some(path) => CredentialSource::File { path, pinned },
                None => CredentialSource::Static,
            },
            api_keys,
            host,
            port,
            upstream_url: non_empty("UPSTREAM_URL")
                .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string()),
            proxy_url: non_empty("PROXY_URL"),
            user_agent: non_empty("USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            rate_limit_lock: Duration::from_secs(lock_secs),
            refresh_interval: Duration::from_secs(refresh_secs),
            debug,
        })
    }

    /// Create a config with default values (useful for testing).
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self {
            credentials,
            credential_source: CredentialSource::Static,
            api_keys: Vec::new(),
            host: "127.0.0.1".to_string(),
            port: 7055,
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            proxy_url: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            rate_limit_lock: Duration::from_secs(600),
            refresh_interval: Duration::from_secs(60),
            debug: false,
        }
    }
}

fn parse_var<T>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        None => Ok(default),
    }
}
