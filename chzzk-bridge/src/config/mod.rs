//! Bridge configuration.
//!
//! Everything is read from environment variables (optionally seeded from a
//! `.env` file by `main`), falling back to defaults that match the stock
//! deployment: a public OAuth callback listener and a loopback-only API
//! listener.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Port of the public OAuth callback listener.
pub const DEFAULT_OAUTH_PORT: u16 = 39680;

/// Port of the internal API listener.
pub const DEFAULT_API_PORT: u16 = 39681;

/// Default SQLite database location.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:chzzk_bridge.db?mode=rwc";

/// Platform permission scopes requested during account interlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiScope {
    Chat,
    Donation,
    UserQuery,
}

impl ApiScope {
    /// Human-readable permission name shown after a successful interlock.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Chat => "Read chat messages",
            Self::Donation => "Read donations",
            Self::UserQuery => "Read user profile",
        }
    }

    /// What the permission is used for.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Chat => "Chat messages",
            Self::Donation => "Donation messages",
            Self::UserQuery => "Channel ID",
        }
    }

    /// Whether the scope maps to a live-session subscription.
    pub fn is_session_subscription(&self) -> bool {
        matches!(self, Self::Chat | Self::Donation)
    }
}

impl fmt::Display for ApiScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Chat => "chat",
            Self::Donation => "donation",
            Self::UserQuery => "user_query",
        };
        f.write_str(name)
    }
}

impl FromStr for ApiScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" => Ok(Self::Chat),
            "donation" => Ok(Self::Donation),
            "user_query" | "user-query" => Ok(Self::UserQuery),
            other => Err(Error::config(format!("Unknown scope: {other}"))),
        }
    }
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// OAuth client id registered with the platform
    pub client_id: String,
    /// OAuth client secret (only needed by a production gateway)
    pub client_secret: Option<String>,
    /// Scopes requested during interlock
    pub scopes: Vec<ApiScope>,
    /// Public hostname, used both as bind address and in the redirect URI
    pub hostname: String,
    /// Public OAuth callback port
    pub oauth_port: u16,
    /// Internal API bind address
    pub api_bind_address: String,
    /// Internal API port
    pub api_port: u16,
    /// SQLite database URL
    pub database_url: String,
    /// Directory for rolling log files
    pub log_dir: String,
    /// Delivery stream poll interval
    pub poll_interval: Duration,
    /// Safety margin subtracted from reported token expiry
    pub token_skew: Duration,
    /// Lifetime of an issued authorization state
    pub state_ttl: Duration,
    /// Upper bound on waiting for a session during teardown
    pub teardown_timeout: Duration,
    /// Upper bound on waiting for a freshly established session to open
    pub session_open_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            scopes: vec![ApiScope::UserQuery, ApiScope::Donation],
            hostname: "0.0.0.0".to_string(),
            oauth_port: DEFAULT_OAUTH_PORT,
            api_bind_address: "127.0.0.1".to_string(),
            api_port: DEFAULT_API_PORT,
            database_url: DEFAULT_DATABASE_URL.to_string(),
            log_dir: "logs".to_string(),
            poll_interval: Duration::from_secs(1),
            token_skew: Duration::from_secs(60),
            state_ttl: Duration::from_secs(30),
            teardown_timeout: Duration::from_secs(10),
            session_open_timeout: Duration::from_secs(30),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `CHZZK_CLIENT_ID`, `CHZZK_CLIENT_SECRET`
    /// - `BRIDGE_SCOPES` (e.g. "chat,donation")
    /// - `BRIDGE_HOSTNAME`, `BRIDGE_OAUTH_PORT`
    /// - `BRIDGE_API_BIND`, `BRIDGE_API_PORT`
    /// - `DATABASE_URL`, `BRIDGE_LOG_DIR`
    /// - `BRIDGE_POLL_INTERVAL_MS`, `BRIDGE_TOKEN_SKEW_SECS`, `BRIDGE_STATE_TTL_SECS`
    /// - `BRIDGE_TEARDOWN_TIMEOUT_SECS`, `BRIDGE_SESSION_OPEN_TIMEOUT_SECS`
    pub fn from_env_or_default() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(client_id) = get("CHZZK_CLIENT_ID") {
            config.client_id = client_id;
        }
        config.client_secret = get("CHZZK_CLIENT_SECRET");

        if let Some(scopes) = get("BRIDGE_SCOPES") {
            config.scopes = scopes
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(ApiScope::from_str)
                .collect::<Result<Vec<_>>>()?;
        }

        if let Some(hostname) = get("BRIDGE_HOSTNAME") {
            config.hostname = hostname;
        }
        if let Some(port) = get("BRIDGE_OAUTH_PORT") {
            config.oauth_port = parse_number("BRIDGE_OAUTH_PORT", &port)?;
        }
        if let Some(bind) = get("BRIDGE_API_BIND") {
            config.api_bind_address = bind;
        }
        if let Some(port) = get("BRIDGE_API_PORT") {
            config.api_port = parse_number("BRIDGE_API_PORT", &port)?;
        }
        if let Some(url) = get("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(dir) = get("BRIDGE_LOG_DIR") {
            config.log_dir = dir;
        }

        if let Some(ms) = get("BRIDGE_POLL_INTERVAL_MS") {
            let ms: u64 = parse_number("BRIDGE_POLL_INTERVAL_MS", &ms)?;
            if ms == 0 {
                return Err(Error::config("BRIDGE_POLL_INTERVAL_MS must be positive"));
            }
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = get("BRIDGE_TOKEN_SKEW_SECS") {
            config.token_skew = Duration::from_secs(parse_number("BRIDGE_TOKEN_SKEW_SECS", &secs)?);
        }
        if let Some(secs) = get("BRIDGE_STATE_TTL_SECS") {
            config.state_ttl = Duration::from_secs(parse_number("BRIDGE_STATE_TTL_SECS", &secs)?);
        }
        if let Some(secs) = get("BRIDGE_TEARDOWN_TIMEOUT_SECS") {
            config.teardown_timeout =
                Duration::from_secs(parse_number("BRIDGE_TEARDOWN_TIMEOUT_SECS", &secs)?);
        }
        if let Some(secs) = get("BRIDGE_SESSION_OPEN_TIMEOUT_SECS") {
            config.session_open_timeout =
                Duration::from_secs(parse_number("BRIDGE_SESSION_OPEN_TIMEOUT_SECS", &secs)?);
        }

        Ok(config)
    }

    /// Address of the public OAuth callback listener.
    pub fn oauth_bind_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.oauth_port)
    }

    /// Address of the internal API listener.
    pub fn api_bind_addr(&self) -> String {
        format!("{}:{}", self.api_bind_address, self.api_port)
    }

    /// Scopes that translate into live-session subscriptions.
    pub fn session_scopes(&self) -> impl Iterator<Item = ApiScope> + '_ {
        self.scopes.iter().copied().filter(ApiScope::is_session_subscription)
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| Error::config(format!("{key} has an invalid value: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.oauth_port, DEFAULT_OAUTH_PORT);
        assert_eq!(config.api_port, DEFAULT_API_PORT);
        assert_eq!(config.api_bind_address, "127.0.0.1");
        assert_eq!(config.scopes, vec![ApiScope::UserQuery, ApiScope::Donation]);
        assert_eq!(config.state_ttl, Duration::from_secs(30));
        assert_eq!(config.token_skew, Duration::from_secs(60));
        assert!(config.client_secret.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("CHZZK_CLIENT_ID", "client"),
            ("BRIDGE_SCOPES", "chat, donation"),
            ("BRIDGE_API_PORT", "8080"),
            ("BRIDGE_POLL_INTERVAL_MS", "250"),
            ("BRIDGE_HOSTNAME", "bridge.example.com"),
        ]))
        .unwrap();

        assert_eq!(config.client_id, "client");
        assert_eq!(config.scopes, vec![ApiScope::Chat, ApiScope::Donation]);
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.oauth_bind_addr(), "bridge.example.com:39680");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = BridgeConfig::from_lookup(lookup(&[("BRIDGE_API_PORT", "http")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = BridgeConfig::from_lookup(lookup(&[("BRIDGE_SCOPES", "chat,video")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err =
            BridgeConfig::from_lookup(lookup(&[("BRIDGE_POLL_INTERVAL_MS", "0")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_session_scopes_skip_user_query() {
        let config = BridgeConfig::default();
        let scopes: Vec<_> = config.session_scopes().collect();
        assert_eq!(scopes, vec![ApiScope::Donation]);
    }
}
