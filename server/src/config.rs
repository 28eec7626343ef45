//! Server configuration module.
//!
//! Parses configuration from environment variables for the Darecast server.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PORT` | 8080 | HTTP server port |
//! | `DARECAST_REALTIME_ENABLED` | true | Accept WebSocket upgrades and SSE streams |
//! | `DARECAST_HARDENING` | false | Enforce origin allow-list and per-IP caps |
//! | `DARECAST_ALLOWED_ORIGINS` | - | Comma-separated origin allow-list |
//! | `DARECAST_ALLOW_SAME_ORIGIN` | false | Also accept an `Origin` matching the `Host` header |
//! | `DARECAST_WS_PING_INTERVAL_SECS` | 25 | Transport ping period |
//! | `DARECAST_WS_IDLE_TIMEOUT_SECS` | 60 | Close connections silent for this long; must exceed the ping period |
//! | `DARECAST_WS_MAX_CONNECTIONS_PER_IP` | 20 | Concurrent connections per address |
//! | `DARECAST_WS_MESSAGE_RATE` | 120 | Inbound frames per minute per address |
//! | `DARECAST_WS_MESSAGE_BURST` | 30 | Inbound burst capacity |
//! | `DARECAST_BROKER_URL` | - | Redis URL; unset means single-instance mode |
//! | `DARECAST_SESSION_TTL_SECS` | 2592000 | Session lifetime |
//! | `DARECAST_SESSION_ROTATE_AFTER_SECS` | 86400 | Session age that triggers rotation |
//! | `DARECAST_SSE_HEARTBEAT_SECS` | 15 | SSE heartbeat period |
//! | `DARECAST_PUBLISHER_TOKEN` | - | Bearer token for `/internal` routes |
//! | `DARECAST_TRUST_PROXY` | false | Take the client IP from `X-Forwarded-For` |
//! | `DARECAST_WS_MAX_PENDING_SENDS` | 256 | Queued frames before a client counts as slow |
//! | `DARECAST_WS_MAX_BUFFERED_BYTES` | 1048576 | Queued bytes before a client counts as slow |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::session::{DEFAULT_ROTATE_AFTER_SECS, DEFAULT_SESSION_TTL_SECS};

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

const DEFAULT_PING_INTERVAL_SECS: u64 = 25;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_CONNECTIONS_PER_IP: usize = 20;
const DEFAULT_MESSAGE_RATE: u32 = 120;
const DEFAULT_MESSAGE_BURST: u32 = 30;
const DEFAULT_SSE_HEARTBEAT_SECS: u64 = 15;
const DEFAULT_MAX_PENDING_SENDS: usize = 256;
const DEFAULT_MAX_BUFFERED_BYTES: usize = 1024 * 1024;

/// Rooms a single connection may join.
pub const DEFAULT_MAX_SUBSCRIPTIONS: usize = 64;

/// Largest inbound WebSocket message accepted.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 16 * 1024;

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// Realtime feature flag. When false, upgrades are refused with 503.
    pub realtime_enabled: bool,

    /// Enforce the origin allow-list and the per-IP connection cap.
    pub hardening: bool,

    /// Origins accepted when hardening is enabled.
    pub allowed_origins: Vec<String>,

    pub ws_ping_interval: Duration,
    pub ws_idle_timeout: Duration,
    pub ws_max_connections_per_ip: usize,

    /// Inbound frames per minute per client address.
    pub ws_message_rate: u32,
    pub ws_message_burst: u32,

    pub ws_max_pending_sends: usize,
    pub ws_max_buffered_bytes: usize,
    pub ws_max_subscriptions: usize,
    pub ws_max_message_bytes: usize,

    /// Redis URL for cross-instance fanout and shared rate limits.
    pub broker_url: Option<String>,

    pub session_ttl: Duration,
    pub session_rotate_after: Duration,

    pub sse_heartbeat: Duration,

    /// Bearer token guarding the internal routes. Unset disables them.
    pub publisher_token: Option<String>,

    /// Trust the first `X-Forwarded-For` hop as the client address.
    pub trust_proxy: bool,

    /// Accept an `Origin` whose authority matches the `Host` header even if
    /// it is not allow-listed.
    pub allow_same_origin: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            realtime_enabled: true,
            hardening: false,
            allowed_origins: Vec::new(),
            ws_ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            ws_idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            ws_max_connections_per_ip: DEFAULT_MAX_CONNECTIONS_PER_IP,
            ws_message_rate: DEFAULT_MESSAGE_RATE,
            ws_message_burst: DEFAULT_MESSAGE_BURST,
            ws_max_pending_sends: DEFAULT_MAX_PENDING_SENDS,
            ws_max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            ws_max_subscriptions: DEFAULT_MAX_SUBSCRIPTIONS,
            ws_max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            broker_url: None,
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            session_rotate_after: Duration::from_secs(DEFAULT_ROTATE_AFTER_SECS),
            sse_heartbeat: Duration::from_secs(DEFAULT_SSE_HEARTBEAT_SECS),
            publisher_token: None,
            trust_proxy: false,
            allow_same_origin: false,
        }
    }
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - A variable has an invalid format
    /// - Port number is not a valid u16
    /// - A limit or interval is zero
    ///
    /// # Example
    ///
    /// ```no_run
    /// use darecast_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            port: parse_port()?,
            realtime_enabled: parse_bool_env("DARECAST_REALTIME_ENABLED", true),
            hardening: parse_bool_env("DARECAST_HARDENING", false),
            allowed_origins: parse_list_env("DARECAST_ALLOWED_ORIGINS"),
            ws_ping_interval: parse_secs_env(
                "DARECAST_WS_PING_INTERVAL_SECS",
                DEFAULT_PING_INTERVAL_SECS,
            )?,
            ws_idle_timeout: parse_secs_env(
                "DARECAST_WS_IDLE_TIMEOUT_SECS",
                DEFAULT_IDLE_TIMEOUT_SECS,
            )?,
            ws_max_connections_per_ip: parse_env(
                "DARECAST_WS_MAX_CONNECTIONS_PER_IP",
                DEFAULT_MAX_CONNECTIONS_PER_IP,
            )?,
            ws_message_rate: parse_env("DARECAST_WS_MESSAGE_RATE", DEFAULT_MESSAGE_RATE)?,
            ws_message_burst: parse_env("DARECAST_WS_MESSAGE_BURST", DEFAULT_MESSAGE_BURST)?,
            ws_max_pending_sends: parse_env(
                "DARECAST_WS_MAX_PENDING_SENDS",
                DEFAULT_MAX_PENDING_SENDS,
            )?,
            ws_max_buffered_bytes: parse_env(
                "DARECAST_WS_MAX_BUFFERED_BYTES",
                DEFAULT_MAX_BUFFERED_BYTES,
            )?,
            ws_max_subscriptions: DEFAULT_MAX_SUBSCRIPTIONS,
            ws_max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            broker_url: parse_optional_env("DARECAST_BROKER_URL"),
            session_ttl: parse_secs_env("DARECAST_SESSION_TTL_SECS", DEFAULT_SESSION_TTL_SECS)?,
            session_rotate_after: parse_secs_env(
                "DARECAST_SESSION_ROTATE_AFTER_SECS",
                DEFAULT_ROTATE_AFTER_SECS,
            )?,
            sse_heartbeat: parse_secs_env("DARECAST_SSE_HEARTBEAT_SECS", DEFAULT_SSE_HEARTBEAT_SECS)?,
            publisher_token: parse_optional_env("DARECAST_PUBLISHER_TOKEN"),
            trust_proxy: parse_bool_env("DARECAST_TRUST_PROXY", false),
            allow_same_origin: parse_bool_env("DARECAST_ALLOW_SAME_ORIGIN", false),
        };

        config.validate()?;
        config.warn_risky_settings();

        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Every interval, rate, and capacity must be non-zero, and the idle
    /// timeout must be longer than the ping interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&str, bool); 11] = [
            ("DARECAST_WS_PING_INTERVAL_SECS", self.ws_ping_interval.is_zero()),
            ("DARECAST_WS_IDLE_TIMEOUT_SECS", self.ws_idle_timeout.is_zero()),
            ("DARECAST_WS_MAX_CONNECTIONS_PER_IP", self.ws_max_connections_per_ip == 0),
            ("DARECAST_WS_MESSAGE_RATE", self.ws_message_rate == 0),
            ("DARECAST_WS_MESSAGE_BURST", self.ws_message_burst == 0),
            ("DARECAST_WS_MAX_PENDING_SENDS", self.ws_max_pending_sends == 0),
            ("DARECAST_WS_MAX_BUFFERED_BYTES", self.ws_max_buffered_bytes == 0),
            ("DARECAST_SESSION_TTL_SECS", self.session_ttl.is_zero()),
            ("DARECAST_SESSION_ROTATE_AFTER_SECS", self.session_rotate_after.is_zero()),
            ("DARECAST_SSE_HEARTBEAT_SECS", self.sse_heartbeat.is_zero()),
            ("max subscriptions per connection", self.ws_max_subscriptions == 0),
        ];

        if let Some((name, _)) = checks.iter().find(|(_, is_zero)| *is_zero) {
            return Err(ConfigError::ValidationError(format!(
                "{name} must be greater than zero"
            )));
        }

        // Idle time is checked on ping ticks, so a timeout that does not
        // exceed the interval evicts every client on the first tick.
        if self.ws_idle_timeout <= self.ws_ping_interval {
            return Err(ConfigError::ValidationError(format!(
                "DARECAST_WS_IDLE_TIMEOUT_SECS ({}s) must be greater than \
                 DARECAST_WS_PING_INTERVAL_SECS ({}s)",
                self.ws_idle_timeout.as_secs(),
                self.ws_ping_interval.as_secs()
            )));
        }

        Ok(())
    }

    fn warn_risky_settings(&self) {
        if self.hardening && self.allowed_origins.is_empty() {
            warn!(
                "DARECAST_HARDENING is enabled with an empty DARECAST_ALLOWED_ORIGINS - \
                 only non-browser clients can connect unless DARECAST_ALLOW_SAME_ORIGIN is set"
            );
        }

        if self.hardening && self.allow_same_origin {
            warn!(
                "DARECAST_ALLOW_SAME_ORIGIN trusts the Host header - \
                 only enable it behind a proxy that pins Host"
            );
        }

        if self.session_rotate_after >= self.session_ttl {
            warn!(
                "DARECAST_SESSION_ROTATE_AFTER_SECS is not below DARECAST_SESSION_TTL_SECS - \
                 sessions will expire before they rotate"
            );
        }

        if self.publisher_token.is_none() {
            warn!("DARECAST_PUBLISHER_TOKEN is not set - internal publish routes are disabled");
        }

        if self.broker_url.is_none() {
            warn!("DARECAST_BROKER_URL is not set - events stay on this instance");
        }
    }
}

/// Parse a boolean environment variable.
///
/// `true`/`1` and `false`/`0` are recognized case-insensitively; any other
/// value counts as `false`. Returns `default` if the variable is unset.
fn parse_bool_env(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => {
            let value = value.trim();
            value.eq_ignore_ascii_case("true") || value == "1"
        }
        Err(_) => default,
    }
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.trim().parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse a numeric environment variable, falling back to `default`.
fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(default),
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|err: T::Err| ConfigError::InvalidFormat {
                var: name.to_string(),
                message: format!("'{}': {err}", value.trim()),
            }),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

fn parse_secs_env(name: &str, default_secs: u64) -> Result<Duration, ConfigError> {
    parse_env(name, default_secs).map(Duration::from_secs)
}

fn parse_optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parse a comma-separated list, dropping empty entries.
fn parse_list_env(name: &str) -> Vec<String> {
    env::var(name)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
