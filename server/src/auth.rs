//! Connection origin checks and publisher token verification.
//!
//! # Origin policy
//!
//! When hardening is enabled, a WebSocket upgrade is only accepted if its
//! `Origin` header matches the configured allow-list. An allow-list entry
//! matches when it:
//! - equals the origin exactly (`https://darecast.app`), ignoring case and a
//!   trailing slash
//! - names only the origin's authority (`darecast.app`, `localhost:5173`)
//!
//! A request whose origin authority equals its `Host` header is same-origin
//! and always passes. A request without an `Origin` header (non-browser
//! clients) passes. With hardening disabled every origin passes.
//!
//! # Publisher token
//!
//! Internal routes require `Authorization: Bearer <token>`; the token is
//! compared in constant time.
//!
//! # Example
//!
//! ```rust
//! use darecast_server::auth::OriginPolicy;
//!
//! let policy = OriginPolicy::new(true, vec!["http://localhost".to_string()]);
//!
//! assert!(policy.validate_origin(Some("http://localhost"), None));
//! assert!(!policy.validate_origin(Some("https://evil.example"), None));
//! assert!(policy.validate_origin(None, None));
//! ```

use subtle::ConstantTimeEq;
use thiserror::Error;

/// Errors raised by request authentication.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The `Origin` header is not allowed.
    #[error("origin not allowed: {0}")]
    OriginRejected(String),

    /// No bearer token was supplied.
    #[error("missing bearer token")]
    MissingToken,

    /// The bearer token did not match.
    #[error("invalid bearer token")]
    InvalidToken,
}

impl AuthError {
    /// Creates an [`AuthError::OriginRejected`] error.
    pub fn origin_rejected(origin: impl Into<String>) -> Self {
        Self::OriginRejected(origin.into())
    }
}

/// Origin allow-list enforcement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginPolicy {
    hardening: bool,
    allowed: Vec<String>,
    same_origin: bool,
}

impl OriginPolicy {
    /// Creates a policy. Allow-list entries are normalized on construction.
    pub fn new(hardening: bool, allowed: Vec<String>) -> Self {
        Self {
            hardening,
            allowed: allowed
                .iter()
                .map(|entry| normalize(entry))
                .filter(|entry| !entry.is_empty())
                .collect(),
            same_origin: false,
        }
    }

    /// Also accepts an `Origin` whose authority equals the request `Host`.
    ///
    /// Off by default: both headers are attacker-controlled under DNS
    /// rebinding.
    #[must_use]
    pub fn with_same_origin(mut self, enabled: bool) -> Self {
        self.same_origin = enabled;
        self
    }

    /// Returns `true` if hardening checks are enforced.
    pub fn hardening(&self) -> bool {
        self.hardening
    }

    /// Decides whether a connection from `origin` may proceed.
    ///
    /// `host` is the request's `Host` header. It is only consulted when
    /// same-origin requests were enabled with
    /// [`with_same_origin`](Self::with_same_origin).
    pub fn validate_origin(&self, origin: Option<&str>, host: Option<&str>) -> bool {
        if !self.hardening {
            return true;
        }

        let Some(origin) = origin else {
            return true;
        };

        let origin = normalize(origin);
        let authority = authority_of(&origin);

        if self.same_origin {
            if let (Some(authority), Some(host)) = (authority, host) {
                if authority.eq_ignore_ascii_case(host.trim()) {
                    return true;
                }
            }
        }

        self.allowed
            .iter()
            .any(|entry| *entry == origin || Some(entry.as_str()) == authority)
    }

    /// Like [`validate_origin`](Self::validate_origin), as a `Result`.
    pub fn check(&self, origin: Option<&str>, host: Option<&str>) -> Result<(), AuthError> {
        if self.validate_origin(origin, host) {
            Ok(())
        } else {
            Err(AuthError::origin_rejected(origin.unwrap_or_default()))
        }
    }
}

fn normalize(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// `https://host:port` -> `host:port`. `None` if there is no scheme.
fn authority_of(origin: &str) -> Option<&str> {
    origin
        .split_once("://")
        .map(|(_, rest)| rest.split('/').next().unwrap_or(rest))
}

/// Compares two secrets in constant time.
pub fn tokens_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Verifies an `Authorization` header value against the expected bearer token.
///
/// # Errors
///
/// Returns [`AuthError::MissingToken`] if the header is absent or not a
/// bearer credential, and [`AuthError::InvalidToken`] if it does not match.
pub fn verify_bearer(authorization: Option<&str>, expected: &str) -> Result<(), AuthError> {
    let presented = authorization
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingToken)?;

    if tokens_match(presented, expected) {
        Ok(())
    } else {
        Err(AuthError::InvalidToken)
    }
}
