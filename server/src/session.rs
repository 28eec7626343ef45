//! Session credential lifecycle for pseudonymous identities.
//!
//! Every client that reaches the gateway is attached to an identity. The first
//! unauthenticated contact mints a fresh identity together with a session
//! credential; presenting that credential again resumes the same identity.
//!
//! # Lifecycle
//!
//! - **Issue** - no usable credential was presented: a new identity and session
//!   are minted.
//! - **Resume** - an active session younger than the rotation threshold.
//! - **Rotate** - an active session older than the rotation threshold is
//!   revoked and a successor is minted for the same identity, linked through
//!   `rotated_from`.
//! - **Expire** - a session found past its expiry is revoked on sight and the
//!   client is treated as new.
//!
//! Revocation is permanent: a revoked session is never reactivated.
//!
//! # Token Format
//!
//! Session tokens are 32 bytes of cryptographically secure random data,
//! base64-url encoded without padding, resulting in 43 character tokens.
//! The token doubles as the session id and must never be logged.
//!
//! # Example
//!
//! ```rust
//! use darecast_server::session::{SessionManager, SessionOutcome, SessionPolicy};
//!
//! #[tokio::main]
//! async fn main() {
//!     let sessions = SessionManager::in_memory(SessionPolicy::default());
//!
//!     let first = sessions.establish(None).await.unwrap();
//!     assert_eq!(first.outcome, SessionOutcome::Issued);
//!
//!     let again = sessions.establish(Some(&first.session.id)).await.unwrap();
//!     assert_eq!(again.outcome, SessionOutcome::Resumed);
//!     assert_eq!(again.identity.id, first.identity.id);
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Default session lifetime (30 days).
pub const DEFAULT_SESSION_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Default age after which a session is rotated (1 day).
pub const DEFAULT_ROTATE_AFTER_SECS: u64 = 24 * 60 * 60;

/// Maximum number of stored sessions.
const DEFAULT_MAX_CAPACITY: usize = 100_000;

/// Size of the random token in bytes.
const TOKEN_BYTES: usize = 32;

/// Expected length of base64-url encoded token (43 characters).
pub const TOKEN_LENGTH: usize = 43;

/// Length of the hex suffix in a pseudonymous handle.
const HANDLE_SUFFIX_LEN: usize = 6;

/// Errors that can occur during session operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The credential store has reached maximum capacity.
    #[error("credential store at maximum capacity ({max_capacity} sessions)")]
    AtCapacity {
        /// The maximum number of sessions allowed.
        max_capacity: usize,
    },

    /// The credential store failed.
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

/// A pseudonymous identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable identity id (`usr_` followed by 32 hex characters).
    pub id: String,

    /// Human-readable pseudonym, e.g. `anon-3f9a1c`.
    pub handle: String,
}

impl Identity {
    /// Mints a new identity.
    pub fn mint() -> Self {
        Self::from_id(format!("usr_{}", Uuid::new_v4().simple()))
    }

    /// Rebuilds the identity for a known id.
    ///
    /// The handle is derived from the id so it never needs to be stored.
    pub fn from_id(id: impl Into<String>) -> Self {
        let id = id.into();
        let suffix: String = id
            .trim_start_matches("usr_")
            .chars()
            .take(HANDLE_SUFFIX_LEN)
            .collect();
        Self {
            handle: format!("anon-{suffix}"),
            id,
        }
    }
}

/// A session credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    /// The opaque session token. Never log this.
    pub id: String,

    /// The identity this session authenticates.
    pub identity_id: String,

    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    /// Token of the session this one replaced on rotation.
    pub rotated_from: Option<String>,

    pub revoked_at: Option<DateTime<Utc>>,
}

impl Session {
    fn new(identity_id: String, now: DateTime<Utc>, ttl: TimeDelta) -> Self {
        Self {
            id: generate_session_token(),
            identity_id,
            issued_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            rotated_from: None,
            revoked_at: None,
        }
    }

    fn successor(&self, now: DateTime<Utc>, ttl: TimeDelta) -> Self {
        Self {
            rotated_from: Some(self.id.clone()),
            ..Self::new(self.identity_id.clone(), now, ttl)
        }
    }

    /// Returns `true` if the session is neither revoked nor expired at `now`.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && now < self.expires_at
    }

    /// Returns `true` once `expires_at` has passed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &"<redacted>")
            .field("identity_id", &self.identity_id)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("rotated", &self.rotated_from.is_some())
            .field("revoked_at", &self.revoked_at)
            .finish()
    }
}

/// Keyed store of session credentials.
///
/// Implementations must make [`revoke`](CredentialStore::revoke) atomic: of
/// several concurrent callers revoking the same active session, exactly one
/// observes `true`.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Looks up a session by token.
    async fn lookup(&self, token: &str) -> Result<Option<Session>, SessionError>;

    /// Stores a new session.
    async fn insert(&self, session: Session) -> Result<(), SessionError>;

    /// Marks a session revoked at `at`.
    ///
    /// Returns `true` if this call performed the revocation, `false` if the
    /// session is unknown or was already revoked.
    async fn revoke(&self, token: &str, at: DateTime<Utc>) -> Result<bool, SessionError>;

    /// Removes sessions that expired before `now`, returning how many.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, SessionError>;

    /// Number of stored sessions.
    async fn len(&self) -> usize;
}

/// In-memory credential store.
pub struct MemoryCredentialStore {
    sessions: RwLock<HashMap<String, Session>>,
    max_capacity: usize,
}

impl MemoryCredentialStore {
    pub fn new(max_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_capacity,
        }
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CAPACITY)
    }
}

impl std::fmt::Debug for MemoryCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.sessions.try_read().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("MemoryCredentialStore")
            .field("session_count", &len)
            .field("max_capacity", &self.max_capacity)
            .finish()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn lookup(&self, token: &str) -> Result<Option<Session>, SessionError> {
        Ok(self.sessions.read().await.get(token).cloned())
    }

    async fn insert(&self, session: Session) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;

        if sessions.len() >= self.max_capacity {
            warn!(
                capacity = sessions.len(),
                max_capacity = self.max_capacity,
                "Credential store at capacity, rejecting new session"
            );
            return Err(SessionError::AtCapacity {
                max_capacity: self.max_capacity,
            });
        }

        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn revoke(&self, token: &str, at: DateTime<Utc>) -> Result<bool, SessionError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(token) {
            Some(session) if session.revoked_at.is_none() => {
                session.revoked_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, SessionError> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired_at(now));
        Ok(before - sessions.len())
    }

    async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Session lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// How long a session stays valid after issue.
    pub ttl: Duration,

    /// Age after which a presented session is rotated.
    pub rotate_after: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            rotate_after: Duration::from_secs(DEFAULT_ROTATE_AFTER_SECS),
        }
    }
}

/// How [`SessionManager::establish`] satisfied a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A new identity and session were minted.
    Issued,
    /// The presented session was replaced by a successor.
    Rotated,
    /// The presented session is still current.
    Resumed,
}

/// Result of [`SessionManager::establish`].
#[derive(Debug, Clone)]
pub struct Established {
    pub identity: Identity,
    pub session: Session,
    pub outcome: SessionOutcome,
}

impl Established {
    /// Returns `true` if the client must be handed a new credential.
    pub fn issued_credential(&self) -> bool {
        self.outcome != SessionOutcome::Resumed
    }
}

/// Issues, rotates, and revokes session credentials. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn CredentialStore>,
    ttl: TimeDelta,
    rotate_after: TimeDelta,
}

impl SessionManager {
    /// Creates a manager over the given credential store.
    pub fn new(store: Arc<dyn CredentialStore>, policy: SessionPolicy) -> Self {
        debug!(
            ttl_secs = policy.ttl.as_secs(),
            rotate_after_secs = policy.rotate_after.as_secs(),
            "Creating session manager"
        );
        Self {
            store,
            ttl: TimeDelta::from_std(policy.ttl).unwrap_or(TimeDelta::MAX),
            rotate_after: TimeDelta::from_std(policy.rotate_after).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Creates a manager over a fresh in-memory store.
    pub fn in_memory(policy: SessionPolicy) -> Self {
        Self::new(Arc::new(MemoryCredentialStore::default()), policy)
    }

    /// Resolves the presented credential to an identity, minting or rotating
    /// as needed.
    ///
    /// A missing, malformed, unknown, expired, or revoked credential yields a
    /// fresh identity. Expired sessions are revoked on sight.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if the credential store fails.
    pub async fn establish(&self, credential: Option<&str>) -> Result<Established, SessionError> {
        self.establish_at(credential, Utc::now()).await
    }

    async fn establish_at(
        &self,
        credential: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Established, SessionError> {
        if let Some(token) = credential.filter(|token| is_well_formed(token)) {
            if let Some(session) = self.store.lookup(token).await? {
                if session.is_active_at(now) {
                    if now.signed_duration_since(session.issued_at) < self.rotate_after {
                        trace!(identity_id = %session.identity_id, "Session resumed");
                        return Ok(Established {
                            identity: Identity::from_id(session.identity_id.clone()),
                            session,
                            outcome: SessionOutcome::Resumed,
                        });
                    }

                    if let Some(established) = self.rotate(&session, now).await? {
                        return Ok(established);
                    }
                } else if session.revoked_at.is_none() {
                    self.store.revoke(token, now).await?;
                    debug!(identity_id = %session.identity_id, "Revoked expired session");
                }
            }
        }

        self.issue(now).await
    }

    async fn rotate(
        &self,
        session: &Session,
        now: DateTime<Utc>,
    ) -> Result<Option<Established>, SessionError> {
        // Only the caller that performs the revocation may mint the successor.
        if !self.store.revoke(&session.id, now).await? {
            debug!(identity_id = %session.identity_id, "Session revoked concurrently");
            return Ok(None);
        }

        let successor = session.successor(now, self.ttl);
        self.store.insert(successor.clone()).await?;

        info!(identity_id = %successor.identity_id, "Session rotated");
        Ok(Some(Established {
            identity: Identity::from_id(successor.identity_id.clone()),
            session: successor,
            outcome: SessionOutcome::Rotated,
        }))
    }

    async fn issue(&self, now: DateTime<Utc>) -> Result<Established, SessionError> {
        let identity = Identity::mint();
        let session = Session::new(identity.id.clone(), now, self.ttl);
        self.store.insert(session.clone()).await?;

        info!(identity_id = %identity.id, handle = %identity.handle, "Issued new identity");
        Ok(Established {
            identity,
            session,
            outcome: SessionOutcome::Issued,
        })
    }

    /// Read-only lookup: the identity behind an active credential.
    ///
    /// Never mints, rotates, or revokes.
    pub async fn identify(&self, credential: &str) -> Result<Option<Identity>, SessionError> {
        if !is_well_formed(credential) {
            return Ok(None);
        }

        let now = Utc::now();
        Ok(self
            .store
            .lookup(credential)
            .await?
            .filter(|session| session.is_active_at(now))
            .map(|session| Identity::from_id(session.identity_id)))
    }

    /// Revokes a credential immediately and permanently.
    ///
    /// Returns `true` if the credential was active.
    pub async fn revoke(&self, credential: &str) -> Result<bool, SessionError> {
        if !is_well_formed(credential) {
            return Ok(false);
        }
        let revoked = self.store.revoke(credential, Utc::now()).await?;
        if revoked {
            debug!("Session revoked");
        }
        Ok(revoked)
    }

    /// Removes expired sessions from the store.
    pub async fn sweep_expired(&self) -> Result<usize, SessionError> {
        let removed = self.store.purge_expired(Utc::now()).await?;
        if removed > 0 {
            debug!(removed_count = removed, "Cleaned up expired sessions");
        }
        Ok(removed)
    }

    /// Number of stored sessions.
    pub async fn session_count(&self) -> usize {
        self.store.len().await
    }

    /// Spawns a background task that sweeps expired sessions every `interval`.
    pub fn spawn_sweep_task(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);

            loop {
                interval.tick().await;
                if let Err(err) = manager.sweep_expired().await {
                    warn!(error = %err, "Session sweep failed");
                }
            }
        })
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("ttl", &self.ttl)
            .field("rotate_after", &self.rotate_after)
            .finish()
    }
}

/// Returns `true` if `token` has the shape of an issued credential.
pub fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LENGTH
        && URL_SAFE_NO_PAD
            .decode(token)
            .is_ok_and(|bytes| bytes.len() == TOKEN_BYTES)
}

/// Generates a cryptographically secure session token.
///
/// The token is 32 bytes of random data, base64-url encoded without
/// padding, resulting in a 43-character string.
fn generate_session_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
