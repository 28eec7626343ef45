//! The connection gateway.
//!
//! A [`Gateway`] owns everything the realtime transports share: the room
//! registry, the per-IP connection counter, and handles to the session
//! manager, rate limiter, and collaborator seams. It subscribes to the event
//! bus once and relays every event into the room registry.
//!
//! Gateways are constructor-injected and hold no global state, so several can
//! coexist in one process (the tests rely on this).
//!
//! # Upgrade sequence
//!
//! [`Gateway::admit`] runs the pre-upgrade checks in a fixed order:
//!
//! 1. realtime enabled, otherwise `503`
//! 2. origin allowed, otherwise `403`
//! 3. per-IP connection cap, otherwise `429`
//! 4. establish or rotate the session
//!
//! Only an [`Admission`] completes the upgrade through [`Gateway::upgrade`].

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::http::header::{COOKIE, HOST, ORIGIN, SET_COOKIE};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::Response;
use tracing::{debug, info, trace, warn};

use crate::auth::OriginPolicy;
use crate::bus::{EventBus, Subscription};
use crate::config::Config;
use crate::connection::Connection;
use crate::directory::{AccessPolicy, EventHistory};
use crate::error::ServerError;
use crate::ip_limit::{IpConnectionLimiter, IpSlot};
use crate::rate_limit::RateLimiter;
use crate::rooms::{Broadcast, RoomRegistry};
use crate::session::{Established, SessionManager};

/// Name of the cookie carrying the session credential.
pub const SESSION_COOKIE: &str = "darecast_session";

/// Tunables for connection handling, derived from [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    pub realtime_enabled: bool,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub max_connections_per_ip: usize,
    pub message_rate_per_minute: u32,
    pub message_burst: u32,
    pub max_pending_sends: usize,
    pub max_buffered_bytes: usize,
    pub max_subscriptions: usize,
    pub max_message_bytes: usize,
    pub sse_heartbeat: Duration,

    /// `Max-Age` of the session cookie.
    pub session_ttl: Duration,
}

impl GatewaySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            realtime_enabled: config.realtime_enabled,
            ping_interval: config.ws_ping_interval,
            idle_timeout: config.ws_idle_timeout,
            max_connections_per_ip: config.ws_max_connections_per_ip,
            message_rate_per_minute: config.ws_message_rate,
            message_burst: config.ws_message_burst,
            max_pending_sends: config.ws_max_pending_sends,
            max_buffered_bytes: config.ws_max_buffered_bytes,
            max_subscriptions: config.ws_max_subscriptions,
            max_message_bytes: config.ws_max_message_bytes,
            sse_heartbeat: config.sse_heartbeat,
            session_ttl: config.session_ttl,
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Collaborators a gateway is built from.
pub struct GatewayParts {
    pub settings: GatewaySettings,
    pub origins: OriginPolicy,
    pub sessions: SessionManager,
    pub rate_limiter: RateLimiter,
    pub access: Arc<dyn AccessPolicy>,
    pub history: Arc<dyn EventHistory>,
}

/// A pre-upgrade request as seen by the gateway.
#[derive(Clone)]
pub struct UpgradeRequest {
    pub ip: IpAddr,
    pub origin: Option<String>,
    pub host: Option<String>,

    /// Presented session credential, from the cookie or query string.
    pub credential: Option<String>,
}

impl std::fmt::Debug for UpgradeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeRequest")
            .field("ip", &self.ip)
            .field("origin", &self.origin)
            .field("host", &self.host)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl UpgradeRequest {
    /// Builds a request from HTTP headers and an optional query credential.
    ///
    /// The cookie wins over the query parameter.
    pub fn from_headers(ip: IpAddr, headers: &HeaderMap, query_credential: Option<String>) -> Self {
        let header = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };

        Self {
            ip,
            origin: header(ORIGIN),
            host: header(HOST),
            credential: credential_from_cookies(headers).or(query_credential),
        }
    }
}

/// A request that passed every pre-upgrade check.
#[derive(Debug)]
pub struct Admission {
    slot: IpSlot,
    established: Established,
}

impl Admission {
    pub fn established(&self) -> &Established {
        &self.established
    }
}

struct Inner {
    settings: GatewaySettings,
    origins: OriginPolicy,
    sessions: SessionManager,
    rate_limiter: RateLimiter,
    access: Arc<dyn AccessPolicy>,
    history: Arc<dyn EventHistory>,
    registry: Arc<RoomRegistry>,
    ip_limiter: IpConnectionLimiter,
    next_sink_id: AtomicU64,
    _relay: Subscription,
}

/// Accepts realtime clients and fans bus events out to them. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    /// Creates a gateway and subscribes it to every event on `bus`.
    ///
    /// Subscribers registered on `bus` before this call run before the relay
    /// for each event.
    pub fn new(bus: &EventBus, parts: GatewayParts) -> Self {
        let registry = Arc::new(RoomRegistry::new());

        let relay = {
            let registry = Arc::clone(&registry);
            bus.subscribe_all(move |event| match Broadcast::new(event.clone()) {
                Ok(broadcast) => {
                    let delivered = registry.broadcast(&broadcast);
                    trace!(
                        event_id = %event.id,
                        resource_id = ?event.resource_id,
                        system_wide = event.is_system_wide(),
                        delivered,
                        "Relayed event"
                    );
                }
                Err(err) => {
                    warn!(event_id = %event.id, error = %err, "Failed to encode event for relay");
                }
            })
        };

        let ip_limiter = IpConnectionLimiter::new(
            parts.settings.max_connections_per_ip,
            parts.origins.hardening(),
        );

        Self {
            inner: Arc::new(Inner {
                settings: parts.settings,
                origins: parts.origins,
                sessions: parts.sessions,
                rate_limiter: parts.rate_limiter,
                access: parts.access,
                history: parts.history,
                registry,
                ip_limiter,
                next_sink_id: AtomicU64::new(1),
                _relay: relay,
            }),
        }
    }

    /// Runs the stateless pre-upgrade checks: realtime enabled, then origin.
    ///
    /// Takes nothing from the gateway, so it is safe to run before the
    /// request is known to be a WebSocket upgrade.
    ///
    /// # Errors
    ///
    /// - [`ServerError::RealtimeDisabled`] if realtime delivery is off
    /// - [`ServerError::OriginRejected`] if the origin is not allowed
    pub fn screen(&self, request: &UpgradeRequest) -> Result<(), ServerError> {
        let inner = &self.inner;
        if !inner.settings.realtime_enabled {
            debug!(ip = %request.ip, "Rejected upgrade, realtime disabled");
            return Err(ServerError::RealtimeDisabled);
        }

        if let Err(err) = inner
            .origins
            .check(request.origin.as_deref(), request.host.as_deref())
        {
            warn!(ip = %request.ip, origin = ?request.origin, "Rejected upgrade from disallowed origin");
            return Err(err.into());
        }

        Ok(())
    }

    /// Runs every pre-upgrade check, reserving an IP slot and establishing
    /// the session.
    ///
    /// Only call this for a genuine upgrade request: a successful admission
    /// may mint a session.
    ///
    /// # Errors
    ///
    /// - Anything [`screen`](Self::screen) returns
    /// - [`ServerError::TooManyConnections`] if the per-IP cap is reached
    /// - [`ServerError::Session`] if the credential store fails
    pub async fn admit(&self, request: UpgradeRequest) -> Result<Admission, ServerError> {
        self.screen(&request)?;

        let inner = &self.inner;
        let Some(slot) = inner.ip_limiter.try_acquire(request.ip) else {
            warn!(
                ip = %request.ip,
                max = inner.settings.max_connections_per_ip,
                "Rejected upgrade, per-IP connection cap reached"
            );
            return Err(ServerError::TooManyConnections(request.ip));
        };

        let established = inner.sessions.establish(request.credential.as_deref()).await?;
        Ok(Admission { slot, established })
    }

    /// Completes an admitted upgrade.
    ///
    /// Sets the session cookie when a new credential was issued.
    pub fn upgrade(&self, ws: WebSocketUpgrade, admission: Admission) -> Response {
        let Admission { slot, established } = admission;
        let cookie = established
            .issued_credential()
            .then(|| session_cookie(&established.session.id, self.inner.settings.session_ttl));

        let gateway = self.clone();
        let id = self.next_sink_id();
        let identity = established.identity;

        let mut response = ws
            .max_message_size(self.inner.settings.max_message_bytes)
            .on_failed_upgrade(move |err| {
                debug!(connection_id = id, error = %err, "WebSocket upgrade failed");
            })
            .on_upgrade(move |socket| Connection::run(gateway, socket, id, slot, identity));

        if let Some(cookie) = cookie {
            match HeaderValue::from_str(&cookie) {
                Ok(value) => {
                    response.headers_mut().append(SET_COOKIE, value);
                }
                Err(err) => warn!(error = %err, "Failed to encode session cookie"),
            }
        }

        response
    }

    /// Allocates an id for a new sink.
    pub fn next_sink_id(&self) -> u64 {
        self.inner.next_sink_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.inner.registry
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.rate_limiter
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn access(&self) -> &Arc<dyn AccessPolicy> {
        &self.inner.access
    }

    pub fn history(&self) -> &Arc<dyn EventHistory> {
        &self.inner.history
    }

    /// Open sinks across both transports.
    pub fn connection_count(&self) -> usize {
        self.inner.registry.connection_count()
    }

    pub fn room_count(&self) -> usize {
        self.inner.registry.room_count()
    }

    /// Open WebSocket connections from `ip`.
    pub fn connections_from(&self, ip: IpAddr) -> usize {
        self.inner.ip_limiter.count(ip)
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("settings", &self.inner.settings)
            .field("hardening", &self.inner.origins.hardening())
            .field("registry", &self.inner.registry)
            .finish()
    }
}

/// Extracts the session credential from the `Cookie` headers.
pub fn credential_from_cookies(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// `Set-Cookie` value for a freshly issued credential.
pub fn session_cookie(token: &str, max_age: Duration) -> String {
    info!(max_age_secs = max_age.as_secs(), "Issuing session cookie");
    format!(
        "{SESSION_COOKIE}={token}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax",
        max_age.as_secs()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, MemoryEventLog, Visibility};
    use crate::rooms::tests::RecordingSink;
    use crate::rooms::RoomSink;
    use crate::session::{SessionOutcome, SessionPolicy};
    use crate::types::PublishRequest;
    use serde_json::json;
    use std::net::Ipv4Addr;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));

    fn gateway_with(bus: &EventBus, settings: GatewaySettings, origins: OriginPolicy) -> Gateway {
        let directory = Arc::new(MemoryDirectory::new());
        directory.register("dare-1", Visibility::Public);
        Gateway::new(
            bus,
            GatewayParts {
                settings,
                origins,
                sessions: SessionManager::in_memory(SessionPolicy::default()),
                rate_limiter: RateLimiter::local(),
                access: directory,
                history: Arc::new(MemoryEventLog::default()),
            },
        )
    }

    fn request(origin: Option<&str>) -> UpgradeRequest {
        UpgradeRequest {
            ip: IP,
            origin: origin.map(str::to_string),
            host: Some("gateway.darecast.app".to_string()),
            credential: None,
        }
    }

    #[tokio::test]
    async fn admit_rejects_when_realtime_disabled() {
        let bus = EventBus::local();
        let settings = GatewaySettings {
            realtime_enabled: false,
            ..GatewaySettings::default()
        };
        let gateway = gateway_with(&bus, settings, OriginPolicy::default());

        let err = gateway.admit(request(None)).await.unwrap_err();
        assert!(matches!(err, ServerError::RealtimeDisabled));
    }

    #[tokio::test]
    async fn screen_takes_no_slot_or_session() {
        let bus = EventBus::local();
        let gateway = gateway_with(&bus, GatewaySettings::default(), OriginPolicy::default());

        gateway.screen(&request(Some("https://darecast.app"))).unwrap();
        assert_eq!(gateway.connections_from(IP), 0);
        assert_eq!(gateway.sessions().session_count().await, 0);
    }

    #[tokio::test]
    async fn screen_rejects_matching_host_outside_allow_list() {
        let bus = EventBus::local();
        let origins = OriginPolicy::new(true, vec!["http://localhost".to_string()]);
        let gateway = gateway_with(&bus, GatewaySettings::default(), origins);

        let err = gateway
            .screen(&request(Some("https://gateway.darecast.app")))
            .unwrap_err();
        assert!(matches!(err, ServerError::OriginRejected(_)));
    }

    #[tokio::test]
    async fn admit_checks_origin_before_ip_cap() {
        let bus = EventBus::local();
        let settings = GatewaySettings {
            max_connections_per_ip: 1,
            ..GatewaySettings::default()
        };
        let origins = OriginPolicy::new(true, vec!["http://localhost".to_string()]);
        let gateway = gateway_with(&bus, settings, origins);

        let err = gateway
            .admit(request(Some("https://evil.example")))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::OriginRejected(_)));
        assert_eq!(gateway.connections_from(IP), 0);

        let admitted = gateway.admit(request(Some("http://localhost"))).await.unwrap();
        assert_eq!(admitted.established().outcome, SessionOutcome::Issued);
        assert_eq!(gateway.connections_from(IP), 1);

        let err = gateway
            .admit(request(Some("http://localhost")))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::TooManyConnections(ip) if ip == IP));

        drop(admitted);
        assert_eq!(gateway.connections_from(IP), 0);
    }

    #[tokio::test]
    async fn admit_resumes_presented_session() {
        let bus = EventBus::local();
        let gateway = gateway_with(&bus, GatewaySettings::default(), OriginPolicy::default());

        let first = gateway.admit(request(None)).await.unwrap();
        let token = first.established().session.id.clone();

        let second = gateway
            .admit(UpgradeRequest {
                credential: Some(token),
                ..request(None)
            })
            .await
            .unwrap();
        assert_eq!(second.established().outcome, SessionOutcome::Resumed);
        assert_eq!(
            second.established().identity,
            first.established().identity
        );
    }

    #[test]
    fn relay_delivers_bus_events_to_rooms() {
        let bus = EventBus::local();
        let gateway = gateway_with(&bus, GatewaySettings::default(), OriginPolicy::default());

        let sink = RecordingSink::new(gateway.next_sink_id());
        gateway.registry().join_buffered("dare-1", sink.clone());
        gateway
            .registry()
            .go_live("dare-1", sink.sink_id(), &Default::default(), || Ok(()))
            .unwrap();

        let event = bus.publish("dare.accepted", PublishRequest::for_resource("dare-1", json!({})));
        bus.publish("dare.accepted", PublishRequest::for_resource("dare-2", json!({})));

        assert_eq!(sink.ids(), vec![event.id]);
    }

    #[test]
    fn dropping_gateway_unsubscribes_relay() {
        let bus = EventBus::local();
        let before = bus.handler_count();
        let gateway = gateway_with(&bus, GatewaySettings::default(), OriginPolicy::default());
        assert_eq!(bus.handler_count(), before + 1);

        drop(gateway);
        assert_eq!(bus.handler_count(), before);
    }

    #[test]
    fn sink_ids_are_unique() {
        let bus = EventBus::local();
        let gateway = gateway_with(&bus, GatewaySettings::default(), OriginPolicy::default());
        let a = gateway.next_sink_id();
        let b = gateway.clone().next_sink_id();
        assert_ne!(a, b);
    }

    #[test]
    fn credential_from_cookie_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; darecast_session=abc123; other=1"),
        );
        assert_eq!(credential_from_cookies(&headers).as_deref(), Some("abc123"));

        let request = UpgradeRequest::from_headers(IP, &headers, Some("from-query".into()));
        assert_eq!(request.credential.as_deref(), Some("abc123"));
    }

    #[test]
    fn query_credential_used_without_cookie() {
        let headers = HeaderMap::new();
        assert!(credential_from_cookies(&headers).is_none());

        let request = UpgradeRequest::from_headers(IP, &headers, Some("from-query".into()));
        assert_eq!(request.credential.as_deref(), Some("from-query"));
    }

    #[test]
    fn session_cookie_attributes() {
        let cookie = session_cookie("tok", Duration::from_secs(60));
        assert_eq!(
            cookie,
            "darecast_session=tok; Max-Age=60; Path=/; HttpOnly; SameSite=Lax"
        );
    }
}
