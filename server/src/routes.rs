//! HTTP route handlers for the Darecast server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /ws` - WebSocket endpoint for realtime room subscriptions
//! - `GET /resources/{resourceId}/stream` - Server-sent events for one resource
//! - `GET /health` - Health check endpoint
//! - `POST /internal/events` - Publish events (publisher token required)
//! - `PUT /internal/resources/{resourceId}` - Register resource visibility
//!
//! The internal routes are only mounted when a publisher token is configured.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use darecast_server::routes::{create_router, AppState};
//! use darecast_server::config::Config;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config);
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
//!         .await
//!         .unwrap();
//! }
//! ```

use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        ConnectInfo, DefaultBodyLimit, FromRequestParts, Path, Query, Request, State,
    },
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    response::{sse::Sse, IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, debug_span, info, trace, warn, Span};

use crate::auth::{verify_bearer, OriginPolicy};
use crate::bus::{EventBus, Subscription};
use crate::config::Config;
use crate::directory::{MemoryDirectory, MemoryEventLog, Visibility};
use crate::error::ServerError;
use crate::gateway::{credential_from_cookies, Gateway, GatewayParts, GatewaySettings, UpgradeRequest};
use crate::rate_limit::RateLimiter;
use crate::session::{SessionManager, SessionPolicy};
use crate::sse::{self, SseStream};
use crate::types::{is_valid_event_type, is_valid_resource_id, PublishRequest};

// ============================================================================
// Constants
// ============================================================================

/// Header carrying the original client address behind a proxy.
const HEADER_FORWARDED_FOR: &str = "X-Forwarded-For";

/// Maximum body size for the internal routes (1 MB).
const MAX_BODY_SIZE: usize = 1024 * 1024;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Event bus the internal routes publish into.
    pub bus: EventBus,

    /// WebSocket and SSE gateway.
    pub gateway: Gateway,

    pub sessions: SessionManager,

    /// Shared with the gateway for inbound frame limits.
    pub rate_limiter: RateLimiter,

    /// In-memory access policy.
    pub directory: Arc<MemoryDirectory>,

    /// In-memory event history, fed from the bus.
    pub event_log: Arc<MemoryEventLog>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,

    _recording: Arc<Subscription>,
}

impl AppState {
    /// Creates application state with a local bus and in-process rate limits.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_components(config, EventBus::local(), RateLimiter::local())
    }

    /// Creates application state around an existing bus and rate limiter.
    ///
    /// Used by the binary to plug in broker-backed components, and by tests.
    #[must_use]
    pub fn with_components(config: Config, bus: EventBus, rate_limiter: RateLimiter) -> Self {
        let event_log = Arc::new(MemoryEventLog::default());
        // The log must see each event before the gateway relays it, so a
        // joining client finds it in history, in its replay buffer, or both.
        let recording = event_log.record_from(&bus);

        let directory = Arc::new(MemoryDirectory::new());
        let sessions = SessionManager::in_memory(SessionPolicy {
            ttl: config.session_ttl,
            rotate_after: config.session_rotate_after,
        });

        let gateway = Gateway::new(
            &bus,
            GatewayParts {
                settings: GatewaySettings::from_config(&config),
                origins: OriginPolicy::new(config.hardening, config.allowed_origins.clone())
                    .with_same_origin(config.allow_same_origin),
                sessions: sessions.clone(),
                rate_limiter: rate_limiter.clone(),
                access: directory.clone(),
                history: event_log.clone(),
            },
        );

        Self {
            config: Arc::new(config),
            bus,
            gateway,
            sessions,
            rate_limiter,
            directory,
            event_log,
            start_time: Instant::now(),
            _recording: Arc::new(recording),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("bus", &self.bus)
            .field("gateway", &self.gateway)
            .field("rate_limiter", &self.rate_limiter)
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()` so
/// handlers see the peer address.
pub fn create_router(state: AppState) -> Router {
    let mut router: Router<AppState> = Router::new()
        .route("/ws", get(get_ws))
        .route("/resources/{resource_id}/stream", get(get_resource_stream))
        .route("/health", get(get_health));

    if state.config.publisher_token.is_some() {
        router = router.merge(
            Router::<AppState>::new()
                .route("/internal/events", post(post_internal_events))
                .route("/internal/resources/{resource_id}", put(put_internal_resource))
                .layer(DefaultBodyLimit::max(MAX_BODY_SIZE)),
        );
    }

    router
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(state)
}

/// Span for one HTTP request.
///
/// Records the path only: the query string may carry a session credential.
fn request_span(request: &Request) -> Span {
    debug_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
        version = ?request.version(),
    )
}

// ============================================================================
// Extractors
// ============================================================================

/// The client address: the socket peer, or the first `X-Forwarded-For` hop
/// when the proxy is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

impl FromRequestParts<AppState> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if state.config.trust_proxy {
            if let Some(ip) = forwarded_for(&parts.headers) {
                return Ok(Self(ip));
            }
        }

        let ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
            .unwrap_or_else(|| {
                trace!("No peer address on request");
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            });
        Ok(Self(ip))
    }
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(HEADER_FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Session credential passed in the query string by non-browser clients.
#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    pub session: Option<String>,
}

// ============================================================================
// GET /ws - WebSocket
// ============================================================================

/// GET /ws - WebSocket endpoint.
///
/// Runs the stateless gateway checks before looking at the upgrade headers,
/// so a refused client gets a plain HTTP error. The IP slot and session are
/// only taken for a genuine upgrade.
///
/// # Responses
///
/// - `101 Switching Protocols` - upgrade accepted, may set the session cookie
/// - `403 Forbidden` - origin not allowed
/// - `429 Too Many Requests` - per-IP connection cap reached
/// - `503 Service Unavailable` - realtime disabled
async fn get_ws(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let request = UpgradeRequest::from_headers(ip, &headers, query.session);
    if let Err(err) = state.gateway.screen(&request) {
        return err.into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(%ip, error = %rejection, "Not a WebSocket upgrade request");
            return rejection.into_response();
        }
    };

    match state.gateway.admit(request).await {
        Ok(admission) => state.gateway.upgrade(ws, admission),
        Err(err) => err.into_response(),
    }
}

// ============================================================================
// GET /resources/{resourceId}/stream - SSE
// ============================================================================

/// GET /resources/{resourceId}/stream - Server-sent events for one resource.
///
/// The session credential is optional; it is only looked up, never issued.
async fn get_resource_stream(
    State(state): State<AppState>,
    Path(resource_id): Path<String>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Result<Sse<SseStream>, ServerError> {
    let identity = match credential_from_cookies(&headers).or(query.session) {
        Some(credential) => state.sessions.identify(&credential).await?,
        None => None,
    };

    let stream = sse::open_stream(&state.gateway, &resource_id, identity.as_ref()).await?;
    Ok(Sse::new(stream))
}

// ============================================================================
// POST /internal/events - Publish
// ============================================================================

/// One event in a publish request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishBody {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    resource_id: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// Request body for publishing.
///
/// Accepts either a single event or an array of events.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PublishPayload {
    Single(PublishBody),
    Batch(Vec<PublishBody>),
}

impl PublishPayload {
    fn into_bodies(self) -> Vec<PublishBody> {
        match self {
            Self::Single(body) => vec![body],
            Self::Batch(bodies) => bodies,
        }
    }
}

/// Response body for an accepted publish.
#[derive(Debug, Serialize, Deserialize)]
pub struct PublishedResponse {
    /// Ids assigned to the published events, in request order.
    pub ids: Vec<String>,
}

fn authorize_publisher(state: &AppState, headers: &HeaderMap) -> Result<(), ServerError> {
    let expected = state
        .config
        .publisher_token
        .as_deref()
        .ok_or_else(|| ServerError::internal("publisher token not configured"))?;
    let authorization = headers.get(AUTHORIZATION).and_then(|value| value.to_str().ok());

    verify_bearer(authorization, expected).map_err(|err| {
        warn!(error = %err, "Rejected internal request");
        ServerError::from(err)
    })
}

/// POST /internal/events - Publish events into the bus.
///
/// Every event is validated before any is published. Resources named by the
/// events are registered as public unless already known.
///
/// # Responses
///
/// - `202 Accepted` - `{"ids": [...]}`
/// - `400 Bad Request` - malformed body, event type, or resource id
/// - `401 Unauthorized` - missing or wrong bearer token
async fn post_internal_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<PublishedResponse>), ServerError> {
    authorize_publisher(&state, &headers)?;

    let bodies = serde_json::from_slice::<PublishPayload>(&body)
        .map_err(|err| ServerError::validation(format!("invalid event format: {err}")))?
        .into_bodies();

    if bodies.is_empty() {
        return Err(ServerError::validation("no events to publish"));
    }
    for body in &bodies {
        if !is_valid_event_type(&body.event_type) {
            return Err(ServerError::validation(format!(
                "invalid event type '{}'",
                body.event_type
            )));
        }
        if let Some(resource_id) = body.resource_id.as_deref() {
            if !is_valid_resource_id(resource_id) {
                return Err(ServerError::validation("invalid resource id"));
            }
        }
    }

    let mut ids = Vec::with_capacity(bodies.len());
    for body in bodies {
        if let Some(resource_id) = body.resource_id.as_deref() {
            state.directory.ensure_registered(resource_id);
        }
        let event = state.bus.publish(
            body.event_type,
            PublishRequest {
                resource_id: body.resource_id,
                payload: body.payload,
            },
        );
        trace!(event_id = %event.id, event_type = %event.event_type, "Published event");
        ids.push(event.id);
    }

    info!(event_count = ids.len(), "Events published");
    Ok((StatusCode::ACCEPTED, Json(PublishedResponse { ids })))
}

// ============================================================================
// PUT /internal/resources/{resourceId} - Visibility
// ============================================================================

/// Request body for resource registration.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceRegistration {
    #[serde(default)]
    visibility: Visibility,

    /// Identities allowed to view a restricted resource.
    #[serde(default)]
    associated_identities: Vec<String>,
}

/// PUT /internal/resources/{resourceId} - Set visibility and associations.
///
/// Associations are additive.
///
/// # Responses
///
/// - `204 No Content`
/// - `400 Bad Request` - malformed body or resource id
/// - `401 Unauthorized` - missing or wrong bearer token
async fn put_internal_resource(
    State(state): State<AppState>,
    Path(resource_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ServerError> {
    authorize_publisher(&state, &headers)?;

    if !is_valid_resource_id(&resource_id) {
        return Err(ServerError::validation("invalid resource id"));
    }

    let registration: ResourceRegistration = if body.is_empty() {
        ResourceRegistration::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ServerError::validation(format!("invalid registration: {err}")))?
    };

    state.directory.register(resource_id.as_str(), registration.visibility);
    for identity_id in registration.associated_identities {
        state.directory.associate(&resource_id, identity_id);
    }

    info!(resource_id = %resource_id, visibility = ?registration.visibility, "Resource registered");
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Open WebSocket connections and SSE streams.
    pub connections: usize,

    /// Non-empty rooms.
    pub rooms: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,

    /// Active fanout strategy: `local` or `redis`.
    pub broker: String,
}

/// GET /health - Health check endpoint.
///
/// ```json
/// {
///   "status": "ok",
///   "connections": 42,
///   "rooms": 7,
///   "uptimeSeconds": 3600,
///   "broker": "redis"
/// }
/// ```
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.gateway.connection_count(),
        rooms: state.gateway.room_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        broker: state.bus.fanout_name().to_string(),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::header::{CONTENT_TYPE, COOKIE};
    use axum::http::Request;
    use futures_util::StreamExt;
    use serde_json::json;
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::directory::{Access, AccessPolicy};
    use crate::error::ErrorResponse;

    const TOKEN: &str = "publisher-secret";

    fn test_config() -> Config {
        Config {
            publisher_token: Some(TOKEN.to_string()),
            ..Config::default()
        }
    }

    async fn send(state: &AppState, request: Request<Body>) -> Response {
        create_router(state.clone()).oneshot(request).await.unwrap()
    }

    async fn json_body<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn publish_request(token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/internal/events")
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    /// Reads the SSE body until `needle` shows up or the deadline passes.
    async fn read_sse_until(response: Response, needle: &str) -> String {
        let mut stream = response.into_body().into_data_stream();
        let mut seen = String::new();
        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(Ok(chunk)) = stream.next().await {
                seen.push_str(&String::from_utf8_lossy(&chunk));
                if seen.contains(needle) {
                    break;
                }
            }
        })
        .await;
        seen
    }

    // ========================================================================
    // Health endpoint tests
    // ========================================================================

    #[tokio::test]
    async fn health_returns_ok_status() {
        let state = AppState::new(test_config());

        let response = send(
            &state,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let health: HealthResponse = json_body(response).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.connections, 0);
        assert_eq!(health.rooms, 0);
        assert_eq!(health.broker, "local");
    }

    // ========================================================================
    // GET /ws tests
    // ========================================================================

    #[tokio::test]
    async fn ws_refused_when_realtime_disabled() {
        let state = AppState::new(Config {
            realtime_enabled: false,
            ..test_config()
        });

        let response = send(
            &state,
            Request::builder().uri("/ws").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body: ErrorResponse = json_body(response).await;
        assert_eq!(body.code.as_deref(), Some("realtime_disabled"));
    }

    #[tokio::test]
    async fn ws_refuses_disallowed_origin_when_hardened() {
        let state = AppState::new(Config {
            hardening: true,
            allowed_origins: vec!["http://localhost".to_string()],
            ..test_config()
        });

        let response = send(
            &state,
            Request::builder()
                .uri("/ws")
                .header("Origin", "https://evil.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(state.sessions.session_count().await, 0);
    }

    #[tokio::test]
    async fn ws_without_upgrade_headers_is_a_client_error() {
        let state = AppState::new(test_config());

        let response = send(
            &state,
            Request::builder().uri("/ws").body(Body::empty()).unwrap(),
        )
        .await;
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn ws_without_upgrade_mints_no_session() {
        let state = AppState::new(test_config());

        for _ in 0..5 {
            let response = send(
                &state,
                Request::builder()
                    .uri("/ws")
                    .header("Origin", "http://localhost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
            assert!(response.status().is_client_error());
        }

        assert_eq!(state.sessions.session_count().await, 0);
        assert_eq!(state.gateway.connections_from(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), 0);
    }

    // ========================================================================
    // SSE tests
    // ========================================================================

    #[tokio::test]
    async fn sse_unknown_resource_is_not_found() {
        let state = AppState::new(test_config());

        let response = send(
            &state,
            Request::builder()
                .uri("/resources/dare-404/stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sse_replays_history() {
        let state = AppState::new(test_config());
        state.directory.register("dare-1", Visibility::Public);
        state.bus.publish(
            "dare.created",
            PublishRequest::for_resource("dare-1", json!({"title": "Sing"})),
        );

        let response = send(
            &state,
            Request::builder()
                .uri("/resources/dare-1/stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        let body = read_sse_until(response, "Sing").await;
        assert!(body.contains("dare.created"));
        assert!(body.contains("\"title\":\"Sing\""));
    }

    #[tokio::test]
    async fn sse_restricted_resource_needs_associated_session() {
        let state = AppState::new(test_config());
        let established = state.sessions.establish(None).await.unwrap();
        state.directory.register("dare-1", Visibility::Restricted);
        state.directory.associate("dare-1", established.identity.id.clone());

        let anonymous = send(
            &state,
            Request::builder()
                .uri("/resources/dare-1/stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(anonymous.status(), StatusCode::FORBIDDEN);

        let associated = send(
            &state,
            Request::builder()
                .uri("/resources/dare-1/stream")
                .header(COOKIE, format!("darecast_session={}", established.session.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(associated.status(), StatusCode::OK);
    }

    // ========================================================================
    // POST /internal/events tests
    // ========================================================================

    #[tokio::test]
    async fn publish_requires_bearer_token() {
        let state = AppState::new(test_config());
        let body = json!({"type": "dare.created", "resourceId": "dare-1"});

        let missing = send(&state, publish_request(None, body.clone())).await;
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = send(&state, publish_request(Some("nope"), body)).await;
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        assert!(state.event_log.events_for("dare-1").is_empty());
    }

    #[tokio::test]
    async fn publish_accepts_single_event() {
        let state = AppState::new(test_config());
        let body = json!({"type": "dare.created", "resourceId": "dare-1", "payload": {"n": 1}});

        let response = send(&state, publish_request(Some(TOKEN), body)).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let published: PublishedResponse = json_body(response).await;
        let history = state.event_log.events_for("dare-1");
        assert_eq!(published.ids, vec![history[0].id.clone()]);
        assert_eq!(history[0].payload, json!({"n": 1}));
        assert!(state.directory.contains("dare-1"));
    }

    #[tokio::test]
    async fn publish_accepts_batch_in_order() {
        let state = AppState::new(test_config());
        let body = json!([
            {"type": "dare.created", "resourceId": "dare-1"},
            {"type": "dare.accepted", "resourceId": "dare-1"},
            {"type": "system.notice", "payload": {"text": "maintenance"}}
        ]);

        let response = send(&state, publish_request(Some(TOKEN), body)).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let published: PublishedResponse = json_body(response).await;
        assert_eq!(published.ids.len(), 3);

        let types: Vec<_> = state
            .event_log
            .events_for("dare-1")
            .into_iter()
            .map(|event| event.event_type)
            .collect();
        assert_eq!(types, vec!["dare.created", "dare.accepted"]);
    }

    #[tokio::test]
    async fn publish_rejects_invalid_input() {
        let state = AppState::new(test_config());

        let bad_json = Request::builder()
            .method("POST")
            .uri("/internal/events")
            .header(AUTHORIZATION, format!("Bearer {TOKEN}"))
            .body(Body::from("not valid json"))
            .unwrap();
        assert_eq!(send(&state, bad_json).await.status(), StatusCode::BAD_REQUEST);

        let bad_type = json!({"type": "has space", "resourceId": "dare-1"});
        assert_eq!(
            send(&state, publish_request(Some(TOKEN), bad_type)).await.status(),
            StatusCode::BAD_REQUEST
        );

        let long_id = "x".repeat(129);
        let bad_resource = json!({"type": "dare.created", "resourceId": long_id});
        assert_eq!(
            send(&state, publish_request(Some(TOKEN), bad_resource)).await.status(),
            StatusCode::BAD_REQUEST
        );

        let empty = json!([]);
        assert_eq!(
            send(&state, publish_request(Some(TOKEN), empty)).await.status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn internal_routes_absent_without_publisher_token() {
        let state = AppState::new(Config::default());
        let body = json!({"type": "dare.created", "resourceId": "dare-1"});

        let response = send(&state, publish_request(Some(TOKEN), body)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    // ========================================================================
    // PUT /internal/resources tests
    // ========================================================================

    #[tokio::test]
    async fn register_resource_sets_visibility_and_associations() {
        let state = AppState::new(test_config());

        let response = send(
            &state,
            Request::builder()
                .method("PUT")
                .uri("/internal/resources/dare-7")
                .header(AUTHORIZATION, format!("Bearer {TOKEN}"))
                .body(Body::from(
                    json!({"visibility": "restricted", "associatedIdentities": ["usr_a"]})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        assert_eq!(
            state.directory.can_view(Some("usr_a"), "dare-7").await.unwrap(),
            Access::Allowed
        );
        assert_eq!(
            state.directory.can_view(Some("usr_b"), "dare-7").await.unwrap(),
            Access::Denied
        );
    }

    #[tokio::test]
    async fn register_resource_requires_bearer_token() {
        let state = AppState::new(test_config());

        let response = send(
            &state,
            Request::builder()
                .method("PUT")
                .uri("/internal/resources/dare-7")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(!state.directory.contains("dare-7"));
    }

    // ========================================================================
    // Client address
    // ========================================================================

    #[test]
    fn forwarded_for_takes_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_FORWARDED_FOR, "198.51.100.4, 10.0.0.1".parse().unwrap());
        assert_eq!(
            forwarded_for(&headers),
            Some(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 4)))
        );

        headers.insert(HEADER_FORWARDED_FOR, "garbage".parse().unwrap());
        assert_eq!(forwarded_for(&headers), None);
    }
}
