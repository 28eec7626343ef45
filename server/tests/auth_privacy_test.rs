//! Privacy tests for credentials in logs.
//!
//! Session tokens and the publisher token must never appear in log output,
//! even at TRACE level.
//!
//! # Test Approach
//!
//! 1. Capture events and span fields, through a custom Layer and through the
//!    JSON formatter the binary installs
//! 2. Exercise session, gateway, and publish code paths
//! 3. Verify that the secrets do NOT appear in captured logs

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use tower::ServiceExt;
use tracing::{span, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use darecast_server::config::Config;
use darecast_server::directory::Visibility;
use darecast_server::gateway::{UpgradeRequest, SESSION_COOKIE};
use darecast_server::routes::{create_router, AppState};
use darecast_server::session::{SessionManager, SessionOutcome, SessionPolicy, TOKEN_LENGTH};

// ============================================================================
// Log Capture Infrastructure
// ============================================================================

/// A buffer for capturing log output during tests.
#[derive(Clone, Default)]
struct LogCapture {
    logs: Arc<Mutex<Vec<String>>>,
}

impl LogCapture {
    /// Returns all captured log messages joined into a single string.
    fn get_logs(&self) -> String {
        self.logs.lock().unwrap().join("\n")
    }
}

/// A tracing Layer that captures log events for inspection.
struct CaptureLayer {
    capture: LogCapture,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = StringVisitor::default();
        event.record(&mut visitor);

        let message = format!(
            "[{}] {}: {}",
            event.metadata().level(),
            event.metadata().target(),
            visitor.parts.join(" ")
        );

        self.capture.logs.lock().unwrap().push(message);
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, _id: &span::Id, _ctx: Context<'_, S>) {
        let mut visitor = StringVisitor::default();
        attrs.record(&mut visitor);

        let message = format!(
            "[{}] span {}: {}",
            attrs.metadata().level(),
            attrs.metadata().name(),
            visitor.parts.join(" ")
        );

        self.capture.logs.lock().unwrap().push(message);
    }

    fn on_record(&self, _id: &span::Id, values: &span::Record<'_>, _ctx: Context<'_, S>) {
        let mut visitor = StringVisitor::default();
        values.record(&mut visitor);
        self.capture.logs.lock().unwrap().push(visitor.parts.join(" "));
    }
}

/// A visitor that collects all event fields into strings.
#[derive(Default)]
struct StringVisitor {
    parts: Vec<String>,
}

impl tracing::field::Visit for StringVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.parts.push(format!("{}={:?}", field.name(), value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.parts.push(format!("{}={}", field.name(), value));
    }
}

/// Runs an async test body with log capture at TRACE level.
///
/// Returns the captured logs for assertion.
async fn with_log_capture<F, Fut>(test_fn: F) -> String
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let capture = LogCapture::default();
    let layer = CaptureLayer {
        capture: capture.clone(),
    };

    let subscriber = tracing_subscriber::registry()
        .with(layer.with_filter(tracing_subscriber::filter::LevelFilter::TRACE));

    let _guard = tracing::subscriber::set_default(subscriber);
    test_fn().await;

    capture.get_logs()
}

/// A writer that appends formatted output to a shared buffer.
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Runs an async test body under the binary's JSON formatter, with span
/// fields included, at TRACE level.
async fn with_json_log_capture<F, Fut>(test_fn: F) -> String
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let buffer = SharedBuffer::default();
    let writer = buffer.clone();

    let subscriber = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new("trace"))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(move || writer.clone()),
        );

    let _guard = tracing::subscriber::set_default(subscriber);
    test_fn().await;

    let bytes = buffer.0.lock().unwrap().clone();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Asserts that the given secret does not appear in the logs.
fn assert_secret_not_in_logs(logs: &str, secret: &str, context: &str) {
    assert!(
        !logs.contains(secret),
        "Secret found in logs during {context}!\nSecret: {secret}\nLogs:\n{logs}"
    );
}

fn loopback() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

// ============================================================================
// Session Lifecycle
// ============================================================================

#[tokio::test]
async fn session_token_not_logged_on_issue() {
    let tokens = Arc::new(Mutex::new(Vec::new()));

    let captured = Arc::clone(&tokens);
    let logs = with_log_capture(|| async move {
        let sessions = SessionManager::in_memory(SessionPolicy::default());
        for _ in 0..3 {
            let established = sessions.establish(None).await.unwrap();
            assert_eq!(established.outcome, SessionOutcome::Issued);
            assert_eq!(established.session.id.len(), TOKEN_LENGTH);
            captured.lock().unwrap().push(established.session.id);
        }
    })
    .await;

    assert!(logs.contains("Issued new identity"), "expected issue log:\n{logs}");
    for token in tokens.lock().unwrap().iter() {
        assert_secret_not_in_logs(&logs, token, "session issue");
    }
}

#[tokio::test]
async fn session_token_not_logged_on_resume_and_identify() {
    let sessions = SessionManager::in_memory(SessionPolicy::default());
    let token = sessions.establish(None).await.unwrap().session.id;

    let logs = with_log_capture(|| {
        let sessions = sessions.clone();
        let token = token.clone();
        async move {
            let resumed = sessions.establish(Some(&token)).await.unwrap();
            assert_eq!(resumed.outcome, SessionOutcome::Resumed);
            assert!(sessions.identify(&token).await.unwrap().is_some());
        }
    })
    .await;

    assert_secret_not_in_logs(&logs, &token, "session resume");
}

#[tokio::test]
async fn session_tokens_not_logged_on_rotation() {
    let sessions = SessionManager::in_memory(SessionPolicy {
        ttl: Duration::from_secs(3600),
        rotate_after: Duration::ZERO,
    });
    let old_token = sessions.establish(None).await.unwrap().session.id;
    let new_token = Arc::new(Mutex::new(String::new()));

    let captured = Arc::clone(&new_token);
    let logs = with_log_capture(|| {
        let sessions = sessions.clone();
        let old_token = old_token.clone();
        async move {
            let rotated = sessions.establish(Some(&old_token)).await.unwrap();
            assert_eq!(rotated.outcome, SessionOutcome::Rotated);
            *captured.lock().unwrap() = rotated.session.id;
        }
    })
    .await;

    assert!(logs.contains("Session rotated"), "expected rotation log:\n{logs}");
    assert_secret_not_in_logs(&logs, &old_token, "session rotation (old token)");
    assert_secret_not_in_logs(&logs, &new_token.lock().unwrap(), "session rotation (new token)");
}

#[tokio::test]
async fn session_token_not_logged_on_expiry() {
    let sessions = SessionManager::in_memory(SessionPolicy {
        ttl: Duration::from_millis(5),
        rotate_after: Duration::from_secs(3600),
    });
    let token = sessions.establish(None).await.unwrap().session.id;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let logs = with_log_capture(|| {
        let sessions = sessions.clone();
        let token = token.clone();
        async move {
            let replaced = sessions.establish(Some(&token)).await.unwrap();
            assert_eq!(replaced.outcome, SessionOutcome::Issued);
            sessions.sweep_expired().await.unwrap();
        }
    })
    .await;

    assert_secret_not_in_logs(&logs, &token, "session expiry");
}

#[tokio::test]
async fn session_token_not_logged_on_revoke() {
    let sessions = SessionManager::in_memory(SessionPolicy::default());
    let token = sessions.establish(None).await.unwrap().session.id;

    let logs = with_log_capture(|| {
        let sessions = sessions.clone();
        let token = token.clone();
        async move {
            assert!(sessions.revoke(&token).await.unwrap());
            assert!(sessions.identify(&token).await.unwrap().is_none());
        }
    })
    .await;

    assert_secret_not_in_logs(&logs, &token, "session revoke");
}

#[tokio::test]
async fn presented_unknown_credentials_not_logged() {
    let unknown = "A".repeat(TOKEN_LENGTH);
    let garbage = "not-a-real-token-but-still-secret";

    let logs = with_log_capture(|| async move {
        let sessions = SessionManager::in_memory(SessionPolicy::default());
        sessions.establish(Some(&"A".repeat(TOKEN_LENGTH))).await.unwrap();
        sessions.establish(Some(garbage)).await.unwrap();
    })
    .await;

    assert_secret_not_in_logs(&logs, &unknown, "unknown credential");
    assert_secret_not_in_logs(&logs, garbage, "malformed credential");
}

#[test]
fn session_debug_does_not_leak_token() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let established = runtime.block_on(async {
        SessionManager::in_memory(SessionPolicy::default())
            .establish(None)
            .await
            .unwrap()
    });

    let debug = format!("{established:?}");
    assert!(!debug.contains(&established.session.id));
    assert!(debug.contains("<redacted>"));
}

// ============================================================================
// Gateway and Publish Paths
// ============================================================================

#[tokio::test]
async fn cookie_credential_not_logged_on_admission() {
    let state = AppState::new(Config::default());
    let token = state.sessions.establish(None).await.unwrap().session.id;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::COOKIE,
        HeaderValue::from_str(&format!("theme=dark; {SESSION_COOKIE}={token}")).unwrap(),
    );
    let request = UpgradeRequest::from_headers(loopback(), &headers, None);
    assert!(!format!("{request:?}").contains(&token));

    let logs = with_log_capture(|| {
        let gateway = state.gateway.clone();
        async move {
            let admission = gateway.admit(request).await.unwrap();
            assert_eq!(admission.established().outcome, SessionOutcome::Resumed);
            tracing::debug!(?admission, "Admitted");
        }
    })
    .await;

    assert!(logs.contains("Admitted"), "expected admission log:\n{logs}");
    assert_secret_not_in_logs(&logs, &token, "gateway admission");
}

#[tokio::test]
async fn publisher_token_not_logged_on_rejection() {
    let secret = "publisher-secret-value-7f3a";
    let wrong = "wrong-secret-value-91bc";
    let app = create_router(AppState::new(Config {
        publisher_token: Some(secret.to_string()),
        ..Config::default()
    }));

    let logs = with_log_capture(|| async move {
        for presented in [wrong, secret] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/internal/events")
                        .header(header::AUTHORIZATION, format!("Bearer {presented}"))
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(Body::from(r#"{"type":"dare.created","payload":{}}"#))
                        .unwrap(),
                )
                .await
                .unwrap();

            let expected = if presented == secret {
                StatusCode::ACCEPTED
            } else {
                StatusCode::UNAUTHORIZED
            };
            assert_eq!(response.status(), expected);
        }
    })
    .await;

    assert!(logs.contains("Rejected internal request"), "expected rejection log:\n{logs}");
    assert_secret_not_in_logs(&logs, secret, "publish");
    assert_secret_not_in_logs(&logs, wrong, "publish rejection");
}

#[tokio::test]
async fn query_credential_not_logged_in_request_spans() {
    let state = AppState::new(Config::default());
    state.directory.register("dare-1", Visibility::Public);
    let token = state.sessions.establish(None).await.unwrap().session.id;
    let app = create_router(state);

    let logs = with_json_log_capture(|| {
        let token = token.clone();
        async move {
            for uri in [
                format!("/resources/dare-1/stream?session={token}"),
                format!("/ws?session={token}"),
            ] {
                let response = app
                    .clone()
                    .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                    .await
                    .unwrap();
                drop(response);
            }
        }
    })
    .await;

    assert!(logs.contains("/resources/dare-1/stream"), "expected request span:\n{logs}");
    assert!(logs.contains("\"path\""), "expected path field:\n{logs}");
    assert_secret_not_in_logs(&logs, &token, "request tracing");
}
