//! Server-sent events: a one-way, per-resource alternative to the WebSocket.
//!
//! An SSE client is a [`RoomSink`] like any WebSocket connection. On connect
//! the stream replays the resource's history in order, then carries live
//! events for that resource interleaved with periodic `heartbeat` events.
//! Each SSE event is named after the domain event type and carries the same
//! `{type, resourceId, payload}` JSON a WebSocket client receives.

use std::collections::HashSet;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::response::sse::Event as SseEvent;
use chrono::Utc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_stream::wrappers::{IntervalStream, ReceiverStream};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directory::{Access, CollaboratorError};
use crate::error::ServerError;
use crate::gateway::Gateway;
use crate::rooms::{Broadcast, DeliveryError, RoomRegistry, RoomSink, Transport, REPLAY_BUFFER_LIMIT};
use crate::session::Identity;
use crate::types::{is_valid_event_type, is_valid_resource_id, CloseReason, Event, RelayedEvent};

/// Name of the synthetic keep-alive event.
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// The body of an SSE response.
pub type SseStream = Pin<Box<dyn Stream<Item = Result<SseEvent, Infallible>> + Send>>;

struct SseSink {
    id: u64,
    queue: mpsc::Sender<Arc<Broadcast>>,
    shutdown: CancellationToken,
}

impl RoomSink for SseSink {
    fn sink_id(&self) -> u64 {
        self.id
    }

    fn transport(&self) -> Transport {
        Transport::Sse
    }

    fn deliver(&self, broadcast: &Arc<Broadcast>) -> Result<(), DeliveryError> {
        if self.shutdown.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.queue
            .try_send(Arc::clone(broadcast))
            .map_err(|err| match err {
                TrySendError::Full(_) => DeliveryError::Backpressure,
                TrySendError::Closed(_) => DeliveryError::Closed,
            })
    }

    fn close(&self, reason: CloseReason) {
        debug!(sink_id = self.id, reason = reason.as_str(), "Closing SSE stream");
        self.shutdown.cancel();
    }
}

/// Removes an SSE sink from the registry when the response stream drops.
struct SseRegistration {
    registry: Arc<RoomRegistry>,
    sink_id: u64,
    resource_id: String,
}

impl Drop for SseRegistration {
    fn drop(&mut self) {
        self.registry.leave(&self.resource_id, self.sink_id);
        self.registry.unregister_open(self.sink_id);
        debug!(sink_id = self.sink_id, resource_id = %self.resource_id, "SSE client disconnected");
    }
}

/// Opens an event stream for `resource_id`.
///
/// `identity` is the caller's identity if it presented an active session.
///
/// # Errors
///
/// - [`ServerError::RealtimeDisabled`] if realtime delivery is off
/// - [`ServerError::Validation`] for a malformed resource id
/// - [`ServerError::NotFound`] / [`ServerError::Forbidden`] from the access policy
/// - [`ServerError::Unavailable`] if the access policy or history fails
pub async fn open_stream(
    gateway: &Gateway,
    resource_id: &str,
    identity: Option<&Identity>,
) -> Result<SseStream, ServerError> {
    let settings = gateway.settings();
    if !settings.realtime_enabled {
        return Err(ServerError::RealtimeDisabled);
    }
    if !is_valid_resource_id(resource_id) {
        return Err(ServerError::validation("invalid resource id"));
    }

    let identity_id = identity.map(|identity| identity.id.as_str());
    match gateway.access().can_view(identity_id, resource_id).await? {
        Access::Allowed => {}
        Access::NotFound => return Err(ServerError::NotFound(resource_id.to_string())),
        Access::Denied => {
            warn!(identity_id = ?identity_id, resource_id, "Unauthorized SSE subscribe attempt");
            return Err(ServerError::Forbidden(resource_id.to_string()));
        }
    }

    let sink_id = gateway.next_sink_id();
    // Room for a full replay buffer on top of the steady-state limit.
    let (queue, live) = mpsc::channel(settings.max_pending_sends.max(1) + REPLAY_BUFFER_LIMIT);
    let shutdown = CancellationToken::new();
    let sink = Arc::new(SseSink {
        id: sink_id,
        queue,
        shutdown: shutdown.clone(),
    });

    let registry = Arc::clone(gateway.registry());
    registry.register_open(sink.clone());
    registry.join_buffered(resource_id, sink);
    let registration = SseRegistration {
        registry: Arc::clone(&registry),
        sink_id,
        resource_id: resource_id.to_string(),
    };

    let history = gateway.history().history_for(resource_id).await?;
    let mut replayed = HashSet::with_capacity(history.len());
    let mut replay = Vec::with_capacity(history.len());
    for event in &history {
        match serde_json::to_string(&RelayedEvent::from(event)) {
            Ok(data) => replay.extend(to_sse_event(event, &data)),
            Err(err) => warn!(event_id = %event.id, error = %err, "Skipping unencodable history event"),
        }
        replayed.insert(event.id.clone());
    }

    let flushed = registry
        .go_live(resource_id, sink_id, &replayed, || Ok(()))
        .map_err(|err| CollaboratorError(format!("stream closed before going live: {err}")))?;

    info!(
        sink_id,
        resource_id,
        identity_id = ?identity_id,
        replayed = replay.len(),
        flushed,
        "SSE client connected"
    );

    let every = settings.sse_heartbeat;
    let heartbeats = IntervalStream::new(tokio::time::interval_at(Instant::now() + every, every))
        .map(|_| {
            SseEvent::default()
                .event(HEARTBEAT_EVENT)
                .data(Utc::now().timestamp_millis().to_string())
        });
    let live = ReceiverStream::new(live)
        .filter_map(|broadcast| to_sse_event(&broadcast.event, broadcast.text.as_str()));

    let events = tokio_stream::iter(replay).chain(live.merge(heartbeats));
    let events = futures_util::StreamExt::take_until(events, shutdown.cancelled_owned());
    let stream = events.map(move |event| {
        // Holds the room membership for as long as the client is reading.
        let _registration = &registration;
        Ok(event)
    });

    Ok(Box::pin(stream))
}

/// Builds the SSE event for a domain event, or `None` if its type or id
/// cannot appear in an SSE field.
fn to_sse_event(event: &Event, data: &str) -> Option<SseEvent> {
    if !is_valid_event_type(&event.event_type) || event.id.chars().any(char::is_control) {
        debug!(event_id = %event.id, "Skipping event that is not representable over SSE");
        return None;
    }

    Some(
        SseEvent::default()
            .event(&event.event_type)
            .id(&event.id)
            .data(data),
    )
}
