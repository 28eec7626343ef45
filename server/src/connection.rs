//! A single WebSocket connection: outbound queue, read loop, and teardown.
//!
//! # State machine
//!
//! `Connecting -> Open -> Closing -> Closed`. A connection is `Connecting`
//! while the upgrade completes, `Open` once it is registered with the room
//! registry, `Closing` as soon as anything decides to end it, and `Closed`
//! after the writer has finished and every registration has been released.
//!
//! # Outbound path
//!
//! Every frame for the client goes through a bounded queue drained by a
//! dedicated writer task. Broadcasts never wait on the queue: if it is full,
//! or the bytes it holds exceed the configured limit, delivery fails with
//! backpressure and the connection is closed. History replay is the one
//! producer that waits for queue space, since it runs on the connection's own
//! task.
//!
//! # Closing
//!
//! Closing cancels the connection's shutdown token. The writer stops sending
//! queued frames, sends the pending error frame if there is one, and then a
//! close frame carrying the close reason.

use std::collections::HashSet;
use std::net::IpAddr;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::directory::Access;
use crate::gateway::Gateway;
use crate::ip_limit::IpSlot;
use crate::rooms::{Broadcast, DeliveryError, RoomRegistry, RoomSink, Transport};
use crate::session::Identity;
use crate::types::{
    is_valid_resource_id, ClientFrame, CloseReason, ErrorCode, RelayedEvent, ServerFrame,
};

/// How long teardown waits for the writer to flush the close frame.
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug)]
enum Outbound {
    Text(Utf8Bytes),
    Ping(Bytes),
}

/// Shared handle to one connection, registered in the room registry.
pub struct ConnectionHandle {
    id: u64,
    ip: IpAddr,
    identity: Identity,
    outbound: mpsc::Sender<Outbound>,
    buffered_bytes: AtomicUsize,
    max_buffered_bytes: usize,
    state: AtomicU8,
    close_reason: OnceLock<CloseReason>,
    farewell: Mutex<Option<Utf8Bytes>>,
    shutdown: CancellationToken,
    last_seen: Mutex<Instant>,
    subscriptions: Mutex<HashSet<String>>,
}

impl ConnectionHandle {
    fn new(
        id: u64,
        ip: IpAddr,
        identity: Identity,
        max_pending_sends: usize,
        max_buffered_bytes: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (outbound, queue) = mpsc::channel(max_pending_sends.max(1));
        let handle = Arc::new(Self {
            id,
            ip,
            identity,
            outbound,
            buffered_bytes: AtomicUsize::new(0),
            max_buffered_bytes,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            close_reason: OnceLock::new(),
            farewell: Mutex::new(None),
            shutdown: CancellationToken::new(),
            last_seen: Mutex::new(Instant::now()),
            subscriptions: Mutex::new(HashSet::new()),
        });
        (handle, queue)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.fetch_max(state as u8, Ordering::AcqRel);
    }

    /// Frames queued but not yet written.
    pub fn pending_sends(&self) -> usize {
        self.outbound.max_capacity() - self.outbound.capacity()
    }

    /// Bytes of text frames queued but not yet written.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes.load(Ordering::Acquire)
    }

    /// Queues a text frame without waiting.
    fn enqueue(&self, text: Utf8Bytes) -> Result<(), DeliveryError> {
        if self.shutdown.is_cancelled() {
            return Err(DeliveryError::Closed);
        }

        let len = text.len();
        let buffered = self.buffered_bytes.fetch_add(len, Ordering::AcqRel) + len;
        if buffered > self.max_buffered_bytes {
            self.buffered_bytes.fetch_sub(len, Ordering::AcqRel);
            return Err(DeliveryError::Backpressure);
        }

        match self.outbound.try_send(Outbound::Text(text)) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.buffered_bytes.fetch_sub(len, Ordering::AcqRel);
                Err(match err {
                    TrySendError::Full(_) => DeliveryError::Backpressure,
                    TrySendError::Closed(_) => DeliveryError::Closed,
                })
            }
        }
    }

    /// Queues a replayed event, waiting for queue space.
    async fn send_replay(&self, text: Utf8Bytes) -> Result<(), DeliveryError> {
        let len = text.len();
        self.buffered_bytes.fetch_add(len, Ordering::AcqRel);

        let sent = tokio::select! {
            _ = self.shutdown.cancelled() => false,
            result = self.outbound.send(Outbound::Text(text)) => result.is_ok(),
        };

        if sent {
            Ok(())
        } else {
            self.buffered_bytes.fetch_sub(len, Ordering::AcqRel);
            Err(DeliveryError::Closed)
        }
    }

    fn send_frame(&self, frame: &ServerFrame<'_>) -> Result<(), DeliveryError> {
        self.enqueue(encode_frame(frame))
    }

    fn send_ping(&self) {
        if self.outbound.try_send(Outbound::Ping(Bytes::new())).is_err() {
            trace!(connection_id = self.id, "Skipped transport ping, queue full");
        }
    }

    /// Starts closing the connection. The first reason wins.
    pub fn close(&self, reason: CloseReason) {
        if self.close_reason.set(reason).is_ok() {
            debug!(
                connection_id = self.id,
                code = reason.code(),
                reason = reason.as_str(),
                "Closing WebSocket connection"
            );
        }
        self.set_state(ConnectionState::Closing);
        self.shutdown.cancel();
    }

    /// Sends an error frame ahead of the close frame, then closes.
    fn fail(&self, error: ErrorCode, resource_id: Option<&str>, reason: CloseReason) {
        if self.close_reason.get().is_some() {
            return;
        }
        let frame = encode_frame(&ServerFrame::Error { error, resource_id });
        *self.farewell.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
        self.close(reason);
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn is_subscribed(&self, resource_id: &str) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(resource_id)
    }

    /// Number of rooms this connection has joined.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn add_subscription(&self, resource_id: &str) {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource_id.to_string());
    }

    fn remove_subscription(&self, resource_id: &str) {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(resource_id);
    }

    fn take_subscriptions(&self) -> HashSet<String> {
        std::mem::take(&mut *self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl RoomSink for ConnectionHandle {
    fn sink_id(&self) -> u64 {
        self.id
    }

    fn transport(&self) -> Transport {
        Transport::WebSocket
    }

    fn deliver(&self, broadcast: &Arc<Broadcast>) -> Result<(), DeliveryError> {
        self.enqueue(broadcast.text.clone())
    }

    fn close(&self, reason: CloseReason) {
        ConnectionHandle::close(self, reason);
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("ip", &self.ip)
            .field("identity_id", &self.identity.id)
            .field("state", &self.state())
            .field("pending_sends", &self.pending_sends())
            .field("buffered_bytes", &self.buffered_bytes())
            .finish()
    }
}

fn encode_frame(frame: &ServerFrame<'_>) -> Utf8Bytes {
    serde_json::to_string(frame).unwrap_or_default().into()
}

/// Releases every registry entry for a connection when dropped.
struct Registration {
    registry: Arc<RoomRegistry>,
    handle: Arc<ConnectionHandle>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        for resource_id in self.handle.take_subscriptions() {
            self.registry.leave(&resource_id, self.handle.id);
        }
        self.registry.unregister_open(self.handle.id);
    }
}

/// Drives one upgraded socket until it closes.
pub(crate) struct Connection {
    gateway: Gateway,
    handle: Arc<ConnectionHandle>,
    rate_key: String,
}

impl Connection {
    pub(crate) async fn run(
        gateway: Gateway,
        socket: WebSocket,
        id: u64,
        slot: IpSlot,
        identity: Identity,
    ) {
        let settings = gateway.settings().clone();
        let ip = slot.ip();
        let (handle, queue) = ConnectionHandle::new(
            id,
            ip,
            identity,
            settings.max_pending_sends,
            settings.max_buffered_bytes,
        );

        let (sink, stream) = socket.split();
        let mut writer = tokio::spawn(write_loop(sink, queue, Arc::clone(&handle)));

        let registry = Arc::clone(gateway.registry());
        registry.register_open(handle.clone());
        let registration = Registration {
            registry,
            handle: Arc::clone(&handle),
        };
        handle.set_state(ConnectionState::Open);

        info!(
            connection_id = id,
            %ip,
            identity_id = %handle.identity.id,
            "WebSocket client connected"
        );

        let connection = Connection {
            gateway,
            handle: Arc::clone(&handle),
            rate_key: format!("ws:{ip}"),
        };
        connection.read_loop(stream, settings.ping_interval, settings.idle_timeout).await;

        handle.set_state(ConnectionState::Closing);
        handle.shutdown.cancel();
        drop(registration);

        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer).await.is_err() {
            debug!(connection_id = id, "Writer did not finish in time, aborting");
            writer.abort();
        }

        handle.set_state(ConnectionState::Closed);
        drop(slot);

        info!(
            connection_id = id,
            %ip,
            close_code = handle.close_reason.get().map(|reason| reason.code()),
            "WebSocket client disconnected"
        );
    }

    async fn read_loop(
        &self,
        mut stream: SplitStream<WebSocket>,
        ping_interval: Duration,
        idle_timeout: Duration,
    ) {
        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.handle.shutdown.cancelled() => break,
                _ = heartbeat.tick() => {
                    if self.handle.idle_for() > idle_timeout {
                        debug!(connection_id = self.handle.id, "No pong within idle window");
                        self.handle.close(CloseReason::IdleTimeout);
                        break;
                    }
                    self.handle.send_ping();
                }
                incoming = stream.next() => {
                    let message = match incoming {
                        Some(Ok(message)) => message,
                        Some(Err(err)) => {
                            debug!(connection_id = self.handle.id, error = %err, "WebSocket read error");
                            break;
                        }
                        None => break,
                    };
                    if self.on_message(message).await.is_break() {
                        break;
                    }
                }
            }
        }
    }

    async fn on_message(&self, message: Message) -> ControlFlow<()> {
        self.handle.touch();

        let text = match message {
            Message::Text(text) => Some(text),
            Message::Binary(_) => None,
            Message::Pong(_) | Message::Ping(_) => return ControlFlow::Continue(()),
            Message::Close(_) => {
                debug!(connection_id = self.handle.id, "WebSocket client sent close frame");
                return ControlFlow::Break(());
            }
        };

        let settings = self.gateway.settings();
        let allowed = self
            .gateway
            .rate_limiter()
            .consume(
                &self.rate_key,
                settings.message_rate_per_minute,
                settings.message_burst,
                1,
            )
            .await;
        if !allowed {
            warn!(connection_id = self.handle.id, ip = %self.handle.ip, "Inbound rate limit exceeded");
            self.handle
                .fail(ErrorCode::RateLimited, None, CloseReason::RateLimited);
            return ControlFlow::Break(());
        }

        let frame = text.and_then(|text| serde_json::from_str::<ClientFrame>(text.as_str()).ok());
        match frame {
            Some(ClientFrame::Sub { resource_id }) => self.subscribe(&resource_id).await,
            Some(ClientFrame::Ping) => {
                let pong = ServerFrame::Pong {
                    at: Utc::now().timestamp_millis(),
                };
                self.reply(&pong)
            }
            None => {
                debug!(connection_id = self.handle.id, "Malformed client frame");
                self.handle
                    .fail(ErrorCode::MalformedFrame, None, CloseReason::MalformedFrame);
                ControlFlow::Break(())
            }
        }
    }

    fn reply(&self, frame: &ServerFrame<'_>) -> ControlFlow<()> {
        match self.handle.send_frame(frame) {
            Ok(()) => ControlFlow::Continue(()),
            Err(DeliveryError::Backpressure) => {
                self.handle.close(CloseReason::Backpressure);
                ControlFlow::Break(())
            }
            Err(DeliveryError::Closed) => ControlFlow::Break(()),
        }
    }

    async fn subscribe(&self, resource_id: &str) -> ControlFlow<()> {
        let handle = &self.handle;

        if !is_valid_resource_id(resource_id) {
            handle.fail(ErrorCode::MalformedFrame, None, CloseReason::MalformedFrame);
            return ControlFlow::Break(());
        }

        if handle.is_subscribed(resource_id) {
            return self.reply(&ServerFrame::Subscribed { resource_id });
        }

        if handle.subscription_count() >= self.gateway.settings().max_subscriptions {
            return self.reply(&ServerFrame::Error {
                error: ErrorCode::TooManySubscriptions,
                resource_id: Some(resource_id),
            });
        }

        let access = self
            .gateway
            .access()
            .can_view(Some(&handle.identity.id), resource_id)
            .await;
        match access {
            Ok(Access::Allowed) => {}
            Ok(Access::NotFound) => {
                debug!(connection_id = handle.id, resource_id, "Subscribe to unknown room");
                handle.fail(ErrorCode::NoSuchRoom, Some(resource_id), CloseReason::Unauthorized);
                return ControlFlow::Break(());
            }
            Ok(Access::Denied) => {
                warn!(
                    connection_id = handle.id,
                    identity_id = %handle.identity.id,
                    resource_id,
                    "Unauthorized subscribe attempt"
                );
                handle.fail(ErrorCode::Forbidden, Some(resource_id), CloseReason::Unauthorized);
                return ControlFlow::Break(());
            }
            Err(err) => {
                warn!(resource_id, error = %err, "Access check failed");
                return self.reply(&ServerFrame::Error {
                    error: ErrorCode::Unavailable,
                    resource_id: Some(resource_id),
                });
            }
        }

        let registry = self.gateway.registry();
        handle.add_subscription(resource_id);
        registry.join_buffered(resource_id, handle.clone());

        let history = match self.gateway.history().history_for(resource_id).await {
            Ok(history) => history,
            Err(err) => {
                warn!(resource_id, error = %err, "History lookup failed");
                registry.leave(resource_id, handle.id);
                handle.remove_subscription(resource_id);
                return self.reply(&ServerFrame::Error {
                    error: ErrorCode::Unavailable,
                    resource_id: Some(resource_id),
                });
            }
        };

        let mut replayed = HashSet::with_capacity(history.len());
        for event in &history {
            let text = match serde_json::to_string(&RelayedEvent::from(event)) {
                Ok(text) => text,
                Err(err) => {
                    warn!(event_id = %event.id, error = %err, "Skipping unencodable history event");
                    continue;
                }
            };
            if handle.send_replay(text.into()).await.is_err() {
                return ControlFlow::Break(());
            }
            replayed.insert(event.id.clone());
        }

        let ack = encode_frame(&ServerFrame::Subscribed { resource_id });
        match registry.go_live(resource_id, handle.id, &replayed, || handle.enqueue(ack)) {
            Ok(flushed) => {
                debug!(
                    connection_id = handle.id,
                    resource_id,
                    replayed = replayed.len(),
                    flushed,
                    "Subscription live"
                );
                ControlFlow::Continue(())
            }
            Err(DeliveryError::Backpressure) => {
                handle.close(CloseReason::Backpressure);
                ControlFlow::Break(())
            }
            Err(DeliveryError::Closed) => ControlFlow::Break(()),
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<Outbound>,
    handle: Arc<ConnectionHandle>,
) {
    loop {
        let outbound = tokio::select! {
            biased;
            _ = handle.shutdown.cancelled() => break,
            next = queue.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };

        let (message, len) = match outbound {
            Outbound::Text(text) => {
                let len = text.len();
                (Message::Text(text), len)
            }
            Outbound::Ping(payload) => (Message::Ping(payload), 0),
        };

        let result = sink.send(message).await;
        handle.buffered_bytes.fetch_sub(len, Ordering::AcqRel);

        if let Err(err) = result {
            debug!(connection_id = handle.id, error = %err, "WebSocket write failed");
            handle.shutdown.cancel();
            return;
        }
    }

    let farewell = handle
        .farewell
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(text) = farewell {
        if sink.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    let frame = handle.close_reason.get().map(|reason| CloseFrame {
        code: reason.code(),
        reason: Utf8Bytes::from_static(reason.as_str()),
    });
    if sink.send(Message::Close(frame)).await.is_ok() {
        let _ = sink.close().await;
    }
}
