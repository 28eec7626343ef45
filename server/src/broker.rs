//! Redis pub/sub fanout for multi-instance deployments.
//!
//! Every locally published event is wrapped in an envelope carrying the
//! publishing instance's id and published on a single Redis channel. Each
//! instance subscribes to that channel and feeds envelopes from *other*
//! instances into its local dispatch, so a local handler never sees the same
//! event twice.
//!
//! Outbound publishing never blocks the caller of
//! [`EventBus::publish`](crate::bus::EventBus::publish): envelopes go through a
//! bounded queue drained by a background task. When the queue is full the
//! remote copy is dropped with a warning; local delivery is unaffected.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use redis::aio::{ConnectionManager, PubSub};
use redis::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Fanout, LocalDispatch};
use crate::types::Event;

/// Redis channel every instance publishes to and subscribes on.
pub const CHANNEL: &str = "darecast:events";

/// Capacity of the outbound envelope queue.
const OUTBOUND_QUEUE_CAPACITY: usize = 4096;

const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(250);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Errors establishing the broker connection.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker URL could not be parsed.
    #[error("invalid broker URL: {0}")]
    InvalidUrl(#[source] redis::RedisError),

    /// The broker could not be reached.
    #[error("failed to connect to broker: {0}")]
    Connect(#[source] redis::RedisError),
}

#[derive(Serialize)]
struct OutboundEnvelope<'a> {
    origin: &'a str,
    event: &'a Event,
}

#[derive(Deserialize)]
struct InboundEnvelope {
    origin: String,
    event: Event,
}

/// Encodes an event for the broker channel.
fn encode_envelope(origin: &str, event: &Event) -> serde_json::Result<String> {
    serde_json::to_string(&OutboundEnvelope { origin, event })
}

/// Decodes a broker message, returning the event unless this instance
/// originated it.
fn decode_envelope(payload: &str, instance_id: &str) -> Option<Event> {
    match serde_json::from_str::<InboundEnvelope>(payload) {
        Ok(envelope) if envelope.origin == instance_id => None,
        Ok(envelope) => Some(envelope.event),
        Err(err) => {
            warn!(error = %err, "Discarding malformed broker envelope");
            None
        }
    }
}

/// Fanout strategy backed by Redis pub/sub.
pub struct RedisFanout {
    instance_id: Arc<str>,
    outbound: mpsc::Sender<String>,
    shutdown: CancellationToken,
}

impl RedisFanout {
    /// Connects to the broker and starts the publish and subscribe tasks.
    ///
    /// Remote events are delivered into `dispatch`.
    pub(crate) async fn connect(
        url: &str,
        instance_id: &Arc<str>,
        dispatch: Arc<LocalDispatch>,
    ) -> Result<Self, BrokerError> {
        let client = Client::open(url).map_err(BrokerError::InvalidUrl)?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(BrokerError::Connect)?;
        pubsub
            .subscribe(CHANNEL)
            .await
            .map_err(BrokerError::Connect)?;

        let connection = client
            .get_connection_manager()
            .await
            .map_err(BrokerError::Connect)?;

        let shutdown = CancellationToken::new();
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

        tokio::spawn(publish_loop(connection, queue, shutdown.clone()));
        tokio::spawn(subscribe_loop(
            client,
            pubsub,
            Arc::clone(instance_id),
            dispatch,
            shutdown.clone(),
        ));

        info!(channel = CHANNEL, instance_id = %instance_id, "Connected to event broker");

        Ok(Self {
            instance_id: Arc::clone(instance_id),
            outbound,
            shutdown,
        })
    }
}

impl Fanout for RedisFanout {
    fn forward(&self, event: &Event) {
        let envelope = match encode_envelope(&self.instance_id, event) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(event_id = %event.id, error = %err, "Failed to encode broker envelope");
                return;
            }
        };

        if let Err(err) = self.outbound.try_send(envelope) {
            warn!(
                event_id = %event.id,
                error = %err,
                "Broker queue unavailable, dropping remote copy"
            );
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

impl Drop for RedisFanout {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn publish_loop(
    mut connection: ConnectionManager,
    mut queue: mpsc::Receiver<String>,
    shutdown: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = queue.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        let result = redis::cmd("PUBLISH")
            .arg(CHANNEL)
            .arg(envelope)
            .query_async::<i64>(&mut connection)
            .await;

        match result {
            Ok(receivers) => debug!(receivers, "Published envelope to broker"),
            Err(err) => warn!(error = %err, "Broker publish failed"),
        }
    }

    debug!("Broker publish loop stopped");
}

async fn subscribe_loop(
    client: Client,
    first: PubSub,
    instance_id: Arc<str>,
    dispatch: Arc<LocalDispatch>,
    shutdown: CancellationToken,
) {
    let mut pending = Some(first);
    let mut delay = RECONNECT_BASE_DELAY;

    loop {
        let result = match pending.take() {
            Some(pubsub) => pump(pubsub, &instance_id, &dispatch, &shutdown).await,
            None => match open_subscription(&client).await {
                Ok(pubsub) => {
                    info!(channel = CHANNEL, "Re-subscribed to event broker");
                    delay = RECONNECT_BASE_DELAY;
                    pump(pubsub, &instance_id, &dispatch, &shutdown).await
                }
                Err(err) => Err(err),
            },
        };

        if shutdown.is_cancelled() {
            break;
        }

        match result {
            Ok(()) => warn!("Broker subscription ended, reconnecting"),
            Err(err) => warn!(error = %err, retry_in_ms = delay.as_millis() as u64, "Broker subscription failed"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(RECONNECT_MAX_DELAY);
    }

    debug!("Broker subscribe loop stopped");
}

async fn open_subscription(client: &Client) -> anyhow::Result<PubSub> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .context("opening pub/sub connection")?;
    pubsub
        .subscribe(CHANNEL)
        .await
        .context("subscribing to broker channel")?;
    Ok(pubsub)
}

async fn pump(
    pubsub: PubSub,
    instance_id: &str,
    dispatch: &LocalDispatch,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let mut messages = pubsub.into_on_message();

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            next = messages.next() => match next {
                Some(message) => message,
                None => return Ok(()),
            },
        };

        let payload: String = message
            .get_payload()
            .context("reading broker message payload")?;

        if let Some(event) = decode_envelope(&payload, instance_id) {
            debug!(event_id = %event.id, event_type = %event.event_type, "Received remote event");
            dispatch.deliver(&event);
        }
    }
}
