//! Room membership and broadcast for every delivery transport.
//!
//! A room is the implicit set of sinks subscribed to one resource id. Rooms
//! are created on first join and removed when their last member leaves.
//! WebSocket connections and SSE streams both implement [`RoomSink`] and are
//! registered in the same [`RoomRegistry`], so a bus event reaches every
//! transport through one code path.
//!
//! # Gap-free joins
//!
//! A sink joins a room in *buffering* mode ([`RoomRegistry::join_buffered`]).
//! While the caller replays history, live broadcasts for that room are queued
//! in the member's replay buffer instead of being delivered. When replay is
//! done, [`RoomRegistry::go_live`] flushes the buffer, skipping events that
//! were already replayed, and switches the member to direct delivery. The
//! flush happens under the room's lock, so no live event can overtake it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::Utf8Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::types::{CloseReason, Event, RelayedEvent};

/// Live events a member may accumulate while its history replays.
pub const REPLAY_BUFFER_LIMIT: usize = 1024;

/// An event prepared for fanout. Serialized once, shared by every recipient.
#[derive(Debug)]
pub struct Broadcast {
    pub event: Event,

    /// `{type, resourceId?, payload}` JSON.
    pub text: Utf8Bytes,
}

impl Broadcast {
    pub fn new(event: Event) -> serde_json::Result<Arc<Self>> {
        let text = serde_json::to_string(&RelayedEvent::from(&event))?;
        Ok(Arc::new(Self {
            event,
            text: text.into(),
        }))
    }
}

/// The transport behind a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    WebSocket,
    Sse,
}

/// Why a sink refused an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The sink's outbound queue is over its limits.
    #[error("outbound backpressure exceeded")]
    Backpressure,

    /// The sink is shutting down.
    #[error("sink closed")]
    Closed,
}

/// A subscriber that can receive room broadcasts.
pub trait RoomSink: Send + Sync {
    /// Identifier unique within one registry.
    fn sink_id(&self) -> u64;

    fn transport(&self) -> Transport;

    /// Queues a broadcast for sending. Must not block.
    fn deliver(&self, broadcast: &Arc<Broadcast>) -> Result<(), DeliveryError>;

    /// Starts closing the sink.
    fn close(&self, reason: CloseReason);
}

struct Member {
    sink: Arc<dyn RoomSink>,
    /// `Some` while history is being replayed.
    replay_buffer: Option<Vec<Arc<Broadcast>>>,
}

/// All open sinks and their room memberships.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<String, HashMap<u64, Member>>,
    open: DashMap<u64, Arc<dyn RoomSink>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink to the set of open sinks.
    pub fn register_open(&self, sink: Arc<dyn RoomSink>) {
        self.open.insert(sink.sink_id(), sink);
    }

    /// Removes a sink from the set of open sinks.
    pub fn unregister_open(&self, sink_id: u64) {
        self.open.remove(&sink_id);
    }

    /// Joins `resource_id` in buffering mode.
    ///
    /// Returns `false` if the sink is already a member.
    pub fn join_buffered(&self, resource_id: &str, sink: Arc<dyn RoomSink>) -> bool {
        let mut room = self.rooms.entry(resource_id.to_string()).or_default();
        let sink_id = sink.sink_id();
        if room.contains_key(&sink_id) {
            return false;
        }

        room.insert(
            sink_id,
            Member {
                sink,
                replay_buffer: Some(Vec::new()),
            },
        );
        trace!(resource_id, sink_id, "Joined room");
        true
    }

    /// Ends buffering for a member.
    ///
    /// Runs `before_flush` (the subscription acknowledgement), then delivers
    /// buffered events whose ids are not in `replayed`, all under the room
    /// lock.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Closed`] if the member has left, or the first error
    /// returned by `before_flush` or the sink.
    pub fn go_live<F>(
        &self,
        resource_id: &str,
        sink_id: u64,
        replayed: &HashSet<String>,
        before_flush: F,
    ) -> Result<usize, DeliveryError>
    where
        F: FnOnce() -> Result<(), DeliveryError>,
    {
        let mut room = self
            .rooms
            .get_mut(resource_id)
            .ok_or(DeliveryError::Closed)?;
        let member = room.get_mut(&sink_id).ok_or(DeliveryError::Closed)?;
        let buffered = member.replay_buffer.take().unwrap_or_default();

        before_flush()?;

        let mut flushed = 0;
        for broadcast in buffered
            .iter()
            .filter(|broadcast| !replayed.contains(&broadcast.event.id))
        {
            member.sink.deliver(broadcast)?;
            flushed += 1;
        }

        if buffered.len() > flushed {
            debug!(
                resource_id,
                sink_id,
                skipped = buffered.len() - flushed,
                "Dropped buffered events already covered by replay"
            );
        }
        Ok(flushed)
    }

    /// Leaves a room, removing it once empty.
    pub fn leave(&self, resource_id: &str, sink_id: u64) -> bool {
        let removed = self
            .rooms
            .get_mut(resource_id)
            .is_some_and(|mut room| room.remove(&sink_id).is_some());

        self.rooms.remove_if(resource_id, |_, room| room.is_empty());
        removed
    }

    /// Delivers a broadcast to its room, or to every open WebSocket sink if
    /// the event is system-wide.
    ///
    /// Sinks that report backpressure are closed. Returns the number of
    /// sinks that accepted or buffered the event.
    pub fn broadcast(&self, broadcast: &Arc<Broadcast>) -> usize {
        let mut failed: Vec<(Arc<dyn RoomSink>, DeliveryError)> = Vec::new();
        let mut delivered = 0;

        match broadcast.event.resource_id.as_deref() {
            Some(resource_id) => {
                if let Some(mut room) = self.rooms.get_mut(resource_id) {
                    for member in room.values_mut() {
                        let result = match member.replay_buffer.as_mut() {
                            Some(buffer) if buffer.len() >= REPLAY_BUFFER_LIMIT => {
                                Err(DeliveryError::Backpressure)
                            }
                            Some(buffer) => {
                                buffer.push(Arc::clone(broadcast));
                                Ok(())
                            }
                            None => member.sink.deliver(broadcast),
                        };
                        match result {
                            Ok(()) => delivered += 1,
                            Err(err) => failed.push((Arc::clone(&member.sink), err)),
                        }
                    }
                }
            }
            None => {
                for entry in self.open.iter() {
                    let sink = entry.value();
                    if sink.transport() != Transport::WebSocket {
                        continue;
                    }
                    match sink.deliver(broadcast) {
                        Ok(()) => delivered += 1,
                        Err(err) => failed.push((Arc::clone(sink), err)),
                    }
                }
            }
        }

        // Room guards are released; closing may re-enter the registry.
        for (sink, err) in failed {
            if err == DeliveryError::Backpressure {
                warn!(
                    sink_id = sink.sink_id(),
                    transport = ?sink.transport(),
                    event_id = %broadcast.event.id,
                    "Closing slow consumer"
                );
                sink.close(CloseReason::Backpressure);
            }
        }

        delivered
    }

    /// Number of open sinks across all transports.
    pub fn connection_count(&self) -> usize {
        self.open.len()
    }

    /// Number of non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Number of members in one room.
    pub fn room_size(&self, resource_id: &str) -> usize {
        self.rooms.get(resource_id).map_or(0, |room| room.len())
    }
}

impl std::fmt::Debug for RoomRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomRegistry")
            .field("connections", &self.connection_count())
            .field("rooms", &self.room_count())
            .finish()
    }
}
