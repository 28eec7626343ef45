//! Shared event and wire-protocol types for the Darecast server.
//!
//! This module defines the domain [`Event`] that flows through the bus, the
//! JSON frames exchanged with WebSocket clients, and the close codes used
//! when the gateway terminates a connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Maximum accepted length of a resource identifier.
pub const MAX_RESOURCE_ID_LEN: usize = 128;

/// Maximum accepted length of an event type name.
pub const MAX_EVENT_TYPE_LEN: usize = 64;

/// A domain event published by the producing system.
///
/// Events are immutable once created. An event without a `resource_id` is
/// system-wide and is delivered to every open connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique event identifier (`evt_` followed by 32 hex characters).
    pub id: String,

    /// Domain event type, e.g. `dare.resolved`.
    #[serde(rename = "type")]
    pub event_type: String,

    /// The resource whose room receives this event, or `None` for system-wide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,

    /// Opaque event payload.
    #[serde(default)]
    pub payload: Value,

    /// When the producing system recorded the event.
    pub occurred_at: DateTime<Utc>,
}

impl Event {
    /// Creates a new event stamped with a fresh id and the current time.
    pub fn new(event_type: impl Into<String>, resource_id: Option<String>, payload: Value) -> Self {
        Self {
            id: format!("evt_{}", Uuid::new_v4().simple()),
            event_type: event_type.into(),
            resource_id,
            payload,
            occurred_at: Utc::now(),
        }
    }

    /// Returns `true` if the event is not scoped to a single resource.
    #[inline]
    pub fn is_system_wide(&self) -> bool {
        self.resource_id.is_none()
    }
}

/// The body of the inbound collaborator contract:
/// `publish(eventType, {resourceId, payload})`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,

    #[serde(default)]
    pub payload: Value,
}

impl PublishRequest {
    /// A request scoped to one resource's room.
    pub fn for_resource(resource_id: impl Into<String>, payload: Value) -> Self {
        Self {
            resource_id: Some(resource_id.into()),
            payload,
        }
    }

    /// A system-wide request delivered to every open connection.
    pub fn system_wide(payload: Value) -> Self {
        Self {
            resource_id: None,
            payload,
        }
    }
}

/// Returns `true` if `resource_id` is acceptable as a room name.
pub fn is_valid_resource_id(resource_id: &str) -> bool {
    !resource_id.is_empty()
        && resource_id.len() <= MAX_RESOURCE_ID_LEN
        && !resource_id.chars().any(char::is_control)
}

/// Returns `true` if `event_type` is acceptable as an event (and SSE event) name.
pub fn is_valid_event_type(event_type: &str) -> bool {
    !event_type.is_empty()
        && event_type.len() <= MAX_EVENT_TYPE_LEN
        && !event_type
            .chars()
            .any(|c| c.is_control() || c.is_whitespace())
}

// ============================================================================
// WebSocket frames
// ============================================================================

/// Frames a client may send over the WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Join the room of one resource.
    Sub {
        #[serde(rename = "resourceId")]
        resource_id: String,
    },

    /// Application-level liveness check.
    Ping,
}

/// Control frames the server sends over the WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame<'a> {
    /// The subscription is live; history has already been replayed.
    Subscribed {
        #[serde(rename = "resourceId")]
        resource_id: &'a str,
    },

    /// Reply to an application ping, `at` in Unix milliseconds.
    Pong { at: i64 },

    /// A request failed.
    Error {
        error: ErrorCode,
        #[serde(rename = "resourceId", skip_serializing_if = "Option::is_none")]
        resource_id: Option<&'a str>,
    },
}

/// A domain event as relayed to clients: `{type, resourceId?, payload}`.
#[derive(Debug, Serialize)]
pub struct RelayedEvent<'a> {
    #[serde(rename = "type")]
    pub event_type: &'a str,

    #[serde(rename = "resourceId", skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<&'a str>,

    pub payload: &'a Value,
}

impl<'a> From<&'a Event> for RelayedEvent<'a> {
    fn from(event: &'a Event) -> Self {
        Self {
            event_type: &event.event_type,
            resource_id: event.resource_id.as_deref(),
            payload: &event.payload,
        }
    }
}

/// Error identifiers carried by [`ServerFrame::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MalformedFrame,
    NoSuchRoom,
    Forbidden,
    RateLimited,
    TooManySubscriptions,
    Unavailable,
}

/// Why the gateway is closing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent something that is not a valid frame.
    MalformedFrame,
    /// Subscribe to a room that does not exist or is not visible.
    Unauthorized,
    /// The client exceeded its inbound message rate.
    RateLimited,
    /// The client could not keep up with outbound traffic.
    Backpressure,
    /// No pong arrived within the idle window.
    IdleTimeout,
}

impl CloseReason {
    /// WebSocket close code sent with the close frame.
    pub fn code(self) -> u16 {
        match self {
            Self::MalformedFrame => close_code::MALFORMED_FRAME,
            Self::Unauthorized => close_code::POLICY_VIOLATION,
            Self::RateLimited => close_code::RATE_LIMITED,
            Self::Backpressure => close_code::BACKPRESSURE,
            Self::IdleTimeout => close_code::IDLE_TIMEOUT,
        }
    }

    /// Short reason string sent with the close frame.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedFrame => "malformed frame",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate limited",
            Self::Backpressure => "backpressure",
            Self::IdleTimeout => "idle timeout",
        }
    }
}

/// WebSocket close codes used by the gateway.
pub mod close_code {
    /// Invalid frame payload (RFC 6455 1007).
    pub const MALFORMED_FRAME: u16 = 1007;
    /// Unauthorized or unknown room (RFC 6455 1008).
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Inbound rate limit exceeded.
    pub const RATE_LIMITED: u16 = 4029;
    /// Outbound backpressure threshold exceeded.
    pub const BACKPRESSURE: u16 = 4008;
    /// Missed pong deadline.
    pub const IDLE_TIMEOUT: u16 = 4000;
}
