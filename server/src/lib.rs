//! Darecast Server - Realtime event gateway.
//!
//! This crate fans domain events published by the Darecast backend out to
//! connected clients:
//! - An event bus with optional cross-instance fanout through Redis
//! - A WebSocket gateway with per-resource rooms, history replay, and
//!   per-connection backpressure
//! - A server-sent events fallback sharing the same rooms and history
//! - Token-bucket rate limiting and pseudonymous session credentials
//!
//! # Architecture
//!
//! The producing system publishes events into the [`bus`]. The
//! [`gateway`] relays every event into the [`rooms`] registry, where
//! WebSocket [`connection`]s and [`sse`] streams are subscribed. Whether an
//! identity may join a room, and what history it sees, is answered by the
//! collaborator traits in [`directory`].

pub mod auth;
pub mod broker;
pub mod bus;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod gateway;
pub mod ip_limit;
pub mod rate_limit;
pub mod rooms;
pub mod routes;
pub mod session;
pub mod sse;
pub mod types;
