//! Realtime stream modules.
//!
//! - `transport`: connection traits and the websocket transport.
//! - `proto`: wire frames pushed by the stream server.
//! - `subscription`: consumer-facing subscribe API and per-consumer
//!   lifecycle over the shared connection registry.
//! - `value`: accumulation of inbound payloads into observable values.

/// Wire frame types.
pub mod proto;
/// Consumer subscriptions over shared connections.
pub mod subscription;
/// Connection traits and websocket transport.
pub mod transport;
/// Payload accumulation modes and values.
pub mod value;

pub use transport::SharedStreamError;
