//! User-facing Rust SDK for consuming server-push event streams.
//!
//! Any number of logical consumers can subscribe to the same stream
//! address; consumers whose address and credential mode match share a
//! single underlying connection, tracked by a reference-counted registry
//! that opens the connection for the first subscriber and closes it when
//! the last one goes away.
//!
//! The crate is organized by concern:
//! - `registry`: connection identity and the shared-connection registry.
//! - `stream`: transport traits, websocket transport, and the
//!   consumer-facing subscription API.

/// Connection keys and the reference-counted connection registry.
pub mod registry;
/// Stream transport, wire frames, and subscriptions.
pub mod stream;

pub use registry::{ConnectionKey, ConnectionRegistry, CredentialMode};
pub use stream::proto::{EventFrame, DEFAULT_EVENT_NAME};
pub use stream::subscription::{EventStreamClient, SubscribeOptions, Subscription};
pub use stream::transport::{
    ConnectOptions, Connection, Listener, ListenerId, Transport, WsTransport,
};
pub use stream::value::{AccumulateMode, StreamValue, UNKNOWN_EVENT_DATA};
pub use stream::SharedStreamError;
