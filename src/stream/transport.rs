//! Connection traits and the production websocket transport.
//!
//! The transport opens one socket per [`Transport::open`] call and fans
//! inbound frames out to listeners registered per event name. Sharing of
//! connections across consumers is not this layer's concern; the
//! connection registry decides when `open` is called at all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::uri::InvalidUri;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use crate::stream::proto::EventFrame;

/// Callback invoked once per inbound event, with the raw payload or
/// `None` when the frame carried no data.
pub type Listener = Box<dyn Fn(Option<&str>) + Send + Sync>;

type SharedListener = Arc<dyn Fn(Option<&str>) + Send + Sync>;

/// Handle identifying one registered listener on a connection.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ListenerId(pub(crate) u64);

/// Per-connection options forwarded to the transport.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ConnectOptions {
    /// Credential mode flag; participates in connection identity.
    pub with_credentials: Option<bool>,
}

/// One live server-push connection.
pub trait Connection: Send + Sync {
    /// Registers a listener for events carrying `event_name`.
    fn add_listener(&self, event_name: &str, listener: Listener) -> ListenerId;

    /// Detaches a previously registered listener.
    fn remove_listener(&self, event_name: &str, id: ListenerId);

    /// Closes the connection. Idempotent; later calls are no-ops.
    fn close(&self);

    /// Whether the connection can still deliver events.
    ///
    /// `false` once the connection was closed or its transport stopped,
    /// letting consumers distinguish "no data yet" from a dead stream.
    /// Transports that do not track liveness may keep the default.
    fn is_open(&self) -> bool {
        true
    }
}

/// Factory for connections, injectable so tests can substitute a fake.
pub trait Transport: Send + Sync {
    /// Opens a connection to `address`.
    ///
    /// Establishment is non-blocking: the returned handle accepts
    /// listeners immediately and events are delivered once the
    /// connection is up. Errors detectable up front (such as a
    /// malformed address) are returned here.
    fn open(
        &self,
        address: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Connection>, SharedStreamError>;
}

/// Errors produced by stream transport and connection identity handling.
#[derive(Debug, Error)]
pub enum SharedStreamError {
    /// Address could not be parsed as a URI.
    #[error("invalid stream address `{address}`: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: InvalidUri,
    },

    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Transport contract violation reported by a [`Transport`]
    /// implementation.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Production transport over tokio-tungstenite.
///
/// `open` must be called from within a tokio runtime: it spawns a
/// background worker that owns the socket and dispatches inbound frames.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsTransport;

impl WsTransport {
    /// Creates the websocket transport.
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WsTransport {
    fn open(
        &self,
        address: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn Connection>, SharedStreamError> {
        let mut request = address.into_client_request()?;
        if let Some(enabled) = options.with_credentials {
            request.headers_mut().insert(
                "x-with-credentials",
                HeaderValue::from_static(if enabled { "true" } else { "false" }),
            );
        }

        let listeners = Arc::new(ListenerTable::default());
        let closed = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let worker_address = address.to_string();
        let worker_listeners = Arc::clone(&listeners);
        let worker_closed = Arc::clone(&closed);
        tokio::spawn(async move {
            connection_worker(worker_address, request, worker_listeners, shutdown_rx).await;
            worker_closed.store(true, Ordering::SeqCst);
        });

        Ok(Arc::new(WsConnection {
            address: address.to_string(),
            listeners,
            closed,
            shutdown: Mutex::new(Some(shutdown_tx)),
        }))
    }
}

struct WsConnection {
    address: String,
    listeners: Arc<ListenerTable>,
    // Set by the worker when it stops, for any reason.
    closed: Arc<AtomicBool>,
    // Taken on the first close so the worker is signalled at most once.
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl Connection for WsConnection {
    fn add_listener(&self, event_name: &str, listener: Listener) -> ListenerId {
        self.listeners.add(event_name, listener)
    }

    fn remove_listener(&self, event_name: &str, id: ListenerId) {
        self.listeners.remove(event_name, id);
    }

    fn close(&self) {
        let shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = shutdown {
            debug!(event = "stream_close_requested", address = %self.address);
            self.closed.store(true, Ordering::SeqCst);
            let _ = tx.send(());
        }
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct ListenerTable {
    next_id: AtomicU64,
    by_event: Mutex<HashMap<String, Vec<(ListenerId, SharedListener)>>>,
}

impl ListenerTable {
    fn add(&self, event_name: &str, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.by_event
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_name.to_string())
            .or_default()
            .push((id, Arc::from(listener)));
        id
    }

    fn remove(&self, event_name: &str, id: ListenerId) {
        let mut by_event = self
            .by_event
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(listeners) = by_event.get_mut(event_name) {
            listeners.retain(|(listener_id, _)| *listener_id != id);
            if listeners.is_empty() {
                by_event.remove(event_name);
            }
        }
    }

    fn dispatch(&self, event_name: &str, payload: Option<&str>) {
        // Snapshot outside the lock so a listener may add or remove
        // listeners on the same connection.
        let listeners: Vec<SharedListener> = {
            let by_event = self
                .by_event
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            by_event
                .get(event_name)
                .map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
                .unwrap_or_default()
        };
        for listener in listeners {
            listener(payload);
        }
    }
}

async fn connection_worker(
    address: String,
    request: Request,
    listeners: Arc<ListenerTable>,
    shutdown_rx: oneshot::Receiver<()>,
) {
    match run_socket(request, &listeners, shutdown_rx).await {
        Ok(()) => debug!(event = "stream_worker_stopped", address = %address),
        Err(err) => warn!(event = "stream_worker_error", address = %address, error = %err),
    }
}

async fn run_socket(
    request: Request,
    listeners: &ListenerTable,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> Result<(), SharedStreamError> {
    let (mut socket, _) = connect_async(request).await?;
    debug!(event = "stream_connected");

    loop {
        tokio::select! {
            // Resolves on an explicit close, or with an error when the
            // handle is dropped without one; both end the worker.
            _ = &mut shutdown_rx => {
                let _ = socket.close(None).await;
                return Ok(());
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => match EventFrame::from_text(&text) {
                        Ok(frame) => listeners.dispatch(frame.event_name(), frame.data.as_deref()),
                        Err(err) => {
                            warn!(event = "stream_frame_decode_failed", error = %err);
                        }
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        socket.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                }
            }
        }
    }
}
