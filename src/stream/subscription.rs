//! Consumer-facing subscribe API and per-consumer lifecycle.
//!
//! A [`Subscription`] is the lease a single consumer holds on a shared
//! connection: activating acquires (or opens) the registry entry for its
//! key and attaches a listener, deactivating detaches the listener and
//! releases the entry. Changing any subscription parameter is always a
//! full deactivate/reactivate cycle, never a live mutation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::registry::{ConnectionKey, ConnectionRegistry};
use crate::stream::proto::DEFAULT_EVENT_NAME;
use crate::stream::transport::{
    ConnectOptions, Connection, Listener, ListenerId, SharedStreamError, Transport, WsTransport,
};
use crate::stream::value::{accumulate, AccumulateMode, StreamValue};

/// Per-subscription options.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubscribeOptions {
    /// Event name the subscription listens for. Defaults to `"message"`.
    pub event_name: String,
    /// Credential-mode flag forwarded to the transport; part of the
    /// connection identity used for sharing.
    pub with_credentials: Option<bool>,
    /// How inbound payloads fold into the observable value.
    pub mode: AccumulateMode,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            event_name: DEFAULT_EVENT_NAME.to_string(),
            with_credentials: None,
            mode: AccumulateMode::Latest,
        }
    }
}

/// Entry point for creating subscriptions.
///
/// Defaults to the websocket transport and the process-wide connection
/// registry; both can be swapped out for scoped sharing or tests.
#[derive(Clone)]
pub struct EventStreamClient {
    transport: Arc<dyn Transport>,
    registry: Arc<ConnectionRegistry>,
}

impl EventStreamClient {
    /// Creates a client over the websocket transport and the global
    /// registry.
    pub fn new() -> Self {
        Self {
            transport: Arc::new(WsTransport::new()),
            registry: ConnectionRegistry::global(),
        }
    }

    /// Substitutes the transport used to open connections.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Substitutes the registry connections are shared through.
    pub fn with_registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Opens a subscription on `address` and activates it.
    ///
    /// Consumers whose address and credential mode match share one
    /// underlying connection. The subscription's value is `None` until
    /// the first matching event arrives.
    pub fn subscribe(
        &self,
        address: impl Into<String>,
        options: SubscribeOptions,
    ) -> Result<Subscription, SharedStreamError> {
        let (tx, rx) = watch::channel(None);
        let mut subscription = Subscription {
            transport: Arc::clone(&self.transport),
            registry: Arc::clone(&self.registry),
            address: address.into(),
            options,
            active: None,
            tx: Arc::new(tx),
            rx,
            generation: Arc::new(AtomicU64::new(0)),
        };
        subscription.activate()?;
        Ok(subscription)
    }
}

impl Default for EventStreamClient {
    fn default() -> Self {
        Self::new()
    }
}

struct ActiveLease {
    key: ConnectionKey,
    conn: Arc<dyn Connection>,
    event_name: String,
    listener: ListenerId,
}

/// One consumer's lease on a shared stream.
///
/// Dropping the subscription releases the lease, so the underlying
/// connection is torn down on every exit path once its last consumer is
/// gone. [`Subscription::close`] does the same explicitly.
pub struct Subscription {
    transport: Arc<dyn Transport>,
    registry: Arc<ConnectionRegistry>,
    address: String,
    options: SubscribeOptions,
    active: Option<ActiveLease>,
    tx: Arc<watch::Sender<Option<StreamValue>>>,
    rx: watch::Receiver<Option<StreamValue>>,
    // Bumped whenever an active period ends. Listeners capture the value
    // current at attach time, so a dispatch already in flight when the
    // listener is detached can no longer write into a later period.
    generation: Arc<AtomicU64>,
}

impl Subscription {
    /// Current accumulated value; `None` until the first event of the
    /// current parameter period arrives.
    pub fn value(&self) -> Option<StreamValue> {
        self.rx.borrow().clone()
    }

    /// Returns a receiver for awaiting value updates.
    pub fn watch(&self) -> watch::Receiver<Option<StreamValue>> {
        self.rx.clone()
    }

    /// Address the subscription currently targets.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Options the subscription currently uses.
    pub fn options(&self) -> &SubscribeOptions {
        &self.options
    }

    /// True while the subscription holds a registry lease.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// True while the subscription's connection can still deliver
    /// events.
    ///
    /// Distinguishes "no value yet" from a stream that died after
    /// activation, such as a refused connection: the value stays `None`
    /// in both cases, but a dead stream reports `false` here. The lease
    /// is not released automatically; that stays the consumer's call.
    pub fn is_connected(&self) -> bool {
        self.active
            .as_ref()
            .map_or(false, |lease| lease.conn.is_open())
    }

    /// Re-parameterizes the subscription.
    ///
    /// Unchanged parameters are a no-op. Any change in address, event
    /// name, credential flag, or accumulate mode runs a full cycle: the
    /// value is reset *before* the old lease is released, so a value
    /// from the old stream can never be observed under the new
    /// parameters; then the old listener is detached and the old key
    /// released before the new one is acquired. A dispatch of the old
    /// listener still in flight on another thread is dropped, never
    /// applied to the new period.
    ///
    /// On error the subscription is left inactive with the new
    /// parameters; the old lease is already released.
    pub fn update_params(
        &mut self,
        address: impl Into<String>,
        options: SubscribeOptions,
    ) -> Result<(), SharedStreamError> {
        let address = address.into();
        if address == self.address && options == self.options {
            return Ok(());
        }

        // End the old period before the reset: an old-period listener
        // that checks its generation from here on loses the race.
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.tx.send_replace(None);
        self.deactivate();
        self.address = address;
        self.options = options;
        self.activate()
    }

    /// Deactivates the subscription and drops it.
    pub fn close(mut self) {
        self.deactivate();
    }

    fn activate(&mut self) -> Result<(), SharedStreamError> {
        let key = ConnectionKey::derive(&self.address, self.options.with_credentials)?;
        let connect = ConnectOptions {
            with_credentials: self.options.with_credentials,
        };
        let transport = Arc::clone(&self.transport);
        let address = self.address.clone();
        let conn = self
            .registry
            .acquire(&key, || transport.open(&address, &connect))?;

        let listener = conn.add_listener(&self.options.event_name, self.make_listener());
        debug!(event = "subscription_activated", key = %key, event_name = %self.options.event_name);
        self.active = Some(ActiveLease {
            key,
            conn,
            event_name: self.options.event_name.clone(),
            listener,
        });
        Ok(())
    }

    fn deactivate(&mut self) {
        if let Some(lease) = self.active.take() {
            self.generation.fetch_add(1, Ordering::AcqRel);
            lease.conn.remove_listener(&lease.event_name, lease.listener);
            self.registry.release(&lease.key);
            debug!(event = "subscription_deactivated", key = %lease.key);
        }
    }

    fn make_listener(&self) -> Listener {
        let tx = Arc::clone(&self.tx);
        let mode = self.options.mode;
        let generation = Arc::clone(&self.generation);
        let period = generation.load(Ordering::Acquire);
        Box::new(move |payload| {
            // The generation check runs inside the sender's critical
            // section, so it is ordered against the reset in
            // `update_params`: a payload from an ended period is
            // dropped, or is overwritten by the reset that follows.
            tx.send_if_modified(|value| {
                if generation.load(Ordering::Acquire) != period {
                    return false;
                }
                *value = Some(accumulate(value.take(), mode, payload));
                true
            });
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.deactivate();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};

    use super::{EventStreamClient, SubscribeOptions};
    use crate::registry::{ConnectionKey, ConnectionRegistry};
    use crate::stream::transport::{
        ConnectOptions, Connection, Listener, ListenerId, SharedStreamError, Transport,
    };
    use crate::stream::value::{AccumulateMode, StreamValue, UNKNOWN_EVENT_DATA};

    type SharedListener = Arc<dyn Fn(Option<&str>) + Send + Sync>;

    #[derive(Default)]
    struct MockConnection {
        listeners: Mutex<Vec<(String, ListenerId, SharedListener)>>,
        next_listener: AtomicU64,
        closed: AtomicUsize,
    }

    impl MockConnection {
        /// Listener snapshot as a dispatch in flight would hold it.
        fn snapshot(&self, event_name: &str) -> Vec<SharedListener> {
            self.listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|(name, _, _)| name == event_name)
                .map(|(_, _, listener)| Arc::clone(listener))
                .collect()
        }

        fn push(&self, event_name: &str, payload: Option<&str>) {
            for listener in self.snapshot(event_name) {
                listener(payload);
            }
        }

        fn listener_count(&self) -> usize {
            self.listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        }
    }

    impl Connection for MockConnection {
        fn add_listener(&self, event_name: &str, listener: Listener) -> ListenerId {
            let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
            self.listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((event_name.to_string(), id, Arc::from(listener)));
            id
        }

        fn remove_listener(&self, _event_name: &str, id: ListenerId) {
            self.listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(_, listener_id, _)| *listener_id != id);
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockTransport {
        opened: Mutex<Vec<Arc<MockConnection>>>,
    }

    impl MockTransport {
        fn opened(&self) -> Vec<Arc<MockConnection>> {
            self.opened
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        fn last_opened(&self) -> Arc<MockConnection> {
            self.opened().last().cloned().expect("no connection opened")
        }
    }

    impl Transport for MockTransport {
        fn open(
            &self,
            address: &str,
            _options: &ConnectOptions,
        ) -> Result<Arc<dyn Connection>, SharedStreamError> {
            if address.contains("refused") {
                return Err(SharedStreamError::Transport(
                    "connection refused".to_string(),
                ));
            }
            let conn = Arc::new(MockConnection::default());
            self.opened
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Arc::clone(&conn));
            Ok(conn)
        }
    }

    fn test_client() -> (EventStreamClient, Arc<MockTransport>, Arc<ConnectionRegistry>) {
        let transport = Arc::new(MockTransport::default());
        let registry = Arc::new(ConnectionRegistry::new());
        let client = EventStreamClient::new()
            .with_transport(Arc::clone(&transport) as Arc<dyn Transport>)
            .with_registry(Arc::clone(&registry));
        (client, transport, registry)
    }

    fn key(address: &str, credentials: Option<bool>) -> ConnectionKey {
        ConnectionKey::derive(address, credentials).expect("key")
    }

    const ADDRESS: &str = "ws://example.com/stream";

    #[test]
    fn consumers_with_matching_identity_share_one_connection() {
        let (client, transport, registry) = test_client();

        let first = client
            .subscribe(ADDRESS, SubscribeOptions::default())
            .expect("first subscribe");
        assert_eq!(registry.ref_count(&key(ADDRESS, None)), Some(1));

        let second = client
            .subscribe(ADDRESS, SubscribeOptions::default())
            .expect("second subscribe");
        assert_eq!(transport.opened().len(), 1);
        assert_eq!(registry.ref_count(&key(ADDRESS, None)), Some(2));

        let conn = transport.last_opened();
        first.close();
        assert_eq!(registry.ref_count(&key(ADDRESS, None)), Some(1));
        assert_eq!(conn.closed.load(Ordering::SeqCst), 0);

        second.close();
        assert_eq!(registry.ref_count(&key(ADDRESS, None)), None);
        assert_eq!(conn.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_credential_flags_open_distinct_connections() {
        let (client, transport, registry) = test_client();

        let _plain = client
            .subscribe(ADDRESS, SubscribeOptions::default())
            .expect("plain subscribe");
        let _with_creds = client
            .subscribe(
                ADDRESS,
                SubscribeOptions {
                    with_credentials: Some(true),
                    ..SubscribeOptions::default()
                },
            )
            .expect("credentialed subscribe");

        assert_eq!(transport.opened().len(), 2);
        assert_eq!(registry.ref_count(&key(ADDRESS, None)), Some(1));
        assert_eq!(registry.ref_count(&key(ADDRESS, Some(true))), Some(1));
    }

    #[test]
    fn latest_mode_observes_newest_payload() {
        let (client, transport, _registry) = test_client();
        let subscription = client
            .subscribe(ADDRESS, SubscribeOptions::default())
            .expect("subscribe");
        assert_eq!(subscription.value(), None);

        let conn = transport.last_opened();
        conn.push("message", Some("a"));
        conn.push("message", Some("b"));
        conn.push("message", Some("c"));

        assert_eq!(
            subscription.value(),
            Some(StreamValue::Latest("c".to_string()))
        );
    }

    #[test]
    fn list_mode_observes_payloads_in_arrival_order() {
        let (client, transport, _registry) = test_client();
        let subscription = client
            .subscribe(
                ADDRESS,
                SubscribeOptions {
                    mode: AccumulateMode::List,
                    ..SubscribeOptions::default()
                },
            )
            .expect("subscribe");

        let conn = transport.last_opened();
        conn.push("message", Some("a"));
        conn.push("message", Some("b"));
        conn.push("message", Some("c"));

        assert_eq!(
            subscription.value(),
            Some(StreamValue::List(vec![
                "a".to_string(),
                "b".to_string(),
                "c".to_string()
            ]))
        );
    }

    #[test]
    fn empty_payload_is_observed_as_sentinel() {
        let (client, transport, _registry) = test_client();
        let subscription = client
            .subscribe(ADDRESS, SubscribeOptions::default())
            .expect("subscribe");

        transport.last_opened().push("message", Some(""));

        assert_eq!(
            subscription.value(),
            Some(StreamValue::Latest(UNKNOWN_EVENT_DATA.to_string()))
        );
    }

    #[test]
    fn events_with_other_names_are_ignored() {
        let (client, transport, _registry) = test_client();
        let subscription = client
            .subscribe(
                ADDRESS,
                SubscribeOptions {
                    event_name: "ticker".to_string(),
                    ..SubscribeOptions::default()
                },
            )
            .expect("subscribe");

        let conn = transport.last_opened();
        conn.push("message", Some("ignored"));
        conn.push("ticker", Some("42"));

        assert_eq!(
            subscription.value(),
            Some(StreamValue::Latest("42".to_string()))
        );
    }

    #[test]
    fn changing_event_name_resets_value_and_reattaches() {
        let (client, transport, registry) = test_client();
        let mut subscription = client
            .subscribe(ADDRESS, SubscribeOptions::default())
            .expect("subscribe");

        let conn = transport.last_opened();
        conn.push("message", Some("old"));
        assert_eq!(
            subscription.value(),
            Some(StreamValue::Latest("old".to_string()))
        );

        subscription
            .update_params(
                ADDRESS,
                SubscribeOptions {
                    event_name: "ticker".to_string(),
                    ..SubscribeOptions::default()
                },
            )
            .expect("update");

        // Reset before any new event arrives.
        assert_eq!(subscription.value(), None);
        // The sole lease was released, so the old connection closed and
        // the re-acquire opened a fresh one with exactly one listener.
        assert_eq!(conn.closed.load(Ordering::SeqCst), 1);
        assert_eq!(conn.listener_count(), 0);
        assert_eq!(registry.ref_count(&key(ADDRESS, None)), Some(1));
        assert_eq!(transport.opened().len(), 2);
        assert_eq!(transport.last_opened().listener_count(), 1);

        transport.last_opened().push("ticker", Some("new"));
        assert_eq!(
            subscription.value(),
            Some(StreamValue::Latest("new".to_string()))
        );
    }

    #[test]
    fn changing_address_moves_the_lease() {
        let (client, transport, registry) = test_client();
        let other = "ws://example.com/other";
        let mut subscription = client
            .subscribe(ADDRESS, SubscribeOptions::default())
            .expect("subscribe");
        let old_conn = transport.last_opened();

        subscription
            .update_params(other, SubscribeOptions::default())
            .expect("update");

        assert_eq!(registry.ref_count(&key(ADDRESS, None)), None);
        assert_eq!(registry.ref_count(&key(other, None)), Some(1));
        assert_eq!(old_conn.closed.load(Ordering::SeqCst), 1);
        assert_eq!(old_conn.listener_count(), 0);
    }

    #[test]
    fn in_flight_dispatch_to_detached_listener_is_dropped() {
        let (client, transport, _registry) = test_client();
        let mut subscription = client
            .subscribe(ADDRESS, SubscribeOptions::default())
            .expect("subscribe");
        let conn = transport.last_opened();

        // A worker thread snapshots the listener, then the consumer
        // re-parameterizes before the dispatch lands.
        let in_flight = conn.snapshot("message");
        subscription
            .update_params(
                ADDRESS,
                SubscribeOptions {
                    event_name: "ticker".to_string(),
                    ..SubscribeOptions::default()
                },
            )
            .expect("update");
        assert_eq!(subscription.value(), None);

        for listener in &in_flight {
            listener(Some("stale"));
        }
        assert_eq!(subscription.value(), None);

        // The new period still receives normally.
        transport.last_opened().push("ticker", Some("fresh"));
        assert_eq!(
            subscription.value(),
            Some(StreamValue::Latest("fresh".to_string()))
        );
    }

    #[test]
    fn unchanged_params_are_a_noop() {
        let (client, transport, _registry) = test_client();
        let mut subscription = client
            .subscribe(ADDRESS, SubscribeOptions::default())
            .expect("subscribe");

        transport.last_opened().push("message", Some("kept"));
        subscription
            .update_params(ADDRESS, SubscribeOptions::default())
            .expect("update");

        assert_eq!(transport.opened().len(), 1);
        assert_eq!(
            subscription.value(),
            Some(StreamValue::Latest("kept".to_string()))
        );
    }

    #[test]
    fn drop_releases_the_lease() {
        let (client, transport, registry) = test_client();
        {
            let _subscription = client
                .subscribe(ADDRESS, SubscribeOptions::default())
                .expect("subscribe");
            assert_eq!(registry.ref_count(&key(ADDRESS, None)), Some(1));
        }
        assert!(registry.is_empty());
        assert_eq!(transport.last_opened().closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_before_any_event_still_releases() {
        let (client, transport, registry) = test_client();
        let subscription = client
            .subscribe(ADDRESS, SubscribeOptions::default())
            .expect("subscribe");

        subscription.close();

        assert!(registry.is_empty());
        let conn = transport.last_opened();
        assert_eq!(conn.closed.load(Ordering::SeqCst), 1);
        assert_eq!(conn.listener_count(), 0);
    }

    #[test]
    fn malformed_address_fails_without_registering() {
        let (client, transport, registry) = test_client();
        let result = client.subscribe("not a valid address", SubscribeOptions::default());

        assert!(matches!(
            result,
            Err(SharedStreamError::InvalidAddress { .. })
        ));
        assert!(registry.is_empty());
        assert!(transport.opened().is_empty());
    }

    #[test]
    fn transport_failure_propagates_without_registering() {
        let (client, _transport, registry) = test_client();
        let result = client.subscribe("ws://refused.example.com/stream", SubscribeOptions::default());

        assert!(matches!(result, Err(SharedStreamError::Transport(_))));
        assert!(registry.is_empty());
    }

    #[test]
    fn failed_reparameterization_leaves_subscription_inactive() {
        let (client, _transport, registry) = test_client();
        let mut subscription = client
            .subscribe(ADDRESS, SubscribeOptions::default())
            .expect("subscribe");

        let result =
            subscription.update_params("ws://refused.example.com/stream", SubscribeOptions::default());

        assert!(result.is_err());
        assert!(!subscription.is_active());
        assert_eq!(subscription.value(), None);
        // The old lease was released before the failing acquire.
        assert!(registry.is_empty());
    }
}
