//! The relay-multiplexing client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use nostr::{ClientMessage, Event, EventParams, Filter, RelayMessage};
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::warn;

use crate::config::MuxConfig;
use crate::error::{MuxError, Result};
use crate::packet::{ConnectionStatePacket, ErrorPacket, EventPacket, MessagePacket, OkPacket};
use crate::pool::{RelayEndpoint, RelayPool, normalize_relay_url};
use crate::publish::{OkListeners, OkStream, publish, route_ok};
use crate::req::{ReqSource, request_id};
use crate::signer::{NullSigner, Signer};
use crate::subscription::{EventStream, run_subscription};
use crate::transport::{ConnectionState, Transport, TransportFactory, WebSocketFactory};

/// Capacity of the aggregator fan-in channels.
const AGGREGATOR_CAPACITY: usize = 1024;

struct Aggregators {
    messages: broadcast::Sender<MessagePacket>,
    events: broadcast::Sender<EventPacket>,
    errors: broadcast::Sender<ErrorPacket>,
    states: broadcast::Sender<ConnectionStatePacket>,
}

impl Aggregators {
    fn new() -> Self {
        Self {
            messages: broadcast::channel(AGGREGATOR_CAPACITY).0,
            events: broadcast::channel(AGGREGATOR_CAPACITY).0,
            errors: broadcast::channel(AGGREGATOR_CAPACITY).0,
            states: broadcast::channel(AGGREGATOR_CAPACITY).0,
        }
    }
}

/// Receiver that reports its stream as already completed.
fn closed_receiver<T: Clone>() -> broadcast::Receiver<T> {
    broadcast::channel(1).1
}

pub(crate) struct ClientInner {
    config: MuxConfig,
    signer: Arc<dyn Signer>,
    pool: Mutex<RelayPool>,
    /// Forward subscriptions only: subscription id → last REQ frame, used
    /// to rehydrate relays added while the subscription is live.
    registry: StdMutex<HashMap<String, ClientMessage>>,
    /// Request id → routed message channel of its driver task.
    subscribers: StdMutex<HashMap<String, mpsc::UnboundedSender<MessagePacket>>>,
    ok_listeners: OkListeners,
    aggregators: StdRwLock<Option<Aggregators>>,
    disposed: AtomicBool,
}

impl ClientInner {
    pub(crate) fn config(&self) -> &MuxConfig {
        &self.config
    }

    fn registry_snapshot(&self) -> HashMap<String, ClientMessage> {
        self.registry.lock().expect("registry lock").clone()
    }

    pub(crate) async fn forward_req(&self, sub_id: &str, filters: Vec<Filter>) {
        let frame = ClientMessage::req(sub_id, filters);
        self.registry
            .lock()
            .expect("registry lock")
            .insert(sub_id.to_string(), frame.clone());
        let mut pool = self.pool.lock().await;
        pool.send_req_forward(sub_id, &frame).await;
    }

    pub(crate) async fn backward_req(&self, sub_id: &str, filters: Vec<Filter>) {
        let frame = ClientMessage::req(sub_id, filters);
        let mut pool = self.pool.lock().await;
        pool.send_req_backward(sub_id, &frame).await;
    }

    pub(crate) async fn close_one(&self, url: &str, sub_id: &str) {
        let mut pool = self.pool.lock().await;
        pool.close_one(url, sub_id).await;
    }

    pub(crate) async fn close_everywhere(&self, sub_id: &str) {
        let mut pool = self.pool.lock().await;
        pool.close_everywhere(sub_id).await;
    }

    pub(crate) async fn mark_closed(&self, url: &str, sub_id: &str) {
        let mut pool = self.pool.lock().await;
        pool.mark_closed(url, sub_id);
    }

    pub(crate) async fn readable_states(&self) -> Vec<(String, ConnectionState)> {
        let pool = self.pool.lock().await;
        pool.readable_states().await
    }

    pub(crate) fn remove_registry(&self, sub_id: &str) {
        self.registry.lock().expect("registry lock").remove(sub_id);
    }

    pub(crate) fn deregister(&self, req_id: &str) {
        self.subscribers
            .lock()
            .expect("subscriber lock")
            .remove(req_id);
    }

    fn route_message(&self, from: &str, message: RelayMessage) {
        if let Some(aggregators) = self
            .aggregators
            .read()
            .expect("aggregator lock")
            .as_ref()
        {
            let _ = aggregators.messages.send(MessagePacket {
                from: from.to_string(),
                message: message.clone(),
            });
            if let RelayMessage::Event {
                subscription_id,
                event,
            } = &message
            {
                let _ = aggregators.events.send(EventPacket {
                    from: from.to_string(),
                    subscription_id: subscription_id.clone(),
                    event: event.clone(),
                });
            }
        }

        match &message {
            RelayMessage::Ok {
                event_id,
                accepted,
                message: text,
            } => {
                route_ok(
                    &self.ok_listeners,
                    OkPacket {
                        from: from.to_string(),
                        event_id: event_id.clone(),
                        accepted: *accepted,
                        message: text.clone(),
                    },
                );
            }
            _ => {
                if let Some(sub_id) = message.subscription_id()
                    && let Some(req_id) = request_id(sub_id)
                {
                    let subscribers = self.subscribers.lock().expect("subscriber lock");
                    if let Some(tx) = subscribers.get(req_id) {
                        let _ = tx.send(MessagePacket {
                            from: from.to_string(),
                            message: message.clone(),
                        });
                    }
                }
            }
        }
    }
}

/// Multiplexes subscriptions and event publication across a dynamic pool
/// of relays.
#[derive(Clone)]
pub struct MuxClient {
    inner: Arc<ClientInner>,
}

impl MuxClient {
    /// Client with the default WebSocket transport and key-only signing.
    pub fn new(config: MuxConfig) -> Self {
        Self::with_parts(config, Arc::new(NullSigner), Arc::new(WebSocketFactory))
    }

    /// Client routing keyless publications through `signer`.
    pub fn with_signer(config: MuxConfig, signer: Arc<dyn Signer>) -> Self {
        Self::with_parts(config, signer, Arc::new(WebSocketFactory))
    }

    /// Fully injected client; the factory seam is how tests drive the
    /// multiplexer without sockets.
    pub fn with_parts(
        config: MuxConfig,
        signer: Arc<dyn Signer>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let pool = RelayPool::new(factory, config.clone());
        Self {
            inner: Arc::new(ClientInner {
                config,
                signer,
                pool: Mutex::new(pool),
                registry: StdMutex::new(HashMap::new()),
                subscribers: StdMutex::new(HashMap::new()),
                ok_listeners: OkListeners::default(),
                aggregators: StdRwLock::new(Some(Aggregators::new())),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Replace the entire pool membership. Relays losing their read flag
    /// have their subscriptions finalized and are stopped; newly readable
    /// relays are started and rehydrated with every live forward REQ;
    /// relays absent from `endpoints` are disposed.
    pub async fn switch_relays(
        &self,
        endpoints: impl IntoIterator<Item = RelayEndpoint>,
    ) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let registry = self.inner.registry_snapshot();
        let inner = &self.inner;
        let mut pool = self.inner.pool.lock().await;
        pool.switch(endpoints, &registry, |url, transport| {
            attach_pumps(inner, url, transport);
        })
        .await
    }

    /// Add or replace one relay, keeping the rest of the pool unchanged.
    pub async fn add_relay(&self, endpoint: RelayEndpoint) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let normalized = normalize_relay_url(&endpoint.url)?.to_string();
        let registry = self.inner.registry_snapshot();
        let inner = &self.inner;
        let mut pool = self.inner.pool.lock().await;
        let mut endpoints = pool.endpoints();
        endpoints.retain(|existing| existing.url != normalized);
        endpoints.push(endpoint);
        pool.switch(endpoints, &registry, |url, transport| {
            attach_pumps(inner, url, transport);
        })
        .await
    }

    /// Remove one relay, finalizing its subscriptions and disposing its
    /// transport.
    pub async fn remove_relay(&self, url: &str) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let normalized = normalize_relay_url(url)?.to_string();
        let registry = self.inner.registry_snapshot();
        let inner = &self.inner;
        let mut pool = self.inner.pool.lock().await;
        let mut endpoints = pool.endpoints();
        endpoints.retain(|existing| existing.url != normalized);
        pool.switch(endpoints, &registry, |url, transport| {
            attach_pumps(inner, url, transport);
        })
        .await
    }

    /// Connection state of one pool member.
    pub async fn relay_state(&self, url: &str) -> Result<ConnectionState> {
        let normalized = normalize_relay_url(url)?.to_string();
        let pool = self.inner.pool.lock().await;
        match pool.relay_state(&normalized).await {
            Some(state) => Ok(state),
            None => Err(MuxError::UnknownRelay(normalized)),
        }
    }

    /// Bind a request source and return its event stream.
    pub async fn subscribe(&self, source: ReqSource) -> Result<EventStream> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(MuxError::Disposed);
        }
        if source.id().is_empty() {
            return Err(MuxError::EmptySubscriptionId);
        }

        let (packet_tx, packet_rx) = mpsc::unbounded_channel();
        {
            let mut subscribers = self.inner.subscribers.lock().expect("subscriber lock");
            if subscribers.contains_key(source.id()) {
                return Err(MuxError::SubscriptionExists(source.id().to_string()));
            }
            subscribers.insert(source.id().to_string(), packet_tx);
        }

        let state_rx = self.connection_states();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        tokio::spawn(run_subscription(
            Arc::clone(&self.inner),
            source,
            packet_rx,
            state_rx,
            event_tx,
            cancel_rx,
        ));
        Ok(EventStream::new(event_rx, cancel_tx))
    }

    /// Sign through the configured external signer and publish to every
    /// writable relay.
    pub async fn send(&self, params: EventParams) -> Result<OkStream> {
        let event = self.inner.signer.sign(&params).await?;
        self.send_signed(event).await
    }

    /// Sign with a hex or bech32 `nsec` secret key and publish.
    pub async fn send_with_key(&self, params: EventParams, secret_key: &str) -> Result<OkStream> {
        let event = self.inner.signer.sign_by_key(&params, secret_key)?;
        self.send_signed(event).await
    }

    /// Publish an already-signed event.
    pub async fn send_signed(&self, event: Event) -> Result<OkStream> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(MuxError::Disposed);
        }
        let mut pool = self.inner.pool.lock().await;
        Ok(publish(&mut pool, &self.inner.ok_listeners, event).await)
    }

    /// Answer an AUTH challenge on one relay with a signed challenge
    /// event. The handshake itself is up to the caller.
    pub async fn send_auth(&self, url: &str, event: Event) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(MuxError::Disposed);
        }
        let normalized = normalize_relay_url(url)?.to_string();
        let pool = self.inner.pool.lock().await;
        let Some(transport) = pool.transport(&normalized) else {
            return Err(MuxError::UnknownRelay(normalized));
        };
        transport.send(ClientMessage::Auth(event)).await;
        Ok(())
    }

    /// Every message from every relay.
    pub fn all_messages(&self) -> broadcast::Receiver<MessagePacket> {
        match self
            .inner
            .aggregators
            .read()
            .expect("aggregator lock")
            .as_ref()
        {
            Some(aggregators) => aggregators.messages.subscribe(),
            None => closed_receiver(),
        }
    }

    /// Every EVENT frame from every relay, across all subscriptions.
    pub fn all_events(&self) -> broadcast::Receiver<EventPacket> {
        match self
            .inner
            .aggregators
            .read()
            .expect("aggregator lock")
            .as_ref()
        {
            Some(aggregators) => aggregators.events.subscribe(),
            None => closed_receiver(),
        }
    }

    /// Terminal transport failures.
    pub fn all_errors(&self) -> broadcast::Receiver<ErrorPacket> {
        match self
            .inner
            .aggregators
            .read()
            .expect("aggregator lock")
            .as_ref()
        {
            Some(aggregators) => aggregators.errors.subscribe(),
            None => closed_receiver(),
        }
    }

    /// Every connection state transition on every relay.
    pub fn connection_states(&self) -> broadcast::Receiver<ConnectionStatePacket> {
        match self
            .inner
            .aggregators
            .read()
            .expect("aggregator lock")
            .as_ref()
        {
            Some(aggregators) => aggregators.states.subscribe(),
            None => closed_receiver(),
        }
    }

    /// Dispose every transport and complete every fan-in stream.
    /// Idempotent; subsequent pool mutations are no-ops.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut pool = self.inner.pool.lock().await;
            pool.dispose_all().await;
        }
        self.inner
            .subscribers
            .lock()
            .expect("subscriber lock")
            .clear();
        self.inner
            .ok_listeners
            .lock()
            .expect("ok listener lock")
            .clear();
        self.inner.registry.lock().expect("registry lock").clear();
        *self.inner.aggregators.write().expect("aggregator lock") = None;
    }
}

/// Spawn the per-transport pump tasks feeding the client-wide streams.
/// Runs before the transport starts so no early frame is lost.
fn attach_pumps(inner: &Arc<ClientInner>, url: &str, transport: &Arc<dyn Transport>) {
    let messages = transport.messages();
    let states = transport.connection_states();
    let errors = transport.errors();

    tokio::spawn(message_pump(
        Arc::clone(inner),
        url.to_string(),
        messages,
    ));
    tokio::spawn(state_pump(Arc::clone(inner), url.to_string(), states));
    tokio::spawn(error_pump(Arc::clone(inner), url.to_string(), errors));
}

async fn message_pump(
    inner: Arc<ClientInner>,
    url: String,
    mut rx: broadcast::Receiver<RelayMessage>,
) {
    loop {
        match rx.recv().await {
            Ok(message) => inner.route_message(&url, message),
            Err(broadcast::error::RecvError::Lagged(count)) => {
                warn!(%url, count, "dropped relay messages on slow fan-in");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn state_pump(
    inner: Arc<ClientInner>,
    url: String,
    mut rx: broadcast::Receiver<ConnectionState>,
) {
    loop {
        match rx.recv().await {
            Ok(state) => {
                if let Some(aggregators) = inner
                    .aggregators
                    .read()
                    .expect("aggregator lock")
                    .as_ref()
                {
                    let _ = aggregators.states.send(ConnectionStatePacket {
                        from: url.clone(),
                        state,
                    });
                }
                // terminal failures forget active REQs so a readd can
                // re-issue them
                if state == ConnectionState::Error || state == ConnectionState::Rejected {
                    let mut pool = inner.pool.lock().await;
                    pool.clear_active(&url);
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn error_pump(inner: Arc<ClientInner>, url: String, mut rx: broadcast::Receiver<String>) {
    loop {
        match rx.recv().await {
            Ok(reason) => {
                if let Some(aggregators) = inner
                    .aggregators
                    .read()
                    .expect("aggregator lock")
                    .as_ref()
                {
                    let _ = aggregators.errors.send(ErrorPacket {
                        from: url.clone(),
                        reason,
                    });
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
