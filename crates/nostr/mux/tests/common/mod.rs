//! Channel-backed transport double driving the multiplexer without
//! sockets.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nostr::{ClientMessage, Event, RelayMessage};
use nostr_mux::{
    ConnectionState, MuxClient, MuxConfig, NullSigner, Transport, TransportFactory,
};
use tokio::sync::{RwLock, broadcast};
use url::Url;

pub const CHANNEL_CAPACITY: usize = 256;

pub struct MockTransport {
    url: String,
    state: RwLock<ConnectionState>,
    sent: StdMutex<Vec<ClientMessage>>,
    message_tx: broadcast::Sender<RelayMessage>,
    state_tx: broadcast::Sender<ConnectionState>,
    error_tx: broadcast::Sender<String>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub disposes: AtomicUsize,
}

impl MockTransport {
    fn new(url: String) -> Self {
        Self {
            url,
            state: RwLock::new(ConnectionState::Initialized),
            sent: StdMutex::new(Vec::new()),
            message_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            state_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            error_tx: broadcast::channel(CHANNEL_CAPACITY).0,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            disposes: AtomicUsize::new(0),
        }
    }

    /// Deliver a parsed frame as if the relay sent it.
    pub fn push(&self, message: RelayMessage) {
        let _ = self.message_tx.send(message);
    }

    /// Surface a transport failure reason.
    pub fn push_error(&self, reason: &str) {
        let _ = self.error_tx.send(reason.to_string());
    }

    /// Force a connection state transition.
    pub async fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().await;
        if *state == next {
            return;
        }
        *state = next;
        let _ = self.state_tx.send(next);
    }

    pub fn sent_frames(&self) -> Vec<ClientMessage> {
        self.sent.lock().expect("sent lock").clone()
    }

    /// Poll until at least `count` frames were recorded.
    pub async fn wait_for_frames(&self, count: usize) -> Vec<ClientMessage> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let frames = self.sent_frames();
            if frames.len() >= count {
                return frames;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} frames on {}, have {}: {frames:?}",
                self.url,
                frames.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Assert the frame count stays at `count` for a settling window.
    pub async fn assert_no_more_frames(&self, count: usize) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let frames = self.sent_frames();
        assert_eq!(
            frames.len(),
            count,
            "unexpected extra frames on {}: {frames:?}",
            self.url
        );
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn url(&self) -> &str {
        &self.url
    }

    async fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Ongoing).await;
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Terminated).await;
    }

    async fn dispose(&self) {
        self.disposes.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Terminated).await;
    }

    async fn send(&self, frame: ClientMessage) {
        if *self.state.read().await != ConnectionState::Ongoing {
            return;
        }
        self.sent.lock().expect("sent lock").push(frame);
    }

    async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    fn messages(&self) -> broadcast::Receiver<RelayMessage> {
        self.message_tx.subscribe()
    }

    fn connection_states(&self) -> broadcast::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn errors(&self) -> broadcast::Receiver<String> {
        self.error_tx.subscribe()
    }
}

#[derive(Default)]
pub struct MockFactory {
    transports: StdMutex<HashMap<String, Arc<MockTransport>>>,
}

impl MockFactory {
    /// The transport created for a normalized relay URL.
    pub fn get(&self, url: &str) -> Arc<MockTransport> {
        self.transports
            .lock()
            .expect("transport lock")
            .get(url)
            .cloned()
            .unwrap_or_else(|| panic!("no transport created for {url}"))
    }

    pub fn created_count(&self) -> usize {
        self.transports.lock().expect("transport lock").len()
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, url: &Url, _config: &MuxConfig) -> Arc<dyn Transport> {
        let transport = Arc::new(MockTransport::new(url.to_string()));
        self.transports
            .lock()
            .expect("transport lock")
            .insert(url.to_string(), Arc::clone(&transport));
        transport
    }
}

/// A client wired to mock transports.
pub fn mock_client(config: MuxConfig) -> (MuxClient, Arc<MockFactory>) {
    let factory = Arc::new(MockFactory::default());
    let client = MuxClient::with_parts(
        config,
        Arc::new(NullSigner),
        Arc::clone(&factory) as Arc<dyn TransportFactory>,
    );
    (client, factory)
}

pub fn test_event(id: &str) -> Event {
    Event {
        id: id.to_string(),
        pubkey: "pubkey".to_string(),
        created_at: 1,
        kind: 1,
        tags: vec![],
        content: "hello".to_string(),
        sig: "sig".to_string(),
    }
}

pub fn incoming_event(subscription_id: &str, event_id: &str) -> RelayMessage {
    RelayMessage::Event {
        subscription_id: subscription_id.to_string(),
        event: test_event(event_id),
    }
}

pub fn eose(subscription_id: &str) -> RelayMessage {
    RelayMessage::Eose {
        subscription_id: subscription_id.to_string(),
    }
}
