//! Per-relay WebSocket transport with bounded automatic reconnection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use nostr::{ClientMessage, RelayMessage};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite, tungstenite::Message,
};
use tracing::{debug, warn};
use url::Url;

use crate::config::MuxConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Capacity of the per-transport fan-out channels.
const CHANNEL_CAPACITY: usize = 1024;

/// Connection state of one relay transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, never started.
    Initialized,
    /// Open handshake in progress.
    Starting,
    /// Connected and ready.
    Ongoing,
    /// Connection lost, retry budget remaining.
    Reconnecting,
    /// Retry budget exhausted.
    Error,
    /// Stopped or disposed.
    Terminated,
    /// The relay refused the handshake outright.
    Rejected,
}

impl ConnectionState {
    /// Whether this state ends the current connection lifetime. A
    /// terminated transport can still begin a new lifetime via `start`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Error | ConnectionState::Terminated | ConnectionState::Rejected
        )
    }
}

/// One bidirectional relay channel.
///
/// `send` on any state other than `Ongoing` is silently dropped; callers
/// rely on CLOSE idempotency to tolerate frames lost across reconnects.
#[async_trait]
pub trait Transport: Send + Sync {
    fn url(&self) -> &str;

    /// Begin a connection lifetime. No-op while one is already running.
    async fn start(&self);

    /// End the current lifetime, keeping the transport restartable.
    /// Idempotent.
    async fn stop(&self);

    /// Terminal stop; subsequent operations are no-ops.
    async fn dispose(&self);

    /// Serialize and send one frame, dropped unless the state is `Ongoing`.
    async fn send(&self, frame: ClientMessage);

    async fn state(&self) -> ConnectionState;

    /// Parsed incoming frames. Malformed frames are suppressed and
    /// surfaced on `errors` instead.
    fn messages(&self) -> broadcast::Receiver<RelayMessage>;

    /// Every state transition, in order.
    fn connection_states(&self) -> broadcast::Receiver<ConnectionState>;

    /// Failure reasons: terminal reconnect exhaustion, handshake
    /// rejection, malformed frames.
    fn errors(&self) -> broadcast::Receiver<String>;
}

/// Creates transports for the relay pool; the seam test doubles plug into.
pub trait TransportFactory: Send + Sync {
    fn create(&self, url: &Url, config: &MuxConfig) -> Arc<dyn Transport>;
}

/// Default factory producing [`WebSocketTransport`]s.
#[derive(Debug, Default)]
pub struct WebSocketFactory;

impl TransportFactory for WebSocketFactory {
    fn create(&self, url: &Url, config: &MuxConfig) -> Arc<dyn Transport> {
        Arc::new(WebSocketTransport::new(url.clone(), config.clone()))
    }
}

struct Shared {
    url: Url,
    config: MuxConfig,
    state: RwLock<ConnectionState>,
    writer: Mutex<Option<WsWriter>>,
    message_tx: broadcast::Sender<RelayMessage>,
    state_tx: broadcast::Sender<ConnectionState>,
    error_tx: broadcast::Sender<String>,
    disposed: AtomicBool,
}

impl Shared {
    async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Transition unless already terminated; termination is monotonic
    /// within a lifetime.
    async fn transition(&self, next: ConnectionState) {
        let mut state = self.state.write().await;
        if *state == ConnectionState::Terminated || *state == next {
            return;
        }
        *state = next;
        let _ = self.state_tx.send(next);
    }

    /// Reset into `Starting` for a fresh lifetime, overriding any
    /// terminal state left by the previous one.
    async fn begin_lifetime(&self) {
        let mut state = self.state.write().await;
        if *state == ConnectionState::Starting {
            return;
        }
        *state = ConnectionState::Starting;
        let _ = self.state_tx.send(ConnectionState::Starting);
    }
}

/// Production transport over tokio-tungstenite.
pub struct WebSocketTransport {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub fn new(url: Url, config: MuxConfig) -> Self {
        let (message_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (state_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (error_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                url,
                config,
                state: RwLock::new(ConnectionState::Initialized),
                writer: Mutex::new(None),
                message_tx,
                state_tx,
                error_tx,
                disposed: AtomicBool::new(false),
            }),
            supervisor: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn url(&self) -> &str {
        self.shared.url.as_str()
    }

    async fn start(&self) {
        if self.shared.disposed.load(Ordering::SeqCst) {
            return;
        }
        let mut supervisor = self.supervisor.lock().await;
        if let Some(handle) = supervisor.as_ref()
            && !handle.is_finished()
        {
            return;
        }
        self.shared.begin_lifetime().await;
        *supervisor = Some(tokio::spawn(run_connection(Arc::clone(&self.shared))));
    }

    async fn stop(&self) {
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            if let Err(error) = writer.send(Message::Close(None)).await {
                debug!(url = %self.shared.url, %error, "close frame failed");
            }
        }
        if let Some(handle) = self.supervisor.lock().await.take() {
            handle.abort();
        }
        self.shared.transition(ConnectionState::Terminated).await;
    }

    async fn dispose(&self) {
        self.shared.disposed.store(true, Ordering::SeqCst);
        self.stop().await;
    }

    async fn send(&self, frame: ClientMessage) {
        if self.shared.state().await != ConnectionState::Ongoing {
            debug!(url = %self.shared.url, "dropping frame on non-open connection");
            return;
        }
        let text = frame.to_json();
        let mut writer = self.shared.writer.lock().await;
        if let Some(writer) = writer.as_mut() {
            if let Err(error) = writer.send(Message::Text(text.into())).await {
                warn!(url = %self.shared.url, %error, "websocket send failed");
            }
        }
    }

    async fn state(&self) -> ConnectionState {
        self.shared.state().await
    }

    fn messages(&self) -> broadcast::Receiver<RelayMessage> {
        self.shared.message_tx.subscribe()
    }

    fn connection_states(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    fn errors(&self) -> broadcast::Receiver<String> {
        self.shared.error_tx.subscribe()
    }
}

/// Connection supervisor: connect, pump frames, reconnect within budget.
async fn run_connection(shared: Arc<Shared>) {
    let mut attempt: u32 = 0;
    loop {
        if shared.disposed.load(Ordering::SeqCst) {
            return;
        }

        match timeout(
            shared.config.connect_timeout,
            connect_async(shared.url.as_str()),
        )
        .await
        {
            Ok(Ok((stream, _response))) => {
                attempt = 0;
                let (writer, reader) = stream.split();
                *shared.writer.lock().await = Some(writer);
                shared.transition(ConnectionState::Ongoing).await;

                read_frames(&shared, reader).await;

                shared.writer.lock().await.take();
            }
            Ok(Err(tungstenite::Error::Http(response))) => {
                warn!(url = %shared.url, status = %response.status(), "relay rejected connection");
                shared.transition(ConnectionState::Rejected).await;
                let _ = shared
                    .error_tx
                    .send(format!("relay rejected connection: {}", response.status()));
                return;
            }
            Ok(Err(error)) => {
                debug!(url = %shared.url, %error, "websocket connect failed");
            }
            Err(_) => {
                debug!(url = %shared.url, "websocket connect timed out");
            }
        }

        if shared.state().await == ConnectionState::Terminated {
            return;
        }

        attempt += 1;
        if attempt > shared.config.retry {
            shared.transition(ConnectionState::Error).await;
            let _ = shared.error_tx.send(format!(
                "giving up after {} reconnect attempts",
                shared.config.retry
            ));
            return;
        }
        shared.transition(ConnectionState::Reconnecting).await;
        tokio::time::sleep(reconnect_delay(&shared.config, attempt)).await;
        shared.transition(ConnectionState::Starting).await;
    }
}

/// Read until the socket closes or fails.
async fn read_frames(shared: &Shared, mut reader: WsReader) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => match RelayMessage::from_json(text.as_str()) {
                Ok(Some(message)) => {
                    let _ = shared.message_tx.send(message);
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(url = %shared.url, %error, "suppressing malformed frame");
                    let _ = shared.error_tx.send(format!("malformed frame: {error}"));
                }
            },
            Ok(Message::Ping(payload)) => {
                let mut writer = shared.writer.lock().await;
                if let Some(writer) = writer.as_mut() {
                    if let Err(error) = writer.send(Message::Pong(payload)).await {
                        debug!(url = %shared.url, %error, "pong failed");
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                warn!(url = %shared.url, %error, "websocket read error");
                break;
            }
        }
    }
}

fn reconnect_delay(config: &MuxConfig, attempt: u32) -> std::time::Duration {
    let shift = attempt.saturating_sub(1).min(16);
    config
        .reconnect_delay
        .saturating_mul(1_u32 << shift)
        .min(config.max_reconnect_delay)
}
