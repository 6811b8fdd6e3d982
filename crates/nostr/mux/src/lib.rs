//! Relay-multiplexing Nostr client.
//!
//! This crate multiplexes subscriptions and event publication across a
//! dynamic pool of relays:
//! - per-relay WebSocket transports with bounded automatic reconnection
//! - pool reconciliation reacting to membership and read/write changes
//!   while subscriptions are live
//! - forward, backward and oneshot subscription strategies with per-relay
//!   EOSE tracking and idle timeouts
//! - publication fan-out with per-relay acknowledgement collection

mod client;
mod config;
mod error;
mod packet;
mod pool;
mod publish;
mod req;
mod signer;
mod subscription;
mod transport;

pub use client::MuxClient;
pub use config::MuxConfig;
pub use error::{MuxError, Result};
pub use packet::{ConnectionStatePacket, ErrorPacket, EventPacket, MessagePacket, OkPacket};
pub use pool::{RelayEndpoint, normalize_relay_url};
pub use publish::OkStream;
pub use req::{ReqEmitter, ReqSource, ReqStrategy};
pub use signer::{NullSigner, Signer};
pub use subscription::EventStream;
pub use transport::{
    ConnectionState, Transport, TransportFactory, WebSocketFactory, WebSocketTransport,
};
