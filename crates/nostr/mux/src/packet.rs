//! Packets tagging relay traffic with its origin.

use nostr::{Event, RelayMessage};

use crate::transport::ConnectionState;

/// Any relay message, tagged with the relay it came from.
#[derive(Debug, Clone)]
pub struct MessagePacket {
    pub from: String,
    pub message: RelayMessage,
}

/// An EVENT frame delivered for a subscription.
#[derive(Debug, Clone)]
pub struct EventPacket {
    pub from: String,
    pub subscription_id: String,
    pub event: Event,
}

/// A publication acknowledgement from one relay.
#[derive(Debug, Clone)]
pub struct OkPacket {
    pub from: String,
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
}

/// A terminal transport failure.
#[derive(Debug, Clone)]
pub struct ErrorPacket {
    pub from: String,
    pub reason: String,
}

/// A connection state transition on one relay.
#[derive(Debug, Clone)]
pub struct ConnectionStatePacket {
    pub from: String,
    pub state: ConnectionState,
}
