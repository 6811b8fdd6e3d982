//! Client configuration.

use std::time::Duration;

/// Multiplexer configuration.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Reconnection attempts per connection lifetime before the transport
    /// enters its terminal error state.
    pub retry: u32,
    /// Idle window after which a backward or oneshot subscription stops
    /// waiting for relays that have not delivered EOSE.
    pub timeout: Duration,
    /// WebSocket open handshake timeout.
    pub connect_timeout: Duration,
    /// Initial delay before a reconnection attempt.
    pub reconnect_delay: Duration,
    /// Upper bound for the exponential reconnection delay.
    pub max_reconnect_delay: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            retry: 10,
            timeout: Duration::from_millis(10_000),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
        }
    }
}
