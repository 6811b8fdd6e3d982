//! Publication fan-out and acknowledgement collection.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use nostr::{ClientMessage, Event};
use tokio::sync::mpsc;
use tracing::debug;

use crate::packet::OkPacket;
use crate::pool::RelayPool;
use crate::transport::ConnectionState;

/// Pending publication waiting for OK frames, correlated by event id.
pub(crate) struct OkListener {
    tx: mpsc::Sender<OkPacket>,
    remaining: usize,
    /// Relays that already acknowledged; repeats from them are dropped.
    acked: HashSet<String>,
}

pub(crate) type OkListeners = Arc<Mutex<HashMap<String, OkListener>>>;

/// Deliver an OK frame to the publication waiting on its event id. At
/// most one packet is surfaced per `(relay, event id)` pair and the
/// listener is dropped once every writable relay has answered.
pub(crate) fn route_ok(listeners: &OkListeners, packet: OkPacket) {
    let mut listeners = listeners.lock().expect("ok listener lock");
    let Some(listener) = listeners.get_mut(&packet.event_id) else {
        return;
    };
    if !listener.acked.insert(packet.from.clone()) {
        debug!(from = %packet.from, event_id = %packet.event_id, "duplicate OK ignored");
        return;
    }
    let event_id = packet.event_id.clone();
    if listener.tx.try_send(packet).is_err() {
        debug!(%event_id, "acknowledgement receiver gone");
        listeners.remove(&event_id);
        return;
    }
    listener.remaining -= 1;
    if listener.remaining == 0 {
        listeners.remove(&event_id);
    }
}

/// Acknowledgements of one publication: yields at most one packet per
/// writable relay, then completes. Dropping it releases the listener.
pub struct OkStream {
    rx: mpsc::Receiver<OkPacket>,
    _guard: OkGuard,
}

impl OkStream {
    /// Next acknowledgement; `None` once every writable relay answered
    /// or the publication was released.
    pub async fn recv(&mut self) -> Option<OkPacket> {
        self.rx.recv().await
    }
}

struct OkGuard {
    listeners: OkListeners,
    event_id: String,
}

impl Drop for OkGuard {
    fn drop(&mut self) {
        self.listeners
            .lock()
            .expect("ok listener lock")
            .remove(&self.event_id);
    }
}

/// Send a signed event to every writable relay and return the
/// acknowledgement stream. Write-only relays that were never started by
/// a read transition are started on demand.
pub(crate) async fn publish(
    pool: &mut RelayPool,
    listeners: &OkListeners,
    event: Event,
) -> OkStream {
    let writable = pool.writable();
    let count = writable.len();

    let (tx, rx) = mpsc::channel(count.max(1));
    if count > 0 {
        listeners.lock().expect("ok listener lock").insert(
            event.id.clone(),
            OkListener {
                tx,
                remaining: count,
                acked: HashSet::new(),
            },
        );
    }

    let frame = ClientMessage::Event(event.clone());
    for (url, transport) in &writable {
        if transport.state().await == ConnectionState::Initialized {
            debug!(%url, "starting write-only relay on demand");
            transport.start().await;
        }
        transport.send(frame.clone()).await;
    }

    OkStream {
        rx,
        _guard: OkGuard {
            listeners: Arc::clone(listeners),
            event_id: event.id,
        },
    }
}
