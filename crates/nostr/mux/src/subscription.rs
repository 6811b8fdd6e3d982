//! Subscription engine: strategy-driven REQ/CLOSE emission and per-relay
//! EOSE tracking.
//!
//! Each bound request runs as one driver task stepped by filter emissions,
//! routed relay messages, connection state transitions and idle timeouts.
//! Backward and oneshot requests keep one [`PendingReq`] per emission and
//! complete it once every readable relay has either drained terminally or
//! delivered EOSE while ongoing.

use std::collections::HashSet;
use std::sync::Arc;

use nostr::RelayMessage;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::debug;

use crate::client::ClientInner;
use crate::packet::{ConnectionStatePacket, EventPacket, MessagePacket};
use crate::req::{ReqSource, ReqStrategy, subscription_id};
use crate::transport::ConnectionState;

/// Events delivered for one bound request. Completes when the strategy
/// finishes; dropping it closes the subscription on every relay still
/// serving it.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<EventPacket>,
    _cancel: mpsc::Sender<()>,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<EventPacket>, cancel: mpsc::Sender<()>) -> Self {
        Self {
            rx,
            _cancel: cancel,
        }
    }

    /// Next event packet; `None` once the subscription completed.
    pub async fn recv(&mut self) -> Option<EventPacket> {
        self.rx.recv().await
    }
}

/// One in-flight backward/oneshot REQ.
struct PendingReq {
    sub_id: String,
    eose_relays: HashSet<String>,
    deadline: Instant,
}

impl PendingReq {
    fn new(sub_id: String, timeout: std::time::Duration) -> Self {
        Self {
            sub_id,
            eose_relays: HashSet::new(),
            deadline: Instant::now() + timeout,
        }
    }
}

/// Every readable relay has either ended its lifetime or is ongoing and
/// has delivered EOSE for this REQ.
async fn is_complete(inner: &ClientInner, req: &PendingReq) -> bool {
    inner
        .readable_states()
        .await
        .iter()
        .all(|(url, state)| {
            state.is_terminal()
                || (*state == ConnectionState::Ongoing && req.eose_relays.contains(url))
        })
}

pub(crate) async fn run_subscription(
    inner: Arc<ClientInner>,
    source: ReqSource,
    mut packet_rx: mpsc::UnboundedReceiver<MessagePacket>,
    mut state_rx: broadcast::Receiver<ConnectionStatePacket>,
    event_tx: mpsc::UnboundedSender<EventPacket>,
    mut cancel_rx: mpsc::Receiver<()>,
) {
    let ReqSource {
        id,
        strategy,
        rx: mut source_rx,
    } = source;
    let timeout = inner.config().timeout;

    let mut next_index: u64 = 0;
    let mut emitted = false;
    let mut source_done = false;
    let mut states_closed = false;
    let mut pending: Vec<PendingReq> = Vec::new();
    let mut forward_sub_id: Option<String> = None;

    loop {
        let finished = match strategy {
            ReqStrategy::Forward => false,
            ReqStrategy::Oneshot => (emitted || source_done) && pending.is_empty(),
            ReqStrategy::Backward => source_done && pending.is_empty(),
        };
        if finished {
            break;
        }

        let next_deadline = pending.iter().map(|req| req.deadline).min();

        tokio::select! {
            maybe_filters = source_rx.recv(), if !source_done => {
                let Some(filters) = maybe_filters else {
                    source_done = true;
                    continue;
                };
                if filters.is_empty() || (strategy == ReqStrategy::Oneshot && emitted) {
                    continue;
                }
                emitted = true;
                match strategy {
                    ReqStrategy::Forward => {
                        let sub_id = subscription_id(&id, 0);
                        inner.forward_req(&sub_id, filters).await;
                        forward_sub_id = Some(sub_id);
                    }
                    ReqStrategy::Backward | ReqStrategy::Oneshot => {
                        let sub_id = subscription_id(&id, next_index);
                        next_index += 1;
                        inner.backward_req(&sub_id, filters).await;
                        let req = PendingReq::new(sub_id, timeout);
                        if is_complete(&inner, &req).await {
                            inner.close_everywhere(&req.sub_id).await;
                        } else {
                            pending.push(req);
                        }
                    }
                }
            }

            maybe_packet = packet_rx.recv() => {
                let Some(packet) = maybe_packet else {
                    // client disposed
                    break;
                };
                handle_packet(
                    &inner,
                    strategy,
                    &forward_sub_id,
                    &mut pending,
                    &event_tx,
                    packet,
                    timeout,
                )
                .await;
            }

            state_change = state_rx.recv(), if !states_closed => {
                match state_change {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        reevaluate_all(&inner, &mut pending, timeout).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        states_closed = true;
                    }
                }
            }

            _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                if next_deadline.is_some() =>
            {
                let now = Instant::now();
                let mut index = 0;
                while index < pending.len() {
                    if pending[index].deadline <= now {
                        let done = pending.remove(index);
                        debug!(sub_id = %done.sub_id, "subscription idle timeout");
                        inner.close_everywhere(&done.sub_id).await;
                    } else {
                        index += 1;
                    }
                }
            }

            _ = cancel_rx.recv() => {
                // caller dropped the event stream
                break;
            }
        }
    }

    if let Some(sub_id) = forward_sub_id {
        inner.remove_registry(&sub_id);
        inner.close_everywhere(&sub_id).await;
    }
    for req in pending {
        inner.close_everywhere(&req.sub_id).await;
    }
    inner.deregister(&id);
}

async fn handle_packet(
    inner: &ClientInner,
    strategy: ReqStrategy,
    forward_sub_id: &Option<String>,
    pending: &mut Vec<PendingReq>,
    event_tx: &mpsc::UnboundedSender<EventPacket>,
    packet: MessagePacket,
    timeout: std::time::Duration,
) {
    let MessagePacket { from, message } = packet;
    match message {
        RelayMessage::Event {
            subscription_id,
            event,
        } => {
            if strategy == ReqStrategy::Forward {
                if forward_sub_id.as_deref() == Some(subscription_id.as_str()) {
                    let _ = event_tx.send(EventPacket {
                        from,
                        subscription_id,
                        event,
                    });
                }
                return;
            }
            let Some(req) = pending
                .iter_mut()
                .find(|req| req.sub_id == subscription_id)
            else {
                // completed or never ours: drop
                return;
            };
            if req.eose_relays.contains(&from) {
                return;
            }
            req.deadline = Instant::now() + timeout;
            let _ = event_tx.send(EventPacket {
                from,
                subscription_id,
                event,
            });
        }

        RelayMessage::Eose { subscription_id } => {
            if strategy == ReqStrategy::Forward {
                return;
            }
            let Some(position) = pending
                .iter()
                .position(|req| req.sub_id == subscription_id)
            else {
                return;
            };
            if !pending[position].eose_relays.insert(from.clone()) {
                // duplicate EOSE from this relay
                return;
            }
            inner.close_one(&from, &subscription_id).await;
            pending[position].deadline = Instant::now() + timeout;
            if is_complete(inner, &pending[position]).await {
                let done = pending.remove(position);
                inner.close_everywhere(&done.sub_id).await;
            }
        }

        RelayMessage::Closed {
            subscription_id, ..
        } => {
            // the relay ended it; no CLOSE goes back
            inner.mark_closed(&from, &subscription_id).await;
            if strategy == ReqStrategy::Forward {
                return;
            }
            let Some(position) = pending
                .iter()
                .position(|req| req.sub_id == subscription_id)
            else {
                return;
            };
            if !pending[position].eose_relays.insert(from) {
                return;
            }
            pending[position].deadline = Instant::now() + timeout;
            if is_complete(inner, &pending[position]).await {
                let done = pending.remove(position);
                inner.close_everywhere(&done.sub_id).await;
            }
        }

        _ => {}
    }
}

async fn reevaluate_all(
    inner: &ClientInner,
    pending: &mut Vec<PendingReq>,
    timeout: std::time::Duration,
) {
    let mut index = 0;
    while index < pending.len() {
        pending[index].deadline = Instant::now() + timeout;
        if is_complete(inner, &pending[index]).await {
            let done = pending.remove(index);
            inner.close_everywhere(&done.sub_id).await;
        } else {
            index += 1;
        }
    }
}
