//! Caller-facing subscription requests.
//!
//! A [`ReqSource`] couples a caller-scoped id with a strategy and a lazy
//! stream of filter emissions. Binding one to the client yields the event
//! stream; the paired [`ReqEmitter`] pushes filter updates while the
//! subscription is live. Empty filter lists are ignored.

use nostr::Filter;
use tokio::sync::mpsc;

/// How subscription ids are attached and completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqStrategy {
    /// One reusable subscription id; each emission replaces the running
    /// REQ on every relay. Never completes on its own.
    Forward,
    /// A fresh subscription id per emission; each runs to EOSE and
    /// closes relay by relay.
    Backward,
    /// Like forward but only the first emission is honored; completes
    /// once every relay has drained.
    Oneshot,
}

/// Pushes filter updates into a live request.
#[derive(Debug, Clone)]
pub struct ReqEmitter {
    tx: mpsc::UnboundedSender<Vec<Filter>>,
}

impl ReqEmitter {
    /// Emit a filter list. Returns false once the subscription is gone.
    pub fn emit(&self, filters: Vec<Filter>) -> bool {
        self.tx.send(filters).is_ok()
    }
}

/// A subscription request to bind with `MuxClient::subscribe`.
pub struct ReqSource {
    pub(crate) id: String,
    pub(crate) strategy: ReqStrategy,
    pub(crate) rx: mpsc::UnboundedReceiver<Vec<Filter>>,
}

impl ReqSource {
    fn channel(id: impl Into<String>, strategy: ReqStrategy) -> (Self, ReqEmitter) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: id.into(),
                strategy,
                rx,
            },
            ReqEmitter { tx },
        )
    }

    /// A forward request: live subscription with in-place filter updates.
    pub fn forward(id: impl Into<String>) -> (Self, ReqEmitter) {
        Self::channel(id, ReqStrategy::Forward)
    }

    /// A backward request: each emission queries stored events to EOSE.
    pub fn backward(id: impl Into<String>) -> (Self, ReqEmitter) {
        Self::channel(id, ReqStrategy::Backward)
    }

    /// A oneshot request carrying its single filter list up front.
    pub fn oneshot(id: impl Into<String>, filters: Vec<Filter>) -> Self {
        let (source, emitter) = Self::channel(id, ReqStrategy::Oneshot);
        emitter.emit(filters);
        source
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn strategy(&self) -> ReqStrategy {
        self.strategy
    }
}

/// Subscription id for the `index`-th emission of request `id`.
pub(crate) fn subscription_id(id: &str, index: u64) -> String {
    format!("{id}:{index}")
}

/// The request id a routed subscription id belongs to.
pub(crate) fn request_id(subscription_id: &str) -> Option<&str> {
    subscription_id.rsplit_once(':').map(|(id, _)| id)
}
