//! Relay pool: the authoritative url → relay record mapping.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use nostr::ClientMessage;
use tracing::debug;
use url::Url;

use crate::config::MuxConfig;
use crate::error::{MuxError, Result};
use crate::transport::{ConnectionState, Transport, TransportFactory};

/// Desired membership of one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub url: String,
    pub read: bool,
    pub write: bool,
}

impl RelayEndpoint {
    /// A relay used for both subscriptions and publication.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            read: true,
            write: true,
        }
    }

    pub fn read_only(url: impl Into<String>) -> Self {
        Self {
            write: false,
            ..Self::new(url)
        }
    }

    pub fn write_only(url: impl Into<String>) -> Self {
        Self {
            read: false,
            ..Self::new(url)
        }
    }
}

/// Canonicalize a relay URL; the scheme must be ws or wss and is
/// preserved. All pool lookups use the normalized form.
pub fn normalize_relay_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())?;
    if url.scheme() != "ws" && url.scheme() != "wss" {
        return Err(MuxError::InvalidUrl {
            url: raw.to_string(),
            reason: format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            ),
        });
    }
    Ok(url)
}

pub(crate) struct RelayRecord {
    pub read: bool,
    pub write: bool,
    pub transport: Arc<dyn Transport>,
    /// Subscription ids for which this relay has received a REQ and no
    /// matching CLOSE yet.
    pub active_sub_ids: HashSet<String>,
}

pub(crate) struct RelayPool {
    records: HashMap<String, RelayRecord>,
    factory: Arc<dyn TransportFactory>,
    config: MuxConfig,
}

impl RelayPool {
    pub fn new(factory: Arc<dyn TransportFactory>, config: MuxConfig) -> Self {
        Self {
            records: HashMap::new(),
            factory,
            config,
        }
    }

    /// Reconcile the pool against `endpoints`: finalize and stop relays
    /// losing their read flag, start newly-readable relays and rehydrate
    /// them from `registry`, dispose relays leaving the pool entirely.
    /// Last-wins on duplicate normalized URLs. `on_create` runs for each
    /// first-time member before its transport starts, so the caller can
    /// attach its pumps without losing early frames.
    pub async fn switch<F>(
        &mut self,
        endpoints: impl IntoIterator<Item = RelayEndpoint>,
        registry: &HashMap<String, ClientMessage>,
        mut on_create: F,
    ) -> Result<()>
    where
        F: FnMut(&str, &Arc<dyn Transport>),
    {
        let mut target: HashMap<String, (Url, bool, bool)> = HashMap::new();
        for endpoint in endpoints {
            let url = normalize_relay_url(&endpoint.url)?;
            target.insert(url.to_string(), (url, endpoint.read, endpoint.write));
        }

        let prev_readable: HashSet<String> = self
            .records
            .iter()
            .filter(|(_, record)| record.read)
            .map(|(url, _)| url.clone())
            .collect();
        let next_readable: HashSet<String> = target
            .iter()
            .filter(|(_, (_, read, _))| *read)
            .map(|(url, _)| url.clone())
            .collect();

        // Drop CLOSEs strictly before add REQs.
        for url in prev_readable.difference(&next_readable) {
            if let Some(record) = self.records.get_mut(url) {
                debug!(%url, "relay no longer readable");
                let active: Vec<String> = record.active_sub_ids.drain().collect();
                for sub_id in active {
                    record.transport.send(ClientMessage::close(sub_id)).await;
                }
                record.transport.stop().await;
            }
        }

        for (key, (url, read, write)) in &target {
            if !self.records.contains_key(key) {
                let transport = self.factory.create(url, &self.config);
                on_create(key, &transport);
                self.records.insert(
                    key.clone(),
                    RelayRecord {
                        read: *read,
                        write: *write,
                        transport,
                        active_sub_ids: HashSet::new(),
                    },
                );
            }
        }

        for url in next_readable.difference(&prev_readable) {
            if let Some(record) = self.records.get_mut(url) {
                debug!(%url, "relay became readable");
                record.transport.start().await;
                for (sub_id, frame) in registry {
                    record.transport.send(frame.clone()).await;
                    record.active_sub_ids.insert(sub_id.clone());
                }
            }
        }

        let gone: Vec<String> = self
            .records
            .keys()
            .filter(|url| !target.contains_key(*url))
            .cloned()
            .collect();
        for url in gone {
            if let Some(record) = self.records.remove(&url) {
                debug!(%url, "relay removed from pool");
                record.transport.dispose().await;
            }
        }

        for (key, (_, read, write)) in &target {
            if let Some(record) = self.records.get_mut(key) {
                record.read = *read;
                record.write = *write;
            }
        }

        Ok(())
    }

    /// Current membership, for single-element switch applications.
    pub fn endpoints(&self) -> Vec<RelayEndpoint> {
        self.records
            .iter()
            .map(|(url, record)| RelayEndpoint {
                url: url.clone(),
                read: record.read,
                write: record.write,
            })
            .collect()
    }

    /// Send a forward REQ to every readable relay, replacing any running
    /// subscription with the same id.
    pub async fn send_req_forward(&mut self, sub_id: &str, frame: &ClientMessage) {
        for record in self.records.values_mut().filter(|record| record.read) {
            record.transport.send(frame.clone()).await;
            record.active_sub_ids.insert(sub_id.to_string());
        }
    }

    /// Send a backward/oneshot REQ to every readable relay not already
    /// serving this subscription id.
    pub async fn send_req_backward(&mut self, sub_id: &str, frame: &ClientMessage) {
        for record in self.records.values_mut().filter(|record| record.read) {
            if record.active_sub_ids.insert(sub_id.to_string()) {
                record.transport.send(frame.clone()).await;
            }
        }
    }

    /// CLOSE one subscription on one relay, if it is active there.
    pub async fn close_one(&mut self, url: &str, sub_id: &str) {
        if let Some(record) = self.records.get_mut(url)
            && record.active_sub_ids.remove(sub_id)
        {
            record.transport.send(ClientMessage::close(sub_id)).await;
        }
    }

    /// Mark a subscription inactive on one relay without sending CLOSE
    /// (the relay already ended it).
    pub fn mark_closed(&mut self, url: &str, sub_id: &str) {
        if let Some(record) = self.records.get_mut(url) {
            record.active_sub_ids.remove(sub_id);
        }
    }

    /// CLOSE a subscription on every relay still holding it.
    pub async fn close_everywhere(&mut self, sub_id: &str) {
        for record in self.records.values_mut() {
            if record.active_sub_ids.remove(sub_id) {
                record.transport.send(ClientMessage::close(sub_id)).await;
            }
        }
    }

    /// Connection state per readable relay, for completion evaluation.
    pub async fn readable_states(&self) -> Vec<(String, ConnectionState)> {
        let mut states = Vec::new();
        for (url, record) in self.records.iter().filter(|(_, record)| record.read) {
            states.push((url.clone(), record.transport.state().await));
        }
        states
    }

    pub fn transport(&self, url: &str) -> Option<Arc<dyn Transport>> {
        self.records
            .get(url)
            .map(|record| Arc::clone(&record.transport))
    }

    pub async fn relay_state(&self, url: &str) -> Option<ConnectionState> {
        match self.records.get(url) {
            Some(record) => Some(record.transport.state().await),
            None => None,
        }
    }

    /// Writable relays for publication fan-out.
    pub fn writable(&self) -> Vec<(String, Arc<dyn Transport>)> {
        self.records
            .iter()
            .filter(|(_, record)| record.write)
            .map(|(url, record)| (url.clone(), Arc::clone(&record.transport)))
            .collect()
    }

    /// Forget every active subscription of a terminally failed relay so
    /// a later readd re-issues REQs.
    pub fn clear_active(&mut self, url: &str) {
        if let Some(record) = self.records.get_mut(url) {
            record.active_sub_ids.clear();
        }
    }

    pub async fn dispose_all(&mut self) {
        for (_, record) in self.records.drain() {
            record.transport.dispose().await;
        }
    }
}
