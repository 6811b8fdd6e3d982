//! NIP-01 events: signed events, unsigned parameters, hashing and signing.

use std::time::{SystemTime, UNIX_EPOCH};

use secp256k1::{Keypair, Message, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::keys::{KeyError, SECP, parse_secret_key};

/// A signed Nostr event as relays accept and deliver it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u64,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Values of single-letter tags named `tag`, e.g. `tag_values("e")`
    /// yields every referenced event id.
    pub fn tag_values<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a str> {
        self.tags
            .iter()
            .filter(move |entry| entry.first().is_some_and(|name| name == tag))
            .filter_map(|entry| entry.get(1).map(String::as_str))
    }
}

/// Parameters of an event that has not been signed yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventParams {
    pub kind: u64,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
    /// Unix seconds; the current time is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
}

/// Event signing error.
#[derive(Debug, Error)]
pub enum SignError {
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("invalid secp256k1 input: {0}")]
    Secp(#[from] secp256k1::Error),
}

/// Serialize the canonical form hashed into the event id:
/// `[0, pubkey, created_at, kind, tags, content]`.
pub fn serialize_event(
    pubkey: &str,
    created_at: u64,
    kind: u64,
    tags: &[Vec<String>],
    content: &str,
) -> String {
    serde_json::json!([0, pubkey, created_at, kind, tags, content]).to_string()
}

/// SHA256 hash of the canonical event serialization.
pub fn get_event_hash(
    pubkey: &str,
    created_at: u64,
    kind: u64,
    tags: &[Vec<String>],
    content: &str,
) -> [u8; 32] {
    let serialized = serialize_event(pubkey, created_at, kind, tags, content);
    Sha256::digest(serialized.as_bytes()).into()
}

/// Sign `params` with a hex or bech32 `nsec` secret key, producing a
/// complete event with id, pubkey and BIP-340 schnorr signature.
pub fn finalize_event(params: &EventParams, secret_key: &str) -> Result<Event, SignError> {
    let secret = parse_secret_key(secret_key)?;
    let secret_key = SecretKey::from_slice(&secret)?;
    let keypair = Keypair::from_secret_key(&SECP, &secret_key);
    let (xonly, _parity) = keypair.x_only_public_key();
    let pubkey = hex::encode(xonly.serialize());

    let created_at = match params.created_at {
        Some(seconds) => seconds,
        None => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    };

    let hash = get_event_hash(&pubkey, created_at, params.kind, &params.tags, &params.content);
    let message = Message::from_digest(hash);
    let signature = SECP.sign_schnorr(&message, &keypair);

    Ok(Event {
        id: hex::encode(hash),
        pubkey,
        created_at,
        kind: params.kind,
        tags: params.tags.clone(),
        content: params.content.clone(),
        sig: signature.to_string(),
    })
}
