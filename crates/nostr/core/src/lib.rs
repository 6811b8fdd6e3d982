//! Nostr protocol types for the relay multiplexer.
//!
//! This crate provides:
//! - NIP-01 events, unsigned event parameters, id hashing and schnorr signing
//! - subscription filters with client-side matching helpers
//! - the JSON-array wire messages exchanged with relays

mod event;
mod filter;
mod keys;
mod message;

pub use event::{Event, EventParams, SignError, finalize_event, get_event_hash, serialize_event};
pub use filter::Filter;
pub use keys::{KeyError, parse_secret_key, public_key_hex};
pub use message::{ClientMessage, MessageError, RelayMessage};
