//! Event signing seam.
//!
//! Signing is injected so hosts can route publication through an external
//! signer (a NIP-07 style extension, a remote signer process). The key
//! path is pure and available on every implementation.

use async_trait::async_trait;
use nostr::{Event, EventParams, finalize_event};

use crate::error::{MuxError, Result};

/// Signs events for the publication path.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign with a caller-provided hex or bech32 `nsec` secret key.
    fn sign_by_key(&self, params: &EventParams, secret_key: &str) -> Result<Event> {
        Ok(finalize_event(params, secret_key)?)
    }

    /// Sign through the external backend. Used when no key is supplied.
    async fn sign(&self, params: &EventParams) -> Result<Event>;
}

/// Signer without an external backend: key-based signing only.
#[derive(Debug, Default)]
pub struct NullSigner;

#[async_trait]
impl Signer for NullSigner {
    async fn sign(&self, _params: &EventParams) -> Result<Event> {
        Err(MuxError::NoSigner)
    }
}
