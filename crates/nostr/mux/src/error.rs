//! Client error types.

use thiserror::Error;

/// Multiplexer error type.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("invalid relay URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("unknown relay: {0}")]
    UnknownRelay(String),

    #[error("subscription id '{0}' is already in use")]
    SubscriptionExists(String),

    #[error("subscription id must not be empty")]
    EmptySubscriptionId,

    #[error("signing error: {0}")]
    Sign(#[from] nostr::SignError),

    #[error("no external signer configured and no secret key provided")]
    NoSigner,

    #[error("external signer error: {0}")]
    Signer(String),

    #[error("client is disposed")]
    Disposed,
}

/// Multiplexer result type.
pub type Result<T> = std::result::Result<T, MuxError>;
