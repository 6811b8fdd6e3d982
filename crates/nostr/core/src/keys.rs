//! Secret key parsing and public key derivation.

use std::sync::LazyLock;

use secp256k1::{All, Keypair, Secp256k1, SecretKey};
use thiserror::Error;

const NSEC_HRP: &str = "nsec";

/// Shared secp256k1 context for signing operations.
pub(crate) static SECP: LazyLock<Secp256k1<All>> = LazyLock::new(Secp256k1::new);

/// Key material error.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid bech32 secret key: {0}")]
    InvalidBech32(String),

    #[error("expected bech32 prefix '{NSEC_HRP}', got '{0}'")]
    WrongPrefix(String),

    #[error("secret key must be 32 bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid secp256k1 secret key: {0}")]
    InvalidKey(#[from] secp256k1::Error),
}

/// Parse a secret key given either as 64 hex characters or as a bech32
/// `nsec` string.
pub fn parse_secret_key(input: &str) -> Result<[u8; 32], KeyError> {
    let trimmed = input.trim();
    let bytes = match hex::decode(trimmed) {
        Ok(bytes) => bytes,
        Err(_) => {
            let (hrp, data) = bech32::decode(trimmed)
                .map_err(|error| KeyError::InvalidBech32(error.to_string()))?;
            if hrp.as_str() != NSEC_HRP {
                return Err(KeyError::WrongPrefix(hrp.to_string()));
            }
            data
        }
    };

    let mut secret = [0_u8; 32];
    if bytes.len() != secret.len() {
        return Err(KeyError::InvalidLength(bytes.len()));
    }
    secret.copy_from_slice(&bytes);
    SecretKey::from_slice(&secret)?;
    Ok(secret)
}

/// Derive the x-only public key for a secret key, hex-encoded.
pub fn public_key_hex(secret: &[u8; 32]) -> Result<String, KeyError> {
    let secret_key = SecretKey::from_slice(secret)?;
    let keypair = Keypair::from_secret_key(&SECP, &secret_key);
    let (xonly, _parity) = keypair.x_only_public_key();
    Ok(hex::encode(xonly.serialize()))
}
