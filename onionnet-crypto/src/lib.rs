//! # onionnet Crypto
//!
//! Cryptographic primitives for the onionnet overlay.
//!
//! Every hop of a circuit is protected by two primitives:
//! - **RSA-2048 / OAEP-SHA256** wraps the per-hop symmetric key under the
//!   relay's long-lived public key
//! - **AES-256-CBC** with a fresh random IV encrypts the layer itself
//!
//! Keys and ciphertexts travel as standard base64 strings so they can be
//! embedded in JSON envelopes and registry records unchanged.
//!
//! ## Example
//!
//! ```rust,ignore
//! use onionnet_crypto::{asymmetric, symmetric};
//!
//! let relay = asymmetric::generate_key_pair()?;
//! let hop_key = symmetric::generate_key();
//!
//! // Sender side
//! let wrapped = asymmetric::encrypt(hop_key.as_bytes(), &relay.public_key)?;
//! let token = symmetric::encrypt(&hop_key, b"layer bytes")?;
//!
//! // Relay side
//! let unwrapped = asymmetric::decrypt(&wrapped, &relay.private_key)?;
//! let key = symmetric::SymmetricKey::from_slice(&unwrapped)?;
//! assert_eq!(symmetric::decrypt(&key, &token)?, b"layer bytes");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod asymmetric;
pub mod symmetric;

pub use asymmetric::{KeyPair, MAX_RSA_PLAINTEXT, RSA_MODULUS_BITS};
pub use symmetric::{SymmetricKey, IV_SIZE, SYMMETRIC_KEY_SIZE, TOKEN_DELIMITER};

pub use rsa::{RsaPrivateKey, RsaPublicKey};

use base64::{Engine, engine::general_purpose::STANDARD};
use thiserror::Error;

/// Errors that can occur during onionnet cryptographic operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key pair generation failed (entropy or algorithm failure).
    #[error("Key generation failed: {0}")]
    KeyGen(String),

    /// A key could not be imported or has the wrong size.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Encryption failed.
    #[error("Encryption failed: {0}")]
    Encrypt(String),

    /// Decryption failed (wrong key, corrupted or malformed ciphertext).
    #[error("Decryption failed: {0}")]
    Decrypt(String),

    /// The plaintext exceeds what the cipher can carry in one operation.
    #[error("Payload too large: {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge {
        /// Length of the rejected plaintext.
        len: usize,
        /// Maximum accepted length.
        max: usize,
    },
}

/// Result type for onionnet crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Encode bytes as standard (padded) base64.
pub fn to_base64(bytes: impl AsRef<[u8]>) -> String {
    STANDARD.encode(bytes)
}

/// Decode standard base64; non-canonical input is rejected.
pub fn from_base64(encoded: &str) -> std::result::Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(encoded)
}
