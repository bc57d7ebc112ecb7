//! # onionnet Crypto - Asymmetric Module
//!
//! RSA key pairs owned by relays and users. The public half is published
//! through the registry; senders use it to wrap the symmetric key of the
//! hop that relay will peel.
//!
//! Exported keys are base64 DER: SPKI for public keys, PKCS#8 for private
//! keys.

use std::fmt;

use rand_core::CryptoRngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::{CryptoError, Result, from_base64, to_base64};

/// Modulus size of every onionnet RSA key.
pub const RSA_MODULUS_BITS: usize = 2048;

/// Largest plaintext RSA-OAEP-SHA256 accepts with a 2048-bit modulus:
/// `k - 2 * hLen - 2 = 256 - 64 - 2`.
pub const MAX_RSA_PLAINTEXT: usize = RSA_MODULUS_BITS / 8 - 2 * 32 - 2;

/// A relay or user key pair, generated once per process lifetime.
#[derive(Clone)]
pub struct KeyPair {
    /// Public key, shared through the registry.
    pub public_key: RsaPublicKey,
    /// Private key, never sent anywhere except the registry shortcut.
    pub private_key: RsaPrivateKey,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &export_public(&self.public_key).ok())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl KeyPair {
    /// Export the public half as base64 SPKI.
    pub fn export_public(&self) -> Result<String> {
        export_public(&self.public_key)
    }

    /// Export the private half as base64 PKCS#8.
    pub fn export_private(&self) -> Result<String> {
        export_private(Some(&self.private_key))?
            .ok_or_else(|| CryptoError::InvalidKey("private key missing".into()))
    }
}

/// Generate a fresh RSA-2048 key pair from the thread-local CSPRNG.
pub fn generate_key_pair() -> Result<KeyPair> {
    generate_key_pair_with(&mut rand::thread_rng())
}

/// Generate a fresh RSA-2048 key pair from the given RNG.
pub fn generate_key_pair_with<R: CryptoRngCore>(rng: &mut R) -> Result<KeyPair> {
    let private_key = RsaPrivateKey::new(rng, RSA_MODULUS_BITS)
        .map_err(|e| CryptoError::KeyGen(e.to_string()))?;
    let public_key = RsaPublicKey::from(&private_key);

    Ok(KeyPair {
        public_key,
        private_key,
    })
}

/// Export a public key as base64 SPKI DER.
pub fn export_public(key: &RsaPublicKey) -> Result<String> {
    let der = key
        .to_public_key_der()
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(to_base64(der.as_bytes()))
}

/// Export a private key as base64 PKCS#8 DER.
///
/// A holder without a private key is a valid state, so `None` maps to
/// `Ok(None)` rather than an error.
pub fn export_private(key: Option<&RsaPrivateKey>) -> Result<Option<String>> {
    let Some(key) = key else {
        return Ok(None);
    };

    let der = key
        .to_pkcs8_der()
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(Some(to_base64(der.as_bytes())))
}

/// Import a base64 SPKI public key.
pub fn import_public(encoded: &str) -> Result<RsaPublicKey> {
    let der = from_base64(encoded).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    RsaPublicKey::from_public_key_der(&der).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Import a base64 PKCS#8 private key.
pub fn import_private(encoded: &str) -> Result<RsaPrivateKey> {
    let der = from_base64(encoded).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    RsaPrivateKey::from_pkcs8_der(&der).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Encrypt a short token (at most [`MAX_RSA_PLAINTEXT`] bytes) with RSA-OAEP.
///
/// Only symmetric key material and similar short tokens go through here;
/// bulk message bytes belong to the symmetric cipher.
pub fn encrypt(plaintext: &[u8], public_key: &RsaPublicKey) -> Result<Vec<u8>> {
    encrypt_with(&mut rand::thread_rng(), plaintext, public_key)
}

/// [`encrypt`] with an explicit RNG for the OAEP seed.
pub fn encrypt_with<R: CryptoRngCore>(
    rng: &mut R,
    plaintext: &[u8],
    public_key: &RsaPublicKey,
) -> Result<Vec<u8>> {
    if plaintext.len() > MAX_RSA_PLAINTEXT {
        return Err(CryptoError::PayloadTooLarge {
            len: plaintext.len(),
            max: MAX_RSA_PLAINTEXT,
        });
    }

    public_key
        .encrypt(rng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| CryptoError::Encrypt(e.to_string()))
}

/// Decrypt an RSA-OAEP ciphertext.
///
/// # Errors
/// `Decrypt` if the ciphertext was produced for another key or is corrupted.
pub fn decrypt(ciphertext: &[u8], private_key: &RsaPrivateKey) -> Result<Vec<u8>> {
    private_key
        .decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map_err(|e| CryptoError::Decrypt(e.to_string()))
}

/// Encrypt base64 data under a base64 public key, returning base64.
pub fn rsa_encrypt(data_b64: &str, public_key_b64: &str) -> Result<String> {
    let data = from_base64(data_b64).map_err(|e| CryptoError::Encrypt(e.to_string()))?;
    let public_key = import_public(public_key_b64)?;
    Ok(to_base64(encrypt(&data, &public_key)?))
}

/// Decrypt a base64 ciphertext, returning the plaintext as base64.
pub fn rsa_decrypt(ciphertext_b64: &str, private_key: &RsaPrivateKey) -> Result<String> {
    let ciphertext =
        from_base64(ciphertext_b64).map_err(|e| CryptoError::Decrypt(e.to_string()))?;
    Ok(to_base64(decrypt(&ciphertext, private_key)?))
}
