//! # onionnet Crypto - Symmetric Module
//!
//! Per-hop AES-256 keys and the CBC token format used for layer payloads.
//!
//! Token format:
//! ```text
//! base64(iv) "." base64(ciphertext)
//! ```
//! Standard base64 never produces `.`, so the split is unambiguous.

use aes::Aes256;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use rand::RngCore;
use rand_core::CryptoRngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CryptoError, Result, from_base64, to_base64};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Size of an AES-256 key in bytes.
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Size of the CBC initialization vector in bytes.
pub const IV_SIZE: usize = 16;

/// Separator between the IV and ciphertext parts of a token.
pub const TOKEN_DELIMITER: char = '.';

/// An ephemeral AES-256 key, wiped from memory when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; SYMMETRIC_KEY_SIZE]);

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

impl SymmetricKey {
    /// Generate a key from the given RNG.
    pub fn generate_with<R: CryptoRngCore>(rng: &mut R) -> Self {
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Wrap a raw key slice, rejecting anything but 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; SYMMETRIC_KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "expected {} key bytes, got {}",
                SYMMETRIC_KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(raw))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.0
    }
}

/// Generate a fresh 256-bit key from the thread-local CSPRNG.
pub fn generate_key() -> SymmetricKey {
    SymmetricKey::generate_with(&mut rand::thread_rng())
}

/// Export the raw key bytes as base64.
pub fn export_key(key: &SymmetricKey) -> String {
    to_base64(key.as_bytes())
}

/// Import a base64 raw key.
pub fn import_key(encoded: &str) -> Result<SymmetricKey> {
    let mut raw = from_base64(encoded).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let key = SymmetricKey::from_slice(&raw);
    raw.zeroize();
    key
}

/// Encrypt `plaintext` under `key` with a fresh random IV.
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<String> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    encrypt_with_iv(key, &iv, plaintext)
}

fn encrypt_with_iv(key: &SymmetricKey, iv: &[u8; IV_SIZE], plaintext: &[u8]) -> Result<String> {
    let cipher = Aes256CbcEnc::new_from_slices(key.as_bytes(), iv)
        .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    Ok(format!(
        "{}{}{}",
        to_base64(iv),
        TOKEN_DELIMITER,
        to_base64(&ciphertext)
    ))
}

/// Decrypt a token produced by [`encrypt`].
///
/// # Errors
/// `Decrypt` if the token is malformed (delimiter, base64, IV or block
/// length) or the padding check fails, which is how a wrong key or
/// corrupted ciphertext usually surfaces.
pub fn decrypt(key: &SymmetricKey, token: &str) -> Result<Vec<u8>> {
    let (iv_part, ciphertext_part) = token
        .split_once(TOKEN_DELIMITER)
        .ok_or_else(|| CryptoError::Decrypt("token is missing the IV delimiter".into()))?;
    if ciphertext_part.contains(TOKEN_DELIMITER) {
        return Err(CryptoError::Decrypt("token has too many parts".into()));
    }

    let iv = from_base64(iv_part).map_err(|e| CryptoError::Decrypt(format!("IV: {}", e)))?;
    if iv.len() != IV_SIZE {
        return Err(CryptoError::Decrypt(format!(
            "IV must be {} bytes, got {}",
            IV_SIZE,
            iv.len()
        )));
    }

    let ciphertext = from_base64(ciphertext_part)
        .map_err(|e| CryptoError::Decrypt(format!("ciphertext: {}", e)))?;
    if ciphertext.is_empty() || ciphertext.len() % IV_SIZE != 0 {
        return Err(CryptoError::Decrypt(
            "ciphertext is not a whole number of blocks".into(),
        ));
    }

    let cipher = Aes256CbcDec::new_from_slices(key.as_bytes(), &iv)
        .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| CryptoError::Decrypt("bad padding (wrong key or corrupted data)".into()))
}

/// [`decrypt`] for tokens that carry UTF-8 text.
pub fn decrypt_str(key: &SymmetricKey, token: &str) -> Result<String> {
    let plaintext = decrypt(key, token)?;
    String::from_utf8(plaintext).map_err(|e| CryptoError::Decrypt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fixed_key() -> SymmetricKey {
        let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(13).wrapping_add(7);
        }
        SymmetricKey::from_bytes(bytes)
    }

    #[test]
    fn test_basic_encryption_decryption() {
        let key = generate_key();
        let token = encrypt(&key, b"hello").expect("encrypt");
        assert_eq!(decrypt_str(&key, &token).expect("decrypt"), "hello");
    }

    #[test]
    fn test_same_plaintext_gives_distinct_tokens() {
        let key = fixed_key();
        let first = encrypt(&key, b"same message").expect("encrypt");
        let second = encrypt(&key, b"same message").expect("encrypt");

        assert_ne!(first, second);
        assert_eq!(decrypt(&key, &first).expect("decrypt"), b"same message");
        assert_eq!(decrypt(&key, &second).expect("decrypt"), b"same message");
    }

    #[test]
    fn test_token_shape() {
        let key = fixed_key();
        let token = encrypt_with_iv(&key, &[9u8; IV_SIZE], b"0123456789abcdef").expect("encrypt");
        let (iv, ciphertext) = token.split_once(TOKEN_DELIMITER).expect("delimiter");

        assert_eq!(from_base64(iv).expect("iv"), vec![9u8; IV_SIZE]);
        // A full block of plaintext gains a full block of PKCS#7 padding.
        assert_eq!(from_base64(ciphertext).expect("ct").len(), 32);
    }

    #[test]
    fn test_empty_plaintext() {
        let key = generate_key();
        let token = encrypt(&key, b"").expect("encrypt");
        assert_eq!(decrypt(&key, &token).expect("decrypt"), b"");
    }

    #[test]
    fn test_large_plaintext() {
        let key = generate_key();
        let msg: Vec<u8> = (0..65536).map(|i| (i & 0xFF) as u8).collect();
        let token = encrypt(&key, &msg).expect("encrypt");
        assert_eq!(decrypt(&key, &token).expect("decrypt"), msg);
    }

    #[test]
    fn test_missing_delimiter_fails() {
        let key = fixed_key();
        let result = decrypt(&key, "bm8tZGVsaW1pdGVy");
        assert!(matches!(result, Err(CryptoError::Decrypt(_))));
    }

    #[test]
    fn test_extra_delimiter_fails() {
        let key = fixed_key();
        let token = encrypt(&key, b"payload").expect("encrypt");
        let result = decrypt(&key, &format!("{}.AAAA", token));
        assert!(matches!(result, Err(CryptoError::Decrypt(_))));
    }

    #[test]
    fn test_bad_iv_length_fails() {
        let key = fixed_key();
        let token = encrypt(&key, b"payload").expect("encrypt");
        let (_, ciphertext) = token.split_once(TOKEN_DELIMITER).expect("delimiter");
        let forged = format!("{}.{}", to_base64([0u8; 8]), ciphertext);
        assert!(matches!(decrypt(&key, &forged), Err(CryptoError::Decrypt(_))));
    }

    #[test]
    fn test_partial_block_fails() {
        let key = fixed_key();
        let forged = format!("{}.{}", to_base64([0u8; IV_SIZE]), to_base64([1u8; 20]));
        assert!(matches!(decrypt(&key, &forged), Err(CryptoError::Decrypt(_))));
    }

    #[test]
    fn test_wrong_key_does_not_yield_plaintext() {
        let token = encrypt(&fixed_key(), b"for the right key only").expect("encrypt");
        let other = generate_key();
        // CBC carries no MAC: a wrong key almost always breaks the padding,
        // and never reproduces the plaintext.
        match decrypt(&other, &token) {
            Err(CryptoError::Decrypt(_)) => {}
            Ok(garbage) => assert_ne!(garbage, b"for the right key only"),
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn test_export_import_round_trip() {
        let key = generate_key();
        let exported = export_key(&key);
        assert_eq!(from_base64(&exported).expect("b64").len(), SYMMETRIC_KEY_SIZE);

        let imported = import_key(&exported).expect("import");
        assert_eq!(imported, key);
    }

    #[test]
    fn test_import_wrong_length_fails() {
        let result = import_key(&to_base64([0u8; 16]));
        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = fixed_key();
        assert_eq!(format!("{:?}", key), "SymmetricKey(<redacted>)");
    }

    proptest! {
        #[test]
        fn prop_decrypt_inverts_encrypt(
            key_bytes in any::<[u8; SYMMETRIC_KEY_SIZE]>(),
            plaintext in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let key = SymmetricKey::from_bytes(key_bytes);
            let token = encrypt(&key, &plaintext).expect("encrypt");
            prop_assert_eq!(decrypt(&key, &token).expect("decrypt"), plaintext);
        }
    }
}
