//! # Onion Layer Codec
//!
//! Serialization of the layers a circuit is built from, and of the
//! envelope each hop receives.
//!
//! A hop receives a [`HopMessage`] with two independently decodable
//! fields: the RSA-wrapped symmetric key and the AES token of its layer.
//! Decrypting the token yields an encoded [`OnionLayer`]:
//!
//! ```text
//! [version: u8][command: u8][addr_len: u16 LE][addr]
//! [payload_len: u32 LE][payload][digest: 16 bytes]
//! ```
//!
//! The digest is the truncated SHA-256 of everything before it. A layer
//! that fails to parse is a [`MalformedLayer`](crate::OnionError) error,
//! kept apart from the `Decrypt` errors the cipher raises.

use onionnet_crypto::{asymmetric, from_base64, symmetric, to_base64};
use onionnet_crypto::{RsaPrivateKey, RsaPublicKey, SymmetricKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{OnionError, Result};

/// Current layer encoding version.
pub const LAYER_VERSION: u8 = 1;

/// Size of the truncated integrity digest closing every layer.
pub const DIGEST_SIZE: usize = 16;

/// Version, command and address length.
const LAYER_HEADER_SIZE: usize = 1 + 1 + 2;

/// Smallest possible layer: header, empty address, payload length, digest.
const MIN_LAYER_SIZE: usize = LAYER_HEADER_SIZE + 4 + DIGEST_SIZE;

const CMD_RELAY: u8 = 0x01;
const CMD_DELIVER: u8 = 0x02;

/// What the hop that decrypts a layer must do with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingCommand {
    /// Forward the payload, itself a [`HopMessage`], to the next relay.
    Relay {
        /// Next relay's address.
        next_address: String,
    },
    /// Final hop: the payload is the plaintext for the user inbox here.
    Deliver {
        /// Destination user's inbox address.
        recipient: String,
    },
}

impl RoutingCommand {
    /// The address the payload goes to next, relay or user.
    pub fn destination(&self) -> &str {
        match self {
            Self::Relay { next_address } => next_address,
            Self::Deliver { recipient } => recipient,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Self::Relay { .. } => CMD_RELAY,
            Self::Deliver { .. } => CMD_DELIVER,
        }
    }
}

/// One relay's worth of routing information and the payload it protects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionLayer {
    /// Routing command for the hop that peels this layer.
    pub command: RoutingCommand,
    /// Inner payload: the next hop's envelope, or the final plaintext.
    pub payload: Vec<u8>,
}

impl OnionLayer {
    /// A layer that forwards `payload` to `next_address`.
    pub fn relay(next_address: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            command: RoutingCommand::Relay {
                next_address: next_address.into(),
            },
            payload,
        }
    }

    /// The innermost layer, delivering `payload` to `recipient`.
    pub fn deliver(recipient: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            command: RoutingCommand::Deliver {
                recipient: recipient.into(),
            },
            payload,
        }
    }

    /// Next relay address; `None` for the innermost layer.
    pub fn next_hop(&self) -> Option<&str> {
        match &self.command {
            RoutingCommand::Relay { next_address } => Some(next_address),
            RoutingCommand::Deliver { .. } => None,
        }
    }

    /// `true` for the innermost layer.
    pub fn is_final(&self) -> bool {
        self.next_hop().is_none()
    }
}

/// Encode a layer into its checksummed binary form.
///
/// # Errors
/// `MalformedLayer` if the address or payload exceeds its length field.
pub fn encode_layer(layer: &OnionLayer) -> Result<Vec<u8>> {
    let address = layer.command.destination().as_bytes();
    let address_len = u16::try_from(address.len())
        .map_err(|_| OnionError::MalformedLayer("address too long".into()))?;
    let payload_len = u32::try_from(layer.payload.len())
        .map_err(|_| OnionError::MalformedLayer("payload too long".into()))?;

    let mut buffer = Vec::with_capacity(MIN_LAYER_SIZE + address.len() + layer.payload.len());
    buffer.push(LAYER_VERSION);
    buffer.push(layer.command.tag());
    buffer.extend_from_slice(&address_len.to_le_bytes());
    buffer.extend_from_slice(address);
    buffer.extend_from_slice(&payload_len.to_le_bytes());
    buffer.extend_from_slice(&layer.payload);

    let digest = layer_digest(&buffer);
    buffer.extend_from_slice(&digest);

    Ok(buffer)
}

/// Decode a layer produced by [`encode_layer`].
///
/// # Errors
/// `MalformedLayer` on truncated input, an unknown version or command, a
/// non-UTF-8 address, trailing bytes, or a digest mismatch.
pub fn decode_layer(bytes: &[u8]) -> Result<OnionLayer> {
    if bytes.len() < MIN_LAYER_SIZE {
        return Err(OnionError::MalformedLayer(format!(
            "layer too short: {} bytes",
            bytes.len()
        )));
    }

    let (body, digest) = bytes.split_at(bytes.len() - DIGEST_SIZE);
    if layer_digest(body) != digest {
        return Err(OnionError::MalformedLayer("digest mismatch".into()));
    }

    let mut reader = Reader::new(body);

    let version = reader.u8()?;
    if version != LAYER_VERSION {
        return Err(OnionError::MalformedLayer(format!(
            "unsupported layer version {}",
            version
        )));
    }

    let tag = reader.u8()?;
    let address_len = reader.u16()? as usize;
    let address = std::str::from_utf8(reader.take(address_len)?)
        .map_err(|_| OnionError::MalformedLayer("address is not UTF-8".into()))?
        .to_string();

    let command = match tag {
        CMD_RELAY => RoutingCommand::Relay {
            next_address: address,
        },
        CMD_DELIVER => RoutingCommand::Deliver { recipient: address },
        other => {
            return Err(OnionError::MalformedLayer(format!(
                "unknown routing command 0x{:02x}",
                other
            )))
        }
    };

    let payload_len = reader.u32()? as usize;
    let payload = reader.take(payload_len)?.to_vec();

    if !reader.is_empty() {
        return Err(OnionError::MalformedLayer(format!(
            "{} trailing bytes",
            reader.remaining()
        )));
    }

    Ok(OnionLayer { command, payload })
}

fn layer_digest(body: &[u8]) -> [u8; DIGEST_SIZE] {
    let hash = Sha256::digest(body);
    let mut digest = [0u8; DIGEST_SIZE];
    digest.copy_from_slice(&hash[..DIGEST_SIZE]);
    digest
}

/// Bounds-checked cursor over a layer body.
struct Reader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .position
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| OnionError::MalformedLayer("layer truncated".into()))?;
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

/// The envelope a relay receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopMessage {
    /// Base64 RSA-OAEP ciphertext of this hop's exported symmetric key.
    pub encrypted_key: String,
    /// Symmetric token (`iv.ciphertext`) of this hop's encoded layer.
    pub payload: String,
}

impl HopMessage {
    /// Encode the envelope for embedding in the previous hop's layer.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| OnionError::MalformedLayer(e.to_string()))
    }

    /// Decode an envelope carried in a layer payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| OnionError::MalformedLayer(e.to_string()))
    }
}

/// Encrypt `layer` for the hop holding `hop_public_key`.
pub fn seal_layer(
    layer: &OnionLayer,
    key: &SymmetricKey,
    hop_public_key: &RsaPublicKey,
) -> Result<HopMessage> {
    let exported = symmetric::export_key(key);
    let wrapped = asymmetric::encrypt(exported.as_bytes(), hop_public_key)?;
    let payload = symmetric::encrypt(key, &encode_layer(layer)?)?;

    Ok(HopMessage {
        encrypted_key: to_base64(wrapped),
        payload,
    })
}

/// Recover the symmetric key a hop was given.
pub fn unwrap_hop_key(message: &HopMessage, private_key: &RsaPrivateKey) -> Result<SymmetricKey> {
    let wrapped = from_base64(&message.encrypted_key).map_err(|e| {
        OnionError::Crypto(onionnet_crypto::CryptoError::Decrypt(format!(
            "wrapped key: {}",
            e
        )))
    })?;
    let exported = asymmetric::decrypt(&wrapped, private_key)?;
    let exported = std::str::from_utf8(&exported)
        .map_err(|_| OnionError::MalformedLayer("wrapped key is not UTF-8".into()))?;
    Ok(symmetric::import_key(exported)?)
}

/// Peel one layer: unwrap the key, decrypt the token, decode the layer.
pub fn peel_layer(message: &HopMessage, private_key: &RsaPrivateKey) -> Result<OnionLayer> {
    let key = unwrap_hop_key(message, private_key)?;
    let plaintext = symmetric::decrypt(&key, &message.payload)?;
    decode_layer(&plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use onionnet_crypto::KeyPair;
    use proptest::prelude::*;
    use std::sync::OnceLock;

    fn hop_keys() -> &'static KeyPair {
        static PAIR: OnceLock<KeyPair> = OnceLock::new();
        PAIR.get_or_init(|| asymmetric::generate_key_pair().unwrap())
    }

    #[test]
    fn test_relay_layer_round_trip() {
        let layer = OnionLayer::relay("127.0.0.1:4002", b"inner envelope".to_vec());
        let decoded = decode_layer(&encode_layer(&layer).unwrap()).unwrap();

        assert_eq!(decoded, layer);
        assert_eq!(decoded.next_hop(), Some("127.0.0.1:4002"));
        assert!(!decoded.is_final());
    }

    #[test]
    fn test_deliver_layer_round_trip() {
        let layer = OnionLayer::deliver("127.0.0.1:3001", b"hello".to_vec());
        let decoded = decode_layer(&encode_layer(&layer).unwrap()).unwrap();

        assert_eq!(decoded, layer);
        assert_eq!(decoded.next_hop(), None);
        assert_eq!(decoded.command.destination(), "127.0.0.1:3001");
    }

    #[test]
    fn test_layer_format() {
        let layer = OnionLayer::relay("a:1", vec![0xAA, 0xBB]);
        let bytes = encode_layer(&layer).unwrap();

        assert_eq!(bytes[0], LAYER_VERSION);
        assert_eq!(bytes[1], CMD_RELAY);
        assert_eq!(&bytes[2..4], &3u16.to_le_bytes());
        assert_eq!(&bytes[4..7], b"a:1");
        assert_eq!(&bytes[7..11], &2u32.to_le_bytes());
        assert_eq!(&bytes[11..13], &[0xAA, 0xBB]);
        assert_eq!(bytes.len(), 13 + DIGEST_SIZE);
    }

    #[test]
    fn test_truncated_layer_fails() {
        let bytes = encode_layer(&OnionLayer::relay("127.0.0.1:4002", vec![7; 40])).unwrap();
        for cut in [0, 1, MIN_LAYER_SIZE - 1, bytes.len() - 1] {
            let result = decode_layer(&bytes[..cut]);
            assert!(
                matches!(result, Err(OnionError::MalformedLayer(_))),
                "cut at {} should be malformed",
                cut
            );
        }
    }

    #[test]
    fn test_corrupted_byte_fails_digest() {
        let bytes = encode_layer(&OnionLayer::deliver("127.0.0.1:3001", b"hello".to_vec())).unwrap();
        for index in 0..bytes.len() {
            let mut corrupted = bytes.clone();
            corrupted[index] ^= 0x20;
            assert!(
                matches!(decode_layer(&corrupted), Err(OnionError::MalformedLayer(_))),
                "flip at {} went unnoticed",
                index
            );
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        // Re-seal a valid layer with an extra byte before the digest.
        let mut body = encode_layer(&OnionLayer::relay("x:1", vec![1])).unwrap();
        body.truncate(body.len() - DIGEST_SIZE);
        body.push(0xFF);
        let digest = layer_digest(&body);
        body.extend_from_slice(&digest);

        assert!(matches!(
            decode_layer(&body),
            Err(OnionError::MalformedLayer(msg)) if msg.contains("trailing")
        ));
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut body = encode_layer(&OnionLayer::relay("x:1", vec![])).unwrap();
        body.truncate(body.len() - DIGEST_SIZE);
        body[1] = 0x7F;
        let digest = layer_digest(&body);
        body.extend_from_slice(&digest);

        assert!(matches!(
            decode_layer(&body),
            Err(OnionError::MalformedLayer(msg)) if msg.contains("0x7f")
        ));
    }

    #[test]
    fn test_hop_message_bytes_round_trip() {
        let message = HopMessage {
            encrypted_key: "a2V5".into(),
            payload: "aXY=.Y3Q=".into(),
        };
        let decoded = HopMessage::from_bytes(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, message);

        assert!(matches!(
            HopMessage::from_bytes(b"{\"encrypted_key\":1}"),
            Err(OnionError::MalformedLayer(_))
        ));
    }

    #[test]
    fn test_seal_then_peel() {
        let keys = hop_keys();
        let layer = OnionLayer::deliver("127.0.0.1:3002", b"final words".to_vec());
        let sealed = seal_layer(&layer, &symmetric::generate_key(), &keys.public_key).unwrap();

        // Neither field leaks the plaintext or the recipient.
        assert!(!sealed.payload.contains("final words"));
        assert!(!sealed.encrypted_key.contains("3002"));

        let peeled = peel_layer(&sealed, &keys.private_key).unwrap();
        assert_eq!(peeled, layer);
    }

    #[test]
    fn test_peel_with_garbage_key_field_is_decrypt_error() {
        let keys = hop_keys();
        let layer = OnionLayer::deliver("127.0.0.1:3002", b"x".to_vec());
        let mut sealed = seal_layer(&layer, &symmetric::generate_key(), &keys.public_key).unwrap();
        sealed.encrypted_key = to_base64([0u8; 256]);

        let err = peel_layer(&sealed, &keys.private_key).unwrap_err();
        assert!(err.is_peel_failure());
        assert!(matches!(
            err,
            OnionError::Crypto(onionnet_crypto::CryptoError::Decrypt(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            relay in any::<bool>(),
            address in "[a-z0-9.:]{0,64}",
            payload in proptest::collection::vec(any::<u8>(), 0..1024),
        ) {
            let layer = if relay {
                OnionLayer::relay(address, payload)
            } else {
                OnionLayer::deliver(address, payload)
            };
            let decoded = decode_layer(&encode_layer(&layer).unwrap()).unwrap();
            prop_assert_eq!(decoded, layer);
        }
    }
}
