//! # onionnet Transport
//!
//! Onion routing layer for onionnet: circuit construction, layered
//! encryption, and the per-hop forwarding state machine, plus the small
//! registry and RPC plumbing that lets relays and users run as separate
//! processes.
//!
//! ## Features
//!
//! - **Circuit Builder**: picks a non-repeating relay path and seals one
//!   layer per hop (RSA-wrapped AES key + AES-CBC layer)
//! - **Onion Codec**: checksummed binary layer framing and the per-hop
//!   envelope carrying the wrapped key and encrypted layer side by side
//! - **Relay**: peels one layer, then forwards or delivers
//! - **User**: sends through a fresh circuit and keeps an inbox
//! - **Registry / RPC**: directory of relays and a length-prefixed JSON
//!   request/response protocol over TCP
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐    ┌─────────┐    ┌─────────┐    ┌─────────┐    ┌────────┐
//! │ Sender │───▶│ Relay 1 │───▶│ Relay 2 │───▶│ Relay 3 │───▶│  User  │
//! └────────┘    └─────────┘    └─────────┘    └─────────┘    └────────┘
//!     │ node list                   peel one layer per hop
//!     ▼
//! ┌──────────┐
//! │ Registry │
//! └──────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod circuit;
pub mod config;
pub mod onion;
pub mod registry;
pub mod relay;
pub mod rpc;
pub mod user;

pub use circuit::{BuiltCircuit, CircuitBuilder, Ordered, SelectionStrategy, UniformRandom};
pub use config::{AddressBook, NetworkLayout, RpcConfig};
pub use onion::{decode_layer, encode_layer, HopMessage, OnionLayer, RoutingCommand};
pub use registry::{Directory, NodeRecord, Registry, RemoteDirectory};
pub use relay::{HopAction, PendingHop, Relay, RelayState, RelayStatsSnapshot};
pub use rpc::{serve, Endpoint, MemoryTransport, Request, Response, TcpTransport, Transport};
pub use user::{User, DEFAULT_CIRCUIT_LENGTH};

use std::collections::HashSet;
use std::fmt;

use onionnet_crypto::{asymmetric, CryptoError, RsaPublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while building, peeling or moving onions.
#[derive(Debug, Error)]
pub enum OnionError {
    /// Key handling or a cipher operation failed.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// A decrypted layer or envelope is structurally invalid.
    #[error("Malformed layer: {0}")]
    MalformedLayer(String),

    /// The requested circuit is longer than the relay pool.
    #[error("Insufficient nodes: requested {requested} hops but only {available} relays are available")]
    InsufficientNodes {
        /// Requested circuit length.
        requested: usize,
        /// Number of distinct relays in the pool.
        available: usize,
    },

    /// The circuit itself is invalid (empty, repeated relay, bad selection).
    #[error("Invalid circuit: {0}")]
    InvalidCircuit(String),

    /// The next hop could not be reached or refused the message.
    #[error("Forwarding to {address} failed: {reason}")]
    Forwarding {
        /// Address of the hop that could not be reached.
        address: String,
        /// Underlying failure.
        reason: String,
    },

    /// The registry rejected a request.
    #[error("Registry error: {0}")]
    Registry(String),

    /// Connection or framing error.
    #[error("Network error: {0}")]
    Network(String),

    /// A network operation exceeded its deadline.
    #[error("Operation timed out")]
    Timeout,

    /// No address is known for the destination user.
    #[error("Unknown user: {0}")]
    UnknownUser(u32),

    /// The remote side answered with an unexpected response.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl OnionError {
    /// Build a forwarding error.
    pub fn forwarding(address: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Forwarding {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    /// `true` when a relay could not peel the message it was handed: the
    /// wrong key was used, or what it decrypted does not parse.
    #[must_use]
    pub fn is_peel_failure(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::Decrypt(_))
                | Self::Crypto(CryptoError::InvalidKey(_))
                | Self::MalformedLayer(_)
        )
    }
}

/// Result type for onion routing operations.
pub type Result<T> = std::result::Result<T, OnionError>;

/// Identifier of a user process.
pub type UserId = u32;

/// Identifier of a relay in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Create a new node ID.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Numeric value of the ID.
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// A relay as published by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Registry identifier.
    pub node_id: NodeId,
    /// Base64 SPKI RSA public key.
    pub public_key: String,
    /// Listening address (e.g. "127.0.0.1:4001").
    pub address: String,
}

impl NodeIdentity {
    /// Import the relay's RSA public key.
    pub fn rsa_public_key(&self) -> Result<RsaPublicKey> {
        Ok(asymmetric::import_public(&self.public_key)?)
    }
}

/// An ordered, non-repeating path of relays, entry first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Circuit {
    hops: Vec<NodeIdentity>,
}

impl Circuit {
    /// Create a circuit, rejecting empty paths and repeated relays.
    pub fn new(hops: Vec<NodeIdentity>) -> Result<Self> {
        if hops.is_empty() {
            return Err(OnionError::InvalidCircuit(
                "circuit must have at least one hop".into(),
            ));
        }

        let mut seen = HashSet::with_capacity(hops.len());
        for hop in &hops {
            if !seen.insert(hop.node_id) {
                return Err(OnionError::InvalidCircuit(format!(
                    "relay {} appears more than once",
                    hop.node_id
                )));
            }
        }

        Ok(Self { hops })
    }

    /// Hops in travel order.
    pub fn hops(&self) -> &[NodeIdentity] {
        &self.hops
    }

    /// Number of hops.
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// `true` only for an empty path, which `new` never builds.
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// First relay, the one the sender talks to.
    pub fn entry(&self) -> &NodeIdentity {
        &self.hops[0]
    }

    /// Last relay, the one that delivers to the user.
    pub fn exit(&self) -> &NodeIdentity {
        &self.hops[self.hops.len() - 1]
    }

    /// Node IDs in travel order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.hops.iter().map(|hop| hop.node_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: u32) -> NodeIdentity {
        NodeIdentity {
            node_id: NodeId::new(id),
            public_key: String::new(),
            address: format!("127.0.0.1:{}", 4000 + id),
        }
    }

    #[test]
    fn test_node_id() {
        let id = NodeId::new(42);
        assert_eq!(id.get(), 42);
        assert_eq!(id.to_string(), "42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
    }

    #[test]
    fn test_circuit_validation() {
        // Empty circuit should fail
        assert!(matches!(
            Circuit::new(vec![]),
            Err(OnionError::InvalidCircuit(_))
        ));

        // Repeated relay should fail
        assert!(matches!(
            Circuit::new(vec![identity(1), identity(2), identity(1)]),
            Err(OnionError::InvalidCircuit(_))
        ));

        // A single hop is a valid circuit
        let single = Circuit::new(vec![identity(7)]).unwrap();
        assert_eq!(single.entry(), single.exit());

        let circuit = Circuit::new(vec![identity(3), identity(1), identity(2)]).unwrap();
        assert_eq!(circuit.len(), 3);
        assert_eq!(circuit.entry().node_id, NodeId::new(3));
        assert_eq!(circuit.exit().node_id, NodeId::new(2));
        assert_eq!(
            circuit.node_ids(),
            vec![NodeId::new(3), NodeId::new(1), NodeId::new(2)]
        );
    }

    #[test]
    fn test_peel_failure_classification() {
        assert!(OnionError::MalformedLayer("truncated".into()).is_peel_failure());
        assert!(OnionError::Crypto(CryptoError::Decrypt("padding".into())).is_peel_failure());
        assert!(!OnionError::forwarding("127.0.0.1:4002", "refused").is_peel_failure());
        assert!(!OnionError::InsufficientNodes {
            requested: 4,
            available: 3
        }
        .is_peel_failure());
    }
}
