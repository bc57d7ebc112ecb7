//! # Node Registry
//!
//! Directory of relays: node ID, public key and listening address.
//!
//! Relays also hand the registry their private key, and the registry will
//! return it by node ID. That lookup exists so tests and tooling can
//! inspect relays; it is a non-production shortcut and nothing on the
//! routing path uses it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::rpc::{Endpoint, Request, Response, Transport};
use crate::{NodeId, NodeIdentity, OnionError, Result};

/// What a relay submits when it registers.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Registry identifier.
    pub node_id: NodeId,
    /// Base64 SPKI public key.
    pub public_key: String,
    /// Base64 PKCS#8 private key, if the node chose to share it.
    pub private_key: Option<String>,
    /// Listening address.
    pub address: String,
}

impl fmt::Debug for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRecord")
            .field("node_id", &self.node_id)
            .field("public_key", &self.public_key)
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("address", &self.address)
            .finish()
    }
}

impl NodeRecord {
    /// The public part of the record.
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            node_id: self.node_id,
            public_key: self.public_key.clone(),
            address: self.address.clone(),
        }
    }
}

/// Lookup interface the rest of the system uses to reach the registry.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Publish a relay.
    async fn register_node(&self, record: NodeRecord) -> Result<()>;

    /// All published relays, in registration order.
    async fn node_registry(&self) -> Result<Vec<NodeIdentity>>;

    /// Private key of `node_id`; `None` if unknown or never shared.
    async fn private_key(&self, node_id: NodeId) -> Result<Option<String>>;
}

/// In-memory registry.
#[derive(Debug, Default)]
pub struct Registry {
    nodes: RwLock<Vec<NodeRecord>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered relays.
    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// `true` if no relay has registered yet.
    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}

#[async_trait]
impl Directory for Registry {
    async fn register_node(&self, record: NodeRecord) -> Result<()> {
        if record.public_key.is_empty() {
            return Err(OnionError::Registry(format!(
                "node {} has no public key",
                record.node_id
            )));
        }

        let mut nodes = self.nodes.write().await;
        if nodes.iter().any(|node| node.node_id == record.node_id) {
            return Err(OnionError::Registry(format!(
                "node {} is already registered",
                record.node_id
            )));
        }

        info!(node_id = %record.node_id, address = %record.address, "node registered");
        nodes.push(record);
        Ok(())
    }

    async fn node_registry(&self) -> Result<Vec<NodeIdentity>> {
        Ok(self
            .nodes
            .read()
            .await
            .iter()
            .map(NodeRecord::identity)
            .collect())
    }

    async fn private_key(&self, node_id: NodeId) -> Result<Option<String>> {
        Ok(self
            .nodes
            .read()
            .await
            .iter()
            .find(|node| node.node_id == node_id)
            .and_then(|node| node.private_key.clone()))
    }
}

#[async_trait]
impl Endpoint for Registry {
    async fn handle(self: Arc<Self>, request: Request) -> Response {
        match request {
            Request::Status => Response::Status("active".into()),
            Request::RegisterNode(record) => match self.register_node(record).await {
                Ok(()) => Response::Ack,
                Err(e) => Response::Error(e.to_string()),
            },
            Request::GetNodeRegistry => match self.node_registry().await {
                Ok(nodes) => Response::Nodes(nodes),
                Err(e) => Response::Error(e.to_string()),
            },
            Request::GetPrivateKey { node_id } => match self.private_key(node_id).await {
                Ok(key) => Response::Text(key),
                Err(e) => Response::Error(e.to_string()),
            },
            other => Response::unsupported(&other),
        }
    }
}

/// [`Directory`] backed by a registry endpoint reached over a transport.
pub struct RemoteDirectory {
    address: String,
    transport: Arc<dyn Transport>,
}

impl RemoteDirectory {
    /// Talk to the registry at `address` through `transport`.
    pub fn new(address: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            address: address.into(),
            transport,
        }
    }

    /// Registry address.
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Directory for RemoteDirectory {
    async fn register_node(&self, record: NodeRecord) -> Result<()> {
        match self
            .transport
            .call(&self.address, Request::RegisterNode(record))
            .await?
        {
            Response::Ack => Ok(()),
            Response::Error(reason) => Err(OnionError::Registry(reason)),
            other => Err(OnionError::Protocol(format!(
                "unexpected registry response: {:?}",
                other
            ))),
        }
    }

    async fn node_registry(&self) -> Result<Vec<NodeIdentity>> {
        self.transport
            .call(&self.address, Request::GetNodeRegistry)
            .await?
            .into_nodes()
    }

    async fn private_key(&self, node_id: NodeId) -> Result<Option<String>> {
        self.transport
            .call(&self.address, Request::GetPrivateKey { node_id })
            .await?
            .into_text()
    }
}
