//! Process bootstrapping: bind, register, serve.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use onionnet_transport::{
    serve, Directory, Endpoint, NodeId, Registry, Relay, RemoteDirectory, RpcConfig,
    TcpTransport, Transport, User, UserId,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{check_node_id, NodeConfig};

/// A running endpoint and the task serving it.
pub struct Launched<T> {
    /// The endpoint's state.
    pub node: Arc<T>,
    /// Address it listens on.
    pub address: String,
    /// Accept loop; finishes only if the listener fails.
    pub handle: JoinHandle<onionnet_transport::Result<()>>,
}

/// Shared pieces every process needs.
pub struct Launcher {
    config: NodeConfig,
    transport: Arc<dyn Transport>,
}

impl Launcher {
    /// Build the TCP transport described by `config`.
    pub fn new(config: NodeConfig) -> Self {
        let transport = Arc::new(TcpTransport::new(config.rpc.clone()));
        Self { config, transport }
    }

    /// The loaded configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Transport for outgoing calls.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Directory backed by the configured registry.
    pub fn directory(&self) -> Arc<dyn Directory> {
        Arc::new(RemoteDirectory::new(
            self.config.network.registry_address(),
            self.transport(),
        ))
    }

    /// Start the registry on its configured port.
    pub async fn registry(&self) -> anyhow::Result<Launched<Registry>> {
        let address = self.config.network.registry_address();
        let node = Arc::new(Registry::new());
        let launched = self.serve(node, address).await?;
        info!("Registry listening on {}", launched.address);
        Ok(launched)
    }

    /// Start relay `id`: generate its key pair, bind, then register.
    pub async fn relay(&self, id: u32) -> anyhow::Result<Launched<Relay>> {
        check_node_id("relay --id", id)?;
        let node_id = NodeId::new(id);
        let address = self
            .config
            .network
            .router_address(node_id)
            .ok_or_else(|| anyhow!("relay {} has no port in this layout", id))?;

        let relay = Relay::generate(node_id, address.clone(), self.transport())
            .context("generating relay key pair")?;
        let launched = self.serve(Arc::new(relay), address).await?;

        launched
            .node
            .register(self.directory().as_ref())
            .await
            .with_context(|| format!("registering relay {}", id))?;

        info!("Relay {} listening on {}", id, launched.address);
        Ok(launched)
    }

    /// Start user `id`.
    pub async fn user(&self, id: UserId) -> anyhow::Result<Launched<User>> {
        check_node_id("user --id", id)?;
        let address = self
            .config
            .network
            .user_address(id)
            .ok_or_else(|| anyhow!("user {} has no port in this layout", id))?;

        let user = User::new(
            id,
            address.clone(),
            self.directory(),
            self.transport(),
            Arc::new(self.config.network.clone()),
        )
        .with_default_circuit_length(self.config.circuit.default_length);
        let launched = self.serve(Arc::new(user), address).await?;

        info!("User {} listening on {}", id, launched.address);
        Ok(launched)
    }

    async fn serve<T: Endpoint>(&self, node: Arc<T>, address: String) -> anyhow::Result<Launched<T>> {
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("binding {}", address))?;
        let handle = tokio::spawn(serve(listener, Arc::clone(&node), self.rpc()));
        Ok(Launched {
            node,
            address,
            handle,
        })
    }

    fn rpc(&self) -> RpcConfig {
        self.config.rpc.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;

    #[test]
    fn test_out_of_range_ids_rejected_before_binding() {
        let launcher = Launcher::new(NodeConfig::default());

        // User 1001 would otherwise bind relay 1's port.
        let err = tokio_test::block_on(launcher.user(1001)).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::Invalid {
                field: "user --id",
                ..
            })
        ));

        let err = tokio_test::block_on(launcher.relay(0)).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::Invalid {
                field: "relay --id",
                ..
            })
        ));
        assert!(tokio_test::block_on(launcher.relay(1000)).is_err());
    }
}
