//! # Network Layout & RPC Configuration
//!
//! Where every process listens, and the limits applied to RPC calls.
//!
//! The default layout puts the registry on port 8080, relay `n` on
//! `4000 + n` and user `n` on `3000 + n`, all on the loopback interface.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{NodeId, UserId};

/// Port layout of a local onionnet deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkLayout {
    /// Host every process binds to.
    pub host: String,
    /// Registry port.
    pub registry_port: u16,
    /// Relay `n` listens on `base_router_port + n`.
    pub base_router_port: u16,
    /// User `n` listens on `base_user_port + n`.
    pub base_user_port: u16,
}

impl Default for NetworkLayout {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            registry_port: 8080,
            base_router_port: 4000,
            base_user_port: 3000,
        }
    }
}

impl NetworkLayout {
    /// Address of the registry.
    pub fn registry_address(&self) -> String {
        format!("{}:{}", self.host, self.registry_port)
    }

    /// Address of relay `node_id`, or `None` if the port would overflow.
    pub fn router_address(&self, node_id: NodeId) -> Option<String> {
        self.offset_address(self.base_router_port, node_id.get())
    }

    /// Address of user `user_id`, or `None` if the port would overflow.
    pub fn user_address(&self, user_id: UserId) -> Option<String> {
        self.offset_address(self.base_user_port, user_id)
    }

    fn offset_address(&self, base: u16, offset: u32) -> Option<String> {
        let port = u16::try_from(offset)
            .ok()
            .and_then(|offset| base.checked_add(offset))?;
        Some(format!("{}:{}", self.host, port))
    }
}

/// Resolves a destination user ID to the address its inbox listens on.
pub trait AddressBook: Send + Sync {
    /// Inbox address of `user_id`, if known.
    fn user_address(&self, user_id: UserId) -> Option<String>;
}

impl AddressBook for NetworkLayout {
    fn user_address(&self, user_id: UserId) -> Option<String> {
        NetworkLayout::user_address(self, user_id)
    }
}

impl AddressBook for HashMap<UserId, String> {
    fn user_address(&self, user_id: UserId) -> Option<String> {
        self.get(&user_id).cloned()
    }
}

/// Limits applied to every RPC exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Deadline for connecting, writing and reading, in milliseconds.
    pub timeout_ms: u64,
    /// Largest accepted frame, in bytes.
    pub max_frame_size: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_frame_size: 1024 * 1024,
        }
    }
}

impl RpcConfig {
    /// Per-operation timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
