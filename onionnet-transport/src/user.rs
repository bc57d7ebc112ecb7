//! # User
//!
//! A user sends messages through fresh circuits and keeps an inbox of what
//! exit relays deliver to it. Users do not register with the registry and
//! have no key pair; only relays do.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::circuit::CircuitBuilder;
use crate::config::AddressBook;
use crate::registry::Directory;
use crate::rpc::{Endpoint, Request, Response, Transport};
use crate::{Circuit, NodeId, OnionError, Result, UserId};

/// Circuit length used when a send request does not name one.
pub const DEFAULT_CIRCUIT_LENGTH: usize = 3;

#[derive(Debug, Default)]
struct UserState {
    last_received: Option<String>,
    last_sent: Option<String>,
    last_circuit: Vec<NodeId>,
}

/// A user process.
pub struct User {
    user_id: UserId,
    address: String,
    directory: Arc<dyn Directory>,
    transport: Arc<dyn Transport>,
    address_book: Arc<dyn AddressBook>,
    builder: CircuitBuilder,
    default_circuit_length: usize,
    state: Mutex<UserState>,
}

impl User {
    /// Create a user whose inbox listens at `address`.
    pub fn new(
        user_id: UserId,
        address: impl Into<String>,
        directory: Arc<dyn Directory>,
        transport: Arc<dyn Transport>,
        address_book: Arc<dyn AddressBook>,
    ) -> Self {
        Self {
            user_id,
            address: address.into(),
            directory,
            transport,
            address_book,
            builder: CircuitBuilder::default(),
            default_circuit_length: DEFAULT_CIRCUIT_LENGTH,
            state: Mutex::new(UserState::default()),
        }
    }

    /// Use `builder` to pick and seal circuits.
    pub fn with_builder(mut self, builder: CircuitBuilder) -> Self {
        self.builder = builder;
        self
    }

    /// Circuit length for send requests that do not name one.
    pub fn with_default_circuit_length(mut self, length: usize) -> Self {
        self.default_circuit_length = length;
        self
    }

    /// User identifier.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Inbox address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send `message` to `destination` through a fresh circuit of
    /// `circuit_length` relays.
    ///
    /// Returns the circuit once the entry relay has accepted the outermost
    /// envelope. Delivery past the entry relay is not confirmed.
    ///
    /// # Errors
    /// - `UnknownUser` if no address is known for `destination`
    /// - `InsufficientNodes` / `InvalidCircuit` before anything is sent
    /// - `Forwarding` if the entry relay is unreachable or refuses
    pub async fn send_message(
        &self,
        message: &str,
        destination: UserId,
        circuit_length: usize,
    ) -> Result<Circuit> {
        let recipient = self
            .address_book
            .user_address(destination)
            .ok_or(OnionError::UnknownUser(destination))?;

        let nodes = self.directory.node_registry().await?;
        let built = self
            .builder
            .build(&nodes, circuit_length, &recipient, message)?;

        self.update(|state| {
            state.last_sent = Some(message.to_string());
            state.last_circuit = built.circuit.node_ids();
        });

        let entry = built.entry_address().to_string();
        debug!(user_id = self.user_id, entry = %entry, "dispatching outermost layer");
        match self.transport.call(&entry, Request::Relay(built.message)).await {
            Ok(response) => response
                .into_ack()
                .map_err(|e| OnionError::forwarding(&entry, e))?,
            Err(e) => return Err(OnionError::forwarding(&entry, e)),
        }

        info!(
            user_id = self.user_id,
            destination,
            hops = built.circuit.len(),
            "message sent"
        );
        Ok(built.circuit)
    }

    /// Accept a plaintext delivered by an exit relay.
    pub fn receive(&self, message: String) {
        info!(user_id = self.user_id, bytes = message.len(), "message delivered");
        self.update(|state| state.last_received = Some(message));
    }

    /// Last message delivered to this user.
    pub fn last_received_message(&self) -> Option<String> {
        self.read(|state| state.last_received.clone())
    }

    /// Last message this user sent.
    pub fn last_sent_message(&self) -> Option<String> {
        self.read(|state| state.last_sent.clone())
    }

    /// Relay IDs of the last circuit, entry first; empty before any send.
    pub fn last_circuit(&self) -> Vec<NodeId> {
        self.read(|state| state.last_circuit.clone())
    }

    fn update(&self, f: impl FnOnce(&mut UserState)) {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
    }

    fn read<T: Default>(&self, f: impl FnOnce(&UserState) -> T) -> T {
        self.state.lock().map(|state| f(&state)).unwrap_or_default()
    }
}

#[async_trait]
impl Endpoint for User {
    async fn handle(self: Arc<Self>, request: Request) -> Response {
        match request {
            Request::Status => Response::Status("alive".into()),
            Request::Deliver { message } => {
                self.receive(message);
                Response::Ack
            }
            Request::SendMessage {
                message,
                destination_user_id,
                circuit_length,
            } => {
                let length = circuit_length.unwrap_or(self.default_circuit_length);
                match self.send_message(&message, destination_user_id, length).await {
                    Ok(_) => Response::Ack,
                    Err(e) => Response::Error(e.to_string()),
                }
            }
            Request::GetLastReceivedMessage => Response::Text(self.last_received_message()),
            Request::GetLastSentMessage => Response::Text(self.last_sent_message()),
            Request::GetLastCircuit => Response::Circuit(self.last_circuit()),
            other => Response::unsupported(&other),
        }
    }
}
