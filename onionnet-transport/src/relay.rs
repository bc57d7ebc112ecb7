//! # Relay Forwarding State Machine
//!
//! Every message a relay receives runs through:
//!
//! ```text
//! AwaitingMessage ──▶ Decrypting ──┬──▶ Forwarding ──┬──▶ Idle
//!                                  ├──▶ Delivering ──┘
//!                                  └──▶ Error ◀─────────── (send failed)
//! ```
//!
//! A run belongs to one message. A failure ends that run in `Error` and
//! drops the message; the relay itself keeps serving. Nothing is retried:
//! a sender that wants another attempt builds a fresh circuit.
//!
//! The key pair is read-only after construction and every buffer is local
//! to the message being peeled, so concurrent messages never share state
//! beyond the observability snapshot and counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use onionnet_crypto::{asymmetric, KeyPair};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::onion::{peel_layer, HopMessage, RoutingCommand};
use crate::registry::{Directory, NodeRecord};
use crate::rpc::{Endpoint, Request, Response, Transport};
use crate::{NodeId, NodeIdentity, OnionError, Result};

/// Where a message is in its trip through a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayState {
    /// Received, nothing done yet.
    AwaitingMessage,
    /// Unwrapping the hop key and decrypting the layer.
    Decrypting,
    /// Sending the inner envelope to the next relay.
    Forwarding,
    /// Sending the plaintext to the destination user.
    Delivering,
    /// Done with this message.
    Idle,
    /// Dropped; terminal for this message only.
    Error,
}

impl RelayState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: RelayState) -> bool {
        use RelayState::*;
        matches!(
            (self, next),
            (AwaitingMessage, Decrypting)
                | (Decrypting, Forwarding)
                | (Decrypting, Delivering)
                | (Decrypting, Error)
                | (Forwarding, Idle)
                | (Forwarding, Error)
                | (Delivering, Idle)
                | (Delivering, Error)
                | (Idle, AwaitingMessage)
        )
    }
}

/// One message's progress through the state machine.
#[derive(Debug)]
struct MessageRun {
    node_id: NodeId,
    state: RelayState,
}

impl MessageRun {
    fn start(node_id: NodeId) -> Self {
        Self {
            node_id,
            state: RelayState::AwaitingMessage,
        }
    }

    fn advance(&mut self, next: RelayState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal relay transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(node_id = %self.node_id, from = ?self.state, to = ?next, "relay state");
        self.state = next;
    }
}

/// What peeling a layer told the relay to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HopAction {
    /// Pass the inner envelope on to the next relay.
    Forward {
        /// Next relay's address.
        next_address: String,
        /// Envelope for the next relay, still sealed for the remaining hops.
        message: HopMessage,
    },
    /// Hand the plaintext to the destination user.
    Deliver {
        /// Destination user's inbox address.
        recipient: String,
        /// Final plaintext.
        message: String,
    },
}

impl HopAction {
    /// Address the payload goes to.
    pub fn destination(&self) -> &str {
        match self {
            Self::Forward { next_address, .. } => next_address,
            Self::Deliver { recipient, .. } => recipient,
        }
    }
}

/// A peeled message waiting to be sent on.
#[derive(Debug)]
pub struct PendingHop {
    action: HopAction,
    run: MessageRun,
}

impl PendingHop {
    /// What will be done with the message.
    pub fn action(&self) -> &HopAction {
        &self.action
    }

    /// Current state of the message (`Forwarding` or `Delivering`).
    pub fn state(&self) -> RelayState {
        self.run.state
    }
}

/// Debug view of the most recent message.
#[derive(Debug, Clone, Default)]
struct Observations {
    last_received_encrypted: Option<String>,
    last_received_decrypted: Option<String>,
    last_destination: Option<String>,
    last_state: Option<RelayState>,
}

#[derive(Debug, Default)]
struct RelayStats {
    received: AtomicU64,
    forwarded: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    forward_failures: AtomicU64,
}

/// Relay counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatsSnapshot {
    /// Envelopes received.
    pub received: u64,
    /// Envelopes passed to the next relay.
    pub forwarded: u64,
    /// Plaintexts handed to users.
    pub delivered: u64,
    /// Envelopes that could not be peeled.
    pub dropped: u64,
    /// Peeled messages whose next hop could not be reached.
    pub forward_failures: u64,
}

/// An onion relay.
pub struct Relay {
    node_id: NodeId,
    address: String,
    keys: Arc<KeyPair>,
    transport: Arc<dyn Transport>,
    observations: Mutex<Observations>,
    stats: RelayStats,
}

impl Relay {
    /// Create a relay listening at `address` with an existing key pair.
    pub fn new(
        node_id: NodeId,
        address: impl Into<String>,
        keys: KeyPair,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            node_id,
            address: address.into(),
            keys: Arc::new(keys),
            transport,
            observations: Mutex::new(Observations::default()),
            stats: RelayStats::default(),
        }
    }

    /// Create a relay with a freshly generated key pair.
    pub fn generate(
        node_id: NodeId,
        address: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let keys = asymmetric::generate_key_pair()?;
        Ok(Self::new(node_id, address, keys, transport))
    }

    /// Registry identifier.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Listening address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The public identity other nodes route through.
    pub fn identity(&self) -> Result<NodeIdentity> {
        Ok(NodeIdentity {
            node_id: self.node_id,
            public_key: self.keys.export_public()?,
            address: self.address.clone(),
        })
    }

    /// The record submitted to the registry, private key included.
    pub fn record(&self) -> Result<NodeRecord> {
        Ok(NodeRecord {
            node_id: self.node_id,
            public_key: self.keys.export_public()?,
            private_key: Some(self.keys.export_private()?),
            address: self.address.clone(),
        })
    }

    /// Publish this relay in `directory`.
    pub async fn register(&self, directory: &dyn Directory) -> Result<()> {
        directory.register_node(self.record()?).await?;
        info!(node_id = %self.node_id, address = %self.address, "relay registered");
        Ok(())
    }

    /// Peel one layer off `message`.
    ///
    /// On success the message is in `Forwarding` or `Delivering` and must
    /// be handed to [`Relay::dispatch`]. On failure it is dropped: nothing
    /// is sent anywhere and the error is returned to the caller.
    pub fn peel(&self, message: &HopMessage) -> Result<PendingHop> {
        let mut run = MessageRun::start(self.node_id);
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        self.observe(|obs| {
            obs.last_received_encrypted = Some(message.payload.clone());
            obs.last_received_decrypted = None;
            obs.last_destination = None;
            obs.last_state = Some(RelayState::Decrypting);
        });

        run.advance(RelayState::Decrypting);
        match self.open(message) {
            Ok((action, decrypted)) => {
                let next = match action {
                    HopAction::Forward { .. } => RelayState::Forwarding,
                    HopAction::Deliver { .. } => RelayState::Delivering,
                };
                run.advance(next);
                self.observe(|obs| {
                    obs.last_received_decrypted = Some(decrypted);
                    obs.last_destination = Some(action.destination().to_string());
                    obs.last_state = Some(next);
                });
                Ok(PendingHop { action, run })
            }
            Err(e) => {
                run.advance(RelayState::Error);
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                self.observe(|obs| obs.last_state = Some(RelayState::Error));
                warn!(node_id = %self.node_id, error = %e, "dropping message that could not be peeled");
                Err(e)
            }
        }
    }

    /// Send a peeled message to its next hop or its recipient.
    ///
    /// # Errors
    /// `Forwarding` if the destination is unreachable or refuses the
    /// message. The message is dropped; the relay keeps running.
    pub async fn dispatch(&self, pending: PendingHop) -> Result<HopAction> {
        let PendingHop { action, mut run } = pending;

        let request = match &action {
            HopAction::Forward { message, .. } => Request::Relay(message.clone()),
            HopAction::Deliver { message, .. } => Request::Deliver {
                message: message.clone(),
            },
        };
        let address = action.destination();

        let outcome = match self.transport.call(address, request).await {
            Ok(response) => response
                .into_ack()
                .map_err(|e| OnionError::forwarding(address, e)),
            Err(e) => Err(OnionError::forwarding(address, e)),
        };

        match outcome {
            Ok(()) => {
                let counter = match action {
                    HopAction::Forward { .. } => &self.stats.forwarded,
                    HopAction::Deliver { .. } => &self.stats.delivered,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                run.advance(RelayState::Idle);
                self.observe(|obs| obs.last_state = Some(RelayState::Idle));
                debug!(node_id = %self.node_id, destination = address, "message sent on");
                Ok(action)
            }
            Err(e) => {
                run.advance(RelayState::Error);
                self.stats.forward_failures.fetch_add(1, Ordering::Relaxed);
                self.observe(|obs| obs.last_state = Some(RelayState::Error));
                warn!(node_id = %self.node_id, error = %e, "forwarding failed, message dropped");
                Err(e)
            }
        }
    }

    /// Peel `message` and send it on, waiting for the next hop to accept.
    pub async fn process(&self, message: &HopMessage) -> Result<HopAction> {
        let pending = self.peel(message)?;
        self.dispatch(pending).await
    }

    /// Payload token of the last envelope received.
    pub fn last_received_encrypted_message(&self) -> Option<String> {
        self.snapshot().last_received_encrypted
    }

    /// Payload obtained by the last successful peel: the next hop's
    /// envelope, or the plaintext on the final hop.
    pub fn last_received_decrypted_message(&self) -> Option<String> {
        self.snapshot().last_received_decrypted
    }

    /// Where the last successfully peeled payload was headed.
    pub fn last_message_destination(&self) -> Option<String> {
        self.snapshot().last_destination
    }

    /// State the most recent message ended in (or is currently in).
    pub fn last_state(&self) -> Option<RelayState> {
        self.snapshot().last_state
    }

    /// Counters since startup.
    pub fn stats(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            received: self.stats.received.load(Ordering::Relaxed),
            forwarded: self.stats.forwarded.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            forward_failures: self.stats.forward_failures.load(Ordering::Relaxed),
        }
    }

    /// Exported private key, for debugging only.
    pub fn export_private_key(&self) -> Result<String> {
        Ok(self.keys.export_private()?)
    }

    /// Returns the action and the decrypted payload as text for the
    /// observability cache.
    fn open(&self, message: &HopMessage) -> Result<(HopAction, String)> {
        let layer = peel_layer(message, &self.keys.private_key)?;

        match layer.command {
            RoutingCommand::Relay { next_address } => {
                let inner = HopMessage::from_bytes(&layer.payload)?;
                let decrypted = String::from_utf8_lossy(&layer.payload).into_owned();
                Ok((
                    HopAction::Forward {
                        next_address,
                        message: inner,
                    },
                    decrypted,
                ))
            }
            RoutingCommand::Deliver { recipient } => {
                let text = String::from_utf8(layer.payload).map_err(|_| {
                    OnionError::MalformedLayer("final payload is not UTF-8".into())
                })?;
                Ok((
                    HopAction::Deliver {
                        recipient,
                        message: text.clone(),
                    },
                    text,
                ))
            }
        }
    }

    fn observe(&self, update: impl FnOnce(&mut Observations)) {
        if let Ok(mut observations) = self.observations.lock() {
            update(&mut observations);
        }
    }

    fn snapshot(&self) -> Observations {
        self.observations
            .lock()
            .map(|observations| observations.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Endpoint for Relay {
    async fn handle(self: Arc<Self>, request: Request) -> Response {
        match request {
            Request::Status => Response::Status("live".into()),
            Request::Relay(message) => match self.peel(&message) {
                Ok(pending) => {
                    // Fire and forget: dispatch logs and counts its own failures.
                    let relay = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _ = relay.dispatch(pending).await;
                    });
                    Response::Ack
                }
                Err(e) => Response::Error(e.to_string()),
            },
            Request::GetLastReceivedEncryptedMessage => {
                Response::Text(self.last_received_encrypted_message())
            }
            Request::GetLastReceivedDecryptedMessage => {
                Response::Text(self.last_received_decrypted_message())
            }
            Request::GetLastMessageDestination => Response::Text(self.last_message_destination()),
            Request::GetRelayPrivateKey => match self.export_private_key() {
                Ok(key) => Response::Text(Some(key)),
                Err(e) => Response::Error(e.to_string()),
            },
            Request::GetRelayStats => Response::Stats(self.stats()),
            other => Response::unsupported(&other),
        }
    }
}
