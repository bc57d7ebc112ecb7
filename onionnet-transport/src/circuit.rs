//! # Circuit Builder
//!
//! Chooses the relay path for one message and seals the onion for it.
//!
//! Layers are planned outermost-first as a flat sequence, then sealed from
//! the innermost hop outwards in a loop, so building never recurses once
//! per hop.

use std::collections::HashSet;
use std::sync::Arc;

use onionnet_crypto::{symmetric, RsaPublicKey};
use rand::seq::SliceRandom;
use tracing::debug;

use crate::onion::{seal_layer, HopMessage, OnionLayer, RoutingCommand};
use crate::{Circuit, NodeIdentity, OnionError, Result};

/// Policy for picking relays out of the registry pool.
///
/// The builder hands over a pool with unique node IDs and a length no
/// larger than the pool; it rejects any selection that repeats a relay
/// or has the wrong length.
pub trait SelectionStrategy: Send + Sync {
    /// Pick `length` relays, entry first.
    fn select(&self, pool: &[NodeIdentity], length: usize) -> Vec<NodeIdentity>;
}

/// Uniform sampling without replacement.
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformRandom;

impl SelectionStrategy for UniformRandom {
    fn select(&self, pool: &[NodeIdentity], length: usize) -> Vec<NodeIdentity> {
        pool.choose_multiple(&mut rand::thread_rng(), length)
            .cloned()
            .collect()
    }
}

/// Takes the first `length` relays in pool order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ordered;

impl SelectionStrategy for Ordered {
    fn select(&self, pool: &[NodeIdentity], length: usize) -> Vec<NodeIdentity> {
        pool.iter().take(length).cloned().collect()
    }
}

/// A sealed onion ready for its first hop.
#[derive(Debug, Clone)]
pub struct BuiltCircuit {
    /// The chosen path.
    pub circuit: Circuit,
    /// Outermost envelope, addressed to the entry relay.
    pub message: HopMessage,
}

impl BuiltCircuit {
    /// Address the outermost envelope must be sent to.
    pub fn entry_address(&self) -> &str {
        &self.circuit.entry().address
    }
}

/// Builds circuits with a pluggable [`SelectionStrategy`].
#[derive(Clone)]
pub struct CircuitBuilder {
    strategy: Arc<dyn SelectionStrategy>,
}

impl Default for CircuitBuilder {
    fn default() -> Self {
        Self::new(UniformRandom)
    }
}

impl CircuitBuilder {
    /// Create a builder using `strategy`.
    pub fn new(strategy: impl SelectionStrategy + 'static) -> Self {
        Self {
            strategy: Arc::new(strategy),
        }
    }

    /// Choose a circuit of `length` distinct relays from `pool`.
    ///
    /// # Errors
    /// - `InvalidCircuit` if `length` is zero or the strategy misbehaves
    /// - `InsufficientNodes` if the pool has fewer than `length` relays
    pub fn select(&self, pool: &[NodeIdentity], length: usize) -> Result<Circuit> {
        if length == 0 {
            return Err(OnionError::InvalidCircuit(
                "circuit length must be at least 1".into(),
            ));
        }

        let mut seen = HashSet::with_capacity(pool.len());
        let distinct: Vec<NodeIdentity> = pool
            .iter()
            .filter(|node| seen.insert(node.node_id))
            .cloned()
            .collect();

        if length > distinct.len() {
            return Err(OnionError::InsufficientNodes {
                requested: length,
                available: distinct.len(),
            });
        }

        let chosen = self.strategy.select(&distinct, length);
        if chosen.len() != length {
            return Err(OnionError::InvalidCircuit(format!(
                "selection returned {} relays, expected {}",
                chosen.len(),
                length
            )));
        }

        Circuit::new(chosen)
    }

    /// Choose a circuit and seal `plaintext` for `recipient` through it.
    ///
    /// Fails before any key is generated if the circuit cannot be chosen.
    pub fn build(
        &self,
        pool: &[NodeIdentity],
        length: usize,
        recipient: &str,
        plaintext: &str,
    ) -> Result<BuiltCircuit> {
        let circuit = self.select(pool, length)?;
        let message = wrap(&circuit, recipient, plaintext.as_bytes())?;

        debug!(
            hops = circuit.len(),
            circuit = ?circuit.node_ids(),
            "built circuit"
        );

        Ok(BuiltCircuit { circuit, message })
    }
}

/// One planned hop: whose key seals it and what it tells that relay.
struct HopPlan {
    public_key: RsaPublicKey,
    command: RoutingCommand,
}

/// Seal `plaintext` through every hop of `circuit`, returning the
/// envelope for the entry relay.
///
/// Each hop gets a fresh symmetric key that lives only until its layer is
/// sealed.
pub fn wrap(circuit: &Circuit, recipient: &str, plaintext: &[u8]) -> Result<HopMessage> {
    let hops = circuit.hops();
    let plan = hops
        .iter()
        .enumerate()
        .map(|(index, hop)| {
            let command = match hops.get(index + 1) {
                Some(next) => RoutingCommand::Relay {
                    next_address: next.address.clone(),
                },
                None => RoutingCommand::Deliver {
                    recipient: recipient.to_string(),
                },
            };
            Ok(HopPlan {
                public_key: hop.rsa_public_key()?,
                command,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let mut payload = plaintext.to_vec();
    let mut outermost = None;

    for hop in plan.into_iter().rev() {
        if let Some(inner) = outermost.take() {
            payload = HopMessage::to_bytes(&inner)?;
        }
        let layer = OnionLayer {
            command: hop.command,
            payload: std::mem::take(&mut payload),
        };
        let key = symmetric::generate_key();
        outermost = Some(seal_layer(&layer, &key, &hop.public_key)?);
    }

    outermost.ok_or_else(|| OnionError::InvalidCircuit("circuit has no hops".into()))
}
