//! # RPC Plumbing
//!
//! Request/response protocol spoken between users, relays and the
//! registry, with a TCP transport and an in-process one.
//!
//! ## Wire Format
//! ```text
//! [frame_len: u32 LE][JSON-encoded Request or Response]
//! ```
//! One request per frame; a connection may carry several requests in a row.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::RpcConfig;
use crate::onion::HopMessage;
use crate::registry::NodeRecord;
use crate::relay::RelayStatsSnapshot;
use crate::{NodeId, NodeIdentity, OnionError, Result, UserId};

/// Requests understood by onionnet endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum Request {
    /// Liveness check, answered by every endpoint.
    Status,

    /// Registry: add a relay.
    RegisterNode(NodeRecord),
    /// Registry: list published relays.
    GetNodeRegistry,
    /// Registry: look up a relay's private key (test-only shortcut).
    GetPrivateKey {
        /// Relay to look up.
        node_id: NodeId,
    },

    /// Relay: peel and forward one envelope.
    Relay(HopMessage),
    /// Relay: last envelope payload received.
    GetLastReceivedEncryptedMessage,
    /// Relay: last payload obtained by peeling.
    GetLastReceivedDecryptedMessage,
    /// Relay: where the last peeled payload was sent.
    GetLastMessageDestination,
    /// Relay: its own exported private key (debugging only).
    GetRelayPrivateKey,
    /// Relay: message counters.
    GetRelayStats,

    /// User: final plaintext delivered by an exit relay.
    Deliver {
        /// Plaintext message.
        message: String,
    },
    /// User: send a message through a fresh circuit.
    SendMessage {
        /// Plaintext message.
        message: String,
        /// Destination user.
        destination_user_id: UserId,
        /// Number of relays; the endpoint default is used when absent.
        circuit_length: Option<usize>,
    },
    /// User: last message delivered to this user.
    GetLastReceivedMessage,
    /// User: last message this user sent.
    GetLastSentMessage,
    /// User: relay IDs of the last circuit used.
    GetLastCircuit,
}

impl Request {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::RegisterNode(_) => "register_node",
            Self::GetNodeRegistry => "get_node_registry",
            Self::GetPrivateKey { .. } => "get_private_key",
            Self::Relay(_) => "relay",
            Self::GetLastReceivedEncryptedMessage => "get_last_received_encrypted_message",
            Self::GetLastReceivedDecryptedMessage => "get_last_received_decrypted_message",
            Self::GetLastMessageDestination => "get_last_message_destination",
            Self::GetRelayPrivateKey => "get_relay_private_key",
            Self::GetRelayStats => "get_relay_stats",
            Self::Deliver { .. } => "deliver",
            Self::SendMessage { .. } => "send_message",
            Self::GetLastReceivedMessage => "get_last_received_message",
            Self::GetLastSentMessage => "get_last_sent_message",
            Self::GetLastCircuit => "get_last_circuit",
        }
    }
}

/// Responses produced by onionnet endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum Response {
    /// The request was accepted.
    Ack,
    /// Liveness answer.
    Status(String),
    /// Published relays.
    Nodes(Vec<NodeIdentity>),
    /// An optional text value (keys, cached messages, destinations).
    Text(Option<String>),
    /// Relay IDs of a circuit.
    Circuit(Vec<NodeId>),
    /// Relay counters.
    Stats(RelayStatsSnapshot),
    /// The request failed; the message describes why.
    Error(String),
}

impl Response {
    /// Unwrap an [`Response::Ack`].
    pub fn into_ack(self) -> Result<()> {
        match self {
            Self::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Unwrap a [`Response::Text`].
    pub fn into_text(self) -> Result<Option<String>> {
        match self {
            Self::Text(text) => Ok(text),
            other => Err(unexpected(other)),
        }
    }

    /// Unwrap a [`Response::Nodes`].
    pub fn into_nodes(self) -> Result<Vec<NodeIdentity>> {
        match self {
            Self::Nodes(nodes) => Ok(nodes),
            other => Err(unexpected(other)),
        }
    }

    /// Unwrap a [`Response::Circuit`].
    pub fn into_circuit(self) -> Result<Vec<NodeId>> {
        match self {
            Self::Circuit(ids) => Ok(ids),
            other => Err(unexpected(other)),
        }
    }

    /// Unwrap a [`Response::Status`].
    pub fn into_status(self) -> Result<String> {
        match self {
            Self::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Unwrap a [`Response::Stats`].
    pub fn into_stats(self) -> Result<RelayStatsSnapshot> {
        match self {
            Self::Stats(stats) => Ok(stats),
            other => Err(unexpected(other)),
        }
    }

    /// Answer for a request the endpoint does not serve.
    pub fn unsupported(request: &Request) -> Self {
        Self::Error(format!("unsupported request: {}", request.kind()))
    }
}

fn unexpected(response: Response) -> OnionError {
    match response {
        Response::Error(reason) => OnionError::Protocol(reason),
        other => OnionError::Protocol(format!("unexpected response: {:?}", other)),
    }
}

/// Something that answers requests: a relay, a user or the registry.
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    /// Handle one request. Failures are reported in the response, never by
    /// panicking, so one bad message cannot take the process down.
    async fn handle(self: Arc<Self>, request: Request) -> Response;
}

/// Moves a request to the endpoint at an address and returns its answer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` to `address` and wait for the response.
    async fn call(&self, address: &str, request: Request) -> Result<Response>;
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T, max_frame_size: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(value).map_err(|e| OnionError::Network(e.to_string()))?;
    if body.len() > max_frame_size {
        return Err(OnionError::Network(format!(
            "frame of {} bytes exceeds the {} byte limit",
            body.len(),
            max_frame_size
        )));
    }
    let len = u32::try_from(body.len())
        .map_err(|_| OnionError::Network("frame too large".into()))?;

    writer
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| OnionError::Network(e.to_string()))?;
    writer
        .write_all(&body)
        .await
        .map_err(|e| OnionError::Network(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| OnionError::Network(e.to_string()))
}

/// Read one length-prefixed JSON frame; `Ok(None)` on a clean EOF.
pub async fn read_frame<R, T>(reader: &mut R, max_frame_size: usize) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(OnionError::Network(e.to_string())),
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > max_frame_size {
        return Err(OnionError::Network(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, max_frame_size
        )));
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| OnionError::Network(e.to_string()))?;

    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| OnionError::Network(format!("invalid frame: {}", e)))
}

/// Transport over TCP, one connection per call.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: RpcConfig,
}

impl TcpTransport {
    /// Create a transport with the given limits.
    pub fn new(config: RpcConfig) -> Self {
        Self { config }
    }

    async fn exchange(&self, address: &str, request: &Request) -> Result<Response> {
        let deadline = self.config.timeout();
        let max = self.config.max_frame_size;

        let mut stream = timeout(deadline, TcpStream::connect(address))
            .await
            .map_err(|_| OnionError::Timeout)?
            .map_err(|e| OnionError::Network(format!("connect {}: {}", address, e)))?;

        timeout(deadline, write_frame(&mut stream, request, max))
            .await
            .map_err(|_| OnionError::Timeout)??;

        timeout(deadline, read_frame::<_, Response>(&mut stream, max))
            .await
            .map_err(|_| OnionError::Timeout)??
            .ok_or_else(|| OnionError::Network(format!("{} closed the connection", address)))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, address: &str, request: Request) -> Result<Response> {
        debug!(address, request = request.kind(), "rpc call");
        self.exchange(address, &request).await
    }
}

/// Accept connections on `listener` and answer them with `endpoint`.
///
/// Each connection runs in its own task; a failing connection is logged
/// and closed without affecting the others. Runs until the listener fails.
pub async fn serve<E>(listener: TcpListener, endpoint: Arc<E>, config: RpcConfig) -> Result<()>
where
    E: Endpoint + ?Sized,
{
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| OnionError::Network(e.to_string()))?;

        let endpoint = Arc::clone(&endpoint);
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, endpoint, config).await {
                warn!(%peer, error = %e, "connection closed with error");
            }
        });
    }
}

async fn handle_connection<E>(mut stream: TcpStream, endpoint: Arc<E>, config: RpcConfig) -> Result<()>
where
    E: Endpoint + ?Sized,
{
    let max = config.max_frame_size;
    loop {
        let request = match timeout(config.timeout(), read_frame::<_, Request>(&mut stream, max)).await {
            Ok(frame) => match frame? {
                Some(request) => request,
                None => return Ok(()),
            },
            // Idle connection.
            Err(_) => return Ok(()),
        };

        let response = Arc::clone(&endpoint).handle(request).await;

        timeout(config.timeout(), write_frame(&mut stream, &response, max))
            .await
            .map_err(|_| OnionError::Timeout)??;
    }
}

/// In-process transport routing calls to registered endpoints.
///
/// Every call goes through a JSON round trip, so in-process tests exercise
/// the same encoding as TCP.
#[derive(Default)]
pub struct MemoryTransport {
    endpoints: RwLock<HashMap<String, Arc<dyn Endpoint>>>,
    calls: AtomicUsize,
    history: Mutex<Vec<(String, &'static str)>>,
}

impl MemoryTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `endpoint` reachable at `address`.
    pub fn register(&self, address: impl Into<String>, endpoint: Arc<dyn Endpoint>) {
        if let Ok(mut endpoints) = self.endpoints.write() {
            endpoints.insert(address.into(), endpoint);
        }
    }

    /// Remove the endpoint at `address`, making it unreachable.
    pub fn unregister(&self, address: &str) {
        if let Ok(mut endpoints) = self.endpoints.write() {
            endpoints.remove(address);
        }
    }

    /// Total number of calls attempted.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// `(address, request kind)` of every call attempted, in order.
    pub fn history(&self) -> Vec<(String, &'static str)> {
        self.history
            .lock()
            .map(|history| history.clone())
            .unwrap_or_default()
    }

    /// Number of calls of `kind` sent to `address`.
    pub fn calls_to(&self, address: &str, kind: &str) -> usize {
        self.history()
            .iter()
            .filter(|(to, k)| to == address && *k == kind)
            .count()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn call(&self, address: &str, request: Request) -> Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut history) = self.history.lock() {
            history.push((address.to_string(), request.kind()));
        }

        let endpoint = self
            .endpoints
            .read()
            .ok()
            .and_then(|endpoints| endpoints.get(address).cloned())
            .ok_or_else(|| OnionError::Network(format!("no endpoint at {}", address)))?;

        let encoded = serde_json::to_vec(&request).map_err(|e| OnionError::Network(e.to_string()))?;
        let request: Request =
            serde_json::from_slice(&encoded).map_err(|e| OnionError::Network(e.to_string()))?;

        Ok(endpoint.handle(request).await)
    }
}
