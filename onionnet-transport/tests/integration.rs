//! End-to-end tests: registry, relays and users wired together, first over
//! the in-process transport, then over real TCP sockets.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use onionnet_crypto::{asymmetric, from_base64, to_base64, KeyPair, TOKEN_DELIMITER};
use onionnet_transport::{
    serve, CircuitBuilder, Directory, HopMessage, MemoryTransport, NodeId, OnionError, Ordered,
    Registry, Relay, RelayState, RemoteDirectory, Request, Response, RpcConfig, TcpTransport,
    Transport, User, UserId,
};
use tokio::net::TcpListener;

const REGISTRY: &str = "127.0.0.1:8080";

fn relay_keys() -> &'static [KeyPair] {
    static KEYS: OnceLock<Vec<KeyPair>> = OnceLock::new();
    KEYS.get_or_init(|| {
        (0..4)
            .map(|_| asymmetric::generate_key_pair().unwrap())
            .collect()
    })
}

fn relay_address(index: usize) -> String {
    format!("127.0.0.1:{}", 4001 + index)
}

fn user_address(id: UserId) -> String {
    format!("127.0.0.1:{}", 3000 + id)
}

struct MemoryNetwork {
    transport: Arc<MemoryTransport>,
    directory: Arc<RemoteDirectory>,
    relays: Vec<Arc<Relay>>,
    users: HashMap<UserId, Arc<User>>,
}

/// Registry at 8080, `relay_count` relays at 4001.., users 1 and 2 at
/// 3001 and 3002, all on one memory transport.
async fn memory_network(relay_count: usize) -> MemoryNetwork {
    let transport = Arc::new(MemoryTransport::new());
    transport.register(REGISTRY, Arc::new(Registry::new()));
    let directory = Arc::new(RemoteDirectory::new(REGISTRY, transport.clone()));

    let mut relays = Vec::new();
    for (i, keys) in relay_keys().iter().take(relay_count).enumerate() {
        let relay = Arc::new(Relay::new(
            NodeId::new(i as u32 + 1),
            relay_address(i),
            keys.clone(),
            transport.clone(),
        ));
        relay.register(directory.as_ref()).await.unwrap();
        transport.register(relay.address(), relay.clone());
        relays.push(relay);
    }

    let book: Arc<HashMap<UserId, String>> =
        Arc::new([1, 2].into_iter().map(|id| (id, user_address(id))).collect());

    let mut users = HashMap::new();
    for id in [1, 2] {
        let user = Arc::new(
            User::new(
                id,
                user_address(id),
                directory.clone(),
                transport.clone(),
                book.clone(),
            )
            .with_builder(CircuitBuilder::new(Ordered)),
        );
        transport.register(user.address(), user.clone());
        users.insert(id, user);
    }

    MemoryNetwork {
        transport,
        directory,
        relays,
        users,
    }
}

async fn eventually<T>(mut check: impl FnMut() -> Option<T>) -> Option<T> {
    for _ in 0..200 {
        if let Some(value) = check() {
            return Some(value);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

#[tokio::test]
async fn three_hop_delivery_over_memory_transport() {
    let net = memory_network(3).await;
    let alice = &net.users[&1];
    let bob = &net.users[&2];

    let circuit = alice.send_message("hello", 2, 3).await.unwrap();
    assert_eq!(circuit.len(), 3);

    let delivered = eventually(|| bob.last_received_message()).await;
    assert_eq!(delivered.as_deref(), Some("hello"));

    // Each envelope went to exactly the next hop, ending at Bob's inbox.
    for (i, relay) in net.relays.iter().enumerate() {
        assert_eq!(net.transport.calls_to(relay.address(), "relay"), 1);
        let expected = if i + 1 < net.relays.len() {
            net.relays[i + 1].address().to_string()
        } else {
            bob.address().to_string()
        };
        assert_eq!(relay.last_message_destination(), Some(expected));
    }
    assert_eq!(net.transport.calls_to(bob.address(), "deliver"), 1);

    // Only the exit relay saw the plaintext.
    assert!(net.relays[..2].iter().all(|relay| {
        relay
            .last_received_decrypted_message()
            .is_some_and(|payload| !payload.contains("hello"))
    }));
    assert_eq!(
        net.relays[2].last_received_decrypted_message().as_deref(),
        Some("hello")
    );

    let idle = eventually(|| {
        net.relays
            .iter()
            .all(|r| r.last_state() == Some(RelayState::Idle))
            .then_some(())
    })
    .await;
    assert!(idle.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_messages_share_relays_without_interference() {
    const MESSAGES: u64 = 20;
    let net = memory_network(3).await;

    let sends: Vec<_> = (0..MESSAGES)
        .map(|i| {
            let alice = Arc::clone(&net.users[&1]);
            tokio::spawn(async move { alice.send_message(&format!("message {}", i), 2, 3).await })
        })
        .collect();
    for send in sends {
        send.await.unwrap().unwrap();
    }

    let exit = &net.relays[2];
    let all_delivered = eventually(|| (exit.stats().delivered == MESSAGES).then_some(())).await;
    assert!(all_delivered.is_some(), "exit stats: {:?}", exit.stats());

    for relay in &net.relays {
        let stats = relay.stats();
        assert_eq!(stats.received, MESSAGES);
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.forward_failures, 0);
    }
    assert_eq!(net.transport.calls_to(&user_address(2), "deliver"), MESSAGES as usize);
    let last = net.users[&2].last_received_message().unwrap();
    assert!(last.starts_with("message "));
}

#[tokio::test]
async fn corrupted_envelope_is_not_forwarded() {
    let net = memory_network(3).await;
    let pool = net.directory.node_registry().await.unwrap();
    let built = CircuitBuilder::new(Ordered)
        .build(&pool, 3, &user_address(2), "hello")
        .unwrap();

    let (iv, ciphertext) = built.message.payload.split_once(TOKEN_DELIMITER).unwrap();
    let mut raw = from_base64(ciphertext).unwrap();
    raw[0] ^= 0x80;
    let corrupted = HopMessage {
        encrypted_key: built.message.encrypted_key.clone(),
        payload: format!("{}{}{}", iv, TOKEN_DELIMITER, to_base64(&raw)),
    };

    let response = net
        .transport
        .call(net.relays[0].address(), Request::Relay(corrupted))
        .await
        .unwrap();
    assert!(matches!(response, Response::Error(_)));

    // Give a wrongly spawned forward the chance to happen.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(net.transport.calls_to(net.relays[1].address(), "relay"), 0);
    assert_eq!(net.relays[0].stats().dropped, 1);
    assert_eq!(net.relays[0].last_message_destination(), None);
}

#[tokio::test]
async fn over_long_circuit_makes_no_relay_calls() {
    let net = memory_network(2).await;
    let result = net.users[&1].send_message("hello", 2, 3).await;
    assert!(matches!(
        result,
        Err(OnionError::InsufficientNodes {
            requested: 3,
            available: 2
        })
    ));

    // Only the registry lookups happened.
    assert!(net
        .transport
        .history()
        .iter()
        .all(|(address, _)| address == REGISTRY));
}

#[tokio::test]
async fn send_request_drives_remote_user() {
    let net = memory_network(4).await;

    let response = net
        .transport
        .call(
            &user_address(1),
            Request::SendMessage {
                message: "via rpc".into(),
                destination_user_id: 2,
                circuit_length: Some(4),
            },
        )
        .await
        .unwrap();
    assert_eq!(response, Response::Ack);

    let delivered = eventually(|| net.users[&2].last_received_message()).await;
    assert_eq!(delivered.as_deref(), Some("via rpc"));

    let circuit = net
        .transport
        .call(&user_address(1), Request::GetLastCircuit)
        .await
        .unwrap()
        .into_circuit()
        .unwrap();
    assert_eq!(circuit, (1..=4).map(NodeId::new).collect::<Vec<_>>());

    let key = net
        .directory
        .private_key(NodeId::new(3))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        asymmetric::import_private(&key).unwrap(),
        relay_keys()[2].private_key
    );
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    (listener, address)
}

#[tokio::test]
async fn three_hop_delivery_over_tcp() {
    let config = RpcConfig {
        timeout_ms: 2_000,
        ..RpcConfig::default()
    };
    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(config.clone()));

    let (listener, registry_address) = bind().await;
    tokio::spawn(serve(listener, Arc::new(Registry::new()), config.clone()));
    let directory = Arc::new(RemoteDirectory::new(&registry_address, transport.clone()));

    for (i, keys) in relay_keys().iter().take(3).enumerate() {
        let (listener, address) = bind().await;
        let relay = Arc::new(Relay::new(
            NodeId::new(i as u32 + 1),
            address,
            keys.clone(),
            transport.clone(),
        ));
        relay.register(directory.as_ref()).await.unwrap();
        tokio::spawn(serve(listener, relay, config.clone()));
    }

    let (alice_listener, alice_address) = bind().await;
    let (bob_listener, bob_address) = bind().await;
    let book: Arc<HashMap<UserId, String>> = Arc::new(
        [(1, alice_address.clone()), (2, bob_address.clone())]
            .into_iter()
            .collect(),
    );

    let alice = Arc::new(User::new(
        1,
        alice_address,
        directory.clone(),
        transport.clone(),
        book.clone(),
    ));
    let bob = Arc::new(User::new(
        2,
        bob_address.clone(),
        directory.clone(),
        transport.clone(),
        book,
    ));
    tokio::spawn(serve(alice_listener, alice.clone(), config.clone()));
    tokio::spawn(serve(bob_listener, bob.clone(), config));

    let circuit = alice.send_message("hello over tcp", 2, 3).await.unwrap();
    assert_eq!(circuit.len(), 3);

    let delivered = eventually(|| bob.last_received_message()).await;
    assert_eq!(delivered.as_deref(), Some("hello over tcp"));

    let status = transport
        .call(&bob_address, Request::Status)
        .await
        .unwrap()
        .into_status()
        .unwrap();
    assert_eq!(status, "alive");
}
