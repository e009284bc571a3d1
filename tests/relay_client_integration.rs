//! End-to-end coverage of the production `relay-client` against a real
//! in-process daemon (`relay-test-utils::TestDaemon`), exercising the same
//! paths an orchestrator worker would: connect, send, receive, query.

use relay_client::{ClientConfig, ClientEvent, RelayClient};
use relay_test_utils::TestDaemon;

#[tokio::test]
async fn two_clients_exchange_messages() {
    let daemon = TestDaemon::start().await.unwrap();

    let alice = RelayClient::connect(ClientConfig::new("Alice", daemon.socket_path.clone())).await.unwrap();
    let bob = RelayClient::connect(ClientConfig::new("Bob", daemon.socket_path.clone())).await.unwrap();

    let mut bob_events = bob.subscribe_events();
    alice.send_message("Bob", "hello there").unwrap();

    let event = tokio::time::timeout(std::time::Duration::from_secs(2), bob_events.recv())
        .await
        .expect("timed out waiting for message")
        .unwrap();

    match event {
        ClientEvent::Message { from, payload, .. } => {
            assert_eq!(from, "Alice");
            assert_eq!(payload.body, "hello there");
        }
        other => panic!("expected Message event, got {other:?}"),
    }
}

#[tokio::test]
async fn send_and_wait_resolves_on_ack() {
    let daemon = TestDaemon::start().await.unwrap();

    let alice = RelayClient::connect(ClientConfig::new("Alice", daemon.socket_path.clone())).await.unwrap();
    let bob = RelayClient::connect(ClientConfig::new("Bob", daemon.socket_path.clone())).await.unwrap();

    let mut bob_events = bob.subscribe_events();
    let wait = tokio::spawn(async move { alice.send_and_wait("Bob", "ping", std::time::Duration::from_secs(2)).await });

    let event = tokio::time::timeout(std::time::Duration::from_secs(2), bob_events.recv()).await.unwrap().unwrap();
    if let ClientEvent::Message { payload, delivery, .. } = event {
        assert_eq!(payload.body, "ping");
        assert!(delivery.is_some());
    } else {
        panic!("expected Message event");
    }

    wait.await.unwrap().expect("send_and_wait should resolve once ack lands");
}

#[tokio::test]
async fn list_agents_query_sees_both_peers() {
    let daemon = TestDaemon::start().await.unwrap();

    let alice = RelayClient::connect(ClientConfig::new("Alice", daemon.socket_path.clone())).await.unwrap();
    let _bob = RelayClient::connect(ClientConfig::new("Bob", daemon.socket_path.clone())).await.unwrap();

    let agents = alice.list_agents(None).await.unwrap();
    assert!(agents.agents.contains(&"Alice".to_string()));
    assert!(agents.agents.contains(&"Bob".to_string()));
}
