use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use transport_bus::ws::WsConnector;
use transport_bus::{
    Bus, ConnectOptions, Connection, Connector, LinkState, LocalBroker, PublishOptions,
};

const TOPIC: &str = "duet_game_abcd";

async fn start_relay() -> (LocalBroker, WsConnector) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let broker = LocalBroker::new();
    tokio::spawn(duet_relay::serve(listener, broker.clone()));
    (broker, WsConnector::new(format!("ws://{addr}/ws")))
}

async fn until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn connect(connector: &WsConnector, options: ConnectOptions) -> Arc<dyn Connection> {
    connector.connect(options).await.expect("connect")
}

#[test_timeout::tokio_timeout_test]
async fn late_subscriber_receives_the_retained_message_over_the_socket() {
    let (broker, connector) = start_relay().await;
    let host = connect(&connector, ConnectOptions::new("host")).await;
    host.publish(TOPIC, Bytes::from_static(b"snapshot"), PublishOptions::RETAINED)
        .expect("publish");
    until(|| broker.retained(TOPIC).is_some()).await;

    let guest = connect(&connector, ConnectOptions::new("guest")).await;
    let mut subscription = guest.subscribe(TOPIC).expect("subscribe");
    let first = subscription.recv().await.expect("retained");
    assert_eq!(first.payload, "snapshot");

    host.publish(TOPIC, Bytes::from_static(b"live"), PublishOptions::TRANSIENT)
        .expect("publish");
    assert_eq!(subscription.recv().await.expect("live").payload, "live");
}

#[test_timeout::tokio_timeout_test]
async fn dropped_socket_publishes_the_last_will() {
    let (broker, connector) = start_relay().await;
    let watcher = connect(&connector, ConnectOptions::new("watcher")).await;
    let mut subscription = watcher.subscribe(TOPIC).expect("subscribe");
    watcher
        .publish(TOPIC, Bytes::from_static(b"probe"), PublishOptions::TRANSIENT)
        .expect("probe");
    assert_eq!(subscription.recv().await.expect("probe").payload, "probe");

    let leaver = connect(
        &connector,
        ConnectOptions::new("leaver").with_last_will(TOPIC, Bytes::from_static(b"gone")),
    )
    .await;
    until(|| broker.connected_clients().contains(&"leaver".to_string())).await;
    drop(leaver);

    assert_eq!(subscription.recv().await.expect("will").payload, "gone");
    assert!(!broker.connected_clients().contains(&"leaver".to_string()));
}

#[test_timeout::tokio_timeout_test]
async fn goodbye_discards_the_last_will() {
    let (broker, connector) = start_relay().await;
    let watcher = connect(&connector, ConnectOptions::new("watcher")).await;
    let mut subscription = watcher.subscribe(TOPIC).expect("subscribe");

    let leaver = connect(
        &connector,
        ConnectOptions::new("leaver").with_last_will(TOPIC, Bytes::from_static(b"gone")),
    )
    .await;
    until(|| broker.connected_clients().contains(&"leaver".to_string())).await;
    leaver.disconnect();
    until(|| !broker.connected_clients().contains(&"leaver".to_string())).await;

    watcher
        .publish(TOPIC, Bytes::from_static(b"probe"), PublishOptions::TRANSIENT)
        .expect("probe");
    assert_eq!(subscription.recv().await.expect("next").payload, "probe");
}

#[test_timeout::tokio_timeout_test]
async fn kicked_client_sees_its_link_go_down() {
    let (broker, connector) = start_relay().await;
    let client = connect(&connector, ConnectOptions::new("flaky")).await;
    until(|| broker.connected_clients().contains(&"flaky".to_string())).await;

    assert!(broker.kick("flaky"));
    let mut link = client.link();
    link.wait_for(|state| *state == LinkState::Down)
        .await
        .expect("link watch");
}

#[test_timeout::tokio_timeout_test]
async fn offline_broker_refuses_the_handshake() {
    let (broker, connector) = start_relay().await;
    broker.set_reachable(false);
    assert!(connector.connect(ConnectOptions::new("early")).await.is_err());
}
