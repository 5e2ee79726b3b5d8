use skybridge_p2p::nat_traversal::{DiscoveredDevice, NatTraversalConfig, NatTraversalManager};
use skybridge_p2p::transport::{
    AppEvent, ConnectionId, ConnectionInfo, Role, ServiceState, TransportConfig, TransportManager,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_test::{assert_err, assert_ok};

type Received = mpsc::UnboundedReceiver<(ConnectionId, AppEvent)>;

async fn manager_with_inbox() -> (TransportManager, Received) {
    let transport = TransportManager::new(TransportConfig::default());
    let (tx, rx) = mpsc::unbounded_channel();
    transport
        .set_event_handler(Arc::new(move |connection, event| {
            let _ = tx.send((connection, event));
        }))
        .await;
    (transport, rx)
}

async fn wait_until(
    transport: &TransportManager,
    check: impl Fn(&ServiceState, &[ConnectionInfo]) -> bool,
) {
    for _ in 0..200 {
        if check(&transport.state().await, &transport.connections().await) {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("transport never reached the expected state");
}

fn free_port() -> u16 {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| s.local_addr())
        .map(|a| a.port())
        .unwrap()
}

#[tokio::test]
async fn handshake_reaches_the_listener_and_disconnect_tears_down_both_sides() {
    let (listener, mut listener_events) = manager_with_inbox().await;
    listener.start(Role::Listener, Some(free_port())).await.unwrap();
    let port = listener.local_port().await.unwrap();
    assert_eq!(listener.state().await, ServiceState::Listening(port));

    let (dialer, _) = manager_with_inbox().await;
    dialer.start(Role::Dialer, None).await.unwrap();
    let connection = dialer.connect(([127, 0, 0, 1], port).into()).await.unwrap();

    let hello = AppEvent::handshake("1.0", "A", vec!["x".to_string()]);
    assert_ok!(dialer.send(&hello, connection).await);

    let (_, received) = timeout(Duration::from_secs(2), listener_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, hello);
    assert_eq!(listener.state().await, ServiceState::Connected);

    assert_ok!(dialer.disconnect(connection).await);
    assert_err!(dialer.send(&AppEvent::KeepAlive, connection).await);
    assert!(dialer.connections().await.is_empty());
    assert_eq!(dialer.state().await, ServiceState::Idle);

    wait_until(&listener, |state, connections| {
        connections.is_empty() && *state == ServiceState::Listening(port)
    })
    .await;
}

#[tokio::test]
async fn listener_replies_reach_the_dialer_in_order() {
    let (listener, mut listener_events) = manager_with_inbox().await;
    listener.start(Role::Listener, Some(0)).await.unwrap();
    let port = listener.local_port().await.unwrap();

    let (dialer, mut dialer_events) = manager_with_inbox().await;
    dialer.start(Role::Dialer, None).await.unwrap();
    let connection = dialer.connect(([127, 0, 0, 1], port).into()).await.unwrap();
    dialer.send(&AppEvent::KeepAlive, connection).await.unwrap();

    let (inbound, _) = timeout(Duration::from_secs(2), listener_events.recv())
        .await
        .unwrap()
        .unwrap();
    for n in 0..5 {
        listener
            .send(&AppEvent::text(format!("message {}", n)), inbound)
            .await
            .unwrap();
    }

    for n in 0..5 {
        let (from, event) = timeout(Duration::from_secs(2), dialer_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, connection);
        assert_eq!(event, AppEvent::text(format!("message {}", n)));
    }

    listener.stop().await;
    wait_until(&dialer, |state, connections| {
        connections.is_empty() && *state == ServiceState::Idle
    })
    .await;
}

#[tokio::test]
async fn punched_path_is_adopted_by_the_transport() {
    let (listener, mut listener_events) = manager_with_inbox().await;
    listener.start(Role::Listener, Some(0)).await.unwrap();
    let port = listener.local_port().await.unwrap();

    let nat = NatTraversalManager::new(NatTraversalConfig {
        stun_servers: vec![],
        punch_interval: Duration::from_millis(20),
        punch_timeout: Duration::from_secs(2),
        ..NatTraversalConfig::default()
    });
    let session = nat
        .create_session(DiscoveredDevice {
            device_id: "listener".into(),
            endpoints: vec![format!("127.0.0.1:{}", port)],
            display_name: "Listener".into(),
        })
        .await;
    let direct = nat.perform_direct_connection(session.session_id).await.unwrap();

    // Probes never create connection entries
    assert!(listener.connections().await.is_empty());

    let (dialer, _) = manager_with_inbox().await;
    dialer.start(Role::Dialer, None).await.unwrap();
    let connection = dialer.adopt(direct).await;
    dialer.send(&AppEvent::text("through the hole"), connection).await.unwrap();

    let (_, event) = timeout(Duration::from_secs(2), listener_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, AppEvent::text("through the hole"));
    assert_eq!(nat.statistics().await.successful_connections, 1);
}
