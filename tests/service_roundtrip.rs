//! End-to-end tests over loopback UDP.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use netcode_transport::core::MAX_FRAGMENTS;
use netcode_transport::prelude::*;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> netcode_transport::TransportConfigBuilder {
    TransportConfig::builder()
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .sweep_interval(Duration::from_millis(5))
        .handshake_resend_interval(Duration::from_millis(50))
        .handshake_timeout(Duration::from_millis(1000))
}

async fn service(config: TransportConfig) -> TransportService {
    TransportService::bind(config, StaticKeypair::generate().unwrap())
        .await
        .unwrap()
}

async fn pair() -> (TransportService, TransportService) {
    let server = service(config().build()).await;
    let client = service(config().accept_incoming(false).build()).await;
    (server, client)
}

async fn connected() -> (TransportService, TransportService, ConnectionInfo) {
    let (server, client) = pair().await;
    let info = timeout(WAIT, client.connect(server.local_addr(), *server.public_key()))
        .await
        .expect("handshake stalled")
        .unwrap();
    (server, client, info)
}

async fn next(service: &mut TransportService) -> Inbound {
    timeout(WAIT, service.recv())
        .await
        .expect("nothing received")
        .expect("service stopped")
}

fn closed_events(service: &TransportService) -> mpsc::UnboundedReceiver<(ConnectionInfo, CloseReason)> {
    let (tx, rx) = mpsc::unbounded_channel();
    service.on_connection_closed(move |info, reason| {
        let _ = tx.send((info.clone(), reason));
    });
    rx
}

#[tokio::test]
async fn test_connect_runs_hooks_on_both_sides() {
    let (server, client) = pair().await;

    let (tx, mut established) = mpsc::unbounded_channel();
    server.on_connection_established(move |info| {
        let _ = tx.send(info.clone());
    });

    let info = timeout(WAIT, client.connect(server.local_addr(), *server.public_key()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.endpoint, server.local_addr());
    assert_eq!(info.remote_public_key, *server.public_key());
    assert_eq!(info.role, netcode_transport::crypto::Role::Initiator);

    let accepted = timeout(WAIT, established.recv()).await.unwrap().unwrap();
    assert_eq!(accepted.endpoint, client.local_addr());
    assert_eq!(accepted.remote_public_key, *client.public_key());
    assert_eq!(server.connections().len(), 1);

    // A second connect reuses the live connection.
    let again = client.connect(server.local_addr(), *server.public_key()).await.unwrap();
    assert_eq!(again.id, info.id);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_reliable_control_is_acknowledged_and_delivered() {
    let (mut server, client, info) = connected().await;

    timeout(
        WAIT,
        client.send(
            Outbound::Control(Bytes::from_static(b"ping")),
            info.endpoint,
            SendOptions::reliable(),
        ),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(client.pending_acks(), 0);

    match next(&mut server).await {
        Inbound::Control { message, source } => {
            assert_eq!(source, client.local_addr());
            assert_eq!(message.body, ControlBody::Payload(Bytes::from_static(b"ping")));
            assert!(message.needs_ack);
        }
        other => panic!("unexpected {other:?}"),
    }

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_fragmented_application_message() {
    let (mut server, client, info) = connected().await;
    let payload: Bytes = (0..10_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();

    timeout(
        WAIT,
        client.send(Outbound::Application(payload.clone()), info.endpoint, SendOptions::reliable()),
    )
    .await
    .unwrap()
    .unwrap();

    match next(&mut server).await {
        Inbound::Application { message, source } => {
            assert_eq!(source, client.local_addr());
            assert_eq!(message, payload);
        }
        other => panic!("unexpected {other:?}"),
    }

    // Replies flow the other way over the same connection.
    let reply = Bytes::from_static(b"pong");
    server
        .send(Outbound::Application(reply.clone()), client.local_addr(), SendOptions::unreliable())
        .await
        .unwrap();
    let mut client = client;
    match next(&mut client).await {
        Inbound::Application { message, .. } => assert_eq!(message, reply),
        other => panic!("unexpected {other:?}"),
    }

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_oversized_messages_are_rejected_before_io() {
    let (server, client, info) = connected().await;
    let capacity = client.mtu(info.endpoint).fragment_capacity(info.endpoint.ip());

    let too_many = Bytes::from(vec![0u8; capacity * MAX_FRAGMENTS + 1]);
    let result = client
        .send(Outbound::Application(too_many), info.endpoint, SendOptions::reliable())
        .await;
    assert!(matches!(result, Err(TransportError::MessageTooBig { .. })));

    let control = Bytes::from(vec![0u8; 2000]);
    let result = client
        .send(Outbound::Control(control), info.endpoint, SendOptions::reliable())
        .await;
    assert!(matches!(result, Err(TransportError::MessageTooBig { .. })));

    let result = client
        .send(Outbound::Application(Bytes::new()), info.endpoint, SendOptions::reliable())
        .await;
    assert!(matches!(result, Err(TransportError::BadMessage(_))));

    assert_eq!(client.pending_acks(), 0);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_send_without_connection_is_unauthorized() {
    let (server, client) = pair().await;
    let result = client
        .send(
            Outbound::Control(Bytes::from_static(b"early")),
            server.local_addr(),
            SendOptions::reliable(),
        )
        .await;
    assert!(matches!(result, Err(TransportError::Unauthorized)));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_close_cancels_pending_and_notifies_peer() {
    let (server, client, info) = connected().await;
    let mut server_closed = closed_events(&server);
    let mut client_closed = closed_events(&client);

    let first = client.send(
        Outbound::Control(Bytes::from_static(b"one")),
        info.endpoint,
        SendOptions::reliable(),
    );
    let second = client.send(
        Outbound::Control(Bytes::from_static(b"two")),
        info.endpoint,
        SendOptions::reliable(),
    );
    let closed = client.close(info.endpoint);

    assert!(matches!(first.await, Err(TransportError::Cancelled)));
    assert!(matches!(second.await, Err(TransportError::Cancelled)));
    timeout(WAIT, closed).await.unwrap().unwrap();
    assert!(client.connection(info.endpoint).is_none());

    let (local, reason) = client_closed.recv().await.unwrap();
    assert_eq!(local.id, info.id);
    assert_eq!(reason, CloseReason::Local);

    let (remote, reason) = timeout(WAIT, server_closed.recv()).await.unwrap().unwrap();
    assert_eq!(remote.endpoint, client.local_addr());
    assert_eq!(reason, CloseReason::PeerClosed);
    assert!(server.connections().is_empty());

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_idle_connection_times_out() {
    let server = service(config().idle_timeout(Duration::from_millis(150)).build()).await;
    let client = service(config().accept_incoming(false).build()).await;
    let mut server_closed = closed_events(&server);

    timeout(WAIT, client.connect(server.local_addr(), *server.public_key()))
        .await
        .unwrap()
        .unwrap();

    let (_, reason) = timeout(WAIT, server_closed.recv()).await.unwrap().unwrap();
    assert_eq!(reason, CloseReason::IdleTimeout);
    assert!(server.connections().is_empty());

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_unauthorized_peer_times_out() {
    let stranger = StaticKeypair::generate().unwrap();
    let server = service(config().authorize_peer(*stranger.public_key()).build()).await;
    let client = service(config().accept_incoming(false).build()).await;

    let result = timeout(WAIT, client.connect(server.local_addr(), *server.public_key()))
        .await
        .unwrap();
    assert!(matches!(result, Err(TransportError::Timeout)));
    assert!(server.connections().is_empty());

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_wrong_server_key_times_out() {
    let (server, client) = pair().await;
    let imposter = StaticKeypair::generate().unwrap();

    let result = timeout(WAIT, client.connect(server.local_addr(), *imposter.public_key()))
        .await
        .unwrap();
    assert!(matches!(result, Err(TransportError::Timeout)));

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_punch_through_and_pmtu_on_loopback() {
    let (server, client) = pair().await;

    timeout(WAIT, client.punch_through(server.local_addr()))
        .await
        .unwrap()
        .unwrap();

    let mtu = timeout(WAIT, client.discover_pmtu(server.local_addr()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mtu, client.config().max_mtu);
    assert_eq!(client.mtu(server.local_addr()).get(), mtu);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_peers() {
    let (server, client, _) = connected().await;
    let mut client_closed = closed_events(&client);
    let mut server_closed = closed_events(&server);

    server.shutdown().await;

    let (_, reason) = server_closed.recv().await.unwrap();
    assert_eq!(reason, CloseReason::Shutdown);
    let (_, reason) = timeout(WAIT, client_closed.recv()).await.unwrap().unwrap();
    assert_eq!(reason, CloseReason::PeerClosed);

    client.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_after_close() {
    let (server, client, first) = connected().await;
    let mut server_closed = closed_events(&server);

    client.close(first.endpoint).await.unwrap();
    let (_, reason) = timeout(WAIT, server_closed.recv()).await.unwrap().unwrap();
    assert_eq!(reason, CloseReason::PeerClosed);

    let second = timeout(WAIT, client.connect(server.local_addr(), *server.public_key()))
        .await
        .unwrap()
        .unwrap();
    assert_ne!(second.id, first.id);
    assert_eq!(server.connections().len(), 1);

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reliable_sends_from_many_tasks() {
    let (server, client, info) = connected().await;
    let client = Arc::new(client);
    let endpoint = info.endpoint;

    let senders: Vec<_> = (0..8)
        .map(|task| {
            let client = client.clone();
            tokio::spawn(async move {
                let tokens: Vec<_> = (0..50)
                    .map(|i| {
                        client.send(
                            Outbound::Control(Bytes::from(format!("{task}:{i}"))),
                            endpoint,
                            SendOptions::reliable(),
                        )
                    })
                    .collect();
                let mut failures = Vec::new();
                for token in tokens {
                    if let Err(e) = token.await {
                        failures.push(e.to_string());
                    }
                }
                failures
            })
        })
        .collect();

    for sender in senders {
        let failures = timeout(WAIT, sender).await.unwrap().unwrap();
        assert!(failures.is_empty(), "{failures:?}");
    }
    assert_eq!(client.pending_acks(), 0);

    let client = Arc::try_unwrap(client).unwrap();
    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_discovered_mtu_reaches_live_connection() {
    let (server, client, info) = connected().await;
    assert_eq!(info.mtu, MtuValue::new(client.config().default_mtu));

    let mtu = timeout(WAIT, client.discover_pmtu(info.endpoint))
        .await
        .unwrap()
        .unwrap();
    let current = client.connection(info.endpoint).unwrap();
    assert_eq!(current.mtu.get(), mtu);
    assert_eq!(current.id, info.id);

    client.shutdown().await;
    server.shutdown().await;
}
