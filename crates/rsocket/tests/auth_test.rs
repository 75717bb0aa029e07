//! Connection setup authentication between transports.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{addr, init_logging, loopback_transport, wait_for_metrics};
use courier_rsocket::{
    Backoff, MemoryClientTransport, MemoryServerTransport, RSocketTransport, StaticResolver,
    Transport,
};
use tokio::time::timeout;

async fn sender(port: u16, target: u16, token: &str) -> RSocketTransport {
    RSocketTransport::builder()
        .resolver(StaticResolver::new([addr(target)]))
        .auth_token(token)
        .server_transport(MemoryServerTransport::new(addr(port)))
        .client_transport(MemoryClientTransport::new())
        .send_retry(Backoff::new(2, Duration::from_millis(10), Duration::from_millis(10)))
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_wrong_token_delivers_nothing() {
    init_logging();

    let receiver = RSocketTransport::builder()
        .resolver(StaticResolver::default())
        .auth_token("correct horse")
        .server_transport(MemoryServerTransport::new(addr(48001)))
        .client_transport(MemoryClientTransport::new())
        .build()
        .await
        .unwrap();
    let inbound = receiver.receive_from("orders").unwrap();

    let intruder = sender(48002, 48001, "battery staple").await;
    let outbound = intruder.send_to("orders").unwrap();
    for _ in 0..5 {
        outbound.send(Bytes::from_static(b"forged")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(timeout(Duration::from_millis(300), inbound.receive()).await.is_err());
    assert_eq!(receiver.metrics().messages_received, 0);

    // Every forged message is reported as failed, none as sent.
    let metrics = wait_for_metrics(&intruder, Duration::from_secs(2), |m| m.send_errors == 5).await;
    assert_eq!(metrics.messages_sent, 0);
    assert_eq!(intruder.channel_metrics("orders").unwrap().send_errors, 5);

    // The server keeps serving authenticated peers.
    let friend = sender(48003, 48001, "correct horse").await;
    friend
        .send_to("orders")
        .unwrap()
        .send(Bytes::from_static(b"genuine"))
        .await
        .unwrap();

    let bytes = timeout(Duration::from_secs(2), inbound.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bytes, Bytes::from_static(b"genuine"));

    friend.close().await.unwrap();
    intruder.close().await.unwrap();
    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_default_token_is_shared() {
    init_logging();

    // Neither side sets a token, so both fall back to the default.
    let transport = loopback_transport(48011).await;
    let inbound = transport.receive_from("defaults").unwrap();

    transport
        .send_to("defaults")
        .unwrap()
        .send(Bytes::from_static(b"hello"))
        .await
        .unwrap();

    let bytes = timeout(Duration::from_secs(2), inbound.receive())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bytes, Bytes::from_static(b"hello"));

    transport.close().await.unwrap();
}
