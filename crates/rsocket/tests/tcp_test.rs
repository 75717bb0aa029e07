//! The transport over its default TCP bindings.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use common::{init_logging, wait_for_metrics};
use courier_rsocket::{DEFAULT_PORT, RSocketTransport, StaticResolver, Transport};
use serial_test::serial;
use tokio::net::TcpListener;
use tokio::time::timeout;

fn local(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

async fn tcp_transport() -> RSocketTransport {
    RSocketTransport::builder()
        .resolver(StaticResolver::new([local(DEFAULT_PORT)]))
        .bind_addr(local(DEFAULT_PORT))
        .build()
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[serial]
async fn test_tcp_round_trip() {
    init_logging();

    let transport = tcp_transport().await;
    assert_eq!(transport.local_addr(), local(DEFAULT_PORT));

    let inbound = transport.receive_from("tcp").unwrap();
    let outbound = transport.send_to("tcp").unwrap();

    let large = Bytes::from(vec![7u8; 1 << 20]);
    outbound.send(Bytes::from_static(b"small")).await.unwrap();
    outbound.send(large.clone()).await.unwrap();

    let first = timeout(Duration::from_secs(5), inbound.receive()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(5), inbound.receive()).await.unwrap().unwrap();
    assert_eq!(first, Bytes::from_static(b"small"));
    assert_eq!(second, large);

    wait_for_metrics(&transport, Duration::from_secs(5), |m| m.messages_sent == 2).await;

    transport.close().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_close_frees_the_port() {
    init_logging();

    let transport = tcp_transport().await;
    let inbound = transport.receive_from("tcp").unwrap();
    transport
        .send_to("tcp")
        .unwrap()
        .send(Bytes::from_static(b"ping"))
        .await
        .unwrap();
    timeout(Duration::from_secs(5), inbound.receive()).await.unwrap().unwrap();

    transport.close().await.unwrap();

    let listener = TcpListener::bind(local(DEFAULT_PORT)).await.unwrap();
    drop(listener);

    let again = tcp_transport().await;
    again.close().await.unwrap();
}
