//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use courier_rsocket::{
    Backoff, DestinationResolver, FnResolver, MemoryClientTransport, MemoryServerTransport,
    Metrics, RSocketTransport, StaticResolver, Transport,
};
use parking_lot::Mutex;
use tokio::time::timeout;

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A transport on an in-memory binding at `port`, sending wherever `resolver` says.
pub async fn memory_transport(
    port: u16,
    resolver: impl DestinationResolver,
) -> RSocketTransport {
    RSocketTransport::builder()
        .resolver(resolver)
        .server_transport(MemoryServerTransport::new(addr(port)))
        .client_transport(MemoryClientTransport::new())
        .send_retry(Backoff::new(3, Duration::from_millis(10), Duration::from_millis(40)))
        .build()
        .await
        .unwrap()
}

/// A transport that sends to itself.
pub async fn loopback_transport(port: u16) -> RSocketTransport {
    memory_transport(port, StaticResolver::new([addr(port)])).await
}

/// Resolver whose answer can be swapped while the test runs.
pub fn switchable_resolver(initial: SocketAddr) -> (impl DestinationResolver, Arc<Mutex<SocketAddr>>) {
    let current = Arc::new(Mutex::new(initial));
    let handle = current.clone();

    let resolver = FnResolver::new(move |_channel: String| {
        let destination = *current.lock();
        async move { Ok::<_, courier_rsocket::Error>(HashSet::from([destination])) }
    });

    (resolver, handle)
}

/// Wait until `condition` holds for the transport's metrics.
pub async fn wait_for_metrics(
    transport: &RSocketTransport,
    within: Duration,
    condition: impl Fn(&Metrics) -> bool,
) -> Metrics {
    timeout(within, async {
        loop {
            let metrics = transport.metrics();
            if condition(&metrics) {
                return metrics;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("metrics never matched: {:?}", transport.metrics()))
}
