//! In-process binding that routes connections through a global registry.

use super::{ClientTransport, Connection, Listener, ServerTransport};
use crate::error::{Error, Result};

use std::fmt::{self, Debug, Formatter};
use std::io;
use std::net::SocketAddr;
use std::sync::LazyLock;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Frames buffered per direction before `send` waits.
const CONNECTION_BUFFER: usize = 100;

/// Listeners by the address they claim.
static GLOBAL_REGISTRY: LazyLock<DashMap<SocketAddr, Registration>> = LazyLock::new(DashMap::new);

#[derive(Clone)]
struct Registration {
    listener_id: Uuid,
    incoming: flume::Sender<Box<dyn Connection>>,
}

/// Server binding that claims an address in the in-process registry.
#[derive(Debug, Clone, Copy)]
pub struct MemoryServerTransport {
    addr: SocketAddr,
}

impl MemoryServerTransport {
    /// Claim `addr` when listening.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl ServerTransport for MemoryServerTransport {
    async fn listen(&self) -> Result<Box<dyn Listener>> {
        let (incoming_tx, incoming_rx) = flume::unbounded();
        let listener_id = Uuid::new_v4();

        match GLOBAL_REGISTRY.entry(self.addr) {
            Entry::Occupied(_) => {
                return Err(Error::Bind {
                    addr: self.addr,
                    source: io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("{} already has a listener", self.addr),
                    ),
                });
            }
            Entry::Vacant(entry) => {
                entry.insert(Registration {
                    listener_id,
                    incoming: incoming_tx,
                });
            }
        }

        info!("Memory listener created for {}", self.addr);

        Ok(Box::new(MemoryListener {
            id: listener_id,
            addr: self.addr,
            incoming: incoming_rx,
            closed: CancellationToken::new(),
        }))
    }
}

/// Client binding that dials listeners in the in-process registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryClientTransport;

impl MemoryClientTransport {
    /// Create the client binding.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ClientTransport for MemoryClientTransport {
    async fn connect(&self, addr: SocketAddr) -> Result<Box<dyn Connection>> {
        let refused = || Error::Connect {
            addr,
            source: io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no memory listener at {addr}"),
            ),
        };

        let listener = GLOBAL_REGISTRY
            .get(&addr)
            .map(|entry| entry.value().incoming.clone())
            .ok_or_else(refused)?;

        let (client_to_server_tx, client_to_server_rx) = flume::bounded(CONNECTION_BUFFER);
        let (server_to_client_tx, server_to_client_rx) = flume::bounded(CONNECTION_BUFFER);
        let id = Uuid::new_v4();
        let closed = CancellationToken::new();

        // The dialing side has no address of its own; report the listener's.
        let client = MemoryConnection {
            id,
            peer: addr,
            sender: client_to_server_tx,
            receiver: server_to_client_rx,
            closed: closed.clone(),
        };
        let server = MemoryConnection {
            id,
            peer: addr,
            sender: server_to_client_tx,
            receiver: client_to_server_rx,
            closed,
        };

        listener
            .send_async(Box::new(server))
            .await
            .map_err(|_| refused())?;

        debug!("Memory connection {} established to {}", id, addr);

        Ok(Box::new(client))
    }
}

/// One end of an in-process connection. Closing either end closes both.
struct MemoryConnection {
    id: Uuid,
    peer: SocketAddr,
    sender: flume::Sender<Bytes>,
    receiver: flume::Receiver<Bytes>,
    closed: CancellationToken,
}

impl Debug for MemoryConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, frame: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        tokio::select! {
            () = self.closed.cancelled() => Err(Error::ConnectionClosed),
            sent = self.sender.send_async(frame) => sent.map_err(|_| Error::ConnectionClosed),
        }
    }

    async fn recv(&self) -> Result<Bytes> {
        // Frames already queued are still delivered after the peer closes.
        if let Ok(frame) = self.receiver.try_recv() {
            return Ok(frame);
        }

        // A peer that sends and then closes has queued its last frame before
        // cancelling, so check the queue once more when the close wins.
        tokio::select! {
            biased;
            frame = self.receiver.recv_async() => frame.map_err(|_| Error::ConnectionClosed),
            () = self.closed.cancelled() => self.receiver.try_recv().map_err(|_| Error::ConnectionClosed),
        }
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing memory connection {}", self.id);
        self.closed.cancel();
        Ok(())
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

struct MemoryListener {
    id: Uuid,
    addr: SocketAddr,
    incoming: flume::Receiver<Box<dyn Connection>>,
    closed: CancellationToken,
}

impl Debug for MemoryListener {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryListener")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl MemoryListener {
    fn deregister(&self) {
        if GLOBAL_REGISTRY
            .remove_if(&self.addr, |_, registration| registration.listener_id == self.id)
            .is_some()
        {
            debug!("Memory listener for {} deregistered", self.addr);
        }
    }
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<Box<dyn Connection>> {
        tokio::select! {
            () = self.closed.cancelled() => Err(Error::ConnectionClosed),
            conn = self.incoming.recv_async() => conn.map_err(|_| Error::ConnectionClosed),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing memory listener for {}", self.addr);
        self.closed.cancel();
        self.deregister();
        Ok(())
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.closed.cancel();
        self.deregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::time::timeout;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_listen_and_connect() {
        let _ = tracing_subscriber::fmt::try_init();

        let listener = MemoryServerTransport::new(addr(41001)).listen().await.unwrap();
        let client = MemoryClientTransport::new().connect(addr(41001)).await.unwrap();
        let server = listener.accept().await.unwrap();

        client.send(Bytes::from("Hello, Memory!")).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Bytes::from("Hello, Memory!"));

        server.send(Bytes::from("Hello back!")).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), Bytes::from("Hello back!"));
        assert_eq!(client.peer_addr(), addr(41001));

        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_address_already_listening() {
        let _ = tracing_subscriber::fmt::try_init();

        let _first = MemoryServerTransport::new(addr(41002)).listen().await.unwrap();
        let second = MemoryServerTransport::new(addr(41002)).listen().await;

        match second {
            Err(Error::Bind { source, .. }) => {
                assert_eq!(source.kind(), io::ErrorKind::AddrInUse);
            }
            other => panic!("expected bind failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_releases_address() {
        let _ = tracing_subscriber::fmt::try_init();

        let listener = MemoryServerTransport::new(addr(41003)).listen().await.unwrap();
        listener.close().await.unwrap();

        assert!(MemoryClientTransport::new().connect(addr(41003)).await.is_err());
        assert!(listener.accept().await.is_err());

        // A stale listener dropping later must not evict the new owner.
        let replacement = MemoryServerTransport::new(addr(41003)).listen().await.unwrap();
        drop(listener);
        assert!(MemoryClientTransport::new().connect(addr(41003)).await.is_ok());
        drop(replacement);

        assert!(MemoryClientTransport::new().connect(addr(41003)).await.is_err());
    }

    #[tokio::test]
    async fn test_closing_one_end_ends_the_other() {
        let _ = tracing_subscriber::fmt::try_init();

        let listener = MemoryServerTransport::new(addr(41004)).listen().await.unwrap();
        let client = MemoryClientTransport::new().connect(addr(41004)).await.unwrap();
        let server = listener.accept().await.unwrap();

        client.send(Bytes::from_static(b"last words")).await.unwrap();
        client.close().await.unwrap();

        assert_eq!(server.recv().await.unwrap(), Bytes::from_static(b"last words"));
        let ended = timeout(Duration::from_secs(1), server.recv()).await.unwrap();
        assert!(matches!(ended, Err(Error::ConnectionClosed)));
        assert!(server.send(Bytes::new()).await.is_err());
    }
}
