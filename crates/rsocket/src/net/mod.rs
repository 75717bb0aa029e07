//! Byte-frame connections the RSocket layer runs over.
//!
//! Two bindings ship with the crate: [`tcp`] for real networks and [`memory`]
//! for wiring transports together inside one process.

pub mod memory;
pub mod tcp;

use crate::error::Result;

use std::fmt::Debug;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;

pub use memory::{MemoryClientTransport, MemoryServerTransport};
pub use tcp::{TcpClientTransport, TcpServerTransport};

/// A duplex connection carrying whole frames.
#[async_trait]
pub trait Connection: Debug + Send + Sync + 'static {
    /// Send one frame.
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Receive the next frame. Fails with [`ConnectionClosed`](crate::Error::ConnectionClosed)
    /// once the peer has gone away.
    async fn recv(&self) -> Result<Bytes>;

    /// Close the connection. Pending and future `recv` calls fail.
    async fn close(&self) -> Result<()>;

    /// Address of the remote end.
    fn peer_addr(&self) -> SocketAddr;
}

/// Source of inbound connections.
#[async_trait]
pub trait Listener: Debug + Send + Sync + 'static {
    /// Wait for the next inbound connection.
    async fn accept(&self) -> Result<Box<dyn Connection>>;

    /// Address the listener is bound to.
    fn local_addr(&self) -> SocketAddr;

    /// Stop accepting connections and release the address.
    async fn close(&self) -> Result<()>;
}

/// Factory for the server-side binding.
#[async_trait]
pub trait ServerTransport: Debug + Send + Sync + 'static {
    /// Bind and start listening.
    async fn listen(&self) -> Result<Box<dyn Listener>>;
}

/// Factory for outbound connections.
#[async_trait]
pub trait ClientTransport: Debug + Send + Sync + 'static {
    /// Open a connection to `addr`.
    async fn connect(&self, addr: SocketAddr) -> Result<Box<dyn Connection>>;
}
