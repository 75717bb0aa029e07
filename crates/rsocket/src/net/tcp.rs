//! TCP binding using a 24-bit length prefix per frame.

use super::{ClientTransport, Connection, Listener, ServerTransport};
use crate::error::{Error, Result};
use crate::protocol::FrameCodec;

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type FramedStream = Framed<TcpStream, FrameCodec>;

/// Server binding listening on a TCP address.
#[derive(Debug, Clone, Copy)]
pub struct TcpServerTransport {
    addr: SocketAddr,
    codec: FrameCodec,
}

impl TcpServerTransport {
    /// Listen on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            codec: FrameCodec::new(),
        }
    }

    /// Reject frames larger than `size` bytes.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.codec = self.codec.with_max_frame_size(size);
        self
    }
}

#[async_trait]
impl ServerTransport for TcpServerTransport {
    async fn listen(&self) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| Error::Bind {
                addr: self.addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!("TCP listener bound to {}", local_addr);

        Ok(Box::new(TcpFrameListener {
            listener: Mutex::new(Some(listener)),
            local_addr,
            codec: self.codec,
            closed: CancellationToken::new(),
        }))
    }
}

/// Client binding dialing TCP addresses.
#[derive(Debug, Clone, Copy)]
pub struct TcpClientTransport {
    connect_timeout: Duration,
    codec: FrameCodec,
}

impl TcpClientTransport {
    /// Give up on connection attempts after `connect_timeout`.
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            codec: FrameCodec::new(),
        }
    }

    /// Reject frames larger than `size` bytes.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.codec = self.codec.with_max_frame_size(size);
        self
    }
}

impl Default for TcpClientTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl ClientTransport for TcpClientTransport {
    async fn connect(&self, addr: SocketAddr) -> Result<Box<dyn Connection>> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(self.connect_timeout))?
            .map_err(|source| Error::Connect { addr, source })?;
        stream.set_nodelay(true)?;

        debug!("TCP connection established to {}", addr);

        Ok(Box::new(TcpConnection::new(stream, addr, self.codec)))
    }
}

struct TcpFrameListener {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    codec: FrameCodec,
    closed: CancellationToken,
}

impl Debug for TcpFrameListener {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpFrameListener")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Listener for TcpFrameListener {
    async fn accept(&self) -> Result<Box<dyn Connection>> {
        let guard = self.listener.lock().await;
        let listener = guard.as_ref().ok_or(Error::ConnectionClosed)?;

        tokio::select! {
            () = self.closed.cancelled() => Err(Error::ConnectionClosed),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                stream.set_nodelay(true)?;

                debug!("Accepted connection from {}", peer);

                Ok(Box::new(TcpConnection::new(stream, peer, self.codec)) as Box<dyn Connection>)
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();

        // Dropping the socket releases the port.
        if self.listener.lock().await.take().is_some() {
            info!("TCP listener on {} closed", self.local_addr);
        }

        Ok(())
    }
}

struct TcpConnection {
    peer: SocketAddr,
    sink: Mutex<SplitSink<FramedStream, Bytes>>,
    stream: Mutex<SplitStream<FramedStream>>,
    closed: CancellationToken,
}

impl TcpConnection {
    fn new(stream: TcpStream, peer: SocketAddr, codec: FrameCodec) -> Self {
        let (sink, stream) = Framed::new(stream, codec).split();

        Self {
            peer,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed: CancellationToken::new(),
        }
    }
}

impl Debug for TcpConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("peer", &self.peer)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn send(&self, frame: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        let mut sink = self.sink.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => Err(Error::ConnectionClosed),
            sent = sink.send(frame) => sent.map_err(Error::from),
        }
    }

    async fn recv(&self) -> Result<Bytes> {
        let mut stream = self.stream.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => Err(Error::ConnectionClosed),
            next = stream.next() => match next {
                Some(frame) => frame.map_err(Error::from),
                None => Err(Error::ConnectionClosed),
            },
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();

        debug!("Closing TCP connection to {}", self.peer);

        // Flushes queued frames and shuts down the write half.
        if let Err(e) = self.sink.lock().await.close().await {
            debug!("Error shutting down connection to {}: {}", self.peer, e);
        }

        Ok(())
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}
