use super::ticker;
use crate::error::{Error, Result};
use crate::net::{ClientTransport, Connection};
use crate::protocol::metadata::{COMPOSITE_METADATA_MIME, OCTET_STREAM_MIME, bearer_metadata};
use crate::protocol::{ErrorCode, Frame, Payload, Setup};

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Stream ids are 31 bits wide.
const STREAM_ID_MASK: u32 = 0x7FFF_FFFF;

/// What a client presents in SETUP.
#[derive(Debug, Clone)]
pub struct SetupOptions {
    /// Bearer token.
    pub auth_token: String,
    /// Interval between client keepalives.
    pub keepalive_interval: Duration,
    /// Advertised maximum lifetime without a keepalive. Also bounds how long
    /// a new connection waits for the server to accept SETUP.
    pub max_lifetime: Duration,
}

/// Opens authenticated connections on a client binding.
#[derive(Debug, Clone)]
pub struct Connector {
    transport: Arc<dyn ClientTransport>,
    setup: SetupOptions,
}

impl Connector {
    /// Connect over `transport`, presenting `setup`.
    pub fn new(transport: Arc<dyn ClientTransport>, setup: SetupOptions) -> Self {
        Self { transport, setup }
    }

    /// Open a connection to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or its SETUP cannot be sent.
    pub async fn connect(&self, addr: SocketAddr) -> Result<PeerConnection> {
        PeerConnection::connect(&*self.transport, addr, &self.setup).await
    }
}

struct Shared {
    addr: SocketAddr,
    connection: Arc<dyn Connection>,
    closed: CancellationToken,
    accepted: CancellationToken,
    rejection: Mutex<Option<String>>,
}

/// One outbound RSocket connection.
///
/// RSocket does not acknowledge SETUP. A KEEPALIVE asking for a response
/// follows it, and the connection counts as open once the answer arrives.
/// A server that refuses the SETUP answers with an ERROR frame instead.
pub struct PeerConnection {
    shared: Arc<Shared>,
    next_stream_id: AtomicU32,
}

impl Debug for PeerConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("addr", &self.shared.addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl PeerConnection {
    /// Connect to `addr`, send SETUP and wait until the server accepts it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SetupRejected`] if the server refuses the SETUP,
    /// [`Error::Timeout`] if it neither accepts nor refuses it within the
    /// max lifetime, or the error of opening the connection.
    pub async fn connect(
        transport: &dyn ClientTransport,
        addr: SocketAddr,
        options: &SetupOptions,
    ) -> Result<Self> {
        let connection: Arc<dyn Connection> = Arc::from(transport.connect(addr).await?);

        let setup = Setup::new(
            COMPOSITE_METADATA_MIME,
            OCTET_STREAM_MIME,
            Payload::new(Some(bearer_metadata(&options.auth_token)?), Bytes::new()),
        )
        .with_keepalive(options.keepalive_interval, options.max_lifetime);

        let acceptance = Frame::KeepAlive {
            respond: true,
            last_received_position: 0,
            data: Bytes::new(),
        };

        for frame in [Frame::Setup(setup), acceptance] {
            if let Err(e) = connection.send(frame.encode()?).await {
                let _ = connection.close().await;
                return Err(e);
            }
        }

        let shared = Arc::new(Shared {
            addr,
            connection,
            closed: CancellationToken::new(),
            accepted: CancellationToken::new(),
            rejection: Mutex::new(None),
        });

        tokio::spawn(drive(shared.clone(), options.keepalive_interval));

        let peer = Self {
            shared,
            next_stream_id: AtomicU32::new(1),
        };
        peer.await_acceptance(options.max_lifetime).await?;

        debug!("connected to {}", addr);
        Ok(peer)
    }

    async fn await_acceptance(&self, within: Duration) -> Result<()> {
        tokio::select! {
            biased;
            () = self.shared.accepted.cancelled() => Ok(()),
            () = self.shared.closed.cancelled() => Err(self.closed_error()),
            () = sleep(within) => {
                warn!("{} did not answer SETUP within {:?}", self.shared.addr, within);
                Err(Error::Timeout(within))
            }
        }
    }

    /// Remote address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    /// Whether the connection has ended, either side having closed it.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Send `payload` as a REQUEST_FNF frame.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closed, the server rejected SETUP, or the
    /// frame cannot be written.
    pub async fn fire_and_forget(&self, payload: Payload) -> Result<()> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let stream_id = self.next_stream_id.fetch_add(2, Ordering::Relaxed) & STREAM_ID_MASK;
        let frame = Frame::RequestFnf { stream_id, payload }.encode()?;

        if let Err(e) = self.shared.connection.send(frame).await {
            self.shared.closed.cancel();
            return Err(match e {
                Error::ConnectionClosed => self.closed_error(),
                other => other,
            });
        }
        Ok(())
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) {
        self.shared.closed.cancel();
        if let Err(e) = self.shared.connection.close().await {
            debug!("error closing connection to {}: {}", self.shared.addr, e);
        }
    }

    fn closed_error(&self) -> Error {
        self.shared.rejection.lock().clone().map_or(Error::ConnectionClosed, |reason| {
            Error::SetupRejected {
                addr: self.shared.addr,
                reason,
            }
        })
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

/// Reads server frames and sends keepalives until the connection ends.
async fn drive(shared: Arc<Shared>, keepalive_interval: Duration) {
    let mut keepalive = ticker(keepalive_interval);

    loop {
        tokio::select! {
            () = shared.closed.cancelled() => break,
            _ = keepalive.tick() => {
                let frame = Frame::KeepAlive {
                    respond: true,
                    last_received_position: 0,
                    data: Bytes::new(),
                };
                if send(&shared, &frame).await.is_err() {
                    break;
                }
            }
            frame = shared.connection.recv() => {
                let Ok(frame) = frame else { break };

                match Frame::decode(frame) {
                    Ok(Frame::Error { stream_id: 0, code, message }) => {
                        warn!(
                            "{} closed the connection ({:#x}): {}",
                            shared.addr, code.0, message
                        );
                        if code == ErrorCode::REJECTED_SETUP
                            || code == ErrorCode::INVALID_SETUP
                            || code == ErrorCode::UNSUPPORTED_SETUP
                        {
                            *shared.rejection.lock() = Some(message);
                        }
                        break;
                    }
                    Ok(Frame::KeepAlive { respond: false, .. }) => shared.accepted.cancel(),
                    Ok(Frame::KeepAlive { respond: true, data, .. }) => {
                        let answer = Frame::KeepAlive {
                            respond: false,
                            last_received_position: 0,
                            data,
                        };
                        if send(&shared, &answer).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("protocol error from {}: {}", shared.addr, e);
                        break;
                    }
                }
            }
        }
    }

    shared.closed.cancel();
    let _ = shared.connection.close().await;
    debug!("connection to {} ended", shared.addr);
}

async fn send(shared: &Shared, frame: &Frame) -> Result<()> {
    shared.connection.send(frame.encode()?).await
}
