//! Server side: accepts RSocket connections and fans their payloads out.

mod broadcast;

pub use broadcast::Subscription;

use crate::config::RSocketConfig;
use crate::error::{ProtocolError, Result};
use crate::net::{Connection, Listener, ServerTransport};
use crate::protocol::metadata::COMPOSITE_METADATA_MIME;
use crate::protocol::{Authentication, CompositeMetadata, ErrorCode, Frame, Setup};
use broadcast::Broadcaster;

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

/// Settings for the server side.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Bearer token clients must present in SETUP.
    pub auth_token: String,
    /// Frames buffered per subscriber.
    pub broadcast_capacity: usize,
    /// How long a full subscriber may delay delivery.
    pub slow_subscriber_timeout: Duration,
    /// How long a connection may take to send SETUP.
    pub setup_timeout: Duration,
}

impl From<&RSocketConfig> for ServerOptions {
    fn from(config: &RSocketConfig) -> Self {
        Self {
            auth_token: config.auth_token.clone(),
            broadcast_capacity: config.broadcast_capacity,
            slow_subscriber_timeout: config.slow_subscriber_timeout,
            setup_timeout: config.setup_timeout,
        }
    }
}

struct ServerContext {
    options: ServerOptions,
    broadcaster: Broadcaster,
}

/// Accepts authenticated connections and publishes every fire-and-forget
/// payload they carry to all subscribers.
///
/// Channel filtering happens on the subscriber side, so one server binding
/// serves every channel of a transport.
pub struct Demultiplexer {
    local_addr: SocketAddr,
    context: Arc<ServerContext>,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for Demultiplexer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Demultiplexer")
            .field("local_addr", &self.local_addr)
            .field("subscribers", &self.context.broadcaster.subscriber_count())
            .field("closed", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl Demultiplexer {
    /// Bind `server` and start accepting connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the binding cannot be established.
    pub async fn bind(server: &dyn ServerTransport, options: ServerOptions) -> Result<Self> {
        let listener = server.listen().await?;
        let local_addr = listener.local_addr();

        let context = Arc::new(ServerContext {
            broadcaster: Broadcaster::new(
                options.broadcast_capacity,
                options.slow_subscriber_timeout,
            ),
            options,
        });
        let shutdown = CancellationToken::new();

        let accept_task = tokio::spawn(accept_loop(listener, context.clone(), shutdown.clone()));

        info!("RSocket server listening on {}", local_addr);

        Ok(Self {
            local_addr,
            context,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    /// Address the server binding is listening on.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Subscribe to every payload received from now on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.context.broadcaster.subscribe()
    }

    /// Stop accepting, drop every connection and end all subscriptions.
    ///
    /// Returns once the binding has been released. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.context.broadcaster.close();

        let task = self.accept_task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("RSocket server task failed: {}", e);
            }
            info!("RSocket server on {} closed", self.local_addr);
        }
    }
}

impl Drop for Demultiplexer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.context.broadcaster.close();
    }
}

async fn accept_loop(
    listener: Box<dyn Listener>,
    context: Arc<ServerContext>,
    shutdown: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        while connections.try_join_next().is_some() {}

        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    let conn: Arc<dyn Connection> = Arc::from(conn);
                    let id = Uuid::new_v4();
                    let span = info_span!("rsocket_connection", %id, peer = %conn.peer_addr());

                    connections.spawn(
                        serve_connection(conn, context.clone(), shutdown.child_token())
                            .instrument(span),
                    );
                }
                Err(crate::Error::ConnectionClosed) => break,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }

    if let Err(e) = listener.close().await {
        warn!("Error closing listener: {}", e);
    }
    drop(listener);

    connections.shutdown().await;
    debug!("accept loop stopped");
}

async fn serve_connection(
    conn: Arc<dyn Connection>,
    context: Arc<ServerContext>,
    cancel: CancellationToken,
) {
    let first = tokio::select! {
        () = cancel.cancelled() => {
            let _ = conn.close().await;
            return;
        }
        first = timeout(context.options.setup_timeout, conn.recv()) => first,
    };

    let frame = match first {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => {
            debug!("connection ended before SETUP: {}", e);
            let _ = conn.close().await;
            return;
        }
        Err(_) => {
            debug!("no SETUP within {:?}", context.options.setup_timeout);
            let _ = conn.close().await;
            return;
        }
    };

    let setup = match Frame::decode(frame) {
        Ok(Frame::Setup(setup)) => setup,
        Ok(_) => {
            reject(&*conn, ErrorCode::INVALID_SETUP, "first frame must be SETUP").await;
            return;
        }
        Err(e @ ProtocolError::UnsupportedVersion { .. }) => {
            reject(&*conn, ErrorCode::UNSUPPORTED_SETUP, &e.to_string()).await;
            return;
        }
        Err(e) => {
            reject(&*conn, ErrorCode::INVALID_SETUP, &e.to_string()).await;
            return;
        }
    };

    if let Err((code, reason)) = validate_setup(&setup, &context.options.auth_token) {
        warn!("rejecting SETUP: {}", reason);
        reject(&*conn, code, reason).await;
        return;
    }

    debug!("connection established");

    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = conn.recv() => match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("connection ended: {}", e);
                    break;
                }
            },
        };

        match Frame::decode(frame) {
            Ok(Frame::RequestFnf { payload, .. }) => {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = context.broadcaster.publish(&payload) => {}
                }
            }
            Ok(Frame::KeepAlive {
                respond: true,
                data,
                ..
            }) => {
                let answer = Frame::KeepAlive {
                    respond: false,
                    last_received_position: 0,
                    data,
                };
                if send_frame(&*conn, &answer).await.is_err() {
                    break;
                }
            }
            Ok(Frame::KeepAlive { .. }) => {}
            Ok(Frame::Error { code, message, .. }) if code.is_connection_error() => {
                debug!("peer closed connection with {:#x}: {}", code.0, message);
                break;
            }
            Ok(Frame::Error { stream_id, message, .. }) => {
                debug!("stream {} error from peer: {}", stream_id, message);
            }
            Ok(Frame::Setup(_)) => {
                reject(&*conn, ErrorCode::CONNECTION_ERROR, "duplicate SETUP").await;
                return;
            }
            Ok(Frame::Unsupported {
                stream_id,
                frame_type,
            }) => {
                debug!("ignoring frame type {:#04x} on stream {}", frame_type, stream_id);
            }
            Err(e) => {
                warn!("protocol error: {}", e);
                reject(&*conn, ErrorCode::CONNECTION_ERROR, &e.to_string()).await;
                return;
            }
        }
    }

    let _ = conn.close().await;
}

fn validate_setup(setup: &Setup, auth_token: &str) -> std::result::Result<(), (ErrorCode, &'static str)> {
    if setup.resume_token.is_some() {
        return Err((ErrorCode::UNSUPPORTED_SETUP, "resumption is not supported"));
    }
    if setup.lease {
        return Err((ErrorCode::UNSUPPORTED_SETUP, "leasing is not supported"));
    }
    if setup.metadata_mime != COMPOSITE_METADATA_MIME {
        return Err((
            ErrorCode::UNSUPPORTED_SETUP,
            "metadata must be composite metadata",
        ));
    }

    let Some(metadata) = setup.payload.metadata.clone() else {
        return Err((ErrorCode::REJECTED_SETUP, "missing authentication"));
    };

    let authentication = CompositeMetadata::decode(metadata)
        .and_then(|metadata| metadata.authentication())
        .map_err(|_| (ErrorCode::INVALID_SETUP, "malformed setup metadata"))?;

    match authentication {
        Some(Authentication::Bearer(token)) if tokens_match(&token, auth_token) => Ok(()),
        Some(_) => Err((ErrorCode::REJECTED_SETUP, "authentication failed")),
        None => Err((ErrorCode::REJECTED_SETUP, "missing authentication")),
    }
}

fn tokens_match(presented: &str, expected: &str) -> bool {
    let (presented, expected) = (presented.as_bytes(), expected.as_bytes());

    presented.len() == expected.len()
        && presented
            .iter()
            .zip(expected)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

async fn send_frame(conn: &dyn Connection, frame: &Frame) -> Result<()> {
    conn.send(frame.encode()?).await
}

async fn reject(conn: &dyn Connection, code: ErrorCode, reason: &str) {
    if let Err(e) = send_frame(conn, &Frame::connection_error(code, reason)).await {
        debug!("failed to send ERROR frame: {}", e);
    }
    let _ = conn.close().await;
}
