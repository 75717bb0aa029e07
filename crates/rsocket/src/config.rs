//! Transport configuration.

use crate::protocol::codec::MAX_FRAME_SIZE;
use crate::retry::Backoff;

use std::net::SocketAddr;
use std::time::Duration;

/// Port the server binding listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 8787;

/// Bearer token shared by transports that were not given one.
pub const DEFAULT_AUTH_TOKEN: &str = concat!(env!("CARGO_PKG_NAME"), "::RSocketTransport");

/// Configuration for [`RSocketTransport`](crate::RSocketTransport).
#[derive(Debug, Clone)]
pub struct RSocketConfig {
    /// Address the default TCP server binding listens on.
    pub bind_addr: SocketAddr,

    /// Bearer token sent in SETUP and required from connecting clients.
    pub auth_token: String,

    /// Frames buffered per inbound subscriber.
    pub broadcast_capacity: usize,

    /// How long a full subscriber may hold up the server before a frame is dropped for it.
    pub slow_subscriber_timeout: Duration,

    /// How long a new connection may take to send its SETUP frame.
    pub setup_timeout: Duration,

    /// Interval at which channel clients re-resolve their destinations.
    pub client_refresh_interval: Duration,

    /// Backoff for outbound messages.
    pub send_retry: Backoff,

    /// Timeout for establishing outbound connections.
    pub connect_timeout: Duration,

    /// Largest frame accepted or produced by the default TCP bindings.
    pub max_frame_size: usize,

    /// Keepalive interval advertised in SETUP.
    pub keepalive_interval: Duration,

    /// Max lifetime advertised in SETUP.
    pub max_lifetime: Duration,
}

impl Default for RSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            auth_token: DEFAULT_AUTH_TOKEN.to_string(),
            broadcast_capacity: 64,
            slow_subscriber_timeout: Duration::from_secs(5),
            setup_timeout: Duration::from_secs(5),
            client_refresh_interval: Duration::from_secs(60),
            send_retry: Backoff::default(),
            connect_timeout: Duration::from_secs(5),
            max_frame_size: MAX_FRAME_SIZE,
            keepalive_interval: Duration::from_secs(20),
            max_lifetime: Duration::from_secs(90),
        }
    }
}
