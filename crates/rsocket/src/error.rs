//! Error types for the RSocket transport.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the RSocket transport.
#[derive(Debug, Error)]
pub enum Error {
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Protocol-level errors.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server binding could not be established.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// The address we tried to bind.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// Failed to reach a destination.
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        /// The address we tried to connect to.
        addr: SocketAddr,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The remote server refused the connection setup.
    #[error("Setup rejected by {addr}: {reason}")]
    SetupRejected {
        /// The rejecting server.
        addr: SocketAddr,
        /// Reason given by the server.
        reason: String,
    },

    /// The resolver returned no destination for a channel.
    #[error("No destination known for channel '{0}'")]
    NoDestination(String),

    /// The connection was closed by either side.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Inbound frames were dropped because the subscriber fell behind.
    #[error("Dropped {0} frame(s) for a slow subscriber")]
    Lagged(u64),

    /// Destination resolution failed.
    #[error("Resolution failed: {0}")]
    Resolve(String),

    /// The transport was assembled with invalid settings.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The transport has been closed.
    #[error("Transport is closed")]
    Closed,

    /// Channel bookkeeping errors.
    #[error(transparent)]
    Messaging(courier_messaging::Error),
}

impl From<courier_messaging::Error> for Error {
    fn from(e: courier_messaging::Error) -> Self {
        match e {
            courier_messaging::Error::Closed => Self::Closed,
            other => Self::Messaging(other),
        }
    }
}

impl Error {
    /// Whether retrying the failed operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Closed
                | Self::Configuration(_)
                | Self::Messaging(_)
                | Self::SetupRejected { .. }
        )
    }
}

/// Wire protocol violations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed frame.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Frame exceeds the configured maximum size.
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Frame type not understood and not marked ignorable.
    #[error("Unknown frame type: {0:#04x}")]
    UnknownFrameType(u8),

    /// Malformed composite metadata.
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Peer speaks a protocol version we do not.
    #[error("Unsupported protocol version {major}.{minor}")]
    UnsupportedVersion {
        /// Major version.
        major: u16,
        /// Minor version.
        minor: u16,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_setup_is_final() {
        let rejected = Error::SetupRejected {
            addr: SocketAddr::from(([127, 0, 0, 1], 7000)),
            reason: "authentication failed".to_string(),
        };
        assert!(!rejected.is_retryable());
        assert!(Error::ConnectionClosed.is_retryable());
        assert!(Error::NoDestination("orders".to_string()).is_retryable());
    }
}
