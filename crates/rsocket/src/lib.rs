//! Named-channel messaging over RSocket.
//!
//! [`RSocketTransport`] implements [`Transport`]: one authenticated server
//! binding receives the fire-and-forget traffic of every channel and fans it
//! out to per-channel receive adapters by routing metadata, while each
//! channel's send adapter delivers through a load-balanced client whose
//! destinations come from a [`DestinationResolver`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod client;
pub mod config;
mod driver;
pub mod error;
pub mod net;
pub mod protocol;
pub mod resolver;
pub mod retry;
pub mod server;
mod transport;

pub use config::{DEFAULT_AUTH_TOKEN, DEFAULT_PORT, RSocketConfig};
pub use driver::RSocketDriver;
pub use error::{Error, ProtocolError, Result};
pub use net::{
    ClientTransport, Connection, Listener, MemoryClientTransport, MemoryServerTransport,
    ServerTransport, TcpClientTransport, TcpServerTransport,
};
pub use resolver::{
    CachingResolver, CachingResolverConfig, DestinationResolver, FnResolver, StaticResolver,
};
pub use retry::Backoff;
pub use transport::{RSocketTransport, RSocketTransportBuilder};

pub use courier_messaging::{
    Deserializer, Metrics, ReceiveChannel, SendChannel, Serializer, Transport, string_from_bytes,
    string_to_bytes, try_from_bytes, try_into_bytes,
};
