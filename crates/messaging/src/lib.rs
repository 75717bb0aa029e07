//! Transport-agnostic messaging over named channels.
//!
//! A [`Transport`] hands out [`ReceiveChannel`]s and [`SendChannel`]s keyed by
//! channel name. Concrete transports only supply a [`ChannelDriver`]; the
//! per-name caching, background adapters, typed codecs and counters live in
//! [`TransportBase`].
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod channel;
mod codec;
mod error;
mod metrics;
mod transport;

pub use channel::{ReceiveChannel, SendChannel};
pub use codec::{
    Deserializer, Serializer, string_from_bytes, string_to_bytes, try_from_bytes, try_into_bytes,
};
pub use error::Error;
pub use metrics::Metrics;
pub use transport::{ChannelDriver, Transport, TransportBase};
