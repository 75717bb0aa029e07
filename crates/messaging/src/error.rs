use thiserror::Error;

/// Errors raised by the channel bookkeeping shared by every transport.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The transport was closed and no longer hands out channels.
    #[error("transport is closed")]
    Closed,

    /// The channel was cancelled or its background adapter stopped.
    #[error("channel is closed")]
    ChannelClosed,
}
