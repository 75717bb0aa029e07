//! Channel name to destination address resolution.

mod caching;

pub use caching::{CachingResolver, CachingResolverConfig};

use crate::error::Result;

use std::collections::HashSet;
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

/// Maps a channel name to the servers that should receive its messages.
#[async_trait]
pub trait DestinationResolver: Debug + Send + Sync + 'static {
    /// Resolve the destinations of `channel`.
    async fn resolve(&self, channel: &str) -> Result<HashSet<SocketAddr>>;
}

#[async_trait]
impl<R> DestinationResolver for Arc<R>
where
    R: DestinationResolver + ?Sized,
{
    async fn resolve(&self, channel: &str) -> Result<HashSet<SocketAddr>> {
        (**self).resolve(channel).await
    }
}

/// Resolve, treating failure as "no destinations".
pub async fn resolve_or_empty(
    resolver: &dyn DestinationResolver,
    channel: &str,
) -> HashSet<SocketAddr> {
    match resolver.resolve(channel).await {
        Ok(destinations) => destinations,
        Err(e) => {
            warn!(channel, error = %e, "destination resolution failed");
            HashSet::new()
        }
    }
}

/// Resolves every channel to the same fixed set.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    destinations: HashSet<SocketAddr>,
}

impl StaticResolver {
    /// Resolve every channel to `destinations`.
    pub fn new(destinations: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self {
            destinations: destinations.into_iter().collect(),
        }
    }
}

#[async_trait]
impl DestinationResolver for StaticResolver {
    async fn resolve(&self, _channel: &str) -> Result<HashSet<SocketAddr>> {
        Ok(self.destinations.clone())
    }
}

/// Resolver backed by an async function of the channel name.
pub struct FnResolver<F> {
    resolve: F,
}

impl<F> FnResolver<F> {
    /// Wrap `resolve`.
    pub const fn new(resolve: F) -> Self {
        Self { resolve }
    }
}

impl<F> Debug for FnResolver<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnResolver").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> DestinationResolver for FnResolver<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HashSet<SocketAddr>>> + Send + 'static,
{
    async fn resolve(&self, channel: &str) -> Result<HashSet<SocketAddr>> {
        (self.resolve)(channel.to_owned()).await
    }
}
