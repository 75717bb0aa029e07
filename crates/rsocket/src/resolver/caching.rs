use super::DestinationResolver;
use crate::error::Result;
use crate::retry::{Backoff, retry_with_backoff};

use std::collections::HashSet;
use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Settings for [`CachingResolver`].
#[derive(Debug, Clone)]
pub struct CachingResolverConfig {
    /// Channels kept in the cache.
    pub capacity: usize,

    /// Age after which a cached value is refreshed in the background.
    pub refresh_interval: Duration,

    /// Backoff applied to each delegate resolution.
    pub retry: Backoff,
}

impl Default for CachingResolverConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            refresh_interval: Duration::from_secs(60),
            retry: Backoff::new(5, Duration::from_millis(100), Duration::from_secs(10)),
        }
    }
}

/// Caches another resolver's answers per channel.
///
/// Concurrent first lookups of a channel share one delegate call. Values older
/// than the refresh interval are served immediately while a single background
/// refresh runs. A failed refresh keeps the previous value.
pub struct CachingResolver<R> {
    shared: Arc<Shared<R>>,
}

struct Shared<R> {
    delegate: R,
    config: CachingResolverConfig,
    entries: Mutex<LruCache<String, Arc<Entry>>>,
}

#[derive(Default)]
struct Entry {
    resolved: RwLock<Option<Resolved>>,
    first_resolution: tokio::sync::Mutex<()>,
    refreshing: AtomicBool,
}

#[derive(Clone)]
struct Resolved {
    destinations: HashSet<SocketAddr>,
    resolved_at: Instant,
}

impl Entry {
    fn current(&self) -> Option<Resolved> {
        self.resolved.read().clone()
    }
}

impl<R> CachingResolver<R>
where
    R: DestinationResolver,
{
    /// Cache `delegate` with default settings.
    pub fn new(delegate: R) -> Self {
        Self::with_config(delegate, CachingResolverConfig::default())
    }

    /// Cache `delegate` with `config`.
    pub fn with_config(delegate: R, config: CachingResolverConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            shared: Arc::new(Shared {
                delegate,
                config,
                entries: Mutex::new(LruCache::new(capacity)),
            }),
        }
    }

    /// Forget the cached value of `channel`.
    pub fn invalidate(&self, channel: &str) {
        self.shared.entries.lock().pop(channel);
    }

    fn entry(&self, channel: &str) -> Arc<Entry> {
        self.shared
            .entries
            .lock()
            .get_or_insert(channel.to_owned(), || Arc::new(Entry::default()))
            .clone()
    }

    fn refresh_in_background(&self, channel: &str, entry: &Arc<Entry>) {
        if entry.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }

        let shared = self.shared.clone();
        let entry = entry.clone();
        let channel = channel.to_owned();

        tokio::spawn(async move {
            let _ = shared.refresh(&channel, &entry).await;
            entry.refreshing.store(false, Ordering::Release);
        });
    }
}

impl<R> Shared<R>
where
    R: DestinationResolver,
{
    async fn refresh(&self, channel: &str, entry: &Entry) -> Result<HashSet<SocketAddr>> {
        let resolved = retry_with_backoff(&self.config.retry, "destination resolution", || {
            self.delegate.resolve(channel)
        })
        .await;

        match resolved {
            Ok(destinations) => {
                debug!(channel, count = destinations.len(), "destinations resolved");
                *entry.resolved.write() = Some(Resolved {
                    destinations: destinations.clone(),
                    resolved_at: Instant::now(),
                });
                Ok(destinations)
            }
            Err(e) => {
                warn!(channel, error = %e, "destination refresh failed, keeping previous value");
                Err(e)
            }
        }
    }
}

impl<R> Debug for CachingResolver<R>
where
    R: Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingResolver")
            .field("delegate", &self.shared.delegate)
            .field("config", &self.shared.config)
            .field("cached", &self.shared.entries.lock().len())
            .finish()
    }
}

#[async_trait]
impl<R> DestinationResolver for CachingResolver<R>
where
    R: DestinationResolver,
{
    async fn resolve(&self, channel: &str) -> Result<HashSet<SocketAddr>> {
        let entry = self.entry(channel);

        if let Some(resolved) = entry.current() {
            if resolved.resolved_at.elapsed() >= self.shared.config.refresh_interval {
                self.refresh_in_background(channel, &entry);
            }
            return Ok(resolved.destinations);
        }

        let _first = entry.first_resolution.lock().await;
        if let Some(resolved) = entry.current() {
            return Ok(resolved.destinations);
        }

        self.shared.refresh(channel, &entry).await
    }
}
