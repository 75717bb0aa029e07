use super::connection::Connector;
use super::load_balancer::LoadBalancedClient;
use crate::error::{Error, Result};
use crate::resolver::DestinationResolver;

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::debug;

type ClientSlot = Arc<OnceCell<Arc<LoadBalancedClient>>>;

/// One [`LoadBalancedClient`] per channel, built on first use.
pub struct ClientCache {
    clients: DashMap<String, ClientSlot>,
    resolver: Arc<dyn DestinationResolver>,
    connector: Connector,
    refresh_interval: Duration,
    closed: AtomicBool,
}

impl Debug for ClientCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCache")
            .field("channels", &self.clients.len())
            .field("refresh_interval", &self.refresh_interval)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl ClientCache {
    /// Empty cache building clients with `resolver` and `connector`.
    pub fn new(
        resolver: Arc<dyn DestinationResolver>,
        connector: Connector,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            clients: DashMap::new(),
            resolver,
            connector,
            refresh_interval,
            closed: AtomicBool::new(false),
        }
    }

    /// The client for `channel`. Concurrent first calls share one build.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] once the cache has been invalidated.
    pub async fn get(&self, channel: &str) -> Result<Arc<LoadBalancedClient>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let slot = self.clients.entry(channel.to_owned()).or_default().clone();
        let client = slot
            .get_or_init(|| {
                debug!(channel, "building client");
                LoadBalancedClient::connect(
                    channel,
                    self.resolver.clone(),
                    self.connector.clone(),
                    self.refresh_interval,
                )
            })
            .await
            .clone();

        // Lost a race with `invalidate_all`.
        if self.closed.load(Ordering::Acquire) {
            client.close().await;
            return Err(Error::Closed);
        }

        Ok(client)
    }

    /// Number of channels with a client.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no client has been built.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Close every client and refuse further lookups. Idempotent.
    pub async fn invalidate_all(&self) {
        self.closed.store(true, Ordering::Release);

        let slots: Vec<ClientSlot> = self.clients.iter().map(|e| e.value().clone()).collect();
        self.clients.clear();

        for slot in slots {
            if let Some(client) = slot.get() {
                client.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::SetupOptions;
    use crate::net::MemoryClientTransport;
    use crate::resolver::FnResolver;

    use std::collections::HashSet;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    fn cache(resolutions: Arc<AtomicUsize>) -> Arc<ClientCache> {
        let resolver = FnResolver::new(move |_channel: String| {
            resolutions.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, Error>(HashSet::from([SocketAddr::from(([127, 0, 0, 1], 45001))]))
            }
        });

        Arc::new(ClientCache::new(
            Arc::new(resolver),
            Connector::new(
                Arc::new(MemoryClientTransport::new()),
                SetupOptions {
                    auth_token: "secret".to_string(),
                    keepalive_interval: Duration::from_secs(20),
                    max_lifetime: Duration::from_secs(90),
                },
            ),
            Duration::from_secs(60),
        ))
    }

    #[tokio::test]
    async fn test_one_client_per_channel() {
        let resolutions = Arc::new(AtomicUsize::new(0));
        let cache = cache(resolutions.clone());

        let lookups: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get("orders").await.unwrap() })
            })
            .collect();

        let mut clients = Vec::new();
        for lookup in lookups {
            clients.push(lookup.await.unwrap());
        }

        assert!(clients.iter().all(|c| Arc::ptr_eq(c, &clients[0])));
        assert_eq!(resolutions.load(Ordering::SeqCst), 1);

        let other = cache.get("invoices").await.unwrap();
        assert_eq!(other.channel(), "invoices");
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_all_closes_clients() {
        let cache = cache(Arc::new(AtomicUsize::new(0)));
        let client = cache.get("orders").await.unwrap();
        assert_eq!(client.destinations().len(), 1);

        cache.invalidate_all().await;
        cache.invalidate_all().await;

        assert!(cache.is_empty());
        assert!(client.destinations().is_empty());
        assert!(matches!(cache.get("orders").await, Err(Error::Closed)));
    }
}
