use super::connection::{Connector, PeerConnection};
use super::ticker;
use crate::error::{Error, Result};
use crate::protocol::Payload;
use crate::resolver::{DestinationResolver, resolve_or_empty};

use std::collections::HashSet;
use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum Slot {
    Idle,
    Connected(Arc<PeerConnection>),
    /// The server refused our SETUP. Redialing with the same token cannot succeed.
    Rejected(String),
}

struct Target {
    addr: SocketAddr,
    slot: Mutex<Slot>,
}

impl Target {
    fn new(addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            addr,
            slot: Mutex::new(Slot::Idle),
        })
    }

    /// The live connection, opening one if there is none.
    async fn connection(&self, connector: &Connector) -> Result<Arc<PeerConnection>> {
        let mut slot = self.slot.lock().await;

        match &*slot {
            Slot::Connected(connection) if !connection.is_closed() => {
                return Ok(connection.clone());
            }
            Slot::Rejected(reason) => {
                return Err(Error::SetupRejected {
                    addr: self.addr,
                    reason: reason.clone(),
                });
            }
            _ => {}
        }

        match connector.connect(self.addr).await {
            Ok(connection) => {
                let connection = Arc::new(connection);
                *slot = Slot::Connected(connection.clone());
                Ok(connection)
            }
            Err(e) => {
                *slot = Self::after_failure(&e);
                Err(e)
            }
        }
    }

    /// Drop `failed` so the next send reconnects, unless `error` says it never will.
    async fn reset(&self, failed: &Arc<PeerConnection>, error: &Error) {
        let mut slot = self.slot.lock().await;
        if matches!(&*slot, Slot::Connected(c) if Arc::ptr_eq(c, failed)) {
            *slot = Self::after_failure(error);
        }
        drop(slot);
        failed.close().await;
    }

    fn after_failure(error: &Error) -> Slot {
        match error {
            Error::SetupRejected { addr, reason } => {
                warn!("{} rejected our SETUP, not reconnecting: {}", addr, reason);
                Slot::Rejected(reason.clone())
            }
            _ => Slot::Idle,
        }
    }

    async fn close(&self) {
        let previous = std::mem::replace(&mut *self.slot.lock().await, Slot::Idle);
        if let Slot::Connected(connection) = previous {
            connection.close().await;
        }
    }
}

/// Round-robin client over the current destinations of one channel.
///
/// Destinations are resolved once when the client is built and then again
/// every refresh interval. Connections open lazily on first use of a target
/// and close when the target disappears from the resolved set.
pub struct LoadBalancedClient {
    channel: String,
    targets: RwLock<Vec<Arc<Target>>>,
    cursor: AtomicUsize,
    connector: Connector,
    shutdown: CancellationToken,
}

impl Debug for LoadBalancedClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancedClient")
            .field("channel", &self.channel)
            .field("targets", &self.destinations())
            .finish_non_exhaustive()
    }
}

impl LoadBalancedClient {
    /// Resolve `channel` and start refreshing it every `refresh_interval`.
    ///
    /// An empty or failed resolution yields a client without targets, not an error.
    pub async fn connect(
        channel: &str,
        resolver: Arc<dyn DestinationResolver>,
        connector: Connector,
        refresh_interval: Duration,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            channel: channel.to_owned(),
            targets: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            connector,
            shutdown: CancellationToken::new(),
        });

        let destinations = resolve_or_empty(&*resolver, channel).await;
        client.update_targets(destinations).await;

        tokio::spawn(refresh_loop(
            Arc::downgrade(&client),
            resolver,
            client.shutdown.clone(),
            refresh_interval,
        ));

        client
    }

    /// Channel this client sends to.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Currently known destinations, in selection order.
    #[must_use]
    pub fn destinations(&self) -> Vec<SocketAddr> {
        self.targets.read().iter().map(|t| t.addr).collect()
    }

    /// Send `payload` to the next destination.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoDestination`] when no destination is known, or the
    /// connection error of the selected destination.
    pub async fn fire_and_forget(&self, payload: Payload) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }

        let target = {
            let targets = self.targets.read();
            if targets.is_empty() {
                return Err(Error::NoDestination(self.channel.clone()));
            }
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % targets.len();
            targets[index].clone()
        };

        let connection = target.connection(&self.connector).await?;

        match connection.fire_and_forget(payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("send to {} failed: {}", target.addr, e);
                target.reset(&connection, &e).await;
                Err(e)
            }
        }
    }

    /// Replace the target set, closing connections to removed destinations.
    async fn update_targets(&self, destinations: HashSet<SocketAddr>) {
        let removed = {
            let mut targets = self.targets.write();

            let (kept, removed): (Vec<_>, Vec<_>) = targets
                .drain(..)
                .partition(|t| destinations.contains(&t.addr));

            let known: HashSet<_> = kept.iter().map(|t| t.addr).collect();
            let added: Vec<_> = destinations
                .iter()
                .filter(|addr| !known.contains(addr))
                .map(|addr| Target::new(*addr))
                .collect();

            if !added.is_empty() || !removed.is_empty() {
                info!(
                    channel = %self.channel,
                    added = added.len(),
                    removed = removed.len(),
                    "destinations changed"
                );
            }

            *targets = kept.into_iter().chain(added).collect();
            targets.sort_by_key(|t| t.addr);
            removed
        };

        for target in removed {
            target.close().await;
        }
    }

    /// Stop refreshing and close every connection. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let targets = std::mem::take(&mut *self.targets.write());
        for target in targets {
            target.close().await;
        }
    }
}

impl Drop for LoadBalancedClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn refresh_loop(
    client: Weak<LoadBalancedClient>,
    resolver: Arc<dyn DestinationResolver>,
    shutdown: CancellationToken,
    refresh_interval: Duration,
) {
    let mut refresh = ticker(refresh_interval);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = refresh.tick() => {}
        }

        let Some(channel) = client.upgrade().map(|c| c.channel.clone()) else {
            break;
        };

        // Keep the current targets when resolution fails.
        let destinations = match resolver.resolve(&channel).await {
            Ok(destinations) => destinations,
            Err(e) => {
                warn!(channel, error = %e, "destination refresh failed");
                continue;
            }
        };

        let Some(client) = client.upgrade() else { break };
        if shutdown.is_cancelled() {
            break;
        }
        client.update_targets(destinations).await;
    }
}
