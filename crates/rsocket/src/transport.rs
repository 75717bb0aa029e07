use crate::client::{ClientCache, Connector, SetupOptions};
use crate::config::RSocketConfig;
use crate::driver::RSocketDriver;
use crate::error::{Error, Result};
use crate::net::{ClientTransport, ServerTransport, TcpClientTransport, TcpServerTransport};
use crate::resolver::DestinationResolver;
use crate::retry::Backoff;
use crate::server::{Demultiplexer, ServerOptions};

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_messaging::{Transport, TransportBase};
use tokio::runtime::Handle;
use tracing::info;

/// Messaging transport over RSocket.
///
/// One server binding receives the traffic of every channel; outbound
/// messages go through one load-balanced client per channel. Build one with
/// [`RSocketTransport::builder`].
///
/// ```no_run
/// # async fn demo() -> courier_rsocket::Result<()> {
/// use courier_rsocket::{RSocketTransport, StaticResolver, Transport};
///
/// let transport = RSocketTransport::builder()
///     .resolver(StaticResolver::new(["10.0.0.7:8787".parse().unwrap()]))
///     .build()
///     .await?;
///
/// transport.send_to("orders")?.send("hello".into()).await?;
/// let next = transport.receive_from("orders")?.receive().await;
///
/// transport.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct RSocketTransport {
    base: TransportBase<RSocketDriver>,
    demux: Arc<Demultiplexer>,
    clients: Arc<ClientCache>,
}

impl Debug for RSocketTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RSocketTransport")
            .field("local_addr", &self.demux.local_addr())
            .field("base", &self.base)
            .field("clients", &self.clients)
            .finish()
    }
}

impl RSocketTransport {
    /// Start configuring a transport.
    #[must_use]
    pub fn builder() -> RSocketTransportBuilder {
        RSocketTransportBuilder::default()
    }

    /// Address the server binding listens on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.demux.local_addr()
    }

    /// Whether [`close`](Transport::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.base.is_closed()
    }
}

#[async_trait]
impl Transport for RSocketTransport {
    type Driver = RSocketDriver;
    type Error = Error;

    fn base(&self) -> &TransportBase<RSocketDriver> {
        &self.base
    }

    /// Stop every adapter, release the server binding and close all outbound
    /// connections. Later calls return immediately.
    async fn close(&self) -> Result<()> {
        if !self.base.close() {
            return Ok(());
        }

        self.demux.close().await;
        self.clients.invalidate_all().await;

        info!("RSocket transport on {} closed", self.demux.local_addr());
        Ok(())
    }
}

/// Builder for [`RSocketTransport`].
#[derive(Default)]
pub struct RSocketTransportBuilder {
    config: RSocketConfig,
    resolver: Option<Arc<dyn DestinationResolver>>,
    server_transport: Option<Arc<dyn ServerTransport>>,
    client_transport: Option<Arc<dyn ClientTransport>>,
}

impl Debug for RSocketTransportBuilder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RSocketTransportBuilder")
            .field("config", &self.config)
            .field("resolver", &self.resolver)
            .field("server_transport", &self.server_transport)
            .field("client_transport", &self.client_transport)
            .finish()
    }
}

impl RSocketTransportBuilder {
    /// Resolver mapping channels to destinations. Required.
    #[must_use]
    pub fn resolver(mut self, resolver: impl DestinationResolver) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Token presented by clients and required by the server.
    #[must_use]
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.config.auth_token = token.into();
        self
    }

    /// Server binding. Defaults to TCP on the configured bind address.
    #[must_use]
    pub fn server_transport(mut self, transport: impl ServerTransport) -> Self {
        self.server_transport = Some(Arc::new(transport));
        self
    }

    /// Client binding. Defaults to TCP.
    #[must_use]
    pub fn client_transport(mut self, transport: impl ClientTransport) -> Self {
        self.client_transport = Some(Arc::new(transport));
        self
    }

    /// Replace all settings at once.
    #[must_use]
    pub fn config(mut self, config: RSocketConfig) -> Self {
        self.config = config;
        self
    }

    /// Address of the default TCP server binding.
    #[must_use]
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Retry policy for outbound messages.
    #[must_use]
    pub fn send_retry(mut self, retry: Backoff) -> Self {
        self.config.send_retry = retry;
        self
    }

    /// How often each channel's destinations are re-resolved.
    #[must_use]
    pub fn client_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.client_refresh_interval = interval;
        self
    }

    /// Bind the server and assemble the transport.
    ///
    /// Must be awaited inside a Tokio runtime; background adapters run on it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for missing or invalid settings and
    /// the binding error if the server cannot listen.
    pub async fn build(self) -> Result<RSocketTransport> {
        let config = self.config;

        let resolver = self
            .resolver
            .ok_or_else(|| Error::Configuration("a destination resolver is required".to_string()))?;

        if config.auth_token.is_empty() {
            return Err(Error::Configuration("auth token must not be empty".to_string()));
        }
        if config.broadcast_capacity == 0 {
            return Err(Error::Configuration(
                "broadcast capacity must be at least 1".to_string(),
            ));
        }
        if !config.send_retry.multiplier.is_finite() || config.send_retry.multiplier < 1.0 {
            return Err(Error::Configuration(format!(
                "retry multiplier must be at least 1, got {}",
                config.send_retry.multiplier
            )));
        }

        let runtime = Handle::try_current().map_err(|e| Error::Configuration(e.to_string()))?;

        let server: Arc<dyn ServerTransport> = match self.server_transport {
            Some(server) => server,
            None => Arc::new(
                TcpServerTransport::new(config.bind_addr).with_max_frame_size(config.max_frame_size),
            ),
        };
        let client: Arc<dyn ClientTransport> = match self.client_transport {
            Some(client) => client,
            None => Arc::new(
                TcpClientTransport::new(config.connect_timeout)
                    .with_max_frame_size(config.max_frame_size),
            ),
        };

        let demux = Arc::new(Demultiplexer::bind(&*server, ServerOptions::from(&config)).await?);

        let connector = Connector::new(
            client,
            SetupOptions {
                auth_token: config.auth_token.clone(),
                keepalive_interval: config.keepalive_interval,
                max_lifetime: config.max_lifetime,
            },
        );
        let clients = Arc::new(ClientCache::new(
            resolver,
            connector,
            config.client_refresh_interval,
        ));

        let driver = RSocketDriver::new(demux.clone(), clients.clone(), config.send_retry);

        info!("RSocket transport ready on {}", demux.local_addr());

        Ok(RSocketTransport {
            base: TransportBase::new(driver, runtime),
            demux,
            clients,
        })
    }
}
