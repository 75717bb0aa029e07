use crate::client::ClientCache;
use crate::error::{Error, Result};
use crate::protocol::Payload;
use crate::protocol::metadata::{route_metadata, route_of};
use crate::retry::{Backoff, retry_with_backoff};
use crate::server::Demultiplexer;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use courier_messaging::ChannelDriver;
use futures::stream::BoxStream;
use futures::{StreamExt, future};
use tracing::warn;

/// Connects the channel bookkeeping to RSocket.
///
/// Inbound: every channel subscribes to the shared demultiplexer and keeps the
/// frames whose routing metadata names it. Outbound: each message becomes a
/// REQUEST_FNF routed to the channel and is sent through the channel's
/// load-balanced client, retrying with backoff.
#[derive(Debug)]
pub struct RSocketDriver {
    demux: Arc<Demultiplexer>,
    clients: Arc<ClientCache>,
    retry: Backoff,
}

impl RSocketDriver {
    /// Driver over `demux` and `clients`, retrying sends per `retry`.
    pub const fn new(demux: Arc<Demultiplexer>, clients: Arc<ClientCache>, retry: Backoff) -> Self {
        Self {
            demux,
            clients,
            retry,
        }
    }
}

#[async_trait]
impl ChannelDriver for RSocketDriver {
    type Error = Error;

    fn subscribe(&self, channel: &str) -> BoxStream<'static, Result<Bytes>> {
        let channel = channel.to_owned();

        self.demux
            .subscribe()
            .filter_map(move |item| {
                future::ready(match item {
                    Ok(payload) => is_routed_to(&payload, &channel).then_some(Ok(payload.data)),
                    Err(e) => Some(Err(e)),
                })
            })
            .boxed()
    }

    async fn send(&self, channel: &str, payload: Bytes) -> Result<()> {
        let payload = Payload::new(Some(route_metadata(channel)?), payload);

        retry_with_backoff(&self.retry, "fire-and-forget", || {
            let payload = payload.clone();
            async move {
                self.clients
                    .get(channel)
                    .await?
                    .fire_and_forget(payload)
                    .await
            }
        })
        .await
    }
}

/// Whether `payload` carries routing metadata naming `channel`.
///
/// Malformed metadata never matches.
fn is_routed_to(payload: &Payload, channel: &str) -> bool {
    let Some(metadata) = payload.metadata.as_ref() else {
        return false;
    };

    match route_of(metadata) {
        Ok(route) => route.as_deref() == Some(channel),
        Err(e) => {
            warn!(channel, error = %e, "ignoring frame with malformed routing metadata");
            false
        }
    }
}
