use crate::channel::{self, ReceiveChannel, SendChannel};
use crate::codec::{Deserializer, Serializer};
use crate::error::Error;
use crate::metrics::{Counters, Metrics, Recorder};

use std::error::Error as StdError;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Network-facing half of a transport.
///
/// A driver knows how to subscribe to the inbound messages of a channel and
/// how to push one outbound message. Queueing, caching, cancellation and
/// accounting are layered on top by [`TransportBase`].
#[async_trait]
pub trait ChannelDriver: Send + Sync + 'static {
    /// Error raised by the network layer.
    type Error: StdError + Send + Sync + 'static;

    /// Subscribes to messages addressed to `channel`.
    ///
    /// The subscription must be registered before this returns so that no
    /// message arriving afterwards is missed. Dropping the stream unsubscribes.
    fn subscribe(&self, channel: &str) -> BoxStream<'static, Result<Bytes, Self::Error>>;

    /// Delivers one message to the destinations of `channel`.
    async fn send(&self, channel: &str, payload: Bytes) -> Result<(), Self::Error>;
}

/// Channel bookkeeping shared by every transport.
///
/// Holds one receive channel and one send channel per name, each backed by a
/// background adapter running on the runtime captured at construction.
pub struct TransportBase<D> {
    driver: Arc<D>,
    runtime: Handle,
    counters: Arc<Counters>,
    channel_counters: DashMap<String, Arc<Counters>>,
    receivers: DashMap<String, ReceiveChannel<Bytes>>,
    senders: DashMap<String, SendChannel<Bytes>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl<D> Debug for TransportBase<D> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportBase")
            .field("receivers", &self.receivers.len())
            .field("senders", &self.senders.len())
            .field("metrics", &self.counters.snapshot())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<D> TransportBase<D>
where
    D: ChannelDriver,
{
    /// Creates the bookkeeping for `driver`, spawning adapters on `runtime`.
    pub fn new(driver: D, runtime: Handle) -> Self {
        Self {
            driver: Arc::new(driver),
            runtime,
            counters: Arc::new(Counters::default()),
            channel_counters: DashMap::new(),
            receivers: DashMap::new(),
            senders: DashMap::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// The driver behind this transport.
    pub const fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Returns the receive channel for `channel`, creating it on first use.
    ///
    /// Repeated calls return handles to the same queue. A cancelled channel
    /// is replaced by a fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] once the transport has been closed.
    pub fn receive_from(&self, channel: &str) -> Result<ReceiveChannel<Bytes>, Error> {
        self.ensure_open()?;

        let mut entry = self
            .receivers
            .entry(channel.to_owned())
            .or_insert_with(|| self.spawn_receiver(channel));

        if entry.is_cancelled() {
            debug!(channel, "replacing cancelled receive channel");
            *entry = self.spawn_receiver(channel);
        }

        Ok(entry.value().clone())
    }

    /// Returns the send channel for `channel`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] once the transport has been closed.
    pub fn send_to(&self, channel: &str) -> Result<SendChannel<Bytes>, Error> {
        self.ensure_open()?;

        let mut entry = self
            .senders
            .entry(channel.to_owned())
            .or_insert_with(|| self.spawn_sender(channel));

        if entry.is_cancelled() {
            debug!(channel, "replacing cancelled send channel");
            *entry = self.spawn_sender(channel);
        }

        Ok(entry.value().clone())
    }

    /// Returns a typed view over the receive channel for `channel`.
    ///
    /// Each call starts its own decoding adapter reading from the shared byte
    /// channel. Messages that fail to decode are logged, counted as receive
    /// errors and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] once the transport has been closed.
    pub fn receive_from_with<T, X>(
        &self,
        channel: &str,
        deserializer: X,
    ) -> Result<ReceiveChannel<T>, Error>
    where
        T: Send + 'static,
        X: Deserializer<T>,
    {
        let source = self.receive_from(channel)?;
        let cancel = source.cancellation().child_token();
        let (tx, rx) = channel::receive_channel(cancel.clone());
        let recorder = self.recorder(channel);
        let channel = channel.to_owned();

        self.runtime.spawn(async move {
            loop {
                let bytes = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    next = source.receive() => match next {
                        Some(bytes) => bytes,
                        None => break,
                    },
                };

                match deserializer.deserialize(bytes) {
                    Ok(value) => {
                        if tx.send(value).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(%channel, error = %e, "dropping message that failed to deserialize");
                        recorder.receive_error();
                    }
                }
            }

            cancel.cancel();
        });

        Ok(rx)
    }

    /// Returns a typed view over the send channel for `channel`.
    ///
    /// Values that fail to encode are logged, counted as send errors and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] once the transport has been closed.
    pub fn send_to_with<T, X>(&self, channel: &str, serializer: X) -> Result<SendChannel<T>, Error>
    where
        T: Send + 'static,
        X: Serializer<T>,
    {
        let sink = self.send_to(channel)?;
        let cancel = sink.cancellation().child_token();
        let (tx, rx) = channel::send_channel(cancel.clone());
        let recorder = self.recorder(channel);
        let channel = channel.to_owned();

        self.runtime.spawn(async move {
            loop {
                let value = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    next = rx.recv_async() => match next {
                        Ok(value) => value,
                        Err(_) => break,
                    },
                };

                match serializer.serialize(&value) {
                    Ok(bytes) => {
                        if sink.send(bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(%channel, error = %e, "dropping message that failed to serialize");
                        recorder.send_error();
                    }
                }
            }

            cancel.cancel();
        });

        Ok(tx)
    }

    /// Transport-wide counters.
    pub fn metrics(&self) -> Metrics {
        self.counters.snapshot()
    }

    /// Counters for a single channel, if it has been used.
    pub fn channel_metrics(&self, channel: &str) -> Option<Metrics> {
        self.channel_counters
            .get(channel)
            .map(|counters| counters.snapshot())
    }

    /// Stops every adapter and forgets all cached channels.
    ///
    /// Returns `false` if the transport was already closed.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.shutdown.cancel();
        self.receivers.clear();
        self.senders.clear();

        debug!("transport channels closed");
        true
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    fn recorder(&self, channel: &str) -> Recorder {
        let channel = self
            .channel_counters
            .entry(channel.to_owned())
            .or_default()
            .value()
            .clone();

        Recorder {
            transport: self.counters.clone(),
            channel,
        }
    }

    fn spawn_receiver(&self, channel: &str) -> ReceiveChannel<Bytes> {
        let cancel = self.shutdown.child_token();
        let (tx, rx) = channel::receive_channel(cancel.clone());
        let mut inbound = self.driver.subscribe(channel);
        let recorder = self.recorder(channel);
        let channel = channel.to_owned();

        self.runtime.spawn(async move {
            debug!(%channel, "receive adapter started");

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    next = inbound.next() => match next {
                        Some(Ok(payload)) => {
                            recorder.received();
                            if tx.send(payload).is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(%channel, error = %e, "failed to receive message");
                            recorder.receive_error();
                        }
                        None => break,
                    },
                }
            }

            cancel.cancel();
            debug!(%channel, "receive adapter stopped");
        });

        rx
    }

    fn spawn_sender(&self, channel: &str) -> SendChannel<Bytes> {
        let cancel = self.shutdown.child_token();
        let (tx, rx) = channel::send_channel(cancel.clone());
        let driver = self.driver.clone();
        let recorder = self.recorder(channel);
        let channel = channel.to_owned();

        self.runtime.spawn(async move {
            debug!(%channel, "send adapter started");

            loop {
                let payload = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    next = rx.recv_async() => match next {
                        Ok(payload) => payload,
                        Err(_) => break,
                    },
                };

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    result = driver.send(&channel, payload) => match result {
                        Ok(()) => recorder.sent(),
                        Err(e) => {
                            error!(%channel, error = %e, "giving up on message");
                            recorder.send_error();
                        }
                    },
                }
            }

            cancel.cancel();
            debug!(%channel, "send adapter stopped");
        });

        tx
    }
}

impl<D> Drop for TransportBase<D> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A named-channel messaging transport.
///
/// Implementors provide [`base`](Self::base) and [`close`](Self::close); every
/// other operation is served by the shared [`TransportBase`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Network driver used by the shared bookkeeping.
    type Driver: ChannelDriver;

    /// Error type surfaced to callers.
    type Error: StdError + From<Error> + Send + Sync + 'static;

    /// The shared bookkeeping.
    fn base(&self) -> &TransportBase<Self::Driver>;

    /// Returns the receive channel for `channel`.
    ///
    /// # Errors
    ///
    /// Fails once the transport has been closed.
    fn receive_from(&self, channel: &str) -> Result<ReceiveChannel<Bytes>, Self::Error> {
        Ok(self.base().receive_from(channel)?)
    }

    /// Returns the send channel for `channel`.
    ///
    /// # Errors
    ///
    /// Fails once the transport has been closed.
    fn send_to(&self, channel: &str) -> Result<SendChannel<Bytes>, Self::Error> {
        Ok(self.base().send_to(channel)?)
    }

    /// Returns a typed receive channel for `channel`.
    ///
    /// # Errors
    ///
    /// Fails once the transport has been closed.
    fn receive_from_with<T, X>(
        &self,
        channel: &str,
        deserializer: X,
    ) -> Result<ReceiveChannel<T>, Self::Error>
    where
        T: Send + 'static,
        X: Deserializer<T>,
    {
        Ok(self.base().receive_from_with(channel, deserializer)?)
    }

    /// Returns a typed send channel for `channel`.
    ///
    /// # Errors
    ///
    /// Fails once the transport has been closed.
    fn send_to_with<T, X>(&self, channel: &str, serializer: X) -> Result<SendChannel<T>, Self::Error>
    where
        T: Send + 'static,
        X: Serializer<T>,
    {
        Ok(self.base().send_to_with(channel, serializer)?)
    }

    /// Transport-wide counters.
    fn metrics(&self) -> Metrics {
        self.base().metrics()
    }

    /// Counters for one channel.
    fn channel_metrics(&self, channel: &str) -> Option<Metrics> {
        self.base().channel_metrics(channel)
    }

    /// Releases every channel and network resource. Idempotent.
    async fn close(&self) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::convert::Infallible;
    use std::time::Duration;

    use serde::{Deserialize, Serialize};
    use tokio::time::timeout;

    #[derive(Debug, thiserror::Error)]
    #[error("loopback refused the message")]
    struct Refused;

    /// Delivers every sent message to the local subscribers of the same channel.
    #[derive(Default)]
    struct LoopbackDriver {
        subscribers: DashMap<String, Vec<flume::Sender<Result<Bytes, Refused>>>>,
    }

    impl LoopbackDriver {
        fn subscriber_count(&self, channel: &str) -> usize {
            self.subscribers.get(channel).map_or(0, |subs| {
                subs.iter().filter(|tx| !tx.is_disconnected()).count()
            })
        }

        fn inject_error(&self, channel: &str) {
            if let Some(subs) = self.subscribers.get(channel) {
                for tx in subs.iter() {
                    let _ = tx.send(Err(Refused));
                }
            }
        }
    }

    #[async_trait]
    impl ChannelDriver for LoopbackDriver {
        type Error = Refused;

        fn subscribe(&self, channel: &str) -> BoxStream<'static, Result<Bytes, Refused>> {
            let (tx, rx) = flume::unbounded();
            self.subscribers
                .entry(channel.to_owned())
                .or_default()
                .push(tx);

            rx.into_stream().boxed()
        }

        async fn send(&self, channel: &str, payload: Bytes) -> Result<(), Refused> {
            if channel.starts_with("refused") {
                return Err(Refused);
            }

            if let Some(subs) = self.subscribers.get(channel) {
                for tx in subs.iter() {
                    let _ = tx.send(Ok(payload.clone()));
                }
            }

            Ok(())
        }
    }

    fn base() -> TransportBase<LoopbackDriver> {
        let _ = tracing_subscriber::fmt::try_init();
        TransportBase::new(LoopbackDriver::default(), Handle::current())
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        timeout(Duration::from_secs(1), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
        item: String,
    }

    #[tokio::test]
    async fn test_round_trip_and_metrics() {
        let base = base();
        let rx = base.receive_from("orders").unwrap();
        let tx = base.send_to("orders").unwrap();

        for i in 0..3u8 {
            tx.send(Bytes::from(vec![i])).await.unwrap();
        }

        for i in 0..3u8 {
            let msg = timeout(Duration::from_secs(1), rx.receive())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(msg, Bytes::from(vec![i]));
        }

        eventually(|| base.metrics().messages_sent == 3).await;
        let metrics = base.metrics();
        assert_eq!(metrics.messages_received, 3);
        assert_eq!(metrics.receive_errors, 0);
        assert_eq!(metrics.send_errors, 0);
        assert_eq!(base.channel_metrics("orders"), Some(metrics));
        assert_eq!(base.channel_metrics("unused"), None);
    }

    #[tokio::test]
    async fn test_channels_are_cached_per_name() {
        let base = base();

        let first = base.receive_from("a").unwrap();
        let second = base.receive_from("a").unwrap();
        let _other = base.receive_from("b").unwrap();

        assert_eq!(base.driver().subscriber_count("a"), 1);
        assert_eq!(base.driver().subscriber_count("b"), 1);

        base.send_to("a").unwrap().send(Bytes::from_static(b"x")).await.unwrap();

        let got = timeout(Duration::from_secs(1), first.receive())
            .await
            .unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"x")));
        assert!(second.try_receive().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_channel_is_replaced() {
        let base = base();

        let first = base.receive_from("jobs").unwrap();
        first.cancel();

        eventually(|| base.driver().subscriber_count("jobs") == 0).await;

        let second = base.receive_from("jobs").unwrap();
        assert!(!second.is_cancelled());
        assert_eq!(base.driver().subscriber_count("jobs"), 1);

        base.send_to("jobs").unwrap().send(Bytes::from_static(b"y")).await.unwrap();
        let got = timeout(Duration::from_secs(1), second.receive())
            .await
            .unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"y")));
    }

    #[tokio::test]
    async fn test_failed_sends_are_counted() {
        let base = base();
        let tx = base.send_to("refused-topic").unwrap();

        tx.send(Bytes::from_static(b"1")).await.unwrap();
        tx.send(Bytes::from_static(b"2")).await.unwrap();

        eventually(|| base.metrics().send_errors == 2).await;
        assert_eq!(base.metrics().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_inbound_errors_are_counted() {
        let base = base();
        let rx = base.receive_from("noisy").unwrap();

        base.driver().inject_error("noisy");
        base.send_to("noisy").unwrap().send(Bytes::from_static(b"ok")).await.unwrap();

        let got = timeout(Duration::from_secs(1), rx.receive()).await.unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"ok")));
        assert_eq!(base.metrics().receive_errors, 1);
        assert_eq!(base.metrics().messages_received, 1);
    }

    #[tokio::test]
    async fn test_typed_channels() {
        let base = base();

        let rx = base
            .receive_from_with("orders", |bytes: Bytes| {
                serde_json::from_slice::<Order>(&bytes)
            })
            .unwrap();
        let tx = base
            .send_to_with("orders", |order: &Order| {
                serde_json::to_vec(order).map(Bytes::from)
            })
            .unwrap();

        // Bypass the typed sender so the receiver sees garbage first.
        base.send_to("orders")
            .unwrap()
            .send(Bytes::from_static(b"not json"))
            .await
            .unwrap();

        let order = Order {
            id: 7,
            item: "widget".to_string(),
        };
        tx.send(order).await.unwrap();

        let got = timeout(Duration::from_secs(1), rx.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            got,
            Order {
                id: 7,
                item: "widget".to_string(),
            }
        );
        assert_eq!(base.metrics().receive_errors, 1);
    }

    #[tokio::test]
    async fn test_typed_serialize_failure_is_counted() {
        let base = base();

        let tx = base
            .send_to_with("numbers", |n: &i64| {
                if *n < 0 {
                    Err(Refused)
                } else {
                    Ok(Bytes::from(n.to_string()))
                }
            })
            .unwrap();
        let rx = base
            .receive_from_with("numbers", crate::codec::string_from_bytes)
            .unwrap();

        tx.send(-1).await.unwrap();
        tx.send(5).await.unwrap();

        let got = timeout(Duration::from_secs(1), rx.receive()).await.unwrap();
        assert_eq!(got.as_deref(), Some("5"));
        assert_eq!(base.metrics().send_errors, 1);
    }

    #[tokio::test]
    async fn test_close_rejects_new_channels_and_stops_adapters() {
        let base = base();
        let rx = base.receive_from("events").unwrap();
        let tx = base.send_to("events").unwrap();

        assert!(base.close());
        assert!(!base.close());

        assert_eq!(base.receive_from("events").unwrap_err(), Error::Closed);
        assert_eq!(base.send_to("events").unwrap_err(), Error::Closed);
        assert_eq!(
            base.send_to_with("events", |_: &u8| Ok::<_, Infallible>(Bytes::new()))
                .unwrap_err(),
            Error::Closed
        );

        assert!(rx.is_cancelled());
        assert_eq!(tx.send(Bytes::new()).await, Err(Error::ChannelClosed));
        eventually(|| base.driver().subscriber_count("events") == 0).await;

        let ended = timeout(Duration::from_secs(1), rx.receive()).await.unwrap();
        assert_eq!(ended, None);
    }
}
