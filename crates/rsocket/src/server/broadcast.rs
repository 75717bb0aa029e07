use crate::error::{Error, Result};
use crate::protocol::Payload;

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

struct Subscriber {
    sender: mpsc::Sender<Payload>,
    lagged: Arc<AtomicU64>,
}

/// Fans every inbound payload out to all current subscribers.
///
/// Each subscriber owns a bounded queue. Publishing waits for a full queue up
/// to the slow-subscriber timeout and then drops the payload for that
/// subscriber only. The subscriber learns about the loss as a
/// [`Error::Lagged`] item.
pub struct Broadcaster {
    subscribers: Arc<DashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    capacity: usize,
    slow_subscriber_timeout: Duration,
    closed: AtomicBool,
}

impl Broadcaster {
    pub fn new(capacity: usize, slow_subscriber_timeout: Duration) -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            capacity: capacity.max(1),
            slow_subscriber_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Registers a subscriber. Payloads published after this returns are delivered to it.
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.capacity);
        let lagged = Arc::new(AtomicU64::new(0));

        self.subscribers.insert(
            id,
            Subscriber {
                sender,
                lagged: lagged.clone(),
            },
        );

        // `close` sets the flag before clearing, so a close racing the insert is seen here.
        if self.closed.load(Ordering::Acquire) {
            self.subscribers.remove(&id);
        }

        Subscription {
            id,
            inner: ReceiverStream::new(receiver),
            lagged,
            subscribers: self.subscribers.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub async fn publish(&self, payload: &Payload) {
        let targets: Vec<_> = self
            .subscribers
            .iter()
            .map(|entry| {
                (
                    *entry.key(),
                    entry.value().sender.clone(),
                    entry.value().lagged.clone(),
                )
            })
            .collect();

        for (id, sender, lagged) in targets {
            match sender
                .send_timeout(payload.clone(), self.slow_subscriber_timeout)
                .await
            {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(subscriber = id, "dropping frame for slow subscriber");
                    lagged.fetch_add(1, Ordering::AcqRel);
                }
                Err(SendTimeoutError::Closed(_)) => {
                    self.subscribers.remove(&id);
                }
            }
        }
    }

    /// Ends every subscription. Later subscriptions end immediately.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.subscribers.clear();
        debug!("broadcaster closed");
    }
}

/// Stream of payloads for one subscriber. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    inner: ReceiverStream<Payload>,
    lagged: Arc<AtomicU64>,
    subscribers: Arc<DashMap<u64, Subscriber>>,
}

impl Stream for Subscription {
    type Item = Result<Payload>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let missed = self.lagged.swap(0, Ordering::AcqRel);
        if missed > 0 {
            return Poll::Ready(Some(Err(Error::Lagged(missed))));
        }

        Pin::new(&mut self.inner).poll_next(cx).map(|item| item.map(Ok))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscribers.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use futures::StreamExt;
    use tokio::time::timeout;

    fn payload(data: &'static [u8]) -> Payload {
        Payload::new(None, Bytes::from_static(data))
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_every_payload() {
        let broadcaster = Broadcaster::new(8, Duration::from_secs(1));
        let mut first = broadcaster.subscribe();
        let mut second = broadcaster.subscribe();

        broadcaster.publish(&payload(b"a")).await;
        broadcaster.publish(&payload(b"b")).await;

        for sub in [&mut first, &mut second] {
            assert_eq!(sub.next().await.unwrap().unwrap().data, Bytes::from_static(b"a"));
            assert_eq!(sub.next().await.unwrap().unwrap().data, Bytes::from_static(b"b"));
        }
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let broadcaster = Broadcaster::new(8, Duration::from_secs(1));
        let sub = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);

        drop(sub);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_subscriber_loses_frames_without_stalling_others() {
        let broadcaster = Broadcaster::new(1, Duration::from_millis(100));
        let mut slow = broadcaster.subscribe();
        let mut fast = broadcaster.subscribe();

        broadcaster.publish(&payload(b"1")).await;
        assert_eq!(fast.next().await.unwrap().unwrap().data, Bytes::from_static(b"1"));

        // `slow` still holds "1", so "2" times out for it.
        broadcaster.publish(&payload(b"2")).await;
        assert_eq!(fast.next().await.unwrap().unwrap().data, Bytes::from_static(b"2"));

        assert!(matches!(slow.next().await, Some(Err(Error::Lagged(1)))));
        assert_eq!(slow.next().await.unwrap().unwrap().data, Bytes::from_static(b"1"));
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let broadcaster = Broadcaster::new(8, Duration::from_secs(1));
        let mut sub = broadcaster.subscribe();

        broadcaster.close();
        let ended = timeout(Duration::from_secs(1), sub.next()).await.unwrap();
        assert!(ended.is_none());

        let mut late = broadcaster.subscribe();
        assert!(late.next().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_subscribe_racing_close_still_ends() {
        for _ in 0..100 {
            let broadcaster = Arc::new(Broadcaster::new(8, Duration::from_secs(1)));

            let subscribing = {
                let broadcaster = broadcaster.clone();
                tokio::spawn(async move { broadcaster.subscribe() })
            };
            let closing = {
                let broadcaster = broadcaster.clone();
                tokio::spawn(async move { broadcaster.close() })
            };

            let mut sub = subscribing.await.unwrap();
            closing.await.unwrap();

            let ended = timeout(Duration::from_secs(1), sub.next()).await.unwrap();
            assert!(ended.is_none());
            assert_eq!(broadcaster.subscriber_count(), 0);
        }
    }
}
