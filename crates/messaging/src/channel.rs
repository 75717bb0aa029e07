use crate::error::Error;

use std::fmt::{self, Debug, Formatter};

use futures::Stream;
use tokio_util::sync::CancellationToken;

/// Creates the producing half of a receive channel together with the handle given to consumers.
pub(crate) fn receive_channel<T>(cancel: CancellationToken) -> (flume::Sender<T>, ReceiveChannel<T>) {
    let (sender, receiver) = flume::unbounded();

    (sender, ReceiveChannel { receiver, cancel })
}

/// Creates the handle given to producers together with the consuming half of a send channel.
pub(crate) fn send_channel<T>(cancel: CancellationToken) -> (SendChannel<T>, flume::Receiver<T>) {
    let (sender, receiver) = flume::unbounded();

    (SendChannel { sender, cancel }, receiver)
}

/// Consumer handle for messages arriving on a named channel.
///
/// Handles are cheap to clone. All clones share one queue, so concurrent
/// consumers compete for messages rather than each seeing every message.
/// Once the channel is cancelled the queue is drained and then reports
/// end-of-stream.
pub struct ReceiveChannel<T> {
    receiver: flume::Receiver<T>,
    cancel: CancellationToken,
}

impl<T> Clone for ReceiveChannel<T> {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> Debug for ReceiveChannel<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveChannel")
            .field("queued", &self.receiver.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl<T> ReceiveChannel<T>
where
    T: Send + 'static,
{
    /// Waits for the next message. Returns `None` once the channel has ended.
    pub async fn receive(&self) -> Option<T> {
        self.receiver.recv_async().await.ok()
    }

    /// Returns a queued message without waiting.
    #[must_use]
    pub fn try_receive(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Blocks the current thread until the next message arrives.
    ///
    /// Intended for consumers living outside the async runtime. Calling this
    /// from a runtime worker thread stalls that worker.
    #[must_use]
    pub fn receive_blocking(&self) -> Option<T> {
        self.receiver.recv().ok()
    }

    /// Number of messages waiting to be consumed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether no message is currently waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Converts the handle into an asynchronous stream of messages.
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static {
        self.receiver.into_stream()
    }

    /// Stops the background adapter feeding this channel.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the channel was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Producer handle for messages leaving on a named channel.
///
/// Messages are queued and drained by a background adapter, so `send`
/// completes as soon as the message is queued, not when it is delivered.
pub struct SendChannel<T> {
    sender: flume::Sender<T>,
    cancel: CancellationToken,
}

impl<T> Clone for SendChannel<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> Debug for SendChannel<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendChannel")
            .field("queued", &self.sender.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl<T> SendChannel<T>
where
    T: Send + 'static,
{
    /// Queues a message for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] if the channel was cancelled or its adapter stopped.
    pub async fn send(&self, message: T) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::ChannelClosed);
        }

        self.sender
            .send_async(message)
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Queues a message without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] if the channel was cancelled or its adapter stopped.
    pub fn try_send(&self, message: T) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::ChannelClosed);
        }

        self.sender
            .try_send(message)
            .map_err(|_| Error::ChannelClosed)
    }

    /// Queues a message from outside the async runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] if the channel was cancelled or its adapter stopped.
    pub fn send_blocking(&self, message: T) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::ChannelClosed);
        }

        self.sender.send(message).map_err(|_| Error::ChannelClosed)
    }

    /// Stops the background adapter draining this channel. Queued messages are discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the channel was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::StreamExt;

    #[tokio::test]
    async fn test_receive_drains_then_ends() {
        let (tx, rx) = receive_channel::<u32>(CancellationToken::new());

        tx.send(1).unwrap();
        tx.send(2).unwrap();
        drop(tx);

        assert_eq!(rx.receive().await, Some(1));
        assert_eq!(rx.try_receive(), Some(2));
        assert_eq!(rx.receive().await, None);
    }

    #[tokio::test]
    async fn test_clones_share_one_queue() {
        let (tx, rx) = receive_channel::<u32>(CancellationToken::new());
        let other = rx.clone();

        tx.send(7).unwrap();

        assert_eq!(other.receive().await, Some(7));
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn test_into_stream() {
        let (tx, rx) = receive_channel::<u32>(CancellationToken::new());

        for i in 0..3 {
            tx.send(i).unwrap();
        }
        drop(tx);

        let collected: Vec<u32> = rx.into_stream().collect().await;
        assert_eq!(collected, vec![0, 1, 2]);
    }

    #[test]
    fn test_receive_blocking_from_plain_thread() {
        let (tx, rx) = receive_channel::<&'static str>(CancellationToken::new());

        let consumer = std::thread::spawn(move || rx.receive_blocking());
        tx.send("hello").unwrap();

        assert_eq!(consumer.join().unwrap(), Some("hello"));
    }

    #[tokio::test]
    async fn test_send_after_cancel_fails() {
        let (tx, rx) = send_channel::<u32>(CancellationToken::new());

        tx.send(1).await.unwrap();
        assert_eq!(rx.recv_async().await.unwrap(), 1);

        tx.cancel();
        assert!(tx.is_cancelled());
        assert_eq!(tx.send(2).await, Err(Error::ChannelClosed));
        assert_eq!(tx.try_send(3), Err(Error::ChannelClosed));
        assert_eq!(tx.send_blocking(4), Err(Error::ChannelClosed));
    }

    #[tokio::test]
    async fn test_send_after_adapter_gone_fails() {
        let (tx, rx) = send_channel::<u32>(CancellationToken::new());
        drop(rx);

        assert_eq!(tx.try_send(1), Err(Error::ChannelClosed));
    }
}
