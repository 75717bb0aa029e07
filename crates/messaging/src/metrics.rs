use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of a transport's message counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Metrics {
    /// Messages handed to a receive channel.
    pub messages_received: u64,

    /// Messages successfully handed to the network.
    pub messages_sent: u64,

    /// Inbound messages that failed or were dropped.
    pub receive_errors: u64,

    /// Outbound messages that were given up on.
    pub send_errors: u64,
}

/// Monotonic counters behind [`Metrics`].
#[derive(Debug, Default)]
pub(crate) struct Counters {
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    receive_errors: AtomicU64,
    send_errors: AtomicU64,
}

impl Counters {
    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_receive_error(&self) {
        self.receive_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Metrics {
        Metrics {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}

/// Transport-wide counters plus the counters of the channel being serviced.
#[derive(Clone, Debug)]
pub(crate) struct Recorder {
    pub transport: std::sync::Arc<Counters>,
    pub channel: std::sync::Arc<Counters>,
}

impl Recorder {
    pub fn received(&self) {
        self.transport.record_received();
        self.channel.record_received();
    }

    pub fn sent(&self) {
        self.transport.record_sent();
        self.channel.record_sent();
    }

    pub fn receive_error(&self) {
        self.transport.record_receive_error();
        self.channel.record_receive_error();
    }

    pub fn send_error(&self) {
        self.transport.record_send_error();
        self.channel.record_send_error();
    }
}
