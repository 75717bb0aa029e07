//! Outbound side: authenticated connections, per-channel load balancing and
//! the client cache shared by all send adapters.

mod cache;
mod connection;
mod load_balancer;

pub use cache::ClientCache;
pub use connection::{Connector, PeerConnection, SetupOptions};
pub use load_balancer::LoadBalancedClient;

use std::time::Duration;

use tokio::time::{Instant, Interval, interval_at};

/// Shortest period a background ticker runs at.
const MIN_TICK: Duration = Duration::from_millis(1);

/// Longest period a background ticker runs at. Keeps `now + period` representable.
const MAX_TICK: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Interval whose first tick is one `period` from now.
fn ticker(period: Duration) -> Interval {
    let period = period.clamp(MIN_TICK, MAX_TICK);
    interval_at(Instant::now() + period, period)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ticker_clamps_extreme_periods() {
        assert_eq!(ticker(Duration::MAX).period(), MAX_TICK);
        assert_eq!(ticker(Duration::ZERO).period(), MIN_TICK);
        assert_eq!(ticker(Duration::from_secs(20)).period(), Duration::from_secs(20));
    }
}
