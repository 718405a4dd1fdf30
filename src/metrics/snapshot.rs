//! Derived connection metrics

use serde::Serialize;
use tokio::time::Instant;

/// Point-in-time projection of connection state. Never authoritative.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_pooled_sockets: usize,
    pub total_messages: u64,
    pub messages_per_second: f64,
    pub average_latency_ms: f64,
    /// Reconnect attempts per open attempt
    pub reconnection_rate: f64,
    pub malformed_messages: u64,
}

/// Raw counters a snapshot is computed from
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsInput {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_pooled_sockets: usize,
    pub messages_received: u64,
    pub messages_delivered: u64,
    pub total_latency_us: u64,
    pub malformed_messages: u64,
    pub open_attempts: u64,
    pub reconnect_attempts: u64,
}

/// Keeps the previous sample so message throughput can be derived
pub struct MetricsTracker {
    last_sample: Option<(Instant, u64)>,
    last_rate: f64,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self {
            last_sample: None,
            last_rate: 0.0,
        }
    }

    pub fn recompute(&mut self, input: MetricsInput) -> MetricsSnapshot {
        let now = Instant::now();

        let messages_per_second = match self.last_sample {
            Some((at, count)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    self.last_rate =
                        input.messages_received.saturating_sub(count) as f64 / elapsed;
                }
                self.last_rate
            }
            None => 0.0,
        };
        self.last_sample = Some((now, input.messages_received));

        let average_latency_ms = if input.messages_delivered > 0 {
            input.total_latency_us as f64 / input.messages_delivered as f64 / 1000.0
        } else {
            0.0
        };

        let reconnection_rate = if input.open_attempts > 0 {
            input.reconnect_attempts as f64 / input.open_attempts as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            total_connections: input.total_connections,
            active_connections: input.active_connections,
            idle_pooled_sockets: input.idle_pooled_sockets,
            total_messages: input.messages_received,
            messages_per_second,
            average_latency_ms,
            reconnection_rate,
            malformed_messages: input.malformed_messages,
        }
    }
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_rate_from_consecutive_samples() {
        let mut tracker = MetricsTracker::new();

        let first = tracker.recompute(MetricsInput {
            messages_received: 10,
            ..Default::default()
        });
        assert_eq!(first.messages_per_second, 0.0);

        tokio::time::advance(Duration::from_secs(2)).await;
        let second = tracker.recompute(MetricsInput {
            messages_received: 50,
            ..Default::default()
        });
        assert_eq!(second.messages_per_second, 20.0);
        assert_eq!(second.total_messages, 50);
    }

    #[test]
    fn test_latency_and_reconnection_rate() {
        let mut tracker = MetricsTracker::new();
        let snapshot = tracker.recompute(MetricsInput {
            messages_delivered: 4,
            total_latency_us: 80_000,
            open_attempts: 8,
            reconnect_attempts: 2,
            ..Default::default()
        });

        assert_eq!(snapshot.average_latency_ms, 20.0);
        assert_eq!(snapshot.reconnection_rate, 0.25);
    }
}
