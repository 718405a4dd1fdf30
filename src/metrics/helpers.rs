//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use crate::connection_manager::ConnectionStatus;

use super::{
    CONNECTIONS_BY_STATUS, CONNECTS_TOTAL, CONNECT_FAILURES_TOTAL, INBOUND_QUEUE_DEPTH,
    MESSAGES_DELIVERED_TOTAL, MESSAGES_MALFORMED_TOTAL, MESSAGES_RECEIVED_TOTAL,
    MESSAGES_UNKNOWN_TOTAL, MESSAGE_DELIVERY_LATENCY, POOLED_SOCKETS, RECONNECTS_EXHAUSTED_TOTAL,
    RECONNECTS_TOTAL, STALE_CONNECTIONS_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for connection lifecycle metrics
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    /// Publish the per-status connection counts
    pub fn set_status_counts(counts: &[(ConnectionStatus, usize)]) {
        for (status, count) in counts {
            CONNECTIONS_BY_STATUS
                .with_label_values(&[status.as_str()])
                .set(*count as i64);
        }
    }

    pub fn set_pooled(count: usize) {
        POOLED_SOCKETS.set(count as i64);
    }

    pub fn record_connected() {
        CONNECTS_TOTAL.inc();
    }

    pub fn record_connect_failure() {
        CONNECT_FAILURES_TOTAL.inc();
    }

    pub fn record_reconnect_scheduled() {
        RECONNECTS_TOTAL.inc();
    }

    pub fn record_reconnects_exhausted() {
        RECONNECTS_EXHAUSTED_TOTAL.inc();
    }

    pub fn record_stale() {
        STALE_CONNECTIONS_TOTAL.inc();
    }
}

/// Helper struct for inbound message metrics
pub struct InboundMetrics;

impl InboundMetrics {
    pub fn record_received() {
        MESSAGES_RECEIVED_TOTAL.inc();
    }

    pub fn record_delivered(latency: Duration) {
        MESSAGES_DELIVERED_TOTAL.inc();
        MESSAGE_DELIVERY_LATENCY.observe(latency.as_secs_f64());
    }

    pub fn record_malformed() {
        MESSAGES_MALFORMED_TOTAL.inc();
    }

    pub fn record_unknown() {
        MESSAGES_UNKNOWN_TOTAL.inc();
    }

    pub fn set_queue_depth(depth: usize) {
        INBOUND_QUEUE_DEPTH.set(depth as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_counts_are_labelled() {
        ConnectionMetrics::set_status_counts(&[
            (ConnectionStatus::Connected, 3),
            (ConnectionStatus::Error, 1),
        ]);

        let output = encode_metrics().unwrap();
        assert!(output.contains(r#"ara_link_connections{status="connected"}"#));
    }
}
