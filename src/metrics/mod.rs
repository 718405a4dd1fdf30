//! Prometheus metrics for the connection manager.
//!
//! This module provides:
//! - Connection metrics (connections by status, idle pooled sockets)
//! - Reconnection metrics (attempts, connect failures, exhausted retries)
//! - Inbound message metrics (received, delivered, malformed, unknown kind)
//! - Delivery latency from enqueue to handler
//! - A derived [`MetricsSnapshot`] recomputed from connection state

mod helpers;
mod snapshot;

pub use helpers::{encode_metrics, ConnectionMetrics, InboundMetrics};
pub use snapshot::{MetricsInput, MetricsSnapshot, MetricsTracker};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, register_int_gauge_vec,
    Histogram, IntCounter, IntGauge, IntGaugeVec,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "ara_link";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Connections by status
    pub static ref CONNECTIONS_BY_STATUS: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_connections", METRIC_PREFIX),
        "Number of managed connections by status",
        &["status"]
    ).unwrap();

    /// Idle sockets waiting in the pool
    pub static ref POOLED_SOCKETS: IntGauge = register_int_gauge!(
        format!("{}_pooled_sockets", METRIC_PREFIX),
        "Idle sockets cached for reuse"
    ).unwrap();

    /// Successful opens
    pub static ref CONNECTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connects_total", METRIC_PREFIX),
        "Total successful connection opens"
    ).unwrap();

    /// Failed opens (timeout or transport error)
    pub static ref CONNECT_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connect_failures_total", METRIC_PREFIX),
        "Total failed connection opens"
    ).unwrap();

    // ============================================================================
    // Reconnection Metrics
    // ============================================================================

    /// Reconnect attempts scheduled
    pub static ref RECONNECTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_reconnects_total", METRIC_PREFIX),
        "Total reconnect attempts scheduled"
    ).unwrap();

    /// Connections that ran out of reconnect attempts
    pub static ref RECONNECTS_EXHAUSTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_reconnects_exhausted_total", METRIC_PREFIX),
        "Total connections that exhausted their reconnect attempts"
    ).unwrap();

    /// Connections flagged stale by the heartbeat monitor
    pub static ref STALE_CONNECTIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_stale_connections_total", METRIC_PREFIX),
        "Total connections detected as stalled"
    ).unwrap();

    // ============================================================================
    // Inbound Message Metrics
    // ============================================================================

    /// Messages received from remote endpoints
    pub static ref MESSAGES_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_received_total", METRIC_PREFIX),
        "Total inbound messages queued"
    ).unwrap();

    /// Messages handed to a handler
    pub static ref MESSAGES_DELIVERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_delivered_total", METRIC_PREFIX),
        "Total inbound messages delivered to handlers"
    ).unwrap();

    /// Messages that failed to parse
    pub static ref MESSAGES_MALFORMED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_malformed_total", METRIC_PREFIX),
        "Total inbound messages dropped as malformed"
    ).unwrap();

    /// Messages with an unrecognised kind
    pub static ref MESSAGES_UNKNOWN_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_unknown_total", METRIC_PREFIX),
        "Total inbound messages dropped for unknown kind"
    ).unwrap();

    /// Time from enqueue to handler
    pub static ref MESSAGE_DELIVERY_LATENCY: Histogram = register_histogram!(
        format!("{}_message_delivery_latency_seconds", METRIC_PREFIX),
        "Inbound message delivery latency in seconds",
        vec![0.001, 0.005, 0.01, 0.016, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    ).unwrap();

    /// Messages waiting in inbound queues
    pub static ref INBOUND_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        format!("{}_inbound_queue_depth", METRIC_PREFIX),
        "Messages waiting in inbound queues"
    ).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics() {
        // Initialize some metrics first (lazy_static requires first access)
        POOLED_SOCKETS.set(1);

        let output = encode_metrics().unwrap();
        assert!(output.contains("ara_link_pooled_sockets"));
    }

    #[test]
    fn test_inbound_metrics() {
        MESSAGES_RECEIVED_TOTAL.inc();
        MESSAGES_DELIVERED_TOTAL.inc();
        MESSAGES_MALFORMED_TOTAL.inc();
        MESSAGE_DELIVERY_LATENCY.observe(0.016);
        // Just verify no panics
    }
}
