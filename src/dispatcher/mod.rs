//! Inbound message dispatch.
//!
//! Every connection gets an unbounded FIFO inbox. Transport callbacks only
//! append to it; a single drain loop (see [`crate::tasks::DrainTask`]) pops
//! small batches per pass and hands them to the [`MessageRouter`], so bursts
//! on one connection never stall the transport or starve the others.

mod message;
mod router;

pub use message::{ClientMessage, Envelope, InboundMessage, MessageKind};
pub use router::{MessageHandler, MessageRouter, RouteOutcome};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::connection_manager::Activity;
use crate::metrics::InboundMetrics;
use crate::transport::Frame;

struct Inbox {
    queue: VecDeque<InboundMessage>,
    activity: Arc<Activity>,
}

/// Statistics for the message dispatcher
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub received: AtomicU64,
    pub delivered: AtomicU64,
    pub malformed: AtomicU64,
    pub unknown: AtomicU64,
    /// Queued messages thrown away with their inbox
    pub discarded: AtomicU64,
    /// Sum of enqueue-to-delivery latency, in microseconds
    pub total_latency_us: AtomicU64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            total_latency_us: self.total_latency_us.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatcher statistics
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub received: u64,
    pub delivered: u64,
    pub malformed: u64,
    pub unknown: u64,
    pub discarded: u64,
    pub total_latency_us: u64,
}

impl DispatcherStatsSnapshot {
    /// Messages that have left the inboxes, delivered or not
    pub fn settled(&self) -> u64 {
        self.delivered + self.malformed + self.unknown + self.discarded
    }
}

/// Per-connection inbound queues plus the batch drain step
pub struct MessageDispatcher {
    inboxes: DashMap<String, Inbox>,
    router: MessageRouter,
    batch_size: usize,
    wake: Notify,
    stats: DispatcherStats,
}

impl MessageDispatcher {
    pub fn new(router: MessageRouter, batch_size: usize) -> Self {
        Self {
            inboxes: DashMap::new(),
            router,
            batch_size: batch_size.max(1),
            wake: Notify::new(),
            stats: DispatcherStats::default(),
        }
    }

    /// Create the inbox for a connection. Messages for unregistered ids are dropped.
    pub fn register(&self, connection_id: &str, activity: Arc<Activity>) {
        let replaced = self.inboxes.insert(
            connection_id.to_string(),
            Inbox {
                queue: VecDeque::new(),
                activity,
            },
        );
        if let Some(old) = replaced {
            self.stats
                .discarded
                .fetch_add(old.queue.len() as u64, Ordering::Relaxed);
        }
    }

    /// Drop a connection's inbox along with anything still queued
    pub fn unregister(&self, connection_id: &str) -> usize {
        let dropped = self
            .inboxes
            .remove(connection_id)
            .map(|(_, inbox)| inbox.queue.len())
            .unwrap_or(0);
        self.stats
            .discarded
            .fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    /// Append an inbound frame. O(1), never waits on the drain loop.
    ///
    /// Any inbound traffic counts as a sign of life for the heartbeat monitor.
    pub fn enqueue(&self, connection_id: &str, payload: Frame) -> bool {
        let Some(mut inbox) = self.inboxes.get_mut(connection_id) else {
            tracing::debug!(connection_id = %connection_id, "Dropping message for unknown connection");
            return false;
        };

        inbox.activity.touch();
        inbox
            .queue
            .push_back(InboundMessage::new(connection_id, payload));
        drop(inbox);

        self.stats.received.fetch_add(1, Ordering::Relaxed);
        InboundMetrics::record_received();
        self.wake.notify_one();
        true
    }

    /// Resolves once something has been enqueued since the last wake-up
    pub async fn wait_for_work(&self) {
        self.wake.notified().await;
    }

    /// One drain pass: up to `batch_size` messages from every non-empty
    /// inbox, in per-connection FIFO order. Returns whether work remains.
    pub fn drain_pass(&self) -> bool {
        let mut batch = Vec::new();
        let mut remaining = 0;

        for mut inbox in self.inboxes.iter_mut() {
            let take = inbox.queue.len().min(self.batch_size);
            let owner = inbox.activity.clone();
            let drained: Vec<_> = inbox.queue.drain(..take).collect();
            batch.extend(drained.into_iter().map(|message| (owner.clone(), message)));
            remaining += inbox.queue.len();
        }

        for (owner, message) in &batch {
            // Skip anything whose inbox was removed or replaced mid-pass
            if !self.is_current(&message.connection_id, owner) {
                self.stats.discarded.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            self.deliver(message);
        }

        InboundMetrics::set_queue_depth(remaining);
        remaining > 0
    }

    fn is_current(&self, connection_id: &str, owner: &Arc<Activity>) -> bool {
        self.inboxes
            .get(connection_id)
            .is_some_and(|inbox| Arc::ptr_eq(&inbox.activity, owner))
    }

    fn deliver(&self, message: &InboundMessage) {
        match self.router.route(message) {
            RouteOutcome::Delivered(_) => {
                let latency = Instant::now().saturating_duration_since(message.received_at);
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .total_latency_us
                    .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
                InboundMetrics::record_delivered(latency);
            }
            RouteOutcome::UnknownKind(_) => {
                self.stats.unknown.fetch_add(1, Ordering::Relaxed);
                InboundMetrics::record_unknown();
            }
            RouteOutcome::Malformed => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                InboundMetrics::record_malformed();
            }
        }
    }

    /// Messages waiting across all inboxes
    pub fn pending(&self) -> usize {
        self.inboxes.iter().map(|inbox| inbox.queue.len()).sum()
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }
}
