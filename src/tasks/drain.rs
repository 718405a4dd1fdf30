use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::dispatcher::MessageDispatcher;

/// Background task that feeds queued inbound messages to the router.
///
/// Sleeps one drain interval before each pass so bursts are coalesced into
/// batches, and parks on the dispatcher once every inbox is empty.
pub struct DrainTask {
    dispatcher: Arc<MessageDispatcher>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl DrainTask {
    pub fn new(
        dispatcher: Arc<MessageDispatcher>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            dispatcher,
            interval,
            shutdown,
        }
    }

    pub async fn run(self) {
        let DrainTask {
            dispatcher,
            interval,
            mut shutdown,
        } = self;

        tracing::info!(
            drain_interval_ms = interval.as_millis() as u64,
            "Drain task started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Drain task received shutdown signal");
                    break;
                }
                _ = drain_until_empty(&dispatcher, interval) => {}
            }
        }

        tracing::info!("Drain task stopped");
    }
}

async fn drain_until_empty(dispatcher: &MessageDispatcher, interval: Duration) {
    dispatcher.wait_for_work().await;

    loop {
        tokio::time::sleep(interval).await;
        if !dispatcher.drain_pass() {
            break;
        }
    }
}
