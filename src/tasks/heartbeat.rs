use std::time::Duration;

use tokio::sync::{broadcast, oneshot};

use crate::config::ConnectionConfig;
use crate::connection_manager::{Command, CommandSender};

/// How long a connected socket has gone without inbound traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessSample {
    pub id: String,
    pub epoch: u64,
    pub idle: Duration,
}

/// A connection is stale once it has been silent for more than two intervals
pub fn is_stale(idle: Duration, interval: Duration) -> bool {
    idle > interval.saturating_mul(2)
}

/// Background task that probes connected sockets and reports stalls
pub struct HeartbeatTask {
    config: ConnectionConfig,
    commands: CommandSender,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
    pub(crate) fn new(
        config: ConnectionConfig,
        commands: CommandSender,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            commands,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let interval = self.config.heartbeat_interval();
        let mut timer = tokio::time::interval(interval);

        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            heartbeat_interval_ms = self.config.heartbeat_interval_ms,
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    if !self.check(interval).await {
                        break;
                    }
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    /// One tick. Returns `false` once the coordinator is gone.
    async fn check(&self, interval: Duration) -> bool {
        let (reply, samples) = oneshot::channel();
        if self.commands.send(Command::Heartbeat { reply }).is_err() {
            return false;
        }
        let Ok(samples) = samples.await else {
            return false;
        };

        let mut stalled = 0;
        for sample in samples {
            if !is_stale(sample.idle, interval) {
                continue;
            }
            stalled += 1;
            let command = Command::Stalled {
                id: sample.id,
                epoch: sample.epoch,
                idle: sample.idle,
            };
            if self.commands.send(command).is_err() {
                return false;
            }
        }

        if stalled > 0 {
            tracing::debug!(stalled = stalled, "Heartbeat found stalled connections");
        }
        true
    }
}
