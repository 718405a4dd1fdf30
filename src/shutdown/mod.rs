//! Graceful shutdown for the link process.
//!
//! On a termination signal, inbound messages already queued are given a
//! bounded window to reach their handlers before the manager closes every
//! socket and stops its background tasks.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::time::Instant;

use crate::connection_manager::ConnectionManager;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time allowed for queued inbound messages to drain (default: 5 seconds)
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
pub struct ShutdownResult {
    pub success: bool,
    /// Inbound messages still queued when the drain window closed
    pub messages_dropped: usize,
    pub duration: Duration,
}

pub struct GracefulShutdown {
    manager: Arc<ConnectionManager>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self::with_config(manager, ShutdownConfig::default())
    }

    pub fn with_config(manager: Arc<ConnectionManager>, config: ShutdownConfig) -> Self {
        Self { manager, config }
    }

    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = Instant::now();

        tracing::info!(reason = %reason, "Starting graceful shutdown - draining inbound queues");
        let messages_dropped = self.drain_inbound().await;

        tracing::info!("Closing connections");
        let success = match self.manager.shutdown().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Manager already shut down");
                false
            }
        };

        let result = ShutdownResult {
            success,
            messages_dropped,
            duration: start.elapsed(),
        };
        tracing::info!(
            messages_dropped = result.messages_dropped,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );
        result
    }

    /// Wait for the messages queued at the start to be handled. Traffic that
    /// arrives afterwards is not waited for. Returns what was left behind.
    async fn drain_inbound(&self) -> usize {
        let deadline = Instant::now() + self.config.drain_timeout;
        let queued = self.manager.pending_messages() as u64;
        let target = self.manager.inbound_stats().settled() + queued;

        loop {
            let settled = self.manager.inbound_stats().settled();
            if settled >= target || self.manager.pending_messages() == 0 {
                return 0;
            }
            if Instant::now() >= deadline {
                let left = (target - settled) as usize;
                tracing::warn!(pending = left, "Drain timeout reached, dropping queued messages");
                return left;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM. Returns the signal name.
pub async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection_manager::ConnectionEvent;
    use crate::dispatcher::MessageHandler;
    use crate::error::ManagerError;
    use crate::transport::MemoryTransport;
    use serde_json::Value;

    struct Ignore;

    impl MessageHandler for Ignore {
        fn on_stream_update(&self, _connection_id: &str, _payload: &Value) {}
        fn on_metrics_update(&self, _payload: &Value) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_shuts_manager_down() {
        let manager = Arc::new(
            ConnectionManager::new(
                ConnectionConfig::default(),
                Arc::new(MemoryTransport::new()),
                Arc::new(Ignore),
            )
            .unwrap(),
        );

        let result = GracefulShutdown::new(manager.clone())
            .execute("test")
            .await;
        assert!(result.success);
        assert_eq!(result.messages_dropped, 0);
        assert_eq!(manager.connections().await.unwrap_err(), ManagerError::ShutDown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_peer_does_not_hold_up_shutdown() {
        let transport = MemoryTransport::new();
        let manager = Arc::new(
            ConnectionManager::new(
                ConnectionConfig::default(),
                Arc::new(transport.clone()),
                Arc::new(Ignore),
            )
            .unwrap(),
        );
        let mut events = manager.subscribe_events();
        manager
            .add_connection("a", "mem://feed/a", Vec::<String>::new())
            .await
            .unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Connected { .. }
        ));
        let peer = transport.take_peer("mem://feed/a").unwrap();

        for n in 0..30 {
            peer.push(format!(r#"{{"type":"stream_update","payload":{n}}}"#));
        }
        let streamer = tokio::spawn(async move {
            let mut n = 0u64;
            loop {
                peer.push(format!(r#"{{"type":"stream_update","payload":{n}}}"#));
                n += 1;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let start = Instant::now();
        let result = GracefulShutdown::new(manager.clone())
            .execute("test")
            .await;
        streamer.abort();

        assert!(result.success);
        assert_eq!(result.messages_dropped, 0);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_default_config() {
        assert_eq!(ShutdownConfig::default().drain_timeout, Duration::from_secs(5));
    }
}
