use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

use ara_realtime_link::config::Settings;
use ara_realtime_link::connection_manager::{ConnectionEvent, ConnectionManager};
use ara_realtime_link::dispatcher::MessageHandler;
use ara_realtime_link::error;
use ara_realtime_link::shutdown::{shutdown_signal, GracefulShutdown};
use ara_realtime_link::telemetry::{init_telemetry, TelemetryGuard};
use ara_realtime_link::transport::WebSocketTransport;

/// Logs every routed message
struct LoggingHandler;

impl MessageHandler for LoggingHandler {
    fn on_stream_update(&self, connection_id: &str, payload: &Value) {
        tracing::info!(connection_id = %connection_id, payload = %payload, "Stream update");
    }

    fn on_metrics_update(&self, payload: &Value) {
        tracing::info!(payload = %payload, "Metrics update");
    }

    fn on_heartbeat_ack(&self, connection_id: &str) {
        tracing::debug!(connection_id = %connection_id, "Heartbeat ack");
    }
}

/// Bring up telemetry and the manager, in that order
fn start(settings: &Settings) -> error::Result<(TelemetryGuard, Arc<ConnectionManager>)> {
    let telemetry = init_telemetry(&settings.telemetry)?;
    tracing::info!(endpoints = settings.endpoints.len(), "Configuration loaded");

    let manager = ConnectionManager::new(
        settings.connection.clone(),
        Arc::new(WebSocketTransport::new()),
        Arc::new(LoggingHandler),
    )?;
    Ok((telemetry, Arc::new(manager)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load()?;
    let (_telemetry, manager) = start(&settings)?;

    let events = manager.subscribe_events();
    let event_log = tokio::spawn(log_events(events));

    for endpoint in &settings.endpoints {
        if let Err(e) = manager
            .add_connection(
                endpoint.id.clone(),
                endpoint.url.clone(),
                endpoint.subscriptions.clone(),
            )
            .await
        {
            tracing::error!(connection_id = %endpoint.id, error = %e, "Failed to add endpoint");
        }
    }

    let signal = shutdown_signal().await;
    tracing::info!(signal = signal, "Received shutdown signal");

    if let Ok(snapshot) = manager.metrics().await {
        tracing::info!(
            total_messages = snapshot.total_messages,
            reconnection_rate = snapshot.reconnection_rate,
            "Final metrics"
        );
    }

    GracefulShutdown::new(manager.clone()).execute(signal).await;
    drop(manager);
    let _ = event_log.await;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::ReconnectFailed { id }) => {
                tracing::error!(connection_id = %id, "Connection gave up reconnecting");
            }
            Ok(ConnectionEvent::CapacityExceeded) => {
                tracing::warn!("Connection capacity exceeded");
            }
            Ok(event) => tracing::debug!(event = ?event, "Connection event"),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped = skipped, "Event log lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
