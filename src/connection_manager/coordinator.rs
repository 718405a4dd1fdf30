//! The single writer of connection state.
//!
//! Public calls and internal signals (connect results, socket closes, stall
//! reports) arrive as [`Command`]s and are applied one at a time. The
//! coordinator never awaits I/O itself: connects and backoff timers run in
//! spawned tasks whose handles live on the record they affect, and every
//! signal they send back carries the record epoch it was started under.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ConnectionConfig;
use crate::dispatcher::{ClientMessage, MessageDispatcher};
use crate::error::{ConnectError, ManagerError};
use crate::metrics::{ConnectionMetrics, MetricsInput, MetricsSnapshot, MetricsTracker};
use crate::tasks::LivenessSample;
use crate::transport::{origin_of, EventSink, Frame, Socket, SocketEvent};

use super::backoff::{ReconnectDecision, ReconnectPolicy};
use super::connector::Connector;
use super::types::{
    BroadcastReport, ConnectionEvent, ConnectionInfo, ConnectionRecord, ConnectionStatus,
};

pub type BroadcastFilter = Box<dyn Fn(&ConnectionInfo) -> bool + Send>;

pub(crate) enum Command {
    Add {
        id: String,
        url: String,
        subscriptions: Vec<String>,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Send {
        id: String,
        frame: Frame,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    Broadcast {
        frame: Frame,
        filter: Option<BroadcastFilter>,
        reply: oneshot::Sender<BroadcastReport>,
    },
    Status {
        id: String,
        reply: oneshot::Sender<Option<ConnectionInfo>>,
    },
    List {
        reply: oneshot::Sender<Vec<ConnectionInfo>>,
    },
    Metrics {
        reply: oneshot::Sender<MetricsSnapshot>,
    },
    Heartbeat {
        reply: oneshot::Sender<Vec<LivenessSample>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Opened {
        id: String,
        epoch: u64,
        result: Result<Socket, ConnectError>,
    },
    SocketClosed {
        id: String,
        epoch: u64,
        clean: bool,
        reason: Option<String>,
    },
    Stalled {
        id: String,
        epoch: u64,
        idle: Duration,
    },
}

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;

/// Everything a record transition needs besides the record itself
struct Context {
    config: ConnectionConfig,
    policy: ReconnectPolicy,
    connector: Connector,
    dispatcher: Arc<MessageDispatcher>,
    commands: CommandSender,
    events: broadcast::Sender<ConnectionEvent>,
    next_epoch: u64,
    open_attempts: u64,
    reconnect_attempts: u64,
    tracker: MetricsTracker,
}

pub(crate) struct Coordinator {
    records: HashMap<String, ConnectionRecord>,
    ctx: Context,
    inbox: mpsc::UnboundedReceiver<Command>,
    shutdown: broadcast::Sender<()>,
    background: Vec<JoinHandle<()>>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConnectionConfig,
        connector: Connector,
        dispatcher: Arc<MessageDispatcher>,
        commands: CommandSender,
        inbox: mpsc::UnboundedReceiver<Command>,
        events: broadcast::Sender<ConnectionEvent>,
        shutdown: broadcast::Sender<()>,
        background: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            records: HashMap::new(),
            ctx: Context {
                policy: ReconnectPolicy::from_config(&config),
                config,
                connector,
                dispatcher,
                commands,
                events,
                next_epoch: 0,
                open_attempts: 0,
                reconnect_attempts: 0,
                tracker: MetricsTracker::new(),
            },
            inbox,
            shutdown,
            background,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(
            max_connections = self.ctx.config.max_connections,
            max_reconnect_attempts = self.ctx.config.max_reconnect_attempts,
            "Connection coordinator started"
        );

        while let Some(command) = self.inbox.recv().await {
            if !self.handle(command) {
                break;
            }
        }

        tracing::info!("Connection coordinator stopped");
    }

    /// Apply one command. Returns `false` once the manager has shut down.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Add {
                id,
                url,
                subscriptions,
                reply,
            } => {
                let _ = reply.send(self.add(id, url, subscriptions));
            }
            Command::Remove { id, reply } => {
                let _ = reply.send(self.remove(&id));
            }
            Command::Send { id, frame, reply } => {
                let _ = reply.send(self.send(id, frame));
            }
            Command::Broadcast {
                frame,
                filter,
                reply,
            } => {
                let _ = reply.send(self.broadcast(frame, filter));
            }
            Command::Status { id, reply } => {
                let now = Instant::now();
                let _ = reply.send(self.records.get(&id).map(|r| r.info(now)));
            }
            Command::List { reply } => {
                let now = Instant::now();
                let mut infos: Vec<_> = self.records.values().map(|r| r.info(now)).collect();
                infos.sort_by(|a, b| a.id.cmp(&b.id));
                let _ = reply.send(infos);
            }
            Command::Metrics { reply } => {
                let _ = reply.send(self.recompute_metrics());
            }
            Command::Heartbeat { reply } => {
                let _ = reply.send(self.probe_connected());
                self.recompute_metrics();
            }
            Command::Opened { id, epoch, result } => self.opened(id, epoch, result),
            Command::SocketClosed {
                id,
                epoch,
                clean,
                reason,
            } => self.socket_closed(&id, epoch, clean, reason),
            Command::Stalled { id, epoch, idle } => self.stalled(&id, epoch, idle),
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn add(
        &mut self,
        id: String,
        url: String,
        subscriptions: Vec<String>,
    ) -> Result<(), ManagerError> {
        if let Some(existing) = self.records.get(&id) {
            if existing.status() != ConnectionStatus::Error {
                return Err(ManagerError::DuplicateId(id));
            }
        }

        let active = self
            .records
            .values()
            .filter(|r| r.status() != ConnectionStatus::Error)
            .count();
        let max = self.ctx.config.max_connections;
        if active >= max {
            tracing::warn!(connection_id = %id, current = active, max = max, "Connection limit reached");
            self.ctx.emit(ConnectionEvent::CapacityExceeded);
            return Err(ManagerError::CapacityExceeded {
                current: active,
                max,
            });
        }

        let origin = origin_of(&url).map_err(|e| ManagerError::InvalidUrl {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        // Re-adding an errored connection replaces it
        if let Some(mut errored) = self.records.remove(&id) {
            errored.cancel_pending();
            self.ctx.dispatcher.unregister(&id);
        }

        let mut record = ConnectionRecord::new(id.clone(), url, origin, subscriptions);
        self.ctx
            .dispatcher
            .register(&id, record.activity.clone());
        self.ctx.start_connect(&mut record, Duration::ZERO);

        tracing::info!(connection_id = %id, url = %record.url, "Connection added");
        self.records.insert(id, record);
        Ok(())
    }

    fn remove(&mut self, id: &str) -> bool {
        let Some(mut record) = self.records.remove(id) else {
            return false;
        };

        record.cancel_pending();
        let dropped = self.ctx.dispatcher.unregister(id);

        if let Some(socket) = record.mark_disconnected() {
            if self.ctx.config.reuse_idle_sockets {
                self.ctx.connector.pool().release(&record.origin, socket);
            } else {
                socket.close();
            }
        }

        tracing::info!(connection_id = %id, dropped_messages = dropped, "Connection removed");
        true
    }

    fn send(&self, id: String, frame: Frame) -> Result<(), ManagerError> {
        let Some(socket) = self.records.get(&id).and_then(|r| r.handle()) else {
            return Err(ManagerError::NotConnected(id));
        };

        socket.send(frame).map_err(|_| ManagerError::SendOnClosed(id))
    }

    fn broadcast(&self, frame: Frame, filter: Option<BroadcastFilter>) -> BroadcastReport {
        let now = Instant::now();
        let mut report = BroadcastReport::default();

        for record in self.records.values() {
            let Some(socket) = record.handle() else {
                continue;
            };
            if let Some(filter) = filter.as_ref() {
                if !filter(&record.info(now)) {
                    continue;
                }
            }

            report.attempted += 1;
            match socket.send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(connection_id = %record.id, error = %e, "Broadcast send failed");
                }
            }
        }

        tracing::debug!(
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast completed"
        );
        report
    }

    /// Send a keepalive on every connected socket and report how long each
    /// has been silent. Probe failures are only logged; staleness decides.
    fn probe_connected(&self) -> Vec<LivenessSample> {
        let now = Instant::now();
        let probe = ClientMessage::Ping.to_frame();

        self.records
            .values()
            .filter_map(|record| {
                let socket = record.handle()?;
                if let Err(e) = socket.send(probe.clone()) {
                    tracing::debug!(connection_id = %record.id, error = %e, "Keepalive probe failed");
                }
                Some(LivenessSample {
                    id: record.id.clone(),
                    epoch: record.epoch,
                    idle: record.activity.idle_for(now),
                })
            })
            .collect()
    }

    fn opened(&mut self, id: String, epoch: u64, result: Result<Socket, ConnectError>) {
        let Some(record) = self
            .records
            .get_mut(&id)
            .filter(|r| r.epoch == epoch && r.status() == ConnectionStatus::Connecting)
        else {
            // Removed or superseded while the connect was in flight
            if let Ok(socket) = result {
                socket.close();
            }
            return;
        };
        record.pending = None;

        match result {
            Ok(socket) => self.ctx.install(record, socket),
            Err(e) => {
                ConnectionMetrics::record_connect_failure();
                tracing::warn!(
                    connection_id = %id,
                    error = %e,
                    reconnect_attempts = record.reconnect_attempts,
                    "Connection attempt failed"
                );
                record.last_error = Some(e.to_string());
                self.ctx.schedule_reconnect(record);
            }
        }
    }

    fn socket_closed(&mut self, id: &str, epoch: u64, clean: bool, reason: Option<String>) {
        let Some(record) = connected_record(&mut self.records, id, epoch) else {
            return;
        };

        if let Some(socket) = record.mark_disconnected() {
            socket.close();
        }
        self.ctx.emit(ConnectionEvent::Disconnected { id: id.to_string() });

        if clean {
            tracing::info!(connection_id = %id, reason = ?reason, "Connection closed by remote");
            return;
        }

        tracing::warn!(connection_id = %id, reason = ?reason, "Connection lost");
        record.last_error = reason;
        self.ctx.schedule_reconnect(record);
    }

    fn stalled(&mut self, id: &str, epoch: u64, idle: Duration) {
        let Some(record) = connected_record(&mut self.records, id, epoch) else {
            return;
        };

        ConnectionMetrics::record_stale();
        tracing::warn!(
            connection_id = %id,
            idle_ms = idle.as_millis() as u64,
            "Connection stalled, reconnecting"
        );

        if let Some(socket) = record.mark_disconnected() {
            socket.close();
        }
        record.last_error = Some(format!("no traffic for {}ms", idle.as_millis()));
        self.ctx.emit(ConnectionEvent::Disconnected { id: id.to_string() });
        self.ctx.schedule_reconnect(record);
    }

    fn recompute_metrics(&mut self) -> MetricsSnapshot {
        let mut counts: HashMap<ConnectionStatus, usize> = HashMap::new();
        for record in self.records.values() {
            *counts.entry(record.status()).or_default() += 1;
        }
        let by_status: Vec<_> = ConnectionStatus::ALL
            .iter()
            .map(|status| (*status, counts.get(status).copied().unwrap_or(0)))
            .collect();

        let pooled = self.ctx.connector.pool().idle_count();
        ConnectionMetrics::set_status_counts(&by_status);
        ConnectionMetrics::set_pooled(pooled);

        let stats = self.ctx.dispatcher.stats();
        self.ctx.tracker.recompute(MetricsInput {
            total_connections: self.records.len(),
            active_connections: counts
                .get(&ConnectionStatus::Connected)
                .copied()
                .unwrap_or(0),
            idle_pooled_sockets: pooled,
            messages_received: stats.received,
            messages_delivered: stats.delivered,
            total_latency_us: stats.total_latency_us,
            malformed_messages: stats.malformed,
            open_attempts: self.ctx.open_attempts,
            reconnect_attempts: self.ctx.reconnect_attempts,
        })
    }

    fn shutdown(&mut self) {
        let count = self.records.len();

        for (id, mut record) in self.records.drain() {
            record.cancel_pending();
            self.ctx.dispatcher.unregister(&id);
            if let Some(socket) = record.mark_disconnected() {
                socket.close();
            }
        }
        let pooled = self.ctx.connector.pool().close_all();

        let _ = self.shutdown.send(());
        for task in self.background.drain(..) {
            task.abort();
        }
        self.inbox.close();

        tracing::info!(
            connections = count,
            pooled_sockets = pooled,
            "Connection manager shut down"
        );
    }
}

/// The record `id`, only if it is still connected under `epoch`
fn connected_record<'a>(
    records: &'a mut HashMap<String, ConnectionRecord>,
    id: &str,
    epoch: u64,
) -> Option<&'a mut ConnectionRecord> {
    records
        .get_mut(id)
        .filter(|r| r.epoch == epoch && r.status() == ConnectionStatus::Connected)
}

impl Context {
    fn emit(&self, event: ConnectionEvent) {
        // Advisory; nobody has to be listening
        let _ = self.events.send(event);
    }

    /// Spawn a connect attempt after `delay`, superseding any earlier one.
    fn start_connect(&mut self, record: &mut ConnectionRecord, delay: Duration) {
        record.cancel_pending();
        self.next_epoch += 1;
        record.epoch = self.next_epoch;
        record.mark_connecting();
        self.open_attempts += 1;

        let connector = self.connector.clone();
        let commands = self.commands.clone();
        let id = record.id.clone();
        let url = record.url.clone();
        let epoch = record.epoch;

        record.pending = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = connector.open(&id, &url).await;
            let _ = commands.send(Command::Opened { id, epoch, result });
        }));
    }

    /// Attach a freshly opened socket and replay subscriptions on it
    fn install(&mut self, record: &mut ConnectionRecord, socket: Socket) {
        socket.attach(self.event_sink(&record.id, record.epoch));

        if !record.subscriptions.is_empty() {
            let subscribe = ClientMessage::Subscribe {
                channels: record.subscriptions.iter().cloned().collect(),
            };
            if let Err(e) = socket.send(subscribe.to_frame()) {
                tracing::warn!(connection_id = %record.id, error = %e, "Failed to replay subscriptions");
            }
        }

        record.mark_connected(socket);
        ConnectionMetrics::record_connected();
        tracing::info!(
            connection_id = %record.id,
            url = %record.url,
            subscriptions = record.subscriptions.len(),
            "Connection established"
        );
        self.emit(ConnectionEvent::Connected {
            id: record.id.clone(),
        });
    }

    /// Apply the reconnection policy to a record that just lost (or failed
    /// to gain) its socket.
    fn schedule_reconnect(&mut self, record: &mut ConnectionRecord) {
        match self.policy.next(record.reconnect_attempts) {
            ReconnectDecision::GiveUp { attempts } => {
                record.cancel_pending();
                record.mark_error(ConnectError::MaxReconnectExceeded { attempts }.to_string());
                ConnectionMetrics::record_reconnects_exhausted();
                tracing::error!(
                    connection_id = %record.id,
                    attempts = attempts,
                    "Reconnect attempts exhausted, giving up"
                );
                self.emit(ConnectionEvent::ReconnectFailed {
                    id: record.id.clone(),
                });
            }
            ReconnectDecision::Retry { attempt, delay } => {
                record.reconnect_attempts = attempt;
                self.reconnect_attempts += 1;
                ConnectionMetrics::record_reconnect_scheduled();
                tracing::info!(
                    connection_id = %record.id,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnect scheduled"
                );
                self.emit(ConnectionEvent::ReconnectScheduled {
                    id: record.id.clone(),
                    attempt,
                    delay,
                });
                self.start_connect(record, delay);
            }
        }
    }

    /// Route socket events for one record epoch into the dispatcher and
    /// back to the coordinator.
    fn event_sink(&self, id: &str, epoch: u64) -> EventSink {
        let id = id.to_string();
        let dispatcher = self.dispatcher.clone();
        let commands = self.commands.clone();

        Box::new(move |event| match event {
            SocketEvent::Message(frame) => {
                dispatcher.enqueue(&id, frame);
            }
            SocketEvent::Closed { clean, reason } => {
                let _ = commands.send(Command::SocketClosed {
                    id: id.clone(),
                    epoch,
                    clean,
                    reason,
                });
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::ConnectionPool;
    use crate::dispatcher::{MessageHandler, MessageRouter};
    use crate::transport::{MemoryTransport, Outbound};
    use serde_json::Value;

    struct Ignore;

    impl MessageHandler for Ignore {
        fn on_stream_update(&self, _connection_id: &str, _payload: &Value) {}
        fn on_metrics_update(&self, _payload: &Value) {}
    }

    fn coordinator() -> (Coordinator, CommandSender) {
        let config = ConnectionConfig::default();
        let (commands, inbox) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(16);
        let (shutdown, _) = broadcast::channel(1);
        let connector = Connector::new(
            Arc::new(MemoryTransport::new()),
            Arc::new(ConnectionPool::new()),
            config.connect_timeout(),
        );
        let dispatcher = Arc::new(MessageDispatcher::new(
            MessageRouter::new(Arc::new(Ignore)),
            config.drain_batch_size,
        ));

        let coordinator = Coordinator::new(
            config,
            connector,
            dispatcher,
            commands.clone(),
            inbox,
            events,
            shutdown,
            Vec::new(),
        );
        (coordinator, commands)
    }

    #[tokio::test]
    async fn test_socket_opened_after_shutdown_is_closed() {
        let (coordinator, commands) = coordinator();
        let (socket, mut driver) = Socket::pair("mem://feed");

        let (reply, done) = oneshot::channel();
        commands.send(Command::Shutdown { reply }).unwrap();
        commands
            .send(Command::Opened {
                id: "a".to_string(),
                epoch: 1,
                result: Ok(socket),
            })
            .unwrap();

        coordinator.run().await;
        done.await.unwrap();

        assert!(!driver.is_open());
        assert_eq!(driver.next_outbound().await, Some(Outbound::Close));
    }

    #[tokio::test]
    async fn test_opened_for_unknown_record_is_closed() {
        let (mut coordinator, _commands) = coordinator();
        let (socket, mut driver) = Socket::pair("mem://feed");

        assert!(coordinator.handle(Command::Opened {
            id: "ghost".to_string(),
            epoch: 7,
            result: Ok(socket),
        }));
        assert!(!driver.is_open());
        assert_eq!(driver.try_next_outbound(), Some(Outbound::Close));
    }
}
