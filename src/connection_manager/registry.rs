use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::ConnectionConfig;
use crate::dispatcher::{
    DispatcherStatsSnapshot, MessageDispatcher, MessageHandler, MessageRouter,
};
use crate::error::{ConfigValidationError, ManagerError};
use crate::metrics::MetricsSnapshot;
use crate::tasks::{DrainTask, HeartbeatTask};
use crate::transport::{Frame, Transport};

use super::connector::Connector;
use super::coordinator::{BroadcastFilter, Command, CommandSender, Coordinator};
use super::pool::ConnectionPool;
use super::types::{BroadcastReport, ConnectionEvent, ConnectionInfo};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Manages a bounded set of outbound realtime connections.
///
/// Cheap handle over the coordinator task. Every call is answered by the
/// coordinator without waiting on network I/O; connects, backoff and
/// heartbeat run in the background and surface through
/// [`subscribe_events`](Self::subscribe_events) and [`status`](Self::status).
///
/// Must be created inside a Tokio runtime.
pub struct ConnectionManager {
    commands: CommandSender,
    events: broadcast::Sender<ConnectionEvent>,
    dispatcher: Arc<MessageDispatcher>,
    config: ConnectionConfig,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self, ConfigValidationError> {
        config.validate()?;

        let (commands, inbox) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = broadcast::channel(1);

        let dispatcher = Arc::new(MessageDispatcher::new(
            MessageRouter::new(handler),
            config.drain_batch_size,
        ));
        let connector = Connector::new(
            transport,
            Arc::new(ConnectionPool::new()),
            config.connect_timeout(),
        );

        let heartbeat = HeartbeatTask::new(config.clone(), commands.clone(), shutdown.subscribe());
        let drain = DrainTask::new(
            dispatcher.clone(),
            config.drain_interval(),
            shutdown.subscribe(),
        );
        let background = vec![tokio::spawn(heartbeat.run()), tokio::spawn(drain.run())];

        let coordinator = Coordinator::new(
            config.clone(),
            connector,
            dispatcher.clone(),
            commands.clone(),
            inbox,
            events.clone(),
            shutdown,
            background,
        );
        tokio::spawn(coordinator.run());

        Ok(Self {
            commands,
            events,
            dispatcher,
            config,
        })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ManagerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| ManagerError::ShutDown)?;
        response.await.map_err(|_| ManagerError::ShutDown)
    }

    /// Register a connection and start connecting in the background.
    ///
    /// `subscriptions` are replayed after every successful (re)connect.
    pub async fn add_connection<S: Into<String>>(
        &self,
        id: impl Into<String>,
        url: impl Into<String>,
        subscriptions: impl IntoIterator<Item = S>,
    ) -> Result<(), ManagerError> {
        let (id, url) = (id.into(), url.into());
        let subscriptions = subscriptions.into_iter().map(Into::into).collect();

        self.request(|reply| Command::Add {
            id,
            url,
            subscriptions,
            reply,
        })
        .await?
    }

    /// Close and forget a connection. Returns whether it existed.
    pub async fn remove_connection(&self, id: &str) -> Result<bool, ManagerError> {
        let id = id.to_string();
        self.request(|reply| Command::Remove { id, reply }).await
    }

    /// Send on a connected socket. Never buffered for later delivery.
    pub async fn send(&self, id: &str, message: impl Into<Frame>) -> Result<(), ManagerError> {
        let id = id.to_string();
        let frame = message.into();
        self.request(|reply| Command::Send { id, frame, reply })
            .await?
    }

    /// Best-effort fan-out to every connected socket
    pub async fn broadcast(&self, message: impl Into<Frame>) -> Result<BroadcastReport, ManagerError> {
        let frame = message.into();
        self.request(|reply| Command::Broadcast {
            frame,
            filter: None,
            reply,
        })
        .await
    }

    /// Like [`broadcast`](Self::broadcast), limited to connections the filter accepts
    pub async fn broadcast_filtered<F>(
        &self,
        message: impl Into<Frame>,
        filter: F,
    ) -> Result<BroadcastReport, ManagerError>
    where
        F: Fn(&ConnectionInfo) -> bool + Send + 'static,
    {
        let frame = message.into();
        let filter: BroadcastFilter = Box::new(filter);
        self.request(|reply| Command::Broadcast {
            frame,
            filter: Some(filter),
            reply,
        })
        .await
    }

    pub async fn status(&self, id: &str) -> Result<Option<ConnectionInfo>, ManagerError> {
        let id = id.to_string();
        self.request(|reply| Command::Status { id, reply }).await
    }

    /// Snapshot of every record, ordered by id
    pub async fn connections(&self) -> Result<Vec<ConnectionInfo>, ManagerError> {
        self.request(|reply| Command::List { reply }).await
    }

    pub async fn metrics(&self) -> Result<MetricsSnapshot, ManagerError> {
        self.request(|reply| Command::Metrics { reply }).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Inbound messages queued but not yet delivered
    pub fn pending_messages(&self) -> usize {
        self.dispatcher.pending()
    }

    /// Counters of the inbound dispatcher
    pub fn inbound_stats(&self) -> DispatcherStatsSnapshot {
        self.dispatcher.stats()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Close every socket, cancel every timer and stop the background tasks.
    ///
    /// Every later call, including a second `shutdown`, returns
    /// [`ManagerError::ShutDown`].
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let (reply, _) = oneshot::channel();
        let _ = self.commands.send(Command::Shutdown { reply });
    }
}
