//! Connection record and related types

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::transport::Socket;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub const ALL: [ConnectionStatus; 4] = [
        ConnectionStatus::Connecting,
        ConnectionStatus::Connected,
        ConnectionStatus::Disconnected,
        ConnectionStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        }
    }
}

/// Time of the last inbound traffic on a connection.
///
/// Written by the dispatcher on every inbound message, read by the
/// heartbeat monitor. Stored as microseconds since creation so it can be
/// updated without locking.
#[derive(Debug)]
pub struct Activity {
    created: Instant,
    last_us: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            created: Instant::now(),
            last_us: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let elapsed = self.created.elapsed().as_micros() as u64;
        self.last_us.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub fn last_seen(&self) -> Instant {
        self.created + Duration::from_micros(self.last_us.load(Ordering::Relaxed))
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen())
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// The manager's state for one logical connection.
///
/// Owned by the coordinator task; nothing else mutates it. `handle` is
/// `Some` exactly when `status` is `Connected`.
pub struct ConnectionRecord {
    pub id: String,
    pub url: String,
    pub origin: String,
    handle: Option<Socket>,
    status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub activity: Arc<Activity>,
    pub subscriptions: BTreeSet<String>,
    /// Bumped whenever a new connect attempt starts; stale signals carry an older epoch
    pub epoch: u64,
    /// In-flight connect or backoff timer
    pub pending: Option<JoinHandle<()>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ConnectionRecord {
    pub fn new(
        id: String,
        url: String,
        origin: String,
        subscriptions: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            id,
            url,
            origin,
            handle: None,
            status: ConnectionStatus::Connecting,
            reconnect_attempts: 0,
            activity: Arc::new(Activity::new()),
            subscriptions: subscriptions.into_iter().collect(),
            epoch: 0,
            pending: None,
            connected_at: None,
            last_error: None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn handle(&self) -> Option<&Socket> {
        self.handle.as_ref()
    }

    /// Install a freshly opened socket. A clean open ends the failure episode.
    pub fn mark_connected(&mut self, socket: Socket) {
        self.handle = Some(socket);
        self.status = ConnectionStatus::Connected;
        self.reconnect_attempts = 0;
        self.connected_at = Some(Utc::now());
        self.last_error = None;
        self.activity.touch();
    }

    /// Leave the connected state, handing back the socket if there was one
    pub fn mark_disconnected(&mut self) -> Option<Socket> {
        self.status = ConnectionStatus::Disconnected;
        self.connected_at = None;
        self.handle.take()
    }

    pub fn mark_connecting(&mut self) {
        debug_assert!(self.handle.is_none());
        self.status = ConnectionStatus::Connecting;
    }

    pub fn mark_error(&mut self, error: String) {
        debug_assert!(self.handle.is_none());
        self.status = ConnectionStatus::Error;
        self.last_error = Some(error);
    }

    /// Abort any in-flight connect or backoff timer
    pub fn cancel_pending(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }

    pub fn info(&self, now: Instant) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            url: self.url.clone(),
            status: self.status,
            reconnect_attempts: self.reconnect_attempts,
            subscriptions: self.subscriptions.iter().cloned().collect(),
            idle_ms: self.activity.idle_for(now).as_millis() as u64,
            connected_at: self.connected_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Read-only view of a connection record
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub url: String,
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub subscriptions: Vec<String>,
    /// Time since the last inbound traffic
    pub idle_ms: u64,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Advisory lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { id: String },
    Disconnected { id: String },
    ReconnectScheduled { id: String, attempt: u32, delay: Duration },
    ReconnectFailed { id: String },
    CapacityExceeded,
}

/// Outcome of a broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Connected records that passed the filter
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}
