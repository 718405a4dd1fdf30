//! Duplex message transports.
//!
//! A [`Transport`] opens a [`Socket`], the handle a connection record owns
//! exclusively. The transport keeps the matching [`SocketDriver`] and uses it
//! to push inbound events and pull outbound frames.

mod memory;
mod websocket;

pub use memory::{MemoryPeer, MemoryTransport, OpenBehaviour};
pub use websocket::WebSocketTransport;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

/// A single message frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Text(text) => text.as_bytes(),
            Frame::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Frame {
    fn from(text: String) -> Self {
        Frame::Text(text)
    }
}

impl From<&str> for Frame {
    fn from(text: &str) -> Self {
        Frame::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Frame {
    fn from(bytes: Vec<u8>) -> Self {
        Frame::Binary(bytes)
    }
}

impl From<serde_json::Value> for Frame {
    fn from(value: serde_json::Value) -> Self {
        Frame::Text(value.to_string())
    }
}

/// Signals raised by the transport side of a socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Message(Frame),
    Closed { clean: bool, reason: Option<String> },
}

/// Work items flowing from a [`Socket`] to its driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Frame),
    Close,
}

/// Error type for transport operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Socket is closed")]
    Closed,
}

/// Callback receiving socket events. Must not block.
pub type EventSink = Box<dyn Fn(SocketEvent) + Send + Sync>;

/// Opens sockets to remote endpoints.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new socket to `url`. Resolves once the socket is ready to send.
    async fn open(&self, url: &str) -> Result<Socket, TransportError>;
}

#[derive(Default)]
struct SinkSlot {
    sink: Option<EventSink>,
    /// Events that arrived before the first sink attached
    backlog: VecDeque<SocketEvent>,
    /// Set by the first attach; later gaps (pooled sockets) drop messages
    attached_before: bool,
}

struct SocketShared {
    origin: String,
    open: AtomicBool,
    outbound: mpsc::UnboundedSender<Outbound>,
    slot: Mutex<SinkSlot>,
}

/// Record-side half of an open socket.
pub struct Socket {
    shared: Arc<SocketShared>,
}

/// Transport-side half of an open socket.
pub struct SocketDriver {
    shared: Arc<SocketShared>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl Socket {
    /// Create a connected socket/driver pair for `origin`.
    pub fn pair(origin: impl Into<String>) -> (Socket, SocketDriver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SocketShared {
            origin: origin.into(),
            open: AtomicBool::new(true),
            outbound: tx,
            slot: Mutex::new(SinkSlot::default()),
        });

        (
            Socket {
                shared: shared.clone(),
            },
            SocketDriver {
                shared,
                outbound: rx,
            },
        )
    }

    pub fn origin(&self) -> &str {
        &self.shared.origin
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Queue a frame for the transport. Never waits.
    pub fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.shared
            .outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| TransportError::Closed)
    }

    /// Route events to `sink`, flushing anything buffered while detached.
    pub fn attach(&self, sink: EventSink) {
        let mut slot = self.shared.slot.lock();
        while let Some(event) = slot.backlog.pop_front() {
            sink(event);
        }
        slot.sink = Some(sink);
        slot.attached_before = true;
    }

    /// Stop routing events. Returns once no sink call is in progress.
    pub fn detach(&self) {
        self.shared.slot.lock().sink = None;
    }

    /// Discard events buffered while no sink was attached.
    pub fn clear_backlog(&self) {
        self.shared.slot.lock().backlog.clear();
    }


    /// Detach and ask the transport to close the socket. Dropping does the same.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.detach();
        if self.shared.open.swap(false, Ordering::AcqRel) {
            let _ = self.shared.outbound.send(Outbound::Close);
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("origin", &self.shared.origin)
            .field("open", &self.is_open())
            .finish()
    }
}

impl SocketDriver {
    pub fn origin(&self) -> &str {
        &self.shared.origin
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    /// Hand an event to the attached sink.
    ///
    /// Without a sink, events are buffered only until the first attach. A
    /// socket detached after that (idle in the pool) drops inbound messages;
    /// its close is still reflected by [`Socket::is_open`].
    pub fn deliver(&self, event: SocketEvent) {
        let closed = matches!(event, SocketEvent::Closed { .. });
        if closed {
            self.shared.open.store(false, Ordering::Release);
        }

        let mut slot = self.shared.slot.lock();
        if let Some(sink) = slot.sink.as_ref() {
            sink(event);
        } else if !slot.attached_before || closed {
            slot.backlog.push_back(event);
        }
    }

    /// Next frame the record side wants written. `None` once the socket is gone.
    pub async fn next_outbound(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    pub fn try_next_outbound(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }

    /// Events held for a sink that has not attached yet
    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.shared.slot.lock().backlog.len()
    }
}

/// Derive the pooling key (`scheme://host:port`) of a URL.
pub fn origin_of(url: &str) -> Result<String, TransportError> {
    let parsed = Url::parse(url).map_err(|e| TransportError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    let host = parsed.host_str().ok_or_else(|| TransportError::InvalidUrl {
        url: url.to_string(),
        reason: "missing host".to_string(),
    })?;

    match parsed.port_or_known_default() {
        Some(port) => Ok(format!("{}://{}:{}", parsed.scheme(), host, port)),
        None => Ok(format!("{}://{}", parsed.scheme(), host)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_origin_defaults_port() {
        assert_eq!(origin_of("ws://example.com/feed").unwrap(), "ws://example.com:80");
        assert_eq!(origin_of("wss://example.com/feed").unwrap(), "wss://example.com:443");
        assert_eq!(origin_of("ws://localhost:9001/a?b=c").unwrap(), "ws://localhost:9001");
        assert_eq!(origin_of("mem://agents/stream").unwrap(), "mem://agents");
    }

    #[test]
    fn test_origin_rejects_garbage() {
        assert!(matches!(
            origin_of("not a url"),
            Err(TransportError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_events_buffer_until_attach() {
        let (socket, driver) = Socket::pair("mem://a");
        driver.deliver(SocketEvent::Message(Frame::from("one")));
        driver.deliver(SocketEvent::Message(Frame::from("two")));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        socket.attach(Box::new(move |event| sink_seen.lock().push(event)));
        driver.deliver(SocketEvent::Message(Frame::from("three")));

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], SocketEvent::Message(Frame::from("one")));
        assert_eq!(seen[2], SocketEvent::Message(Frame::from("three")));
    }

    #[test]
    fn test_detach_stops_delivery() {
        let (socket, driver) = Socket::pair("mem://a");
        let count = Arc::new(AtomicUsize::new(0));
        let sink_count = count.clone();
        socket.attach(Box::new(move |_| {
            sink_count.fetch_add(1, Ordering::Relaxed);
        }));

        driver.deliver(SocketEvent::Message(Frame::from("x")));
        socket.detach();
        driver.deliver(SocketEvent::Message(Frame::from("y")));

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_send_after_close_fails() {
        let (socket, mut driver) = Socket::pair("mem://a");
        socket.send(Frame::from("hello")).unwrap();
        driver.deliver(SocketEvent::Closed {
            clean: false,
            reason: None,
        });

        assert!(!socket.is_open());
        assert!(matches!(socket.send(Frame::from("late")), Err(TransportError::Closed)));
        assert_eq!(
            driver.try_next_outbound(),
            Some(Outbound::Frame(Frame::from("hello")))
        );
    }

    #[tokio::test]
    async fn test_drop_closes_transport() {
        let (socket, mut driver) = Socket::pair("mem://a");
        drop(socket);

        assert!(!driver.is_open());
        assert_eq!(driver.next_outbound().await, Some(Outbound::Close));
        assert_eq!(driver.next_outbound().await, None);
    }

    #[test]
    fn test_detached_after_attach_drops_messages() {
        let (socket, driver) = Socket::pair("mem://a");
        socket.attach(Box::new(|_| {}));
        socket.detach();

        for n in 0..10_000 {
            driver.deliver(SocketEvent::Message(Frame::from(n.to_string())));
        }
        assert_eq!(driver.buffered(), 0);

        driver.deliver(SocketEvent::Closed {
            clean: true,
            reason: None,
        });
        assert!(!socket.is_open());
        assert_eq!(driver.buffered(), 1);
    }

    #[test]
    fn test_close_notifies_driver() {
        let (socket, mut driver) = Socket::pair("mem://a");
        socket.close();
        assert_eq!(driver.try_next_outbound(), Some(Outbound::Close));
        assert!(!driver.is_open());
    }
}
