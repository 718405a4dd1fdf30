//! In-process transport with scripted open outcomes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{origin_of, Frame, Outbound, Socket, SocketDriver, SocketEvent, Transport, TransportError};

/// What the next `open` against a URL does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenBehaviour {
    /// Open succeeds immediately
    Accept,
    /// Open fails with a handshake error
    Refuse(String),
    /// Open never completes
    Hang,
}

#[derive(Default)]
struct MemoryState {
    scripts: HashMap<String, VecDeque<OpenBehaviour>>,
    fallback: HashMap<String, OpenBehaviour>,
    attempts: HashMap<String, Vec<Instant>>,
    peers: HashMap<String, VecDeque<MemoryPeer>>,
}

/// Transport whose remote ends live in the same process.
///
/// Every successful open yields a [`MemoryPeer`] that plays the server.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one-shot outcomes for the next opens of `url`.
    pub fn script(&self, url: &str, outcomes: impl IntoIterator<Item = OpenBehaviour>) {
        self.state
            .lock()
            .scripts
            .entry(url.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Outcome used for `url` once its script runs out (default: accept).
    pub fn set_default(&self, url: &str, behaviour: OpenBehaviour) {
        self.state.lock().fallback.insert(url.to_string(), behaviour);
    }

    /// Instants at which `open` was called for `url`
    pub fn open_attempts(&self, url: &str) -> Vec<Instant> {
        self.state
            .lock()
            .attempts
            .get(url)
            .cloned()
            .unwrap_or_default()
    }

    /// Take the oldest not-yet-claimed peer opened for `url`.
    pub fn take_peer(&self, url: &str) -> Option<MemoryPeer> {
        self.state.lock().peers.get_mut(url)?.pop_front()
    }

    fn next_behaviour(&self, url: &str) -> OpenBehaviour {
        let mut state = self.state.lock();
        state.attempts.entry(url.to_string()).or_default().push(Instant::now());

        if let Some(next) = state.scripts.get_mut(url).and_then(|s| s.pop_front()) {
            return next;
        }
        state
            .fallback
            .get(url)
            .cloned()
            .unwrap_or(OpenBehaviour::Accept)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &str) -> Result<Socket, TransportError> {
        let origin = origin_of(url)?;

        match self.next_behaviour(url) {
            OpenBehaviour::Accept => {
                let (socket, driver) = Socket::pair(origin);
                self.state
                    .lock()
                    .peers
                    .entry(url.to_string())
                    .or_default()
                    .push_back(MemoryPeer { driver });
                Ok(socket)
            }
            OpenBehaviour::Refuse(reason) => Err(TransportError::Handshake(reason)),
            OpenBehaviour::Hang => std::future::pending().await,
        }
    }
}

/// Server side of an in-memory socket
pub struct MemoryPeer {
    driver: SocketDriver,
}

impl MemoryPeer {
    pub fn push(&self, frame: impl Into<Frame>) {
        self.driver.deliver(SocketEvent::Message(frame.into()));
    }

    pub fn push_json(&self, value: serde_json::Value) {
        self.push(value);
    }

    /// Close from the remote end.
    pub fn close(&self, clean: bool) {
        self.driver.deliver(SocketEvent::Closed {
            clean,
            reason: None,
        });
    }

    /// Whether the local side still holds the socket open
    pub fn is_open(&self) -> bool {
        self.driver.is_open()
    }

    /// Frames written by the local side so far, in order.
    pub fn received(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(outbound) = self.driver.try_next_outbound() {
            if let Outbound::Frame(frame) = outbound {
                frames.push(frame);
            }
        }
        frames
    }

    /// Whether the local side requested a close
    pub fn close_requested(&mut self) -> bool {
        let mut requested = false;
        while let Some(outbound) = self.driver.try_next_outbound() {
            if outbound == Outbound::Close {
                requested = true;
            }
        }
        requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_fallback() {
        let transport = MemoryTransport::new();
        transport.script(
            "mem://feed/a",
            [OpenBehaviour::Refuse("nope".into()), OpenBehaviour::Accept],
        );

        assert!(matches!(
            transport.open("mem://feed/a").await,
            Err(TransportError::Handshake(_))
        ));
        assert!(transport.open("mem://feed/a").await.is_ok());
        assert!(transport.open("mem://feed/a").await.is_ok());
        assert_eq!(transport.open_attempts("mem://feed/a").len(), 3);
    }

    #[tokio::test]
    async fn test_peer_sees_sent_frames() {
        let transport = MemoryTransport::new();
        let socket = transport.open("mem://feed/a").await.unwrap();
        let mut peer = transport.take_peer("mem://feed/a").unwrap();

        socket.send(Frame::from("hi")).unwrap();
        assert_eq!(peer.received(), vec![Frame::from("hi")]);

        socket.close();
        assert!(!peer.is_open());
        assert!(peer.close_requested());
    }
}
