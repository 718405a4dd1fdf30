//! Idle socket cache keyed by origin.

use dashmap::DashMap;

use crate::transport::Socket;

/// Caches still-open sockets so a new logical connection to the same origin
/// can skip the handshake. Not a resource guard: capacity is bounded by the
/// manager's connection limit.
#[derive(Default)]
pub struct ConnectionPool {
    idle: DashMap<String, Vec<Socket>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop a cached socket for `origin`, discarding any that closed while idle.
    pub fn acquire(&self, origin: &str) -> Option<Socket> {
        let mut sockets = self.idle.get_mut(origin)?;

        while let Some(socket) = sockets.pop() {
            if socket.is_open() {
                socket.clear_backlog();
                tracing::debug!(origin = %origin, "Reusing pooled socket");
                return Some(socket);
            }
            tracing::debug!(origin = %origin, "Discarding pooled socket closed while idle");
        }

        drop(sockets);
        self.idle.remove_if(origin, |_, sockets| sockets.is_empty());
        None
    }

    /// Return a socket for reuse. The caller must no longer use it.
    pub fn release(&self, origin: &str, socket: Socket) {
        socket.detach();
        if !socket.is_open() {
            return;
        }
        self.idle.entry(origin.to_string()).or_default().push(socket);
    }

    /// Close every cached socket
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for mut entry in self.idle.iter_mut() {
            for socket in entry.value_mut().drain(..) {
                socket.close();
                closed += 1;
            }
        }
        self.idle.clear();
        closed
    }

    pub fn idle_count(&self) -> usize {
        self.idle.iter().map(|entry| entry.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Frame, SocketEvent};

    #[test]
    fn test_acquire_miss() {
        let pool = ConnectionPool::new();
        assert!(pool.acquire("ws://a:80").is_none());
    }

    #[test]
    fn test_release_then_acquire() {
        let pool = ConnectionPool::new();
        let (socket, _driver) = Socket::pair("ws://a:80");
        pool.release("ws://a:80", socket);
        assert_eq!(pool.idle_count(), 1);

        assert!(pool.acquire("ws://b:80").is_none());
        assert!(pool.acquire("ws://a:80").is_some());
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_closed_while_idle_is_skipped() {
        let pool = ConnectionPool::new();
        let (socket, driver) = Socket::pair("ws://a:80");
        pool.release("ws://a:80", socket);
        driver.deliver(SocketEvent::Closed {
            clean: true,
            reason: None,
        });

        assert!(pool.acquire("ws://a:80").is_none());
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_idle_socket_does_not_buffer_traffic() {
        let pool = ConnectionPool::new();
        let (socket, driver) = Socket::pair("ws://a:80");
        socket.attach(Box::new(|_| {}));
        pool.release("ws://a:80", socket);

        for n in 0..100_000 {
            driver.deliver(SocketEvent::Message(Frame::from(n.to_string())));
        }

        assert_eq!(driver.buffered(), 0);
        assert!(pool.acquire("ws://a:80").is_some());
    }

    #[test]
    fn test_close_all() {
        let pool = ConnectionPool::new();
        let (first, mut first_driver) = Socket::pair("ws://a:80");
        let (second, _second_driver) = Socket::pair("ws://b:80");
        pool.release("ws://a:80", first);
        pool.release("ws://b:80", second);

        assert_eq!(pool.close_all(), 2);
        assert_eq!(pool.idle_count(), 0);
        assert!(!first_driver.is_open());
        assert!(first_driver.try_next_outbound().is_some());
    }
}
