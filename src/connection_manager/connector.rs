//! Opens sockets, preferring pooled ones, bounded by the connect timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::error::ConnectError;
use crate::transport::{origin_of, Socket, Transport};

use super::pool::ConnectionPool;

#[derive(Clone)]
pub struct Connector {
    transport: Arc<dyn Transport>,
    pool: Arc<ConnectionPool>,
    connect_timeout: Duration,
}

impl Connector {
    pub fn new(
        transport: Arc<dyn Transport>,
        pool: Arc<ConnectionPool>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            pool,
            connect_timeout,
        }
    }

    /// Produce a live socket for `url`.
    ///
    /// A socket still opening when the timeout fires is dropped, which tears
    /// down the half-open transport.
    pub async fn open(&self, id: &str, url: &str) -> Result<Socket, ConnectError> {
        let origin = origin_of(url)?;

        if let Some(socket) = self.pool.acquire(&origin) {
            tracing::debug!(connection_id = %id, origin = %origin, "Opened from pool");
            return Ok(socket);
        }

        match timeout(self.connect_timeout, self.transport.open(url)).await {
            Ok(Ok(socket)) => Ok(socket),
            Ok(Err(e)) => Err(ConnectError::Transport(e)),
            Err(_) => Err(ConnectError::Timeout {
                timeout_ms: self.connect_timeout.as_millis() as u64,
            }),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, OpenBehaviour, TransportError};

    fn connector(transport: &MemoryTransport) -> Connector {
        Connector::new(
            Arc::new(transport.clone()),
            Arc::new(ConnectionPool::new()),
            Duration::from_millis(500),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_on_hang() {
        let transport = MemoryTransport::new();
        transport.script("mem://feed/a", [OpenBehaviour::Hang]);

        let result = connector(&transport).open("a", "mem://feed/a").await;
        assert!(matches!(result, Err(ConnectError::Timeout { timeout_ms: 500 })));
    }

    #[tokio::test]
    async fn test_transport_error_surfaces() {
        let transport = MemoryTransport::new();
        transport.script("mem://feed/a", [OpenBehaviour::Refuse("503".into())]);

        let result = connector(&transport).open("a", "mem://feed/a").await;
        assert!(matches!(
            result,
            Err(ConnectError::Transport(TransportError::Handshake(_)))
        ));
    }

    #[tokio::test]
    async fn test_pool_hit_skips_transport() {
        let transport = MemoryTransport::new();
        let connector = connector(&transport);

        let (socket, _driver) = Socket::pair("mem://feed");
        connector.pool().release("mem://feed", socket);

        assert!(connector.open("a", "mem://feed/a").await.is_ok());
        assert!(transport.open_attempts("mem://feed/a").is_empty());
    }
}
