//! WebSocket transport backed by tokio-tungstenite.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{origin_of, Frame, Outbound, Socket, SocketDriver, SocketEvent, Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ws://` / `wss://` sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<Socket, TransportError> {
        let origin = origin_of(url)?;

        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let (socket, driver) = Socket::pair(origin);
        tokio::spawn(pump(stream, driver));

        tracing::debug!(url = %url, "WebSocket handshake completed");
        Ok(socket)
    }
}

/// Shuttle frames between the WebSocket stream and the socket driver until
/// either side goes away.
async fn pump(stream: WsStream, mut driver: SocketDriver) {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            outbound = driver.next_outbound() => match outbound {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = write.send(to_message(frame)).await {
                        driver.deliver(SocketEvent::Closed {
                            clean: false,
                            reason: Some(e.to_string()),
                        });
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    driver.deliver(SocketEvent::Message(Frame::Text(text.as_str().to_owned())));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    driver.deliver(SocketEvent::Message(Frame::Binary(bytes.to_vec())));
                }
                Some(Ok(Message::Close(frame))) => {
                    let clean = frame
                        .as_ref()
                        .map(|f| f.code == CloseCode::Normal)
                        .unwrap_or(true);
                    let reason = frame.map(|f| f.reason.as_str().to_owned());
                    driver.deliver(SocketEvent::Closed { clean, reason });
                    break;
                }
                // Control frames are answered by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    driver.deliver(SocketEvent::Closed {
                        clean: false,
                        reason: Some(e.to_string()),
                    });
                    break;
                }
                None => {
                    driver.deliver(SocketEvent::Closed {
                        clean: false,
                        reason: Some("stream ended".to_string()),
                    });
                    break;
                }
            },
        }
    }

    tracing::debug!(origin = %driver.origin(), "WebSocket pump stopped");
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(bytes) => Message::Binary(bytes.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_conversion() {
        assert!(matches!(to_message(Frame::from("x")), Message::Text(_)));
        assert!(matches!(to_message(Frame::from(vec![1u8, 2])), Message::Binary(_)));
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_url() {
        let transport = WebSocketTransport::new();
        let result = transport.open("definitely not a url").await;
        assert!(matches!(result, Err(TransportError::InvalidUrl { .. })));
    }
}
