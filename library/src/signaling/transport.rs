use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// One open, bidirectional text-frame connection to the relay.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: String) -> anyhow::Result<()>;

    /// Next inbound text frame, `None` once the remote side closed.
    ///
    /// Must be cancel safe, the client polls it inside `select!`.
    async fn recv(&mut self) -> Option<anyhow::Result<String>>;

    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Opens transports, once initially and again on every reconnection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> anyhow::Result<Box<dyn Transport>>;
}

/// Connects to the relay over WebSocket.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> anyhow::Result<Box<dyn Transport>> {
        let (stream, _response) = tokio_tungstenite::connect_async(url).await?;
        Ok(Box::new(WebSocketTransport { stream }))
    }
}

struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: String) -> anyhow::Result<()> {
        self.stream.send(Message::Text(frame)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<anyhow::Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(error) => return Some(Err(error.into())),
            }
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}
