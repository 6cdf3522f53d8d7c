use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("connection closed")]
    Closed,
}

/// Opens links to a realtime endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>, TransportError>;
}

/// One open connection carrying text frames.
///
/// `recv` must be cancel-safe: the transport polls it inside `select!`.
#[async_trait]
pub trait Link: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    async fn ping(&mut self) -> Result<(), TransportError>;
    /// Next text frame; `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;
    async fn close(&mut self);
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket connector backed by tokio-tungstenite.
#[derive(Clone, Debug)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>, TransportError> {
        let (stream, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| {
                TransportError::Connect(format!("timed out after {:?}", self.connect_timeout))
            })?
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WsStream,
}

#[async_trait]
impl Link for WsLink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.stream
            .send(WsMessage::Ping(Default::default()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => return Some(Ok(text.as_str().to_owned())),
                Some(Ok(WsMessage::Close(_))) | None => return None,
                // Pongs are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(TransportError::Receive(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
