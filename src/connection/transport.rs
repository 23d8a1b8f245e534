//! Duplex transport abstraction and the WebSocket implementation.
//!
//! The connection manager only needs a message-oriented full-duplex channel
//! with connect/send/receive/close; any socket abstraction with this shape
//! satisfies it. Tests substitute in-memory fakes.

use std::future::Future;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::TransportError;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Factory producing one duplex connection per call.
pub trait Connector: Send + Sync + 'static {
    type Conn: Conn;

    fn connect(
        &self,
        auth_token: &str,
    ) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;
}

/// One established message-oriented full-duplex channel.
pub trait Conn: Send + 'static {
    fn send_text(&mut self, text: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next text frame; `Ok(None)` when the peer closed the channel.
    fn recv_text(&mut self)
        -> impl Future<Output = Result<Option<String>, TransportError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// WebSocket connector. Auth is carried as a query parameter on the
/// connection URL; no further handshake messages are needed.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    fn ws_url(&self, auth_token: &str) -> String {
        let e = |s: &str| url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>();
        let base = self
            .url
            .trim_end_matches('/')
            .replace("https://", "wss://")
            .replace("http://", "ws://");
        let sep = if base.contains('?') { '&' } else { '?' };
        format!("{}{}access_token={}", base, sep, e(auth_token))
    }
}

impl Connector for WsConnector {
    type Conn = WsConn;

    async fn connect(&self, auth_token: &str) -> Result<WsConn, TransportError> {
        let url = self.ws_url(auth_token);
        tracing::info!("Connecting WebSocket to {}", self.url);

        let (stream, response) = connect_async(&url).await?;
        tracing::info!(status = %response.status(), "WebSocket connected");

        Ok(WsConn { stream })
    }
}

pub struct WsConn {
    stream: WsStream,
}

impl Conn for WsConn {
    async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
        tracing::debug!("WS send: {}", text);
        self.stream
            .send(Message::Text(text.to_string()))
            .await
            .map_err(TransportError::from)
    }

    /// Receive the next text frame, answering pings and ignoring other
    /// control frames.
    async fn recv_text(&mut self) -> Result<Option<String>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    return Ok(Some(text));
                }
                Some(Ok(Message::Ping(data))) => {
                    self.stream.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    return Err(TransportError::from(e));
                }
                None => {
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
