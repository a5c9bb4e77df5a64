//! Shared WebSocket socket layer.
//!
//! Defines the socket seam the protocol engine is built on and the default
//! `tokio-tungstenite` implementation behind it. Nothing else in the crate
//! touches `tokio-tungstenite` directly.
//!
//! # Architecture
//!
//! A [`SocketFactory`] turns a URL into a ([`WsWrite`], [`WsRead`]) pair. The
//! transport owns both halves exclusively: the read half goes to the read
//! pump, the write half to the write pump. [`TungsteniteSocketFactory`] is
//! the production factory; tests substitute an in-memory one.
//!
//! Readers may deliver one logical message as a run of
//! [`WsMessage::Fragment`] chunks terminated by a [`WsMessage::Text`]; the
//! transport reassembles them.

// Rust guideline compliant 2026-02

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

use crate::constants::SOCKET_CONNECT_TIMEOUT;
use crate::error::HassError;

/// Concrete WebSocket stream type (avoids repeating the 6-line generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Received WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// UTF-8 text; the final (or only) chunk of a message.
    Text(String),
    /// UTF-8 text chunk with more chunks of the same message to follow.
    Fragment(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Read half of a socket.
#[async_trait]
pub trait WsRead: Send + std::fmt::Debug {
    /// Receive the next message, returning `None` when the stream ends.
    async fn recv(&mut self) -> Option<Result<WsMessage, HassError>>;
}

/// Write half of a socket.
#[async_trait]
pub trait WsWrite: Send + std::fmt::Debug {
    /// Send a UTF-8 text frame.
    async fn send_text(&mut self, text: &str) -> Result<(), HassError>;

    /// Send a pong frame in response to a ping.
    async fn send_pong(&mut self, data: Vec<u8>) -> Result<(), HassError>;

    /// Send a close frame.
    async fn send_close(&mut self) -> Result<(), HassError>;

    /// Flush pending writes and release the sink.
    async fn close(&mut self) -> Result<(), HassError>;
}

/// Writer/reader halves of one connected socket.
pub type WsPair = (Box<dyn WsWrite>, Box<dyn WsRead>);

/// Opens sockets for the protocol engine.
#[async_trait]
pub trait SocketFactory: Send + Sync + std::fmt::Debug {
    /// Connect to `url` and return the split halves.
    ///
    /// # Errors
    ///
    /// Returns `HassError::Transport` if the URL is invalid, the upgrade
    /// fails or the connect does not finish within its bound.
    async fn connect(&self, url: &str) -> Result<WsPair, HassError>;
}

/// Write half of a `tokio-tungstenite` connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

#[async_trait]
impl WsWrite for WsWriter {
    async fn send_text(&mut self, text: &str) -> Result<(), HassError> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .map_err(|e| HassError::Transport(format!("WebSocket send_text failed: {e}")))
    }

    async fn send_pong(&mut self, data: Vec<u8>) -> Result<(), HassError> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .map_err(|e| HassError::Transport(format!("WebSocket send_pong failed: {e}")))
    }

    async fn send_close(&mut self) -> Result<(), HassError> {
        self.sink
            .send(tungstenite::Message::Close(None))
            .await
            .map_err(|e| HassError::Transport(format!("WebSocket send_close failed: {e}")))
    }

    async fn close(&mut self) -> Result<(), HassError> {
        self.sink
            .close()
            .await
            .map_err(|e| HassError::Transport(format!("WebSocket close failed: {e}")))
    }
}

/// Read half of a `tokio-tungstenite` connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

#[async_trait]
impl WsRead for WsReader {
    /// Raw `Frame` variants are skipped internally. tungstenite assembles
    /// continuation frames itself, so text always arrives as [`WsMessage::Text`].
    async fn recv(&mut self) -> Option<Result<WsMessage, HassError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(WsMessage::Text(text)));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(Ok(WsMessage::Binary(data)));
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    return Some(Ok(WsMessage::Ping(data)));
                }
                Some(Ok(tungstenite::Message::Pong(data))) => {
                    return Some(Ok(WsMessage::Pong(data)));
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(WsMessage::Close { code, reason }));
                }
                Some(Ok(tungstenite::Message::Frame(_))) => {
                    // Raw frames, skip
                    continue;
                }
                Some(Err(e)) => {
                    return Some(Err(HassError::Transport(format!(
                        "WebSocket read error: {e}"
                    ))));
                }
                None => return None,
            }
        }
    }
}

/// Connect to a WebSocket URL.
///
/// Performs the WebSocket handshake under [`SOCKET_CONNECT_TIMEOUT`] and
/// returns split (writer, reader) halves.
///
/// # Errors
///
/// Returns `HassError::Transport` if the URL is invalid, the handshake fails
/// or times out.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader), HassError> {
    use tungstenite::client::IntoClientRequest;

    let request = url
        .into_client_request()
        .map_err(|e| HassError::Transport(format!("invalid WebSocket URL {url}: {e}")))?;

    let (ws_stream, _response) =
        tokio::time::timeout(SOCKET_CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|elapsed| {
                HassError::Transport(format!("WebSocket connect to {url} timed out ({elapsed})"))
            })?
            .map_err(|e| HassError::Transport(format!("WebSocket connect failed: {e}")))?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Default [`SocketFactory`] backed by `tokio-tungstenite` (plain or TLS).
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteSocketFactory;

#[async_trait]
impl SocketFactory for TungsteniteSocketFactory {
    async fn connect(&self, url: &str) -> Result<WsPair, HassError> {
        let (writer, reader) = connect(url).await?;
        Ok((Box::new(writer), Box::new(reader)))
    }
}

/// Build the hub WebSocket URL for `host:port`.
#[must_use]
pub fn websocket_url(host: &str, port: u16, ssl: bool) -> String {
    let scheme = if ssl { "wss" } else { "ws" };
    format!(
        "{scheme}://{host}:{port}{}",
        crate::constants::WEBSOCKET_PATH
    )
}
