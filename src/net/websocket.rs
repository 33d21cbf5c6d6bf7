//! WebSocket transport.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{Connection, FrameWriter, Inbound, InboundReader, Transport};
use crate::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ws://` and `wss://` connections and sends each frame as one
/// binary message. TLS goes through the platform's native stack.
///
/// Streaming transcription services usually want an API key in the
/// handshake and a control message before the close frame; both are
/// optional.
///
/// # Example
///
/// ```
/// use audio_uplink::net::WebSocketTransport;
///
/// let transport = WebSocketTransport::new()
///     .with_auth_token("secret")
///     .with_close_message(r#"{"type":"CloseStream"}"#);
/// ```
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    auth_token: Option<String>,
    close_message: Option<String>,
}

impl WebSocketTransport {
    /// Creates a transport with a bare handshake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `Authorization: Token <token>` with the handshake.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Sends `message` as a text message right before closing.
    #[must_use]
    pub fn with_close_message(mut self, message: impl Into<String>) -> Self {
        self.close_message = Some(message.into());
        self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, endpoint: &str) -> Result<Connection, TransportError> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Token {token}"))
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!("WebSocket handshake complete: {}", response.status());

        let (sink, stream) = stream.split();
        Ok(Connection {
            writer: Box::new(WsWriter {
                sink,
                close_message: self.close_message.clone(),
            }),
            reader: Box::new(WsReader { stream }),
        })
    }
}

fn map_ws_error(err: WsError) -> TransportError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        other => TransportError::io(other),
    }
}

struct WsWriter {
    sink: SplitSink<WsStream, Message>,
    close_message: Option<String>,
}

#[async_trait]
impl FrameWriter for WsWriter {
    async fn send(&mut self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.sink
            .send(Message::Binary(payload))
            .await
            .map_err(map_ws_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(message) = self.close_message.take() {
            self.sink
                .send(Message::Text(message))
                .await
                .map_err(map_ws_error)?;
        }
        self.sink.close().await.map_err(map_ws_error)
    }
}

struct WsReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl InboundReader for WsReader {
    async fn next(&mut self) -> Option<Result<Inbound, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(map_ws_error(e))),
            };
            let inbound = match message {
                Message::Text(text) => Inbound::Text(text),
                Message::Binary(payload) => Inbound::Binary(payload),
                Message::Close(frame) => Inbound::Close {
                    reason: frame
                        .map(|f| f.reason.into_owned())
                        .filter(|reason| !reason.is_empty()),
                },
                // Pings are answered by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            return Some(Ok(inbound));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_errors_map_to_closed() {
        assert_eq!(map_ws_error(WsError::ConnectionClosed), TransportError::Closed);
        assert_eq!(map_ws_error(WsError::AlreadyClosed), TransportError::Closed);
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe");
        assert!(matches!(map_ws_error(WsError::Io(io)), TransportError::Io(_)));
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_connect_error() {
        let err = WebSocketTransport::new()
            .open("not a url")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
    }

    #[tokio::test]
    async fn test_wss_endpoint_reaches_tls_handshake() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // Accept the TCP connection, then hang up before any TLS exchange.
        let server = tokio::spawn(async move { listener.accept().await.is_ok() });

        let err = WebSocketTransport::new()
            .with_auth_token("secret")
            .open(&format!("wss://127.0.0.1:{port}/v1/listen"))
            .await
            .unwrap_err();

        assert!(server.await.unwrap(), "client never dialled the server");
        let TransportError::Connect(reason) = err else {
            panic!("expected a connect error, got {err:?}");
        };
        assert!(!reason.contains("not compiled"), "{reason}");
    }

    #[tokio::test]
    async fn test_bad_token_is_connect_error() {
        let err = WebSocketTransport::new()
            .with_auth_token("line\nbreak")
            .open("ws://127.0.0.1:9/")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
    }
}
