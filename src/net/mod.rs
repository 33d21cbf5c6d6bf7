//! Outbound connection handling.
//!
//! [`NetworkSender`] owns one connection at a time and sends each frame as
//! a single binary message. The wire itself sits behind the [`Transport`]
//! trait so the pipeline can run over a real WebSocket or an in-process
//! [`MemoryTransport`]:
//!
//! - [`WebSocketTransport`]: `ws://` endpoints via tokio-tungstenite
//! - [`MemoryTransport`]: records payloads in memory, with scriptable
//!   failures, for tests and offline runs

mod memory;
mod sender;
mod websocket;

pub use memory::MemoryTransport;
pub use sender::NetworkSender;
pub use websocket::WebSocketTransport;

pub(crate) use sender::ConnectionMonitor;

use async_trait::async_trait;

use crate::TransportError;

/// Lifecycle of the outbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No connection has been attempted.
    #[default]
    Disconnected,
    /// `connect` is in progress.
    Connecting,
    /// Frames can be sent.
    Open,
    /// `close` is in progress.
    Closing,
    /// Closed by either side.
    Closed,
    /// The connection could not be opened or broke.
    Failed,
}

impl ConnectionState {
    /// Returns `true` once the connection is gone for good.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Message received from the remote end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text message (for transcription back-ends, usually JSON results).
    Text(String),
    /// A binary message.
    Binary(Vec<u8>),
    /// The remote end closed the connection.
    Close {
        /// Reason given by the remote end, if any.
        reason: Option<String>,
    },
}

/// Both halves of an open connection.
pub struct Connection {
    /// Outbound half.
    pub writer: Box<dyn FrameWriter>,
    /// Inbound half.
    pub reader: Box<dyn InboundReader>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Something that can open message-oriented connections.
///
/// # Implementation Notes
///
/// - `open` suspends until the connection is usable or has failed
/// - each call to [`FrameWriter::send`] must produce exactly one message
///   on the wire
/// - [`InboundReader::next`] returns `None` once the connection has ended
///
/// # Example
///
/// ```
/// use audio_uplink::net::{Connection, Transport};
/// use audio_uplink::TransportError;
/// use async_trait::async_trait;
///
/// struct Unreachable;
///
/// #[async_trait]
/// impl Transport for Unreachable {
///     async fn open(&self, endpoint: &str) -> Result<Connection, TransportError> {
///         Err(TransportError::Connect(format!("{endpoint} is unreachable")))
///     }
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a connection to `endpoint`.
    async fn open(&self, endpoint: &str) -> Result<Connection, TransportError>;
}

/// Outbound half of a connection.
#[async_trait]
pub trait FrameWriter: Send {
    /// Sends one binary message.
    ///
    /// [`TransportError::Closed`] means the connection is gone; any other
    /// error only loses this message.
    async fn send(&mut self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Closes the connection from this side.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Inbound half of a connection.
#[async_trait]
pub trait InboundReader: Send {
    /// Waits for the next message; `None` once the connection has ended.
    async fn next(&mut self) -> Option<Result<Inbound, TransportError>>;
}
