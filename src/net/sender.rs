//! The connection owner.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{ConnectionState, FrameWriter, Inbound, InboundReader, Transport};
use crate::event::emit;
use crate::{EventCallback, Frame, SendError, TransportError, UplinkError, UplinkEvent};

/// Default bound on `connect`.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// State shared with the reader task and any monitors.
struct SenderShared {
    state: watch::Sender<ConnectionState>,
    /// Why the connection ended, when it ended on its own.
    reason: Mutex<Option<String>>,
    events: Option<EventCallback>,
}

impl SenderShared {
    fn new(events: Option<EventCallback>) -> Self {
        Self {
            state: watch::channel(ConnectionState::Disconnected).0,
            reason: Mutex::new(None),
            events,
        }
    }

    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Moves to `next` if the current state satisfies `from`.
    fn transition_if(&self, from: impl Fn(ConnectionState) -> bool, next: ConnectionState) -> bool {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if *state == next || !from(*state) {
                return false;
            }
            previous = Some(*state);
            *state = next;
            true
        });

        let Some(previous) = previous else {
            return false;
        };
        tracing::info!("Connection {} -> {}", previous, next);
        emit(
            self.events.as_ref(),
            UplinkEvent::ConnectionStateChanged {
                previous,
                current: next,
            },
        );
        true
    }

    fn transition(&self, next: ConnectionState) -> bool {
        self.transition_if(|_| true, next)
    }

    /// Records an unsolicited end of an open connection.
    fn lost(&self, next: ConnectionState, reason: String) {
        if self.transition_if(|s| s == ConnectionState::Open, next) {
            self.reason.lock().get_or_insert(reason);
        }
    }
}

/// Owns the outbound connection and sends frames over it.
///
/// Frames are serialized as raw little-endian 16-bit PCM, one message per
/// frame. There is no buffering here and no retry: a frame that fails to
/// send is lost, and the bounded queue upstream is the only buffer.
///
/// # Example
///
/// ```
/// use audio_uplink::net::{ConnectionState, MemoryTransport, NetworkSender};
/// use audio_uplink::{Frame, SendError};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let transport = MemoryTransport::new();
/// let mut sender = NetworkSender::new(Arc::new(transport.clone()));
///
/// let frame = Frame::new(0, vec![1, -1], Duration::ZERO, 16000);
/// assert_eq!(sender.send(&frame).await, Err(SendError::NotConnected));
///
/// sender.connect("memory://test").await.unwrap();
/// assert_eq!(sender.state(), ConnectionState::Open);
/// sender.send(&frame).await.unwrap();
/// assert_eq!(transport.sent(), vec![vec![1, 0, 255, 255]]);
///
/// sender.close().await;
/// assert_eq!(sender.state(), ConnectionState::Closed);
/// # });
/// ```
pub struct NetworkSender {
    transport: Arc<dyn Transport>,
    shared: Arc<SenderShared>,
    writer: Option<Box<dyn FrameWriter>>,
    reader: Option<JoinHandle<()>>,
    connect_timeout: Duration,
}

impl NetworkSender {
    /// Creates a sender that opens connections through `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            shared: Arc::new(SenderShared::new(None)),
            writer: None,
            reader: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Reports state changes and inbound text messages to `callback`.
    #[must_use]
    pub fn with_event_callback(mut self, callback: EventCallback) -> Self {
        self.shared = Arc::new(SenderShared::new(Some(callback)));
        self
    }

    /// Bounds how long [`connect`](Self::connect) may take.
    ///
    /// Default: 10s
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.current()
    }

    /// Returns a receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Why the connection ended, if the remote side or the network ended it.
    pub fn disconnect_reason(&self) -> Option<String> {
        self.shared.reason.lock().clone()
    }

    pub(crate) fn monitor(&self) -> ConnectionMonitor {
        ConnectionMonitor {
            rx: self.shared.state.subscribe(),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Opens a connection to `endpoint`, suspending until it is open or has
    /// failed.
    ///
    /// # Errors
    ///
    /// Returns [`UplinkError::ConnectionFailed`] if the transport fails or
    /// the connect timeout elapses, and [`UplinkError::InvalidState`] if a
    /// connection is already open or in progress.
    pub async fn connect(&mut self, endpoint: &str) -> Result<(), UplinkError> {
        let state = self.state();
        if matches!(
            state,
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Closing
        ) {
            return Err(UplinkError::InvalidState {
                state: format!("connection {state}"),
            });
        }

        if let Some(stale) = self.reader.take() {
            stale.abort();
        }
        self.writer = None;
        self.shared.reason.lock().take();
        self.shared.transition(ConnectionState::Connecting);
        tracing::info!("Connecting to {}", endpoint);

        let opened = tokio::time::timeout(self.connect_timeout, self.transport.open(endpoint))
            .await
            .unwrap_or_else(|_| {
                Err(TransportError::Connect(format!(
                    "timed out after {:?}",
                    self.connect_timeout
                )))
            });

        let connection = match opened {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!("Connection to {} failed: {}", endpoint, e);
                self.shared.transition(ConnectionState::Failed);
                return Err(UplinkError::ConnectionFailed {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        self.writer = Some(connection.writer);
        self.reader = Some(tokio::spawn(read_inbound(
            connection.reader,
            Arc::clone(&self.shared),
        )));
        self.shared.transition(ConnectionState::Open);
        Ok(())
    }

    /// Sends one frame as a binary message.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::NotConnected`] unless the connection is open, and
    /// [`SendError::Transport`] if the write fails. Either way the frame is
    /// lost.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), SendError> {
        if self.state() != ConnectionState::Open {
            return Err(SendError::NotConnected);
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(SendError::NotConnected);
        };

        match writer.send(frame.encode_pcm_le()).await {
            Ok(()) => Ok(()),
            Err(TransportError::Closed) => {
                self.shared
                    .lost(ConnectionState::Failed, "connection closed during send".to_string());
                Err(SendError::Transport(TransportError::Closed))
            }
            Err(e) => Err(SendError::Transport(e)),
        }
    }

    /// Closes the connection. Calling it again does nothing.
    pub async fn close(&mut self) {
        let closing = self.shared.transition_if(
            |s| matches!(s, ConnectionState::Connecting | ConnectionState::Open),
            ConnectionState::Closing,
        );

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            if closing {
                if let Err(e) = writer.close().await {
                    tracing::warn!("Error while closing connection: {}", e);
                }
            }
        }

        if closing {
            self.shared.transition(ConnectionState::Closed);
        }
    }
}

impl std::fmt::Debug for NetworkSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkSender")
            .field("state", &self.state())
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl Drop for NetworkSender {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Reader task: surfaces text messages and detects remote disconnects.
async fn read_inbound(mut reader: Box<dyn InboundReader>, shared: Arc<SenderShared>) {
    loop {
        match reader.next().await {
            Some(Ok(Inbound::Text(text))) => {
                tracing::debug!("Server message: {}", text);
                emit(shared.events.as_ref(), UplinkEvent::ServerMessage { text });
            }
            Some(Ok(Inbound::Binary(payload))) => {
                tracing::debug!("Ignoring {} byte binary message from server", payload.len());
            }
            Some(Ok(Inbound::Close { reason })) => {
                let reason = reason.unwrap_or_else(|| "closed by remote".to_string());
                tracing::info!("Connection closed by remote: {}", reason);
                shared.lost(ConnectionState::Closed, reason);
                return;
            }
            Some(Err(e)) => {
                tracing::warn!("Connection error: {}", e);
                shared.lost(ConnectionState::Failed, e.to_string());
                return;
            }
            None => {
                shared.lost(ConnectionState::Closed, "connection ended".to_string());
                return;
            }
        }
    }
}

/// Watches a sender's connection for an unsolicited end.
pub(crate) struct ConnectionMonitor {
    rx: watch::Receiver<ConnectionState>,
    shared: Arc<SenderShared>,
}

impl ConnectionMonitor {
    /// Resolves with the reason once the connection is closed or failed.
    pub(crate) async fn lost(&mut self) -> String {
        let _ = self.rx.wait_for(|state| state.is_terminal()).await;
        self.shared
            .reason
            .lock()
            .clone()
            .unwrap_or_else(|| "connection closed".to_string())
    }
}
