//! Error types for audio-uplink.
//!
//! Errors are split into two categories:
//! - **Fatal errors** ([`UplinkError`]): Abort startup or end a running pipeline
//! - **Per-frame errors** ([`SendError`]): A single frame was lost; the pipeline keeps running
//!
//! Runtime issues that are neither (overflow, discarded frames) are surfaced via
//! [`EventCallback`](crate::EventCallback) instead.

/// Fatal and lifecycle errors.
///
/// Returned from [`Pipeline::start()`](crate::Pipeline::start) when startup fails,
/// and recorded as the terminal cause when a running pipeline stops on its own.
/// `Clone` so the terminal cause can be handed to every caller that asks for it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UplinkError {
    /// Permission to capture audio was denied.
    ///
    /// On macOS, check System Settings > Privacy & Security > Microphone.
    #[error("permission denied for audio capture (check OS settings)")]
    PermissionDenied,

    /// The capture device does not exist or cannot be opened.
    #[error("device unavailable: {name} - {reason}")]
    DeviceUnavailable {
        /// Name of the device (or `"default"`).
        name: String,
        /// Why the device is unavailable.
        reason: String,
    },

    /// The capture device went away while the pipeline was running.
    #[error("capture device lost: {reason}")]
    DeviceLost {
        /// Description reported by the capture backend.
        reason: String,
    },

    /// The outbound connection could not be established.
    #[error("connection to {endpoint} failed: {reason}")]
    ConnectionFailed {
        /// The endpoint that was dialled.
        endpoint: String,
        /// Why the connection failed.
        reason: String,
    },

    /// The remote end closed the connection or it broke while running.
    #[error("connection lost: {reason}")]
    ConnectionLost {
        /// Description of the disconnect.
        reason: String,
    },

    /// An operation required an open connection.
    #[error("not connected")]
    NotConnected,

    /// The frame queue was shut down.
    #[error("queue closed")]
    QueueClosed,

    /// Too many frames in a row failed to send.
    #[error("{count} consecutive frame sends failed")]
    TooManySendFailures {
        /// Number of consecutive failures observed.
        count: u32,
    },

    /// The pipeline configuration is not usable.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// The requested lifecycle operation is not valid in the current state.
    #[error("operation not valid while pipeline is {state}")]
    InvalidState {
        /// The state the pipeline was in.
        state: String,
    },

    /// An error from the underlying audio library (CPAL).
    #[error("audio backend error: {0}")]
    BackendError(String),
}

impl UplinkError {
    /// Creates a device-unavailable error.
    pub fn device_unavailable(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a device-lost error.
    pub fn device_lost(reason: impl Into<String>) -> Self {
        Self::DeviceLost {
            reason: reason.into(),
        }
    }
}

/// Errors raised by a [`Transport`](crate::net::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be opened.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Reading or writing on an open connection failed.
    #[error("i/o error: {0}")]
    Io(String),

    /// The connection is already closed.
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// Creates an I/O error from anything displayable.
    pub fn io(err: impl std::fmt::Display) -> Self {
        Self::Io(err.to_string())
    }
}

/// Per-frame send errors.
///
/// The frame that produced this error is lost; it is not retried or re-queued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The sender was not in the `Open` state.
    #[error("not connected")]
    NotConnected,

    /// The transport rejected the write.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Returned by [`BoundedAsyncQueue`](crate::BoundedAsyncQueue) operations after shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue closed")]
pub struct QueueClosed;

impl From<QueueClosed> for UplinkError {
    fn from(_: QueueClosed) -> Self {
        Self::QueueClosed
    }
}
