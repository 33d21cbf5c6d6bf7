//! # audio-uplink
//!
//! **Note:** This crate is under active development. The API may change before 1.0.
//!
//! Live audio capture streamed to a remote consumer as fixed-size PCM frames.
//!
//! `audio-uplink` captures audio (a CPAL input device, a host callback or a
//! scripted source), cuts it into fixed-duration 16-bit frames and sends
//! each frame as one binary message over a persistent connection, typically
//! a WebSocket to a streaming transcription service.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use audio_uplink::AudioUplink;
//! use audio_uplink::net::WebSocketTransport;
//!
//! # async fn run() -> Result<(), audio_uplink::UplinkError> {
//! let mut pipeline = AudioUplink::builder()
//!     .endpoint("ws://localhost:8000/ws/audio")
//!     .transport(WebSocketTransport::new().with_close_message(r#"{"type":"CloseStream"}"#))
//!     .queue_capacity(50)                            // ~5s of 100ms frames
//!     .on_event(|e| tracing::info!(?e, "uplink event"))
//!     .start()
//!     .await?;
//!
//! // ... later
//! pipeline.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **Capture**: the device callback only writes into a lock-free ring
//!   buffer; a producer task turns the samples into frames
//! - **Queue**: a bounded FIFO; when it is full the producer suspends, which
//!   is the only backpressure between capture and network
//! - **Uplink**: a consumer task sends frames in order, one message each
//!
//! Stopping halts capture first, drains the queue within a bounded timeout
//! (or discards it), then closes the connection.

#![warn(missing_docs)]
// Audio code requires intentional numeric casts between sample formats
#![allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_lossless
)]
// unwrap/expect allowed in tests only
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
// These doc lints are too strict for internal implementation details
#![allow(clippy::missing_panics_doc, clippy::missing_errors_doc)]

mod builder;
mod config;
mod error;
mod event;
pub mod format;
mod frame;
pub mod net;
mod pipeline;
mod queue;
pub mod source;

pub use builder::{AudioUplink, PipelineBuilder};
pub use config::{DrainPolicy, UplinkConfig};
pub use error::{QueueClosed, SendError, TransportError, UplinkError};
pub use event::{event_callback, EventCallback, UplinkEvent};
pub use frame::Frame;
pub use net::{ConnectionState, NetworkSender};
pub use pipeline::{FrameBuffer, Pipeline, PipelineState, PipelineStats};
pub use queue::BoundedAsyncQueue;
pub use source::{default_input_device_name, list_input_devices, CaptureSource};
