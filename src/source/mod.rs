//! Capture sources.
//!
//! A [`CaptureSource`] owns a capture device (or stands in for one) and,
//! once started, hands out a [`SampleStream`] of normalized mono samples at
//! the pipeline's sample rate. Three strategies are provided:
//!
//! - [`DeviceSource`]: a CPAL input device (default or by name)
//! - [`CallbackSource`]: host code pushes chunks from its own audio callback
//!   through a [`SampleFeeder`]
//! - [`ScriptedSource`]: pre-recorded or synthetic audio delivered on a
//!   fixed timeslice, for tests and replay

mod callback;
mod device;
mod scripted;

pub use callback::{CallbackSource, SampleFeeder};
pub use device::DeviceSource;
pub use scripted::ScriptedSource;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};
use tokio::sync::Notify;

use crate::UplinkError;

/// What a capture source delivers.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// A chunk of normalized mono samples at the requested rate.
    Samples(Vec<f32>),

    /// Samples were dropped before delivery because the consumer fell behind.
    Overflow {
        /// Number of samples dropped since the last report.
        dropped_samples: u64,
    },

    /// The device went away. No further samples follow.
    DeviceLost {
        /// Description reported by the backend.
        reason: String,
    },
}

/// Format the pipeline asks a source to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    /// Target sample rate in Hz (mono).
    pub sample_rate: u32,
    /// Polling period for sources backed by a ring buffer.
    pub poll_interval: Duration,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            poll_interval: Duration::from_millis(20),
        }
    }
}

/// Stream of capture events produced by a started source.
#[async_trait]
pub trait SampleStream: Send {
    /// Waits for the next event.
    ///
    /// Returns `None` once the source has stopped or run out of audio.
    async fn next_event(&mut self) -> Option<CaptureEvent>;
}

/// A capture strategy.
///
/// # Implementation Notes
///
/// - `start` returns once samples are wired to the returned stream.
///   Permission and availability failures are reported here, as
///   [`UplinkError::PermissionDenied`] or [`UplinkError::DeviceUnavailable`].
/// - `stop` ends delivery and releases the device. It must be idempotent.
/// - A device that disappears mid-stream reports
///   [`CaptureEvent::DeviceLost`] on the stream.
///
/// # Example
///
/// ```
/// use audio_uplink::source::{CaptureEvent, CaptureFormat, CaptureSource, SampleStream};
/// use audio_uplink::UplinkError;
/// use async_trait::async_trait;
///
/// struct Silence;
///
/// struct SilenceStream { remaining: usize }
///
/// #[async_trait]
/// impl SampleStream for SilenceStream {
///     async fn next_event(&mut self) -> Option<CaptureEvent> {
///         if self.remaining == 0 {
///             return None;
///         }
///         self.remaining -= 1;
///         Some(CaptureEvent::Samples(vec![0.0; 160]))
///     }
/// }
///
/// #[async_trait]
/// impl CaptureSource for Silence {
///     fn name(&self) -> &str {
///         "silence"
///     }
///
///     async fn start(
///         &mut self,
///         _format: CaptureFormat,
///     ) -> Result<Box<dyn SampleStream>, UplinkError> {
///         Ok(Box::new(SilenceStream { remaining: 10 }))
///     }
///
///     async fn stop(&mut self) {}
/// }
/// ```
#[async_trait]
pub trait CaptureSource: Send {
    /// Human-readable name for logging and events.
    fn name(&self) -> &str;

    /// Starts capture and returns the stream samples arrive on.
    async fn start(&mut self, format: CaptureFormat) -> Result<Box<dyn SampleStream>, UplinkError>;

    /// Stops capture and releases the device. Calling it again does nothing.
    async fn stop(&mut self);
}

/// One-shot stop flag that async code can wait on.
#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// Lists all available input devices.
///
/// # Errors
///
/// Returns an error if the audio host cannot be accessed.
pub fn list_input_devices() -> Result<Vec<String>, UplinkError> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| UplinkError::BackendError(e.to_string()))?;

    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

/// Gets the name of the default input device, if any.
pub fn default_input_device_name() -> Option<String> {
    cpal::default_host()
        .default_input_device()
        .and_then(|d| d.name().ok())
}
