//! Source fed from a host-owned audio callback.
//!
//! Some hosts already run their own capture (an audio worklet, a plugin
//! callback, a platform API the crate does not wrap). They keep calling
//! [`SampleFeeder::feed`] from that callback; the pipeline sees the chunks
//! as an ordinary [`SampleStream`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use super::{CaptureEvent, CaptureFormat, CaptureSource, SampleStream, StopSignal};
use crate::format::FormatConverter;
use crate::UplinkError;

/// State shared between feeders, the source and its stream.
#[derive(Debug, Default)]
struct FeedState {
    accepting: AtomicBool,
    overflow: AtomicU64,
    lost: Mutex<Option<String>>,
    stop: StopSignal,
}

/// Capture source driven by host code.
///
/// Like [`DeviceSource`](super::DeviceSource), the stream ends as soon as
/// the source is stopped; chunks fed but not yet read are dropped.
///
/// # Example
///
/// ```
/// use audio_uplink::source::CallbackSource;
///
/// // 48kHz stereo chunks in, room for 64 chunks in flight.
/// let (source, feeder) = CallbackSource::new(48000, 2, 64);
///
/// // Before the pipeline starts the source, chunks are refused.
/// assert!(!feeder.feed(&[0.0; 960]));
/// ```
#[derive(Debug)]
pub struct CallbackSource {
    name: String,
    sample_rate: u32,
    channels: u16,
    state: Arc<FeedState>,
    rx: Option<mpsc::Receiver<Vec<f32>>>,
}

/// Handle host code uses to push samples into a [`CallbackSource`].
///
/// Cheap to clone. Never blocks, so it is safe to call from a real-time
/// audio callback.
#[derive(Debug, Clone)]
pub struct SampleFeeder {
    tx: mpsc::Sender<Vec<f32>>,
    state: Arc<FeedState>,
}

impl CallbackSource {
    /// Creates a source for interleaved chunks at `sample_rate` with
    /// `channels` channels, buffering at most `capacity` chunks.
    pub fn new(sample_rate: u32, channels: u16, capacity: usize) -> (Self, SampleFeeder) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let state = Arc::new(FeedState::default());
        let source = Self {
            name: "callback".to_string(),
            sample_rate,
            channels,
            state: Arc::clone(&state),
            rx: Some(rx),
        };
        (source, SampleFeeder { tx, state })
    }

    /// Sets the name used in logs and events.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl SampleFeeder {
    /// Pushes one interleaved chunk.
    ///
    /// Returns `false` if the chunk was refused: the source is not running,
    /// or the pipeline has fallen behind (counted as overflow).
    pub fn feed(&self, samples: &[f32]) -> bool {
        if !self.state.accepting.load(Ordering::Acquire) {
            return false;
        }
        match self.tx.try_send(samples.to_vec()) {
            Ok(()) => true,
            Err(TrySendError::Full(chunk)) => {
                self.state
                    .overflow
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Reports that the host's device went away.
    pub fn device_lost(&self, reason: impl Into<String>) {
        *self.state.lost.lock() = Some(reason.into());
        self.state.accepting.store(false, Ordering::Release);
        // Wake the stream so it notices without waiting for more audio.
        let _ = self.tx.try_send(Vec::new());
    }

    /// Returns `true` while the source accepts chunks.
    pub fn is_accepting(&self) -> bool {
        self.state.accepting.load(Ordering::Acquire)
    }
}

#[async_trait]
impl CaptureSource for CallbackSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, format: CaptureFormat) -> Result<Box<dyn SampleStream>, UplinkError> {
        let rx = self
            .rx
            .take()
            .ok_or_else(|| UplinkError::device_unavailable(&self.name, "already started"))?;

        self.state.accepting.store(true, Ordering::Release);
        tracing::info!(
            "CallbackSource '{}' accepting: {}Hz/{}ch -> {}Hz/1ch",
            self.name,
            self.sample_rate,
            self.channels,
            format.sample_rate
        );

        Ok(Box::new(CallbackStream {
            rx,
            state: Arc::clone(&self.state),
            converter: FormatConverter::new(self.sample_rate, self.channels, format.sample_rate),
        }))
    }

    async fn stop(&mut self) {
        if self.state.stop.is_stopped() {
            return;
        }
        self.state.accepting.store(false, Ordering::Release);
        self.state.stop.stop();
        tracing::info!("CallbackSource '{}' stopped", self.name);
    }
}

struct CallbackStream {
    rx: mpsc::Receiver<Vec<f32>>,
    state: Arc<FeedState>,
    converter: FormatConverter,
}

impl CallbackStream {
    fn pending_event(&self) -> Option<CaptureEvent> {
        if let Some(reason) = self.state.lost.lock().take() {
            return Some(CaptureEvent::DeviceLost { reason });
        }
        let dropped_samples = self.state.overflow.swap(0, Ordering::Relaxed);
        (dropped_samples > 0).then_some(CaptureEvent::Overflow { dropped_samples })
    }

}

#[async_trait]
impl SampleStream for CallbackStream {
    async fn next_event(&mut self) -> Option<CaptureEvent> {
        loop {
            if self.state.stop.is_stopped() {
                return None;
            }
            if let Some(event) = self.pending_event() {
                return Some(event);
            }
            match self.rx.try_recv() {
                Ok(chunk) if chunk.is_empty() => continue,
                Ok(chunk) => return Some(CaptureEvent::Samples(self.converter.convert(&chunk))),
                Err(TryRecvError::Disconnected) => return None,
                Err(TryRecvError::Empty) => {}
            }

            let state = Arc::clone(&self.state);
            tokio::select! {
                chunk = self.rx.recv() => match chunk {
                    Some(chunk) if chunk.is_empty() => {}
                    Some(chunk) => {
                        return Some(CaptureEvent::Samples(self.converter.convert(&chunk)))
                    }
                    None => return None,
                },
                () = state.stop.wait() => {}
            }
        }
    }
}
