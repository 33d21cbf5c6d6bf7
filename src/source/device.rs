//! CPAL input device source.
//!
//! The CPAL stream lives on a dedicated thread (it is not `Send` on every
//! platform). Its callback converts to `f32` and pushes into a lock-free
//! ring buffer; the async side polls that buffer, downmixes and resamples.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use tokio::sync::oneshot;

use super::{CaptureEvent, CaptureFormat, CaptureSource, SampleStream};
use crate::format::FormatConverter;
use crate::UplinkError;

/// Default ring buffer length, in seconds of device audio.
const DEFAULT_BUFFER_DURATION: Duration = Duration::from_secs(5);

/// Name used for the default input device in errors.
const DEFAULT_DEVICE_NAME: &str = "default";

#[derive(Debug, Clone)]
enum DeviceSelection {
    SystemDefault,
    ByName(String),
}

/// State shared between the CPAL callbacks and the async stream.
#[derive(Debug, Default)]
struct CaptureShared {
    stopped: AtomicBool,
    overflow: AtomicU64,
    lost: Mutex<Option<String>>,
}

/// Handle to the thread that owns the CPAL stream.
struct CaptureWorker {
    stop_tx: std_mpsc::Sender<()>,
    thread: thread::JoinHandle<()>,
    shared: Arc<CaptureShared>,
}

/// Device format reported back by the capture thread.
struct Opened {
    sample_rate: u32,
    channels: u16,
    consumer: HeapCons<f32>,
}

/// Captures from a CPAL input device.
///
/// # Example
///
/// ```no_run
/// use audio_uplink::source::DeviceSource;
///
/// let mic = DeviceSource::default_device();
/// let usb = DeviceSource::by_name("USB Audio Device");
/// ```
pub struct DeviceSource {
    selection: DeviceSelection,
    name: String,
    buffer_duration: Duration,
    worker: Option<CaptureWorker>,
}

impl DeviceSource {
    /// Captures from the system's default input device.
    pub fn default_device() -> Self {
        Self {
            selection: DeviceSelection::SystemDefault,
            name: DEFAULT_DEVICE_NAME.to_string(),
            buffer_duration: DEFAULT_BUFFER_DURATION,
            worker: None,
        }
    }

    /// Captures from the input device with the given name.
    pub fn by_name(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            selection: DeviceSelection::ByName(name.clone()),
            name,
            buffer_duration: DEFAULT_BUFFER_DURATION,
            worker: None,
        }
    }

    /// Sets how much device audio the ring buffer can hold before dropping.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub fn with_buffer_duration(mut self, duration: Duration) -> Self {
        self.buffer_duration = duration;
        self
    }

    fn open_device(&self) -> Result<cpal::Device, UplinkError> {
        let host = cpal::default_host();
        match &self.selection {
            DeviceSelection::SystemDefault => host.default_input_device().ok_or_else(|| {
                UplinkError::device_unavailable(DEFAULT_DEVICE_NAME, "no default input device")
            }),
            DeviceSelection::ByName(name) => {
                let devices = host
                    .input_devices()
                    .map_err(|e| UplinkError::BackendError(e.to_string()))?;
                for device in devices {
                    if device.name().is_ok_and(|n| &n == name) {
                        return Ok(device);
                    }
                }
                Err(UplinkError::device_unavailable(name, "not found"))
            }
        }
    }

    /// Opens the device and starts the stream on the current (capture) thread.
    fn open_stream(
        &self,
        shared: &Arc<CaptureShared>,
    ) -> Result<(cpal::Stream, Opened), UplinkError> {
        let device = self.open_device()?;
        let supported = device.default_input_config().map_err(|e| match e {
            cpal::DefaultStreamConfigError::BackendSpecific { err } => {
                classify_backend_error(&self.name, err.description)
            }
            other => UplinkError::device_unavailable(&self.name, other.to_string()),
        })?;

        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        let sample_rate = config.sample_rate.0;
        let channels = config.channels;

        let capacity = (f64::from(sample_rate)
            * f64::from(channels)
            * self.buffer_duration.as_secs_f64()) as usize;
        let (producer, consumer) = HeapRb::<f32>::new(capacity.max(1024)).split();

        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, producer, shared),
            SampleFormat::I16 => build_stream::<i16>(&device, &config, producer, shared),
            SampleFormat::U16 => build_stream::<u16>(&device, &config, producer, shared),
            SampleFormat::I32 => build_stream::<i32>(&device, &config, producer, shared),
            format => {
                return Err(UplinkError::device_unavailable(
                    &self.name,
                    format!("unsupported sample format {format:?}"),
                ));
            }
        }
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                UplinkError::device_unavailable(&self.name, "device not available")
            }
            cpal::BuildStreamError::BackendSpecific { err } => {
                classify_backend_error(&self.name, err.description)
            }
            other => UplinkError::BackendError(other.to_string()),
        })?;

        stream.play().map_err(|e| match e {
            cpal::PlayStreamError::BackendSpecific { err } => {
                classify_backend_error(&self.name, err.description)
            }
            other => UplinkError::device_unavailable(&self.name, other.to_string()),
        })?;

        Ok((
            stream,
            Opened {
                sample_rate,
                channels,
                consumer,
            },
        ))
    }
}

impl std::fmt::Debug for DeviceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSource")
            .field("selection", &self.selection)
            .field("running", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CaptureSource for DeviceSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, format: CaptureFormat) -> Result<Box<dyn SampleStream>, UplinkError> {
        if self.worker.is_some() {
            return Err(UplinkError::device_unavailable(&self.name, "already capturing"));
        }

        let shared = Arc::new(CaptureShared::default());
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let opener = Self {
            selection: self.selection.clone(),
            name: self.name.clone(),
            buffer_duration: self.buffer_duration,
            worker: None,
        };
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("audio-uplink-capture".to_string())
            .spawn(move || match opener.open_stream(&thread_shared) {
                Ok((stream, opened)) => {
                    if ready_tx.send(Ok(opened)).is_err() {
                        return;
                    }
                    // Park until stop() or the source is dropped.
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| UplinkError::BackendError(e.to_string()))?;

        let opened = ready_rx
            .await
            .map_err(|_| UplinkError::BackendError("capture thread exited".to_string()))??;

        tracing::info!(
            "DeviceSource '{}' capturing: device={}Hz/{}ch, target={}Hz/1ch",
            self.name,
            opened.sample_rate,
            opened.channels,
            format.sample_rate
        );

        let stream = DeviceSampleStream {
            consumer: opened.consumer,
            channels: usize::from(opened.channels.max(1)),
            converter: FormatConverter::new(opened.sample_rate, opened.channels, format.sample_rate),
            shared: Arc::clone(&shared),
            poll: tokio::time::interval(format.poll_interval),
            scratch: Vec::new(),
        };

        self.worker = Some(CaptureWorker {
            stop_tx,
            thread,
            shared,
        });
        Ok(Box::new(stream))
    }

    async fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.shared.stopped.store(true, Ordering::SeqCst);
        let _ = worker.stop_tx.send(());
        let joined = tokio::task::spawn_blocking(move || worker.thread.join()).await;
        if !matches!(joined, Ok(Ok(()))) {
            tracing::warn!("DeviceSource '{}': capture thread did not exit cleanly", self.name);
        }
        tracing::info!("DeviceSource '{}' stopped", self.name);
    }
}

/// Maps a backend-specific failure, recognising permission refusals.
fn classify_backend_error(name: &str, description: String) -> UplinkError {
    let lower = description.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        UplinkError::PermissionDenied
    } else {
        UplinkError::device_unavailable(name, description)
    }
}

fn build_stream<S>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: HeapProd<f32>,
    shared: &Arc<CaptureShared>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    S: SizedSample,
    f32: FromSample<S>,
{
    let data_shared = Arc::clone(shared);
    let error_shared = Arc::clone(shared);
    device.build_input_stream(
        config,
        move |data: &[S], _: &cpal::InputCallbackInfo| {
            // Non-blocking push; whatever does not fit is counted, not waited on.
            let pushed = producer.push_iter(data.iter().map(|&s| s.to_sample::<f32>()));
            if pushed < data.len() {
                data_shared
                    .overflow
                    .fetch_add((data.len() - pushed) as u64, Ordering::Relaxed);
            }
        },
        move |err| match err {
            cpal::StreamError::DeviceNotAvailable => {
                tracing::error!("Audio device lost");
                *error_shared.lost.lock() = Some("device not available".to_string());
            }
            other => {
                tracing::warn!("Audio stream error: {}", other);
            }
        },
        None,
    )
}

/// Async side of a running device capture.
struct DeviceSampleStream {
    consumer: HeapCons<f32>,
    channels: usize,
    converter: FormatConverter,
    shared: Arc<CaptureShared>,
    poll: tokio::time::Interval,
    scratch: Vec<f32>,
}

impl DeviceSampleStream {
    /// Pops whole interleaved frames from the ring buffer.
    fn take_available(&mut self) -> Option<Vec<f32>> {
        let available = self.consumer.occupied_len();
        let whole = available - available % self.channels;
        if whole == 0 {
            return None;
        }
        self.scratch.resize(whole, 0.0);
        let popped = self.consumer.pop_slice(&mut self.scratch);
        Some(self.converter.convert(&self.scratch[..popped]))
    }
}

#[async_trait]
impl SampleStream for DeviceSampleStream {
    async fn next_event(&mut self) -> Option<CaptureEvent> {
        loop {
            if let Some(reason) = self.shared.lost.lock().take() {
                return Some(CaptureEvent::DeviceLost { reason });
            }
            let dropped_samples = self.shared.overflow.swap(0, Ordering::Relaxed);
            if dropped_samples > 0 {
                return Some(CaptureEvent::Overflow { dropped_samples });
            }
            if let Some(samples) = self.take_available() {
                return Some(CaptureEvent::Samples(samples));
            }
            if self.shared.stopped.load(Ordering::SeqCst) {
                return None;
            }
            self.poll.tick().await;
        }
    }
}
