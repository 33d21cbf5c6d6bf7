//! Pipeline orchestration.
//!
//! A running pipeline is three tasks joined by one queue:
//!
//! ```text
//! CaptureSource → capture task (FrameBuffer) → BoundedAsyncQueue → uplink task → NetworkSender
//! ```
//!
//! - **Capture task**: turns capture events into frames and `put`s them,
//!   suspending while the queue is full
//! - **Uplink task**: `get`s frames and sends them in order
//! - **Supervisor**: waits for a stop request or a fatal condition, then
//!   tears down in order: capture, queue, connection
//!
//! The queue capacity is the only backpressure lever between the two sides.

mod capture;
mod frame_buffer;
mod uplink;

pub use frame_buffer::FrameBuffer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::{JoinError, JoinHandle};

use capture::{CaptureEnd, CaptureTask};
use uplink::{Uplink, UplinkEnd};

use crate::event::emit;
use crate::net::{ConnectionMonitor, NetworkSender};
use crate::source::{CaptureFormat, CaptureSource, StopSignal};
use crate::{
    BoundedAsyncQueue, DrainPolicy, EventCallback, Frame, UplinkConfig, UplinkError, UplinkEvent,
};

/// Frame-level debug logging happens once per this many frames.
pub(crate) const LOG_EVERY_N_FRAMES: u64 = 50;

/// Lifecycle of a [`Pipeline`].
///
/// ```text
/// Idle → Starting → Running → Stopping → Stopped
/// ```
///
/// A failed start goes straight from `Starting` to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PipelineState {
    /// Built, not started.
    #[default]
    Idle,
    /// Connecting and starting capture.
    Starting,
    /// Frames are flowing.
    Running,
    /// Tearing down.
    Stopping,
    /// All resources released.
    Stopped,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Counters for a pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames cut by the frame buffer.
    pub frames_produced: u64,
    /// Frames the transport accepted.
    pub frames_sent: u64,
    /// Frames lost to send failures.
    pub frames_failed: u64,
    /// Frames produced but never sent, counted at shutdown.
    pub frames_discarded: u64,
    /// Mono samples received from the capture source.
    pub samples_captured: u64,
    /// Payload bytes sent.
    pub bytes_sent: u64,
    /// Samples the capture source dropped before delivery.
    pub overflow_samples: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) frames_produced: AtomicU64,
    pub(crate) frames_sent: AtomicU64,
    pub(crate) frames_failed: AtomicU64,
    pub(crate) frames_discarded: AtomicU64,
    pub(crate) samples_captured: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) overflow_samples: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_produced: self.frames_produced.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_failed: self.frames_failed.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            samples_captured: self.samples_captured.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            overflow_samples: self.overflow_samples.load(Ordering::Relaxed),
        }
    }

    /// Everything produced that was neither sent nor failed was discarded.
    fn settle_discarded(&self) {
        let stats = self.snapshot();
        let unsent = stats
            .frames_produced
            .saturating_sub(stats.frames_sent)
            .saturating_sub(stats.frames_failed);
        self.frames_discarded.store(unsent, Ordering::Relaxed);
    }
}

/// State shared between the pipeline handle and its tasks.
pub(crate) struct PipelineShared {
    state: watch::Sender<PipelineState>,
    cause: Mutex<Option<UplinkError>>,
    pub(crate) stats: StatsCounters,
    events: Option<EventCallback>,
}

impl PipelineShared {
    pub(crate) fn new(events: Option<EventCallback>) -> Self {
        Self {
            state: watch::channel(PipelineState::Idle).0,
            cause: Mutex::new(None),
            stats: StatsCounters::default(),
            events,
        }
    }

    pub(crate) fn emit(&self, event: UplinkEvent) {
        emit(self.events.as_ref(), event);
    }

    fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    fn transition(&self, next: PipelineState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!("Pipeline {} -> {}", previous, next);
            self.emit(UplinkEvent::PipelineStateChanged {
                previous,
                current: next,
            });
        }
    }

    /// Records the terminal cause (first one wins) and moves to `Stopped`.
    fn finish(&self, cause: Option<UplinkError>) {
        if let Some(cause) = cause {
            self.cause.lock().get_or_insert(cause);
        }
        self.transition(PipelineState::Stopped);
    }

    fn cause(&self) -> Option<UplinkError> {
        self.cause.lock().clone()
    }
}

/// Parts owned by a pipeline that has not been started.
struct IdleParts {
    source: Box<dyn CaptureSource>,
    sender: NetworkSender,
}

/// Handle to the supervisor of a started pipeline.
struct RunningParts {
    stop_tx: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<()>,
}

/// A capture-to-network uplink.
///
/// Created by [`PipelineBuilder`](crate::PipelineBuilder). Frames flow in
/// background tasks from [`start`](Self::start) until [`stop`](Self::stop)
/// is called, the capture source runs out, or a fatal error occurs.
///
/// # Lifecycle
///
/// 1. [`start`](Self::start) opens the connection, then starts capture.
///    If the connection fails, capture is never started.
/// 2. Frames flow while the state is [`PipelineState::Running`].
/// 3. [`stop`](Self::stop) halts capture, drains or discards queued frames
///    per [`DrainPolicy`], then closes the connection.
/// 4. A fatal error (device lost, connection lost, too many failed sends)
///    runs the same teardown and is kept as the terminal cause.
///
/// Dropping a running `Pipeline` stops it in the background.
///
/// # Example
///
/// ```
/// use audio_uplink::net::MemoryTransport;
/// use audio_uplink::source::ScriptedSource;
/// use audio_uplink::{AudioUplink, PipelineState};
///
/// # tokio::runtime::Builder::new_multi_thread().enable_all().build().unwrap().block_on(async {
/// let mut script = ScriptedSource::transcription();
/// script.generate_sine(440.0, 1000);
/// let transport = MemoryTransport::new();
///
/// let mut pipeline = AudioUplink::builder()
///     .endpoint("memory://demo")
///     .source(script)
///     .transport(transport.clone())
///     .start()
///     .await?;
///
/// // The script runs out after one second; the pipeline stops by itself.
/// pipeline.wait().await?;
/// assert_eq!(pipeline.state(), PipelineState::Stopped);
/// assert_eq!(transport.sent_count(), 10);
/// # Ok::<(), audio_uplink::UplinkError>(())
/// # }).unwrap();
/// ```
pub struct Pipeline {
    config: UplinkConfig,
    shared: Arc<PipelineShared>,
    idle: Option<IdleParts>,
    running: Option<RunningParts>,
}

impl Pipeline {
    pub(crate) fn new(
        config: UplinkConfig,
        source: Box<dyn CaptureSource>,
        sender: NetworkSender,
        events: Option<EventCallback>,
    ) -> Self {
        Self {
            config,
            shared: Arc::new(PipelineShared::new(events)),
            idle: Some(IdleParts { source, sender }),
            running: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    /// Returns `true` while frames are flowing.
    pub fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    /// Returns a receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.shared.state.subscribe()
    }

    /// Current counters.
    pub fn stats(&self) -> PipelineStats {
        self.shared.stats.snapshot()
    }

    /// The error that ended the run, if it ended on one.
    pub fn terminal_cause(&self) -> Option<UplinkError> {
        self.shared.cause()
    }

    /// The configuration this pipeline was built with.
    pub fn config(&self) -> &UplinkConfig {
        &self.config
    }

    /// Opens the connection, then starts capture.
    ///
    /// Returns once frames can flow. On failure everything that was brought
    /// up is released again and the pipeline ends in
    /// [`PipelineState::Stopped`] with the error as its terminal cause.
    ///
    /// # Errors
    ///
    /// - [`UplinkError::InvalidState`] unless the pipeline is idle
    /// - [`UplinkError::ConnectionFailed`] if the connection cannot be
    ///   opened; capture is not started
    /// - [`UplinkError::PermissionDenied`] or
    ///   [`UplinkError::DeviceUnavailable`] if capture cannot start
    pub async fn start(&mut self) -> Result<(), UplinkError> {
        let state = self.state();
        let parts = match (state, self.idle.take()) {
            (PipelineState::Idle, Some(parts)) => parts,
            _ => {
                return Err(UplinkError::InvalidState {
                    state: state.to_string(),
                })
            }
        };
        let IdleParts {
            mut source,
            mut sender,
        } = parts;

        self.shared.transition(PipelineState::Starting);

        if let Err(e) = sender.connect(&self.config.endpoint).await {
            tracing::error!("Pipeline start failed: {}", e);
            self.shared.finish(Some(e.clone()));
            return Err(e);
        }
        let monitor = sender.monitor();
        let sender = Arc::new(AsyncMutex::new(sender));

        let queue = BoundedAsyncQueue::new(self.config.queue_capacity);
        let uplink = tokio::spawn(
            Uplink::new(
                queue.clone(),
                Arc::clone(&sender),
                Arc::clone(&self.shared),
                self.config.max_consecutive_send_failures,
            )
            .run(),
        );

        let format = CaptureFormat {
            sample_rate: self.config.sample_rate,
            poll_interval: self.config.capture_poll_interval,
        };
        let stream = match source.start(format).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("Capture source '{}' failed to start: {}", source.name(), e);
                queue.close();
                uplink.abort();
                sender.lock().await.close().await;
                self.shared.finish(Some(e.clone()));
                return Err(e);
            }
        };
        tracing::info!("Capture source '{}' started", source.name());
        self.shared.emit(UplinkEvent::SourceStarted {
            source: source.name().to_string(),
        });

        let shutdown = Arc::new(StopSignal::default());
        let capture = tokio::spawn(
            CaptureTask::new(
                stream,
                FrameBuffer::with_duration(self.config.sample_rate, self.config.frame_duration),
                queue.clone(),
                Arc::clone(&self.shared),
                Arc::clone(&shutdown),
                self.config.flush_partial_on_stop,
            )
            .run(),
        );

        self.shared.transition(PipelineState::Running);

        let (stop_tx, stop_rx) = oneshot::channel();
        let supervisor = Supervisor {
            source,
            sender,
            queue,
            monitor,
            capture: Some(capture),
            uplink: Some(uplink),
            shutdown,
            shared: Arc::clone(&self.shared),
            drain_policy: self.config.drain_policy,
        };
        self.running = Some(RunningParts {
            stop_tx: Some(stop_tx),
            supervisor: tokio::spawn(supervisor.run(stop_rx)),
        });
        Ok(())
    }

    /// Stops the pipeline and waits until every resource is released.
    ///
    /// Safe to call in any state and more than once. A pipeline that was
    /// never started goes straight to [`PipelineState::Stopped`].
    ///
    /// # Errors
    ///
    /// Returns the terminal cause if the run ended on a fatal error.
    pub async fn stop(&mut self) -> Result<(), UplinkError> {
        if let Some(mut running) = self.running.take() {
            if let Some(stop_tx) = running.stop_tx.take() {
                let _ = stop_tx.send(());
            }
            if let Err(e) = running.supervisor.await {
                self.shared.finish(Some(UplinkError::BackendError(format!(
                    "pipeline supervisor failed: {e}"
                ))));
            }
        } else if self.state() != PipelineState::Stopped {
            self.idle = None;
            self.shared.finish(None);
        }
        self.outcome()
    }

    /// Waits until the pipeline has stopped, whatever the reason.
    ///
    /// Never resolves for a pipeline that is never started or stopped.
    ///
    /// # Errors
    ///
    /// Returns the terminal cause if the run ended on a fatal error.
    pub async fn wait(&self) -> Result<(), UplinkError> {
        let mut rx = self.shared.state.subscribe();
        let _ = rx
            .wait_for(|state| *state == PipelineState::Stopped)
            .await;
        self.outcome()
    }

    fn outcome(&self) -> Result<(), UplinkError> {
        match self.shared.cause() {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state())
            .field("endpoint", &self.config.endpoint)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.running.as_mut().and_then(|r| r.stop_tx.take()) {
            tracing::debug!("Pipeline dropped while running, stopping in background");
            let _ = stop_tx.send(());
        }
    }
}

/// What woke the supervisor.
enum Trigger {
    StopRequested,
    CaptureEnded(Result<CaptureEnd, JoinError>),
    UplinkEnded(Result<UplinkEnd, JoinError>),
    ConnectionLost(String),
}

/// Owns the running resources and performs ordered teardown.
struct Supervisor {
    source: Box<dyn CaptureSource>,
    sender: Arc<AsyncMutex<NetworkSender>>,
    queue: BoundedAsyncQueue<Frame>,
    monitor: ConnectionMonitor,
    capture: Option<JoinHandle<CaptureEnd>>,
    uplink: Option<JoinHandle<UplinkEnd>>,
    shutdown: Arc<StopSignal>,
    shared: Arc<PipelineShared>,
    drain_policy: DrainPolicy,
}

impl Supervisor {
    async fn run(mut self, stop_rx: oneshot::Receiver<()>) {
        let trigger = self.wait_for_trigger(stop_rx).await;
        let (cause, reason) = self.resolve(trigger);
        self.teardown(cause, reason).await;
    }

    async fn wait_for_trigger(&mut self, stop_rx: oneshot::Receiver<()>) -> Trigger {
        let (Some(capture), Some(uplink)) = (self.capture.as_mut(), self.uplink.as_mut()) else {
            return Trigger::StopRequested;
        };
        tokio::select! {
            // A dropped handle counts as a stop request.
            _ = stop_rx => Trigger::StopRequested,
            end = capture => Trigger::CaptureEnded(end),
            end = uplink => Trigger::UplinkEnded(end),
            reason = self.monitor.lost() => Trigger::ConnectionLost(reason),
        }
    }

    /// Maps the trigger to a terminal cause and a reason for the source event.
    fn resolve(&mut self, trigger: Trigger) -> (Option<UplinkError>, String) {
        match trigger {
            Trigger::StopRequested => (None, "stopped".to_string()),
            Trigger::CaptureEnded(end) => {
                self.capture = None;
                match end {
                    Ok(CaptureEnd::Exhausted | CaptureEnd::Shutdown) => {
                        (None, "end of stream".to_string())
                    }
                    Ok(CaptureEnd::DeviceLost(reason)) => {
                        let cause = UplinkError::device_lost(reason);
                        let text = cause.to_string();
                        (Some(cause), text)
                    }
                    Err(e) => task_failure("capture", &e),
                }
            }
            Trigger::UplinkEnded(end) => {
                self.uplink = None;
                match end {
                    Ok(UplinkEnd::TooManySendFailures(count)) => {
                        let cause = UplinkError::TooManySendFailures { count };
                        let text = cause.to_string();
                        (Some(cause), text)
                    }
                    Ok(UplinkEnd::QueueClosed) => (None, "stopped".to_string()),
                    Err(e) => task_failure("uplink", &e),
                }
            }
            Trigger::ConnectionLost(reason) => {
                let cause = UplinkError::ConnectionLost { reason };
                let text = cause.to_string();
                (Some(cause), text)
            }
        }
    }

    async fn teardown(mut self, cause: Option<UplinkError>, reason: String) {
        self.shared.transition(PipelineState::Stopping);
        if let Some(cause) = &cause {
            tracing::error!("Pipeline stopping on fatal error: {}", cause);
        }

        // 1. No new samples.
        self.source.stop().await;
        self.shared.emit(UplinkEvent::SourceStopped {
            source: self.source.name().to_string(),
            reason,
        });

        // 2. Drain or discard what is queued.
        let connection_usable = !matches!(
            cause,
            Some(UplinkError::ConnectionLost { .. } | UplinkError::TooManySendFailures { .. })
        );
        match self.drain_policy {
            DrainPolicy::BestEffort { timeout } if connection_usable => self.drain(timeout).await,
            _ => {}
        }
        self.shutdown.stop();
        let discarded = self.queue.close();
        if !discarded.is_empty() {
            tracing::warn!("Discarding {} queued frames", discarded.len());
            self.shared.emit(UplinkEvent::FramesDiscarded {
                count: discarded.len(),
            });
        }
        drop(discarded);

        if let Some(capture) = self.capture.take() {
            let _ = capture.await;
        }
        if let Some(uplink) = self.uplink.take() {
            uplink.abort();
            let _ = uplink.await;
        }

        // 3. Close the connection.
        self.sender.lock().await.close().await;

        self.shared.stats.settle_discarded();
        let stats = self.shared.stats.snapshot();
        tracing::info!(
            "Pipeline stopped: {} frames sent, {} failed, {} discarded",
            stats.frames_sent,
            stats.frames_failed,
            stats.frames_discarded
        );
        self.shared.finish(cause);
    }

    /// Lets the uplink send what is queued, bounded by `timeout`.
    async fn drain(&mut self, timeout: Duration) {
        let mut capture_finished = false;
        let drained = tokio::time::timeout(timeout, async {
            // The producer may still be flushing its last frames.
            if let Some(capture) = self.capture.as_mut() {
                let _ = capture.await;
                capture_finished = true;
            }
            self.queue.drained().await;
            // Wait out the frame in flight.
            drop(self.sender.lock().await);
        })
        .await;

        if capture_finished {
            self.capture = None;
        }
        match drained {
            Ok(()) => tracing::debug!("Queue drained"),
            Err(_) => tracing::warn!(
                "Drain timed out after {:?} with {} frames queued",
                timeout,
                self.queue.len()
            ),
        }
    }
}

fn task_failure(task: &str, err: &JoinError) -> (Option<UplinkError>, String) {
    let cause = UplinkError::BackendError(format!("{task} task failed: {err}"));
    let text = cause.to_string();
    (Some(cause), text)
}
