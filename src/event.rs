//! Runtime events for monitoring pipeline health.
//!
//! Events are notifications, not error handling. Most of them describe
//! conditions the pipeline absorbs and keeps running through; fatal causes
//! are also reported as [`UplinkError`](crate::UplinkError) from
//! [`Pipeline::wait()`](crate::Pipeline::wait).

use std::sync::Arc;

use crate::net::ConnectionState;
use crate::pipeline::PipelineState;

/// Runtime events emitted by a pipeline.
///
/// # Example
///
/// ```
/// use audio_uplink::UplinkEvent;
///
/// fn handle_event(event: UplinkEvent) {
///     match event {
///         UplinkEvent::FrameSendFailed { sequence, error } => {
///             eprintln!("frame {} lost: {}", sequence, error);
///         }
///         UplinkEvent::ServerMessage { text } => println!("{}", text),
///         other => eprintln!("{:?}", other),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub enum UplinkEvent {
    /// The pipeline moved to a new lifecycle state.
    PipelineStateChanged {
        /// State before the transition.
        previous: PipelineState,
        /// State after the transition.
        current: PipelineState,
    },

    /// The connection moved to a new state.
    ConnectionStateChanged {
        /// State before the transition.
        previous: ConnectionState,
        /// State after the transition.
        current: ConnectionState,
    },

    /// A frame could not be sent and is lost.
    ///
    /// Frames are not retried. Repeated failures beyond
    /// [`UplinkConfig::max_consecutive_send_failures`](crate::UplinkConfig::max_consecutive_send_failures)
    /// stop the pipeline.
    FrameSendFailed {
        /// Sequence number of the lost frame.
        sequence: u64,
        /// Description of the failure.
        error: String,
    },

    /// Queued frames were dropped at shutdown by the drain policy.
    FramesDiscarded {
        /// Number of frames dropped.
        count: usize,
    },

    /// Samples short of a full frame were dropped at shutdown.
    PartialFrameDiscarded {
        /// Number of staged samples dropped.
        samples: usize,
    },

    /// The capture backend could not hand samples over fast enough and
    /// dropped some before they reached the frame buffer.
    CaptureOverflow {
        /// Number of samples dropped since the last report.
        dropped_samples: u64,
    },

    /// The capture device went away mid-stream.
    DeviceLost {
        /// Description reported by the capture backend.
        reason: String,
    },

    /// The remote consumer sent a text message (e.g. a transcript).
    ServerMessage {
        /// Message body.
        text: String,
    },

    /// The capture source started delivering samples.
    SourceStarted {
        /// Name of the source.
        source: String,
    },

    /// The capture source stopped delivering samples.
    SourceStopped {
        /// Name of the source.
        source: String,
        /// Why the source stopped.
        reason: String,
    },
}

/// Callback type for receiving runtime events.
///
/// Register an event callback via [`PipelineBuilder::on_event()`].
///
/// [`PipelineBuilder::on_event()`]: crate::PipelineBuilder::on_event
pub type EventCallback = Arc<dyn Fn(UplinkEvent) + Send + Sync>;

/// Creates an [`EventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use audio_uplink::{event_callback, UplinkEvent};
///
/// let callback = event_callback(|event| {
///     println!("Got event: {:?}", event);
/// });
/// ```
pub fn event_callback<F>(f: F) -> EventCallback
where
    F: Fn(UplinkEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Invokes the callback if one is registered.
pub(crate) fn emit(callback: Option<&EventCallback>, event: UplinkEvent) {
    if let Some(callback) = callback {
        callback(event);
    }
}
