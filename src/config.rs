//! Configuration types for the uplink pipeline.

use std::time::Duration;

use crate::UplinkError;

/// What happens to frames still queued when the pipeline stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPolicy {
    /// Keep sending queued frames until the queue is empty or `timeout`
    /// elapses, then discard whatever is left.
    BestEffort {
        /// Upper bound on the drain phase.
        timeout: Duration,
    },

    /// Discard queued frames immediately.
    Discard,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self::BestEffort {
            timeout: Duration::from_millis(500),
        }
    }
}

/// Configuration for an uplink pipeline.
///
/// Use [`UplinkConfig::default()`] for sensible defaults, or customize as needed.
///
/// # Example
///
/// ```
/// use audio_uplink::UplinkConfig;
/// use std::time::Duration;
///
/// let config = UplinkConfig {
///     endpoint: "ws://localhost:8000/ws/audio".to_string(),
///     frame_duration: Duration::from_millis(50),
///     queue_capacity: Some(20),
///     ..Default::default()
/// };
/// assert_eq!(config.frame_sample_count(), 800);
/// ```
#[derive(Debug, Clone)]
pub struct UplinkConfig {
    /// Sample rate of emitted frames in Hz.
    ///
    /// Default: 16000
    pub sample_rate: u32,

    /// Duration of each frame.
    ///
    /// Default: 100ms
    pub frame_duration: Duration,

    /// Maximum number of frames waiting for the network.
    ///
    /// `None` means unbounded: the producer never suspends.
    /// Default: `None`
    pub queue_capacity: Option<usize>,

    /// Connection target, e.g. `ws://localhost:8000/ws/audio`.
    pub endpoint: String,

    /// Shutdown behaviour for queued frames.
    ///
    /// Default: best-effort drain bounded by 500ms
    pub drain_policy: DrainPolicy,

    /// Bound on connection setup during start.
    ///
    /// Default: 10s
    pub connect_timeout: Duration,

    /// Consecutive per-frame send failures tolerated before the pipeline
    /// stops. `None` never stops on send failures.
    ///
    /// Default: 10
    pub max_consecutive_send_failures: Option<u32>,

    /// Emit the trailing partial frame on stop instead of discarding it.
    ///
    /// Default: false
    pub flush_partial_on_stop: bool,

    /// How often device capture polls its ring buffer.
    ///
    /// Default: 20ms
    pub capture_poll_interval: Duration,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_duration: Duration::from_millis(100),
            queue_capacity: None,
            endpoint: String::new(),
            drain_policy: DrainPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            max_consecutive_send_failures: Some(10),
            flush_partial_on_stop: false,
            capture_poll_interval: Duration::from_millis(20),
        }
    }
}

impl UplinkConfig {
    /// Number of samples in one frame.
    #[must_use]
    pub fn frame_sample_count(&self) -> usize {
        frame_sample_count(self.sample_rate, self.frame_duration)
    }

    /// Checks that the configuration can drive a pipeline.
    pub fn validate(&self) -> Result<(), UplinkError> {
        if self.sample_rate == 0 {
            return Err(invalid("sample rate must be non-zero"));
        }
        if self.frame_sample_count() == 0 {
            return Err(invalid(format!(
                "frame duration {:?} holds no samples at {}Hz",
                self.frame_duration, self.sample_rate
            )));
        }
        if self.queue_capacity == Some(0) {
            return Err(invalid("queue capacity must be at least 1"));
        }
        if self.endpoint.trim().is_empty() {
            return Err(invalid("endpoint is not set"));
        }
        Ok(())
    }
}

/// Samples per frame for a rate and duration, rounded down.
pub(crate) fn frame_sample_count(sample_rate: u32, frame_duration: Duration) -> usize {
    (u128::from(sample_rate) * frame_duration.as_micros() / 1_000_000) as usize
}

fn invalid(reason: impl Into<String>) -> UplinkError {
    UplinkError::InvalidConfig {
        reason: reason.into(),
    }
}
