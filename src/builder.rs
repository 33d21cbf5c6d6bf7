//! Builder pattern for `AudioUplink`.

use std::sync::Arc;
use std::time::Duration;

use crate::net::{NetworkSender, Transport, WebSocketTransport};
use crate::source::{CaptureSource, DeviceSource};
use crate::{event_callback, DrainPolicy, EventCallback, Pipeline, UplinkConfig, UplinkError, UplinkEvent};

/// Entry point for building uplink pipelines.
///
/// # Example
///
/// ```no_run
/// use audio_uplink::AudioUplink;
/// use audio_uplink::net::WebSocketTransport;
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), audio_uplink::UplinkError> {
/// let mut pipeline = AudioUplink::builder()
///     .endpoint("ws://localhost:8000/ws/audio")
///     .transport(WebSocketTransport::new().with_auth_token("secret"))
///     .queue_capacity(20)
///     .on_event(|e| tracing::warn!(?e, "uplink event"))
///     .start()
///     .await?;
///
/// tokio::time::sleep(Duration::from_secs(10)).await;
/// pipeline.stop().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct AudioUplink;

impl AudioUplink {
    /// Creates a new builder.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }
}

/// Builder for configuring and starting a [`Pipeline`].
///
/// Use [`AudioUplink::builder()`] to create a new builder. Without an
/// explicit source it captures from the default input device; without an
/// explicit transport it connects over WebSocket.
#[must_use]
pub struct PipelineBuilder {
    config: UplinkConfig,
    source: Option<Box<dyn CaptureSource>>,
    transport: Option<Arc<dyn Transport>>,
    event_callback: Option<EventCallback>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("config", &self.config)
            .field("source", &self.source.as_ref().map(|s| s.name().to_string()))
            .field("has_transport", &self.transport.is_some())
            .field("has_event_callback", &self.event_callback.is_some())
            .finish()
    }
}

impl PipelineBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: UplinkConfig::default(),
            source: None,
            transport: None,
            event_callback: None,
        }
    }

    /// Set the connection target.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    /// Set the sample rate of emitted frames.
    ///
    /// Default: 16000
    pub fn sample_rate(mut self, sample_rate: u32) -> Self {
        self.config.sample_rate = sample_rate;
        self
    }

    /// Set the duration of each frame.
    ///
    /// Default: 100ms
    pub fn frame_duration(mut self, duration: Duration) -> Self {
        self.config.frame_duration = duration;
        self
    }

    /// Bound the frame queue to `capacity` frames.
    ///
    /// Default: unbounded
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = Some(capacity);
        self
    }

    /// Let the frame queue grow without bound.
    pub fn unbounded_queue(mut self) -> Self {
        self.config.queue_capacity = None;
        self
    }

    /// Set what happens to queued frames on stop.
    pub fn drain_policy(mut self, policy: DrainPolicy) -> Self {
        self.config.drain_policy = policy;
        self
    }

    /// Drain queued frames on stop for at most `timeout`.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_policy = DrainPolicy::BestEffort { timeout };
        self
    }

    /// Bound how long connecting may take.
    ///
    /// Default: 10s
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Stop after more than `limit` consecutive failed sends; `None` never stops.
    ///
    /// Default: `Some(10)`
    pub fn max_consecutive_send_failures(mut self, limit: Option<u32>) -> Self {
        self.config.max_consecutive_send_failures = limit;
        self
    }

    /// Send the trailing partial frame on stop instead of discarding it.
    pub fn flush_partial_on_stop(mut self, flush: bool) -> Self {
        self.config.flush_partial_on_stop = flush;
        self
    }

    /// Set the capture source.
    pub fn source<S: CaptureSource + 'static>(mut self, source: S) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Capture from the input device with the given name.
    pub fn device(self, name: impl Into<String>) -> Self {
        self.source(DeviceSource::by_name(name))
    }

    /// Set the transport used to reach the endpoint.
    pub fn transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Set a callback to receive runtime events.
    ///
    /// Events include state changes, lost frames, capture overflow and
    /// messages from the server.
    pub fn on_event<F>(mut self, callback: F) -> Self
    where
        F: Fn(UplinkEvent) + Send + Sync + 'static,
    {
        self.event_callback = Some(event_callback(callback));
        self
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: UplinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the configuration built so far.
    pub fn config(&self) -> &UplinkConfig {
        &self.config
    }

    /// Build an idle pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`UplinkError::InvalidConfig`] if the configuration is not usable.
    pub fn build(self) -> Result<Pipeline, UplinkError> {
        self.config.validate()?;

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(WebSocketTransport::new()));
        let mut sender =
            NetworkSender::new(transport).with_connect_timeout(self.config.connect_timeout);
        if let Some(callback) = &self.event_callback {
            sender = sender.with_event_callback(Arc::clone(callback));
        }
        let source = self
            .source
            .unwrap_or_else(|| Box::new(DeviceSource::default_device()));

        tracing::debug!(
            "Building pipeline: {} at {}Hz, {:?} frames, queue {:?}",
            source.name(),
            self.config.sample_rate,
            self.config.frame_duration,
            self.config.queue_capacity
        );
        Ok(Pipeline::new(self.config, source, sender, self.event_callback))
    }

    /// Build and start the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid
    /// - The connection cannot be opened (capture is not started)
    /// - The capture source cannot start
    pub async fn start(self) -> Result<Pipeline, UplinkError> {
        let mut pipeline = self.build()?;
        pipeline.start().await?;
        Ok(pipeline)
    }
}
