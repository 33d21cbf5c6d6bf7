//! Scripted audio source for testing without hardware.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{CaptureEvent, CaptureFormat, CaptureSource, SampleStream, StopSignal};
use crate::format::{i16_to_f32, FormatConverter};
use crate::UplinkError;

/// A source that plays back audio prepared ahead of time.
///
/// Samples are delivered in chunks of [`chunk_duration`](Self::chunk_duration),
/// optionally paced by a timeslice like a recorder would. Failures can be
/// scripted too, which makes it possible to exercise the whole pipeline in
/// CI.
///
/// # Example
///
/// ```
/// use audio_uplink::source::ScriptedSource;
/// use std::time::Duration;
///
/// let mut script = ScriptedSource::transcription();
///
/// // 100ms of silence, then 100ms of a 440Hz tone
/// script.generate_silence(100);
/// script.generate_sine(440.0, 100);
/// assert_eq!(script.duration(), Duration::from_millis(200));
/// ```
#[derive(Debug)]
pub struct ScriptedSource {
    name: String,
    sample_rate: u32,
    samples: Vec<f32>,
    chunk_duration: Duration,
    interval: Option<Duration>,
    start_error: Option<UplinkError>,
    lose_device: Option<(usize, String)>,
    hold_open: bool,
    started: bool,
    stop: Arc<StopSignal>,
}

impl ScriptedSource {
    /// Creates an empty mono script at the given sample rate.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            name: "scripted".to_string(),
            sample_rate,
            samples: Vec::new(),
            chunk_duration: Duration::from_millis(20),
            interval: None,
            start_error: None,
            lose_device: None,
            hold_open: false,
            started: false,
            stop: Arc::new(StopSignal::default()),
        }
    }

    /// Creates a script at 16kHz, the usual transcription rate.
    pub fn transcription() -> Self {
        Self::new(16000)
    }

    /// Sets the name used in logs and events.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets how much audio each delivered chunk carries.
    ///
    /// Default: 20ms
    #[must_use]
    pub fn chunk_duration(mut self, duration: Duration) -> Self {
        self.chunk_duration = duration;
        self
    }

    /// Delivers one chunk per `interval` instead of as fast as possible.
    #[must_use]
    pub fn paced(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Makes `start` fail with `error`.
    #[must_use]
    pub fn fail_start(mut self, error: UplinkError) -> Self {
        self.start_error = Some(error);
        self
    }

    /// Reports the device as lost after `chunks` chunks have been delivered.
    #[must_use]
    pub fn lose_device_after(mut self, chunks: usize, reason: impl Into<String>) -> Self {
        self.lose_device = Some((chunks, reason.into()));
        self
    }

    /// Keeps the stream open after the script runs out, until stopped.
    #[must_use]
    pub fn hold_open(mut self, hold: bool) -> Self {
        self.hold_open = hold;
        self
    }

    /// Returns the sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Generates silence for the given duration in milliseconds.
    pub fn generate_silence(&mut self, duration_ms: u64) {
        let count = self.samples_for_duration(duration_ms);
        self.samples.resize(self.samples.len() + count, 0.0);
    }

    /// Generates a full-scale sine wave at `frequency` Hz.
    pub fn generate_sine(&mut self, frequency: f64, duration_ms: u64) {
        let count = self.samples_for_duration(duration_ms);
        let sample_rate = f64::from(self.sample_rate);
        self.samples.extend((0..count).map(|i| {
            let t = i as f64 / sample_rate;
            (2.0 * std::f64::consts::PI * frequency * t).sin() as f32
        }));
    }

    /// Generates deterministic white noise with peak `amplitude`.
    pub fn generate_noise(&mut self, duration_ms: u64, amplitude: f32) {
        let count = self.samples_for_duration(duration_ms);
        // LCG so runs are reproducible
        let mut seed: u32 = 12345;
        self.samples.extend((0..count).map(|_| {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let unit = f32::from((seed >> 16) as u16) / 32768.0 - 1.0;
            unit * amplitude
        }));
    }

    /// Appends normalized samples.
    pub fn add_samples(&mut self, samples: &[f32]) {
        self.samples.extend_from_slice(samples);
    }

    /// Appends 16-bit samples. They survive quantization unchanged.
    pub fn add_i16_samples(&mut self, samples: &[i16]) {
        self.samples.extend(samples.iter().map(|&s| i16_to_f32(s)));
    }

    /// Returns the scripted samples.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Returns the duration of the scripted audio.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    fn samples_for_duration(&self, duration_ms: u64) -> usize {
        (u64::from(self.sample_rate) * duration_ms / 1000) as usize
    }
}

#[async_trait]
impl CaptureSource for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self, format: CaptureFormat) -> Result<Box<dyn SampleStream>, UplinkError> {
        if let Some(error) = self.start_error.clone() {
            return Err(error);
        }
        if self.started {
            return Err(UplinkError::device_unavailable(&self.name, "already started"));
        }
        self.started = true;

        let mut converter = FormatConverter::new(self.sample_rate, 1, format.sample_rate);
        let converted = converter.convert(&std::mem::take(&mut self.samples));
        let chunk_len =
            crate::config::frame_sample_count(format.sample_rate, self.chunk_duration).max(1);
        let chunks: VecDeque<Vec<f32>> = converted.chunks(chunk_len).map(<[f32]>::to_vec).collect();

        tracing::debug!(
            "ScriptedSource '{}' started: {} chunks of {} samples",
            self.name,
            chunks.len(),
            chunk_len
        );

        Ok(Box::new(ScriptedStream {
            chunks,
            pacing: self.interval.map(tokio::time::interval),
            lose_device: self.lose_device.take(),
            delivered: 0,
            hold_open: self.hold_open,
            stop: Arc::clone(&self.stop),
        }))
    }

    async fn stop(&mut self) {
        if !self.stop.is_stopped() {
            self.stop.stop();
            tracing::debug!("ScriptedSource '{}' stopped", self.name);
        }
    }
}

struct ScriptedStream {
    chunks: VecDeque<Vec<f32>>,
    pacing: Option<tokio::time::Interval>,
    lose_device: Option<(usize, String)>,
    delivered: usize,
    hold_open: bool,
    stop: Arc<StopSignal>,
}

#[async_trait]
impl SampleStream for ScriptedStream {
    async fn next_event(&mut self) -> Option<CaptureEvent> {
        if self.stop.is_stopped() {
            return None;
        }
        let lost = matches!(&self.lose_device, Some((after, _)) if self.delivered >= *after);
        if lost {
            if let Some((_, reason)) = self.lose_device.take() {
                self.chunks.clear();
                return Some(CaptureEvent::DeviceLost { reason });
            }
        }

        if self.chunks.is_empty() {
            if self.hold_open {
                self.stop.wait().await;
            }
            return None;
        }

        if let Some(pacing) = self.pacing.as_mut() {
            tokio::select! {
                _ = pacing.tick() => {}
                () = self.stop.wait() => return None,
            }
        }

        let chunk = self.chunks.pop_front()?;
        self.delivered += 1;
        Some(CaptureEvent::Samples(chunk))
    }
}
