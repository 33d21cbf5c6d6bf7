//! Fixed-length PCM frame, the unit of transmission.

use std::time::Duration;

/// One fixed-duration block of quantized mono samples.
///
/// Frames are created by [`FrameBuffer`](crate::FrameBuffer), moved through the
/// queue and consumed exactly once by the [`NetworkSender`](crate::NetworkSender).
/// The sample data is private so a frame cannot be mutated after creation.
///
/// # Example
///
/// ```
/// use audio_uplink::Frame;
/// use std::time::Duration;
///
/// let frame = Frame::new(0, vec![0i16; 1600], Duration::ZERO, 16000);
/// assert_eq!(frame.duration(), Duration::from_millis(100));
/// assert_eq!(frame.encode_pcm_le().len(), 3200);
/// ```
#[derive(Debug, PartialEq, Eq)]
pub struct Frame {
    sequence: u64,
    samples: Box<[i16]>,
    timestamp: Duration,
    sample_rate: u32,
}

impl Frame {
    /// Creates a frame.
    pub fn new(sequence: u64, samples: Vec<i16>, timestamp: Duration, sample_rate: u32) -> Self {
        Self {
            sequence,
            samples: samples.into_boxed_slice(),
            timestamp,
            sample_rate,
        }
    }

    /// Position of this frame in the run, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The quantized samples.
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Offset of the first sample from the start of the run.
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` if this frame contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Nominal duration derived from sample count and rate.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    /// Serializes the samples as raw little-endian signed 16-bit PCM.
    ///
    /// This is the whole wire message; there is no header.
    pub fn encode_pcm_le(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.samples.len() * 2);
        for sample in self.samples.iter() {
            payload.extend_from_slice(&sample.to_le_bytes());
        }
        payload
    }
}
