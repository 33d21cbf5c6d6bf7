//! Staging buffer that slices a sample stream into fixed-length frames.

use std::time::Duration;

use crate::format::f32_to_i16;
use crate::Frame;

/// Accumulates samples and emits a [`Frame`] each time a full frame's worth
/// has been staged.
///
/// Samples are quantized to `i16` as they enter. Frames are cut oldest-first
/// and numbered from 0. Whatever is short of a full frame stays staged for
/// the next [`push`](Self::push); at the end of a stream it is either
/// emitted by [`flush`](Self::flush) or dropped by [`discard`](Self::discard).
///
/// # Example
///
/// ```
/// use audio_uplink::FrameBuffer;
///
/// let mut buffer = FrameBuffer::new(16000, 1600);
/// let frames = buffer.push(&vec![0.0f32; 4000]);
/// assert_eq!(frames.len(), 2);
/// assert_eq!(buffer.staged_len(), 800);
/// ```
#[derive(Debug)]
pub struct FrameBuffer {
    staged: Vec<i16>,
    frame_len: usize,
    sample_rate: u32,
    next_sequence: u64,
    samples_emitted: u64,
}

impl FrameBuffer {
    /// Creates a buffer that cuts frames of `frame_len` samples (at least 1).
    pub fn new(sample_rate: u32, frame_len: usize) -> Self {
        let frame_len = frame_len.max(1);
        Self {
            staged: Vec::with_capacity(frame_len * 2),
            frame_len,
            sample_rate,
            next_sequence: 0,
            samples_emitted: 0,
        }
    }

    /// Creates a buffer for frames of `frame_duration` at `sample_rate`.
    pub fn with_duration(sample_rate: u32, frame_duration: Duration) -> Self {
        Self::new(
            sample_rate,
            crate::config::frame_sample_count(sample_rate, frame_duration),
        )
    }

    /// Samples per frame.
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Number of samples waiting for a full frame.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Sequence number the next frame will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Stages normalized samples and returns every frame that became complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Frame> {
        self.staged.extend(samples.iter().map(|&s| f32_to_i16(s)));
        self.cut_frames()
    }

    /// Stages already-quantized samples and returns every completed frame.
    pub fn push_i16(&mut self, samples: &[i16]) -> Vec<Frame> {
        self.staged.extend_from_slice(samples);
        self.cut_frames()
    }

    /// Emits the staged remainder as a short final frame, if there is one.
    pub fn flush(&mut self) -> Option<Frame> {
        if self.staged.is_empty() {
            return None;
        }
        let samples = std::mem::take(&mut self.staged);
        Some(self.make_frame(samples))
    }

    /// Drops the staged remainder and returns how many samples were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.staged.len();
        self.staged.clear();
        dropped
    }

    fn cut_frames(&mut self) -> Vec<Frame> {
        let count = self.staged.len() / self.frame_len;
        if count == 0 {
            return Vec::new();
        }
        let consumed = count * self.frame_len;
        let mut frames = Vec::with_capacity(count);
        // Drain once so the remainder only moves a single time.
        let emitted: Vec<i16> = self.staged.drain(..consumed).collect();
        for chunk in emitted.chunks_exact(self.frame_len) {
            frames.push(self.make_frame(chunk.to_vec()));
        }
        frames
    }

    fn make_frame(&mut self, samples: Vec<i16>) -> Frame {
        let timestamp = if self.sample_rate == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(self.samples_emitted as f64 / f64::from(self.sample_rate))
        };
        self.samples_emitted += samples.len() as u64;
        let frame = Frame::new(self.next_sequence, samples, timestamp, self.sample_rate);
        self.next_sequence += 1;
        frame
    }
}
