//! Sample rate conversion.
//!
//! Linear interpolation: fast, and good enough for speech headed to a
//! transcription service.

/// Streaming linear resampler for mono audio.
///
/// Output positions are tracked against the total input consumed, so
/// feeding a signal in chunks gives exactly the samples a single call over
/// the whole signal would. The last input sample is carried over to
/// interpolate across chunk boundaries.
///
/// # Example
///
/// ```
/// use audio_uplink::format::Resampler;
///
/// let mut resampler = Resampler::new(48000, 16000);
/// let total: usize = (0..48)
///     .map(|_| resampler.process(&[0.0; 1000]).len())
///     .sum();
/// assert_eq!(total, 16000);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Resampler {
    from_rate: u32,
    to_rate: u32,
    /// Output samples produced so far.
    produced: u64,
    /// Input samples consumed so far.
    consumed: u64,
    /// Last sample of the previous chunk.
    carry: Option<f32>,
}

impl Resampler {
    /// Creates a resampler from `from_rate` to `to_rate` Hz.
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            from_rate,
            to_rate,
            produced: 0,
            consumed: 0,
            carry: None,
        }
    }

    /// Returns `true` if [`process`](Self::process) copies its input unchanged.
    pub fn is_passthrough(&self) -> bool {
        self.from_rate == self.to_rate
    }

    /// Resamples the next chunk of the stream.
    ///
    /// Outputs whose position falls after the last input sample are emitted
    /// with the following chunk.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return samples.to_vec();
        }
        if samples.is_empty() || self.from_rate == 0 || self.to_rate == 0 {
            return Vec::new();
        }

        let from = i128::from(self.from_rate);
        let to = i128::from(self.to_rate);
        let len = samples.len() as i128;
        let consumed = i128::from(self.consumed);
        let mut out = Vec::with_capacity((samples.len() as u64 * u64::from(self.to_rate)
            / u64::from(self.from_rate)) as usize
            + 1);

        loop {
            // Position of the next output relative to this chunk, in 1/to units.
            let position = i128::from(self.produced) * from - consumed * to;
            if position > (len - 1) * to {
                break;
            }
            let index = position.div_euclid(to);
            let rem = position.rem_euclid(to);
            let at = |i: i128| -> f32 {
                if i < 0 {
                    self.carry.unwrap_or(samples[0])
                } else {
                    samples[i as usize]
                }
            };
            let s1 = at(index);
            let value = if rem == 0 {
                s1
            } else {
                let frac = (rem as f64 / to as f64) as f32;
                s1 + (at(index + 1) - s1) * frac
            };
            out.push(value);
            self.produced += 1;
        }

        self.consumed += samples.len() as u64;
        self.carry = samples.last().copied();
        out
    }
}

/// Resamples a complete mono signal from one sample rate to another.
///
/// Returns the input unchanged when the rates match. A zero rate on either
/// side yields an empty output. Use [`Resampler`] for audio that arrives in
/// chunks.
///
/// # Arguments
///
/// * `samples` - Input samples (mono)
/// * `from_rate` - Source sample rate in Hz
/// * `to_rate` - Target sample rate in Hz
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    Resampler::new(from_rate, to_rate).process(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked(samples: &[f32], chunk: usize, from_rate: u32, to_rate: u32) -> Vec<f32> {
        let mut resampler = Resampler::new(from_rate, to_rate);
        samples
            .chunks(chunk)
            .flat_map(|c| resampler.process(c))
            .collect()
    }

    #[test]
    fn test_resample_same_rate() {
        let samples = vec![0.1f32, 0.2, 0.3];
        assert_eq!(resample(&samples, 16000, 16000), samples);
    }

    #[test]
    fn test_resample_empty() {
        assert!(resample(&[], 48000, 16000).is_empty());
    }

    #[test]
    fn test_resample_downsample() {
        // 48kHz to 16kHz = 3:1 ratio
        let samples: Vec<f32> = (0..480).map(|i| i as f32 / 480.0).collect();
        let out = resample(&samples, 48000, 16000);
        assert_eq!(out.len(), 160);
        assert_eq!(out[1], samples[3]);
    }

    #[test]
    fn test_resample_upsample_interpolates() {
        let samples = vec![0.0f32, 1.0];
        let resampled = resample(&samples, 1, 2);
        assert_eq!(resampled.len(), 3);
        assert_eq!(resampled[0], 0.0);
        assert!((resampled[1] - 0.5).abs() < 1e-6);
        assert_eq!(resampled[2], 1.0);
    }

    #[test]
    fn test_resample_zero_rates() {
        assert!(resample(&[0.5], 16000, 0).is_empty());
        assert!(resample(&[0.5], 0, 16000).is_empty());
    }

    #[test]
    fn test_chunked_downsample_keeps_rate() {
        let samples: Vec<f32> = (0..48000).map(|i| (i as f32 * 0.01).sin()).collect();
        let whole = resample(&samples, 48000, 16000);
        let parts = chunked(&samples, 1000, 48000, 16000);

        assert_eq!(whole.len(), 16000);
        assert_eq!(parts, whole);
    }

    #[test]
    fn test_chunked_upsample_interpolates_across_boundary() {
        let ramp: Vec<f32> = (0..8).map(|i| i as f32 / 10.0).collect();
        let whole = resample(&ramp, 8000, 16000);
        let parts = chunked(&ramp, 3, 8000, 16000);

        assert_eq!(parts, whole);
        // The output between the last sample of one chunk and the first of
        // the next is interpolated, not repeated.
        assert!((parts[5] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_uneven_ratio_and_chunking_match() {
        let samples: Vec<f32> = (0..4410).map(|i| (i % 97) as f32 / 97.0).collect();
        let whole = resample(&samples, 44100, 16000);
        for chunk in [1, 7, 441, 1000] {
            assert_eq!(chunked(&samples, chunk, 44100, 16000), whole, "chunk {chunk}");
        }
    }
}
