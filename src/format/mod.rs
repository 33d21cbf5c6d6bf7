//! Audio format conversion utilities.
//!
//! - Sample quantization (f32 ↔ i16)
//! - Channel conversion (multi-channel → mono)
//! - Sample rate conversion (resampling)

mod convert;
mod resample;

pub use convert::{downmix_to_mono, f32_slice_to_i16, f32_to_i16, i16_to_f32};
pub use resample::{resample, Resampler};

/// Converts device-native audio to mono at the target rate.
///
/// Keeps resampling state between calls, so one converter serves exactly
/// one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatConverter {
    device_channels: u16,
    resampler: Resampler,
}

impl FormatConverter {
    /// Creates a converter from the device format to mono at `target_sample_rate`.
    pub fn new(device_sample_rate: u32, device_channels: u16, target_sample_rate: u32) -> Self {
        Self {
            device_channels,
            resampler: Resampler::new(device_sample_rate, target_sample_rate),
        }
    }

    /// Returns `true` if [`convert`](Self::convert) copies its input unchanged.
    pub fn is_passthrough(&self) -> bool {
        self.device_channels <= 1 && self.resampler.is_passthrough()
    }

    /// Downmixes then resamples the next chunk of interleaved device samples.
    pub fn convert(&mut self, interleaved: &[f32]) -> Vec<f32> {
        let mono = downmix_to_mono(interleaved, self.device_channels);
        self.resampler.process(&mono)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converter_passthrough() {
        let mut converter = FormatConverter::new(16000, 1, 16000);
        assert!(converter.is_passthrough());
        assert_eq!(converter.convert(&[0.1, 0.2]), vec![0.1, 0.2]);
    }

    #[test]
    fn test_converter_stereo_48k_to_mono_16k() {
        let mut converter = FormatConverter::new(48000, 2, 16000);
        assert!(!converter.is_passthrough());
        // 10ms of 48kHz stereo
        let input = vec![0.0f32; 960];
        assert_eq!(converter.convert(&input).len(), 160);
    }

    #[test]
    fn test_converter_keeps_rate_across_callbacks() {
        // One second of 48kHz stereo in 1000-frame device callbacks.
        let mut converter = FormatConverter::new(48000, 2, 16000);
        let total: usize = (0..48)
            .map(|_| converter.convert(&[0.25; 2000]).len())
            .sum();
        assert_eq!(total, 16000);
    }
}
