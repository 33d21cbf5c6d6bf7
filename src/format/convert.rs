//! Sample quantization and channel conversion.

/// Quantizes a normalized sample to signed 16-bit.
///
/// The input is clamped to [-1.0, 1.0] before scaling, so out-of-range
/// values saturate instead of wrapping. Positive values scale by 32767 and
/// negative values by 32768, which maps 1.0 to `i16::MAX` and -1.0 to
/// `i16::MIN` exactly. NaN quantizes to 0.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let clamped = sample.clamp(-1.0, 1.0);
    let scaled = if clamped >= 0.0 {
        clamped * 32767.0
    } else {
        clamped * 32768.0
    };
    scaled.round() as i16
}

/// Converts a signed 16-bit sample to a normalized float.
///
/// Exact inverse of [`f32_to_i16`] for every `i16` value.
#[inline]
pub fn i16_to_f32(sample: i16) -> f32 {
    if sample >= 0 {
        f32::from(sample) / 32767.0
    } else {
        f32::from(sample) / 32768.0
    }
}

/// Averages interleaved multi-channel samples down to mono.
///
/// A trailing incomplete frame is ignored. One channel (or zero) returns
/// the input unchanged.
pub fn downmix_to_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let channels = usize::from(channels);
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Quantizes a slice of normalized samples.
pub fn f32_slice_to_i16(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| f32_to_i16(s)).collect()
}
