//! Channel mixing and sample-rate conversion for 16-bit PCM.
//!
//! The voice transport delivers 48 kHz stereo while the transcription link
//! expects 24 kHz mono.  [`LinkFormatAdapter`](crate::audio::LinkFormatAdapter)
//! chains the two steps below:
//!
//! 1. [`downmix_to_mono`] — average interleaved channels.
//! 2. [`resample_linear`] — linear interpolation to the target rate.

// ---------------------------------------------------------------------------
// downmix_to_mono
// ---------------------------------------------------------------------------

/// Average each interleaved frame of `channels` samples into one.
///
/// A trailing partial frame is dropped, and zero channels yield nothing.
///
/// ```rust
/// use voice_bridge::audio::downmix_to_mono;
///
/// let stereo = [1000_i16, -1000, 400, 600]; // L R L R
/// assert_eq!(downmix_to_mono(&stereo, 2), vec![0, 500]);
/// ```
pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        n => {
            let n = n as usize;
            samples
                .chunks_exact(n)
                .map(|frame| {
                    let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                    (sum / n as i32) as i16
                })
                .collect()
        }
    }
}

// ---------------------------------------------------------------------------
// resample_linear
// ---------------------------------------------------------------------------

/// Resample mono `samples` from `source_rate` to `target_rate` Hz by linear
/// interpolation in exact integer arithmetic.
///
/// Equal (or zero) rates return the input unchanged.  The output holds
/// `ceil(len * target_rate / source_rate)` samples; positions past the last
/// input sample repeat it.
///
/// ```rust
/// use voice_bridge::audio::resample_linear;
///
/// // 20 ms at 48 kHz → 20 ms at 24 kHz
/// let hi = vec![250_i16; 960];
/// let lo = resample_linear(&hi, 48_000, 24_000);
/// assert_eq!(lo.len(), 480);
/// ```
pub fn resample_linear(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if source_rate == target_rate || source_rate == 0 || target_rate == 0 {
        return samples.to_vec();
    }

    let (src, dst) = (u64::from(source_rate), u64::from(target_rate));
    let out_len = (samples.len() as u64 * dst).div_ceil(src);

    (0..out_len)
        .map(|i| {
            // Output sample i sits at input position (i * src) / dst.
            let pos = i * src;
            let idx = (pos / dst) as usize;
            let rem = (pos % dst) as i64;
            match (samples.get(idx), samples.get(idx + 1)) {
                (Some(&a), Some(&b)) => {
                    let (a, b) = (i64::from(a), i64::from(b));
                    (a + (b - a) * rem / dst as i64) as i16
                }
                (Some(&a), None) => a,
                _ => 0,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
