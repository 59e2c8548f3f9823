//! Bounded per-speaker sample queue used by the mixer.
//!
//! A [`SpeakerBuffer`] holds at most `max_frames` frames of link-format
//! PCM.  Pushing past that bound discards the oldest samples, so a speaker
//! whose packets outrun the mix cadence loses stale audio instead of
//! building up latency.  Frames are only ever read whole.
//!
//! ```rust
//! use voice_bridge::audio::SpeakerBuffer;
//!
//! let mut buf = SpeakerBuffer::new(2, 2);
//! assert_eq!(buf.push(&[1, 2, 3, 4, 5]), 1); // one sample over the bound
//! assert_eq!(buf.pop_frame(), Some(vec![2, 3]));
//! assert_eq!(buf.pop_frame(), Some(vec![4, 5]));
//! assert_eq!(buf.pop_frame(), None);
//! ```

use std::collections::VecDeque;

pub struct SpeakerBuffer {
    samples: VecDeque<i16>,
    frame_samples: usize,
    limit: usize,
    dropped: u64,
}

impl SpeakerBuffer {
    /// # Panics
    ///
    /// Panics if either argument is zero.
    pub fn new(frame_samples: usize, max_frames: usize) -> Self {
        assert!(frame_samples > 0 && max_frames > 0, "SpeakerBuffer bounds must be > 0");
        let limit = frame_samples * max_frames;
        Self {
            samples: VecDeque::with_capacity(limit),
            frame_samples,
            limit,
            dropped: 0,
        }
    }

    /// Queue `pcm`, evicting the oldest samples past the bound.  Returns how
    /// many samples were evicted.
    pub fn push(&mut self, pcm: &[i16]) -> usize {
        // Only the newest `limit` samples of a huge push can survive.
        let skipped = pcm.len().saturating_sub(self.limit);
        let pcm = &pcm[skipped..];
        let overflow = (self.samples.len() + pcm.len()).saturating_sub(self.limit);
        self.samples.drain(..overflow);
        self.samples.extend(pcm.iter().copied());

        let evicted = skipped + overflow;
        self.dropped += evicted as u64;
        evicted
    }

    /// Take the oldest full frame, if one is buffered.
    pub fn pop_frame(&mut self) -> Option<Vec<i16>> {
        if !self.has_frame() {
            return None;
        }
        Some(self.samples.drain(..self.frame_samples).collect())
    }

    pub fn has_frame(&self) -> bool {
        self.samples.len() >= self.frame_samples
    }

    /// Samples currently queued.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_frame_stays_queued() {
        let mut buf = SpeakerBuffer::new(4, 2);
        assert_eq!(buf.push(&[1, 2, 3]), 0);
        assert!(!buf.has_frame());
        assert_eq!(buf.pop_frame(), None);

        buf.push(&[4, 5]);
        assert_eq!(buf.pop_frame(), Some(vec![1, 2, 3, 4]));
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn overflow_evicts_oldest_across_pushes() {
        let mut buf = SpeakerBuffer::new(2, 2);
        buf.push(&[1, 2, 3]);
        assert_eq!(buf.push(&[4, 5, 6]), 2);

        assert_eq!(buf.len(), 4);
        assert_eq!(buf.dropped(), 2);
        assert_eq!(buf.pop_frame(), Some(vec![3, 4]));
        assert_eq!(buf.pop_frame(), Some(vec![5, 6]));
    }

    #[test]
    fn push_larger_than_bound_keeps_newest() {
        let mut buf = SpeakerBuffer::new(2, 1);
        buf.push(&[9]);
        assert_eq!(buf.push(&[1, 2, 3, 4, 5]), 4);
        assert_eq!(buf.pop_frame(), Some(vec![4, 5]));
        assert!(buf.is_empty());
    }

    #[test]
    #[should_panic(expected = "SpeakerBuffer bounds must be > 0")]
    fn zero_bound_panics() {
        let _ = SpeakerBuffer::new(0, 4);
    }
}
