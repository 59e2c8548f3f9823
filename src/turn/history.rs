//! Bounded transcript history for one session.

use std::collections::VecDeque;

use crate::transcription::TranscriptEntry;

/// Finalized transcripts, oldest first.  Once `cap` entries are held the
/// oldest is evicted.
#[derive(Debug, Clone)]
pub struct TranscriptHistory {
    entries: VecDeque<TranscriptEntry>,
    cap: usize,
}

impl TranscriptHistory {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            entries: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, entry: TranscriptEntry) {
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<TranscriptEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&TranscriptEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
