//! Anti-replay sliding window over inbound record sequences.
//!
//! - Window size: [`REPLAY_WINDOW_SIZE`] sequences
//! - Below window: reject
//! - Seen sequence: reject
//! - Above highest: advance the window
//!
//! The bitmap is a ring indexed by `sequence % bits`, with one spare word so
//! that advancing clears whole words without losing the oldest in-window
//! entries.

use crate::core::{CryptoError, REPLAY_WINDOW_SIZE};

const WORD_BITS: u64 = 64;
const WORDS: usize = REPLAY_WINDOW_SIZE / WORD_BITS as usize + 1;
const RING_BITS: u64 = WORDS as u64 * WORD_BITS;

/// Anti-replay sliding window.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    bitmap: [u64; WORDS],
    highest: u64,
}

impl ReplayWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self {
            bitmap: [0; WORDS],
            highest: 0,
        }
    }

    /// Whether `sequence` must be rejected. Does not update the window.
    pub fn is_replay(&self, sequence: u64) -> bool {
        if sequence > self.highest {
            return false;
        }
        if self.highest - sequence >= REPLAY_WINDOW_SIZE as u64 {
            return true;
        }
        let (word, bit) = Self::position(sequence);
        self.bitmap[word] & bit != 0
    }

    /// Record `sequence` as seen. Call only after the record authenticated.
    pub fn mark(&mut self, sequence: u64) {
        if sequence > self.highest {
            let current = self.highest / WORD_BITS;
            let target = sequence / WORD_BITS;
            let advance = (target - current).min(WORDS as u64);
            for i in 1..=advance {
                let word = ((current + i) % WORDS as u64) as usize;
                self.bitmap[word] = 0;
            }
            self.highest = sequence;
        } else if self.highest - sequence >= REPLAY_WINDOW_SIZE as u64 {
            return;
        }

        let (word, bit) = Self::position(sequence);
        self.bitmap[word] |= bit;
    }

    /// Check and record in one step.
    pub fn check_and_update(&mut self, sequence: u64) -> Result<(), CryptoError> {
        if self.is_replay(sequence) {
            return Err(CryptoError::ReplayDetected);
        }
        self.mark(sequence);
        Ok(())
    }

    /// Highest sequence seen so far.
    pub fn highest(&self) -> u64 {
        self.highest
    }

    fn position(sequence: u64) -> (usize, u64) {
        let index = sequence % RING_BITS;
        ((index / WORD_BITS) as usize, 1 << (index % WORD_BITS))
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}
