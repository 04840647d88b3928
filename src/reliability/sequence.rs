//! Per-destination message sequence allocation.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::{rngs::OsRng, Rng};

use crate::core::{lock, Endpoint};

/// Hands out monotonically increasing sequences per destination.
///
/// The first sequence towards a destination is random in `[0, 2^31)`, so an
/// off-path sender cannot guess which sequence to acknowledge, and a
/// connection has 2^31 messages before the counter wraps.
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    next: Mutex<HashMap<Endpoint, u32>>,
}

impl SequenceAllocator {
    /// Create an empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next sequence towards `destination`.
    pub fn next(&self, destination: Endpoint) -> u32 {
        let mut next = lock(&self.next);
        let slot = next
            .entry(destination)
            .or_insert_with(|| OsRng.gen_range(0..1u32 << 31));
        let sequence = *slot;
        *slot = slot.wrapping_add(1);
        sequence
    }

    /// Forget a destination; its next sequence is random again.
    pub fn forget(&self, destination: Endpoint) {
        lock(&self.next).remove(&destination);
    }

    /// Forget every destination `keep` rejects.
    pub fn retain(&self, mut keep: impl FnMut(Endpoint) -> bool) {
        lock(&self.next).retain(|&destination, _| keep(destination));
    }

    /// Number of destinations with a live counter.
    pub fn len(&self) -> usize {
        lock(&self.next).len()
    }

    /// Whether no destination has a counter.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
