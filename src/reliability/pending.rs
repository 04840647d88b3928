//! Acknowledgement tracking and resend-with-backoff.
//!
//! Each `(destination, classification)` pair owns a FIFO queue of in-flight
//! messages. Only the head can be acknowledged; the control channel assumes
//! in-order delivery, so an acknowledgement for a later entry is a reordered
//! duplicate and is ignored.
//!
//! Completions are never resolved while the store lock is held. The first
//! send of a registration is queued under it, so frames leave in sequence
//! order; resends are queued after it is released.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::core::{
    lock, AckClassification, Endpoint, PacketSink, TransportError, TransportResult,
    DEFAULT_MAX_RESEND_ATTEMPTS, DEFAULT_RESEND_BACKOFF, DEFAULT_RESEND_INTERVAL,
};

use super::completion::Completion;
use super::sequence::SequenceAllocator;

/// Resend schedule for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendPolicy {
    /// Wait before the first resend.
    pub interval: Duration,
    /// Send attempts, the first send included, before `Timeout`.
    pub max_attempts: u32,
    /// Multiplier applied to the interval after every resend (1 = fixed).
    pub backoff: u32,
}

impl Default for ResendPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RESEND_INTERVAL,
            max_attempts: DEFAULT_MAX_RESEND_ATTEMPTS,
            backoff: DEFAULT_RESEND_BACKOFF,
        }
    }
}

/// What an acknowledgement did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Matched the head entry, which completed successfully.
    Completed,
    /// Older than anything outstanding (duplicate or late); ignored.
    Stale,
    /// Matched an entry behind the head; ignored.
    Reordered,
}

/// An in-flight message awaiting acknowledgement.
#[derive(Debug)]
struct PendingAck {
    sequence: u32,
    frames: Vec<Bytes>,
    completion: Completion<()>,
    attempts: u32,
    max_attempts: u32,
    interval: Duration,
    backoff: u32,
    deadline: Instant,
}

#[derive(Debug, Default)]
struct PendingQueue {
    entries: VecDeque<PendingAck>,
    highest_registered: Option<u32>,
    /// When the last entry left the queue.
    drained_at: Option<Instant>,
}

impl PendingQueue {
    fn mark_if_drained(&mut self, now: Instant) {
        if self.entries.is_empty() && self.drained_at.is_none() {
            self.drained_at = Some(now);
        }
    }
}

type QueueKey = (Endpoint, AckClassification);
type Queues = HashMap<QueueKey, PendingQueue>;

/// Shared store of in-flight acknowledged messages.
#[derive(Debug, Default)]
pub struct PendingAckStore {
    queues: Mutex<Queues>,
}

impl PendingAckStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a message and perform its first send through `sink`.
    ///
    /// `sequence` must be greater than every sequence registered before for
    /// the same destination and classification; otherwise the completion
    /// fails with `ProtocolError` and nothing is sent.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        destination: Endpoint,
        classification: AckClassification,
        sequence: u32,
        frames: Vec<Bytes>,
        completion: Completion<()>,
        policy: ResendPolicy,
        now: Instant,
        sink: &dyn PacketSink,
    ) -> TransportResult<()> {
        let queues = lock(&self.queues);
        Self::enqueue(queues, destination, classification, sequence, frames, completion, policy, now, sink)
    }

    /// Allocate the next sequence towards `destination` from `sequences`,
    /// build its frames and register them in one step.
    ///
    /// Allocation happens under the store lock, so concurrent senders
    /// register in the order their sequences were handed out.
    #[allow(clippy::too_many_arguments)]
    pub fn register_next<F>(
        &self,
        destination: Endpoint,
        classification: AckClassification,
        sequences: &SequenceAllocator,
        build: F,
        completion: Completion<()>,
        policy: ResendPolicy,
        now: Instant,
        sink: &dyn PacketSink,
    ) -> TransportResult<u32>
    where
        F: FnOnce(u32) -> Vec<Bytes>,
    {
        let queues = lock(&self.queues);
        let sequence = sequences.next(destination);
        let frames = build(sequence);
        Self::enqueue(queues, destination, classification, sequence, frames, completion, policy, now, sink)?;
        Ok(sequence)
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue(
        mut queues: MutexGuard<'_, Queues>,
        destination: Endpoint,
        classification: AckClassification,
        sequence: u32,
        frames: Vec<Bytes>,
        completion: Completion<()>,
        policy: ResendPolicy,
        now: Instant,
        sink: &dyn PacketSink,
    ) -> TransportResult<()> {
        let queue = queues.entry((destination, classification)).or_default();

        if queue.highest_registered.is_some_and(|highest| sequence <= highest) {
            drop(queues);
            let reason = format!("sequence {sequence} reused for {destination}");
            completion.complete(Err(TransportError::protocol(reason.clone())));
            return Err(TransportError::protocol(reason));
        }

        queue.highest_registered = Some(sequence);
        queue.drained_at = None;
        queue.entries.push_back(PendingAck {
            sequence,
            frames: frames.clone(),
            completion,
            attempts: 1,
            max_attempts: policy.max_attempts.max(1),
            interval: policy.interval,
            backoff: policy.backoff.max(1),
            deadline: now + policy.interval,
        });

        sink.transmit(destination, classification, frames);
        Ok(())
    }

    /// Apply an acknowledgement from `destination`.
    ///
    /// Returns `ProtocolError` when the peer acknowledged a sequence that
    /// was never sent to it; the queue is left untouched.
    pub fn acknowledge(
        &self,
        destination: Endpoint,
        classification: AckClassification,
        sequence: u32,
    ) -> TransportResult<AckOutcome> {
        let completed = {
            let mut queues = lock(&self.queues);
            let Some(queue) = queues.get_mut(&(destination, classification)) else {
                warn!(%destination, sequence, ?classification, "acknowledgement with nothing sent");
                return Err(TransportError::protocol(format!(
                    "ack {sequence} from {destination} with nothing sent"
                )));
            };

            match queue.entries.front().map(|head| head.sequence) {
                Some(head) if head == sequence => {
                    let entry = queue.entries.pop_front();
                    queue.mark_if_drained(Instant::now());
                    entry
                }
                Some(head) if sequence < head => {
                    debug!(%destination, sequence, head, "stale acknowledgement");
                    return Ok(AckOutcome::Stale);
                }
                _ if queue.entries.iter().any(|entry| entry.sequence == sequence) => {
                    debug!(%destination, sequence, "reordered acknowledgement ignored");
                    return Ok(AckOutcome::Reordered);
                }
                _ if queue.highest_registered.is_some_and(|highest| sequence <= highest) => {
                    debug!(%destination, sequence, "acknowledgement for settled sequence");
                    return Ok(AckOutcome::Stale);
                }
                _ => {
                    warn!(%destination, sequence, ?classification, "acknowledgement for unsent sequence");
                    return Err(TransportError::protocol(format!(
                        "ack {sequence} from {destination} was never sent"
                    )));
                }
            }
        };

        if let Some(entry) = completed {
            debug!(%destination, sequence, attempts = entry.attempts, "acknowledged");
            entry.completion.complete(Ok(()));
        }
        Ok(AckOutcome::Completed)
    }

    /// Resend entries past their deadline and time out exhausted ones.
    /// Returns the number of entries that timed out.
    pub fn check_timeouts(&self, now: Instant, sink: &dyn PacketSink) -> usize {
        let mut resends = Vec::new();
        let mut expired = Vec::new();

        {
            let mut queues = lock(&self.queues);
            for (&(destination, classification), queue) in queues.iter_mut() {
                let mut i = 0;
                while i < queue.entries.len() {
                    let entry = &mut queue.entries[i];
                    if entry.deadline > now {
                        i += 1;
                        continue;
                    }

                    if entry.attempts >= entry.max_attempts {
                        if let Some(entry) = queue.entries.remove(i) {
                            expired.push((destination, entry));
                        }
                        continue;
                    }

                    entry.attempts += 1;
                    entry.interval = entry.interval.saturating_mul(entry.backoff);
                    entry.deadline = (entry.deadline + entry.interval).max(now + Duration::from_millis(1));
                    resends.push((destination, classification, entry.sequence, entry.attempts, entry.frames.clone()));
                    i += 1;
                }
                queue.mark_if_drained(now);
            }
        }

        for (destination, classification, sequence, attempts, frames) in resends {
            debug!(%destination, sequence, attempts, "resending");
            sink.transmit(destination, classification, frames);
        }

        let count = expired.len();
        for (destination, entry) in expired {
            warn!(%destination, sequence = entry.sequence, attempts = entry.attempts, "acknowledgement timed out");
            entry.completion.complete(Err(TransportError::Timeout));
        }
        count
    }

    /// Drop insecure queues that have been empty for at least `linger`,
    /// then forget the sequence counter of every destination that has no
    /// queue left and for which `connected` is false.
    ///
    /// Returns the number of queues dropped.
    pub fn evict_drained(
        &self,
        now: Instant,
        linger: Duration,
        sequences: &SequenceAllocator,
        connected: impl Fn(Endpoint) -> bool,
    ) -> usize {
        let mut queues = lock(&self.queues);
        let before = queues.len();
        queues.retain(|&(_, classification), queue| {
            classification == AckClassification::Secure
                || queue
                    .drained_at
                    .is_none_or(|drained| now.saturating_duration_since(drained) < linger)
        });
        let evicted = before - queues.len();
        if evicted > 0 {
            trace!(evicted, "drained acknowledgement queues dropped");
        }

        sequences.retain(|destination| {
            queues.contains_key(&(destination, AckClassification::Secure))
                || queues.contains_key(&(destination, AckClassification::Insecure))
                || connected(destination)
        });
        evicted
    }

    /// Cancel everything in flight towards `destination` and forget its
    /// sequence counter.
    ///
    /// Every completion resolves with `Cancelled` before this returns.
    pub fn cancel_destination(&self, destination: Endpoint, sequences: &SequenceAllocator) -> usize {
        let removed: Vec<PendingQueue> = {
            let mut queues = lock(&self.queues);
            let removed = [AckClassification::Secure, AckClassification::Insecure]
                .into_iter()
                .filter_map(|classification| queues.remove(&(destination, classification)))
                .collect();
            sequences.forget(destination);
            removed
        };
        Self::cancel_queues(removed)
    }

    /// Cancel everything in flight. Used on shutdown.
    pub fn cancel_all(&self) -> usize {
        let removed: Vec<PendingQueue> = lock(&self.queues).drain().map(|(_, queue)| queue).collect();
        Self::cancel_queues(removed)
    }

    /// Number of entries in flight towards `destination`.
    pub fn outstanding(&self, destination: Endpoint, classification: AckClassification) -> usize {
        lock(&self.queues)
            .get(&(destination, classification))
            .map_or(0, |queue| queue.entries.len())
    }

    /// Total number of entries in flight.
    pub fn len(&self) -> usize {
        lock(&self.queues).values().map(|queue| queue.entries.len()).sum()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of queues tracked, drained ones included.
    pub fn queue_count(&self) -> usize {
        lock(&self.queues).len()
    }

    fn cancel_queues(queues: Vec<PendingQueue>) -> usize {
        let mut count = 0;
        for entry in queues.into_iter().flat_map(|queue| queue.entries) {
            entry.completion.complete(Err(TransportError::Cancelled));
            count += 1;
        }
        count
    }
}
