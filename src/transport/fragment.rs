//! Application message fragmentation and reassembly.
//!
//! Outbound messages larger than one record are split into at most
//! [`MAX_FRAGMENTS`] fragments sharing one sequence. Inbound fragments are
//! collected per `(source, sequence)` and released once every index arrived.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::core::{Endpoint, TransportError, TransportResult, MAX_FRAGMENTS};

use super::codec::{ControlBody, ControlMessage};

/// Position of a fragment within its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentHeader {
    /// Zero-based fragment index.
    pub index: u16,
    /// Total number of fragments in the message.
    pub count: u16,
}

impl FragmentHeader {
    /// Validate and build a header.
    pub fn new(index: u16, count: u16) -> TransportResult<Self> {
        if count == 0 || usize::from(count) > MAX_FRAGMENTS {
            return Err(TransportError::bad_message(format!(
                "invalid fragment count {count}"
            )));
        }
        if index >= count {
            return Err(TransportError::bad_message(format!(
                "fragment index {index} out of {count}"
            )));
        }
        Ok(Self { index, count })
    }
}

/// Largest message that fits in [`MAX_FRAGMENTS`] fragments of `capacity`.
pub fn max_message_size(capacity: usize) -> usize {
    capacity * MAX_FRAGMENTS
}

/// Number of fragments needed for `size` bytes, checked against the
/// protocol ceiling.
pub fn fragment_count(size: usize, capacity: usize) -> TransportResult<usize> {
    if capacity == 0 {
        return Err(TransportError::bad_message("zero fragment capacity"));
    }

    let count = size.div_ceil(capacity);
    if count == 0 {
        return Err(TransportError::bad_message("empty message"));
    }
    if count > MAX_FRAGMENTS {
        return Err(TransportError::MessageTooBig {
            size,
            limit: max_message_size(capacity),
        });
    }
    Ok(count)
}

/// Split `payload` into fragment messages of at most `capacity` bytes each.
///
/// Fragments are zero-copy slices of `payload`.
pub fn split(
    sequence: u32,
    payload: &Bytes,
    capacity: usize,
    needs_ack: bool,
) -> TransportResult<Vec<ControlMessage>> {
    let count = fragment_count(payload.len(), capacity)?;

    let fragments = (0..count)
        .map(|index| {
            let start = index * capacity;
            let end = (start + capacity).min(payload.len());
            ControlMessage::new(
                sequence,
                needs_ack,
                ControlBody::ApplicationFragment {
                    // count <= MAX_FRAGMENTS fits u16
                    header: FragmentHeader {
                        index: index as u16,
                        count: count as u16,
                    },
                    data: payload.slice(start..end),
                },
            )
        })
        .collect();

    Ok(fragments)
}

struct FragmentAssembly {
    slots: Vec<Option<Bytes>>,
    received: usize,
    last_progress: Instant,
}

impl FragmentAssembly {
    fn new(count: u16, now: Instant) -> Self {
        Self {
            slots: vec![None; usize::from(count)],
            received: 0,
            last_progress: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.slots.len()
    }

    fn concat(self) -> Bytes {
        let total = self.slots.iter().flatten().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for slot in self.slots.into_iter().flatten() {
            out.extend_from_slice(&slot);
        }
        out.freeze()
    }
}

/// Collects fragments into complete messages.
pub struct FragmentAssembler {
    assemblies: HashMap<(Endpoint, u32), FragmentAssembly>,
    timeout: Duration,
    max_assemblies: usize,
}

impl FragmentAssembler {
    /// Create an assembler that discards partial messages idle for
    /// `timeout` and tracks at most `max_assemblies` at once.
    pub fn new(timeout: Duration, max_assemblies: usize) -> Self {
        Self {
            assemblies: HashMap::new(),
            timeout,
            max_assemblies: max_assemblies.max(1),
        }
    }

    /// Add one fragment. Returns the message once all fragments arrived.
    ///
    /// A repeated index overwrites the earlier copy. A fragment whose count
    /// disagrees with the assembly in progress is rejected.
    pub fn add_fragment(
        &mut self,
        source: Endpoint,
        sequence: u32,
        header: FragmentHeader,
        data: Bytes,
        now: Instant,
    ) -> TransportResult<Option<Bytes>> {
        if header.count == 1 {
            return Ok(Some(data));
        }

        let key = (source, sequence);
        if !self.assemblies.contains_key(&key) && self.assemblies.len() >= self.max_assemblies {
            self.evict_oldest();
        }

        let assembly = self
            .assemblies
            .entry(key)
            .or_insert_with(|| FragmentAssembly::new(header.count, now));

        if assembly.slots.len() != usize::from(header.count) {
            return Err(TransportError::bad_message(format!(
                "fragment count {} disagrees with {} for sequence {sequence}",
                header.count,
                assembly.slots.len()
            )));
        }

        let slot = &mut assembly.slots[usize::from(header.index)];
        if slot.is_none() {
            assembly.received += 1;
        }
        *slot = Some(data);
        assembly.last_progress = now;

        trace!(%source, sequence, index = header.index, count = header.count, "fragment stored");

        if !assembly.is_complete() {
            return Ok(None);
        }

        Ok(self.assemblies.remove(&key).map(FragmentAssembly::concat))
    }

    /// Drop assemblies without progress for the configured timeout.
    /// Returns the number discarded.
    pub fn expire(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.assemblies.len();
        self.assemblies.retain(|(source, sequence), assembly| {
            let keep = now.saturating_duration_since(assembly.last_progress) < timeout;
            if !keep {
                debug!(%source, sequence, received = assembly.received, "fragment assembly expired");
            }
            keep
        });
        before - self.assemblies.len()
    }

    /// Number of partial messages held.
    pub fn len(&self) -> usize {
        self.assemblies.len()
    }

    /// Whether no partial message is held.
    pub fn is_empty(&self) -> bool {
        self.assemblies.is_empty()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .assemblies
            .iter()
            .min_by_key(|(_, assembly)| assembly.last_progress)
            .map(|(key, _)| *key);

        if let Some(key) = oldest {
            debug!(source = %key.0, sequence = key.1, "evicting fragment assembly");
            self.assemblies.remove(&key);
        }
    }
}

impl std::fmt::Debug for FragmentAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FragmentAssembler")
            .field("assemblies", &self.assemblies.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    fn peer() -> Endpoint {
        "10.0.0.1:7000".parse().unwrap()
    }

    fn payload(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    fn parts(fragments: Vec<ControlMessage>) -> Vec<(u32, FragmentHeader, Bytes)> {
        fragments
            .into_iter()
            .map(|msg| match msg.body {
                ControlBody::ApplicationFragment { header, data } => (msg.sequence, header, data),
                other => panic!("unexpected body {other:?}"),
            })
            .collect()
    }

    fn reassemble(assembler: &mut FragmentAssembler, fragments: &[(u32, FragmentHeader, Bytes)]) -> Option<Bytes> {
        let now = Instant::now();
        let mut out = None;
        for (sequence, header, data) in fragments {
            let result = assembler
                .add_fragment(peer(), *sequence, *header, data.clone(), now)
                .unwrap();
            if result.is_some() {
                assert!(out.is_none(), "message completed twice");
                out = result;
            }
        }
        out
    }

    #[test]
    fn test_ten_thousand_bytes_reverse_order() {
        let original = payload(10_000);
        let mut fragments = parts(split(77, &original, 1200, false).unwrap());
        assert_eq!(fragments.len(), 9);
        assert!(fragments.iter().all(|(seq, h, _)| *seq == 77 && h.count == 9));
        assert_eq!(fragments[8].2.len(), 10_000 - 8 * 1200);

        fragments.reverse();
        let mut assembler = FragmentAssembler::new(Duration::from_secs(5), 8);
        assert_eq!(reassemble(&mut assembler, &fragments), Some(original));
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_any_permutation_reassembles() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for (size, capacity) in [(1, 1200), (1200, 1200), (1201, 1200), (4000, 16), (65_536, 1184)] {
            let original = payload(size);
            let fragments = parts(split(1, &original, capacity, false).unwrap());

            for _ in 0..8 {
                let mut shuffled = fragments.clone();
                shuffled.shuffle(&mut rng);
                let mut assembler = FragmentAssembler::new(Duration::from_secs(5), 8);
                assert_eq!(reassemble(&mut assembler, &shuffled).as_ref(), Some(&original));
            }
        }
    }

    #[test]
    fn test_duplicate_fragments_overwrite() {
        let original = payload(3000);
        let fragments = parts(split(5, &original, 1000, false).unwrap());
        let now = Instant::now();
        let mut assembler = FragmentAssembler::new(Duration::from_secs(5), 8);

        for _ in 0..3 {
            let (seq, header, data) = &fragments[0];
            assert!(assembler.add_fragment(peer(), *seq, *header, data.clone(), now).unwrap().is_none());
        }
        let (seq, header, data) = &fragments[1];
        assert!(assembler.add_fragment(peer(), *seq, *header, data.clone(), now).unwrap().is_none());

        let (seq, header, data) = &fragments[2];
        let message = assembler.add_fragment(peer(), *seq, *header, data.clone(), now).unwrap();
        assert_eq!(message, Some(original));
    }

    #[test]
    fn test_fragment_count_limits() {
        assert_eq!(fragment_count(256 * 100, 100).unwrap(), 256);
        assert!(matches!(
            fragment_count(256 * 100 + 1, 100),
            Err(TransportError::MessageTooBig { size: 25_601, limit: 25_600 })
        ));
        assert!(matches!(fragment_count(0, 100), Err(TransportError::BadMessage(_))));
        assert!(matches!(fragment_count(10, 0), Err(TransportError::BadMessage(_))));

        assert!(split(1, &Bytes::new(), 1200, false).is_err());
    }

    #[test]
    fn test_count_mismatch_rejected() {
        let mut assembler = FragmentAssembler::new(Duration::from_secs(5), 8);
        let now = Instant::now();
        assembler
            .add_fragment(peer(), 1, FragmentHeader::new(0, 3).unwrap(), Bytes::from_static(b"a"), now)
            .unwrap();

        let result = assembler.add_fragment(peer(), 1, FragmentHeader::new(1, 4).unwrap(), Bytes::from_static(b"b"), now);
        assert!(matches!(result, Err(TransportError::BadMessage(_))));
        assert_eq!(assembler.len(), 1);
    }

    #[test]
    fn test_assemblies_keyed_by_source() {
        let mut assembler = FragmentAssembler::new(Duration::from_secs(5), 8);
        let now = Instant::now();
        let other: Endpoint = "10.0.0.2:7000".parse().unwrap();
        let header = FragmentHeader::new(0, 2).unwrap();

        assembler.add_fragment(peer(), 1, header, Bytes::from_static(b"a"), now).unwrap();
        assembler.add_fragment(other, 1, header, Bytes::from_static(b"b"), now).unwrap();
        assert_eq!(assembler.len(), 2);

        let done = assembler
            .add_fragment(other, 1, FragmentHeader::new(1, 2).unwrap(), Bytes::from_static(b"c"), now)
            .unwrap();
        assert_eq!(done, Some(Bytes::from_static(b"bc")));
        assert_eq!(assembler.len(), 1);
    }

    #[test]
    fn test_idle_assemblies_expire() {
        let mut assembler = FragmentAssembler::new(Duration::from_millis(100), 8);
        let start = Instant::now();
        let header = FragmentHeader::new(0, 2).unwrap();

        assembler.add_fragment(peer(), 1, header, Bytes::from_static(b"a"), start).unwrap();
        assembler
            .add_fragment(peer(), 2, header, Bytes::from_static(b"a"), start + Duration::from_millis(80))
            .unwrap();

        assert_eq!(assembler.expire(start + Duration::from_millis(50)), 0);
        assert_eq!(assembler.expire(start + Duration::from_millis(120)), 1);
        assert_eq!(assembler.len(), 1);
        assert_eq!(assembler.expire(start + Duration::from_millis(200)), 1);
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut assembler = FragmentAssembler::new(Duration::from_secs(5), 2);
        let start = Instant::now();
        let header = FragmentHeader::new(0, 2).unwrap();

        for (i, sequence) in [10u32, 11, 12].into_iter().enumerate() {
            let at = start + Duration::from_millis(i as u64);
            assembler.add_fragment(peer(), sequence, header, Bytes::from_static(b"x"), at).unwrap();
        }
        assert_eq!(assembler.len(), 2);

        // sequence 10 was evicted, so its second half starts a new assembly
        let tail = FragmentHeader::new(1, 2).unwrap();
        let result = assembler
            .add_fragment(peer(), 10, tail, Bytes::from_static(b"y"), start + Duration::from_millis(5))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_single_fragment_bypasses_assembly() {
        let mut assembler = FragmentAssembler::new(Duration::from_secs(5), 2);
        let result = assembler
            .add_fragment(peer(), 3, FragmentHeader::new(0, 1).unwrap(), Bytes::from_static(b"solo"), Instant::now())
            .unwrap();
        assert_eq!(result, Some(Bytes::from_static(b"solo")));
        assert!(assembler.is_empty());
    }
}
