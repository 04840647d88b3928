//! MTU arithmetic and per-destination path MTU bookkeeping.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use crate::core::{
    lock, Endpoint, AEAD_TAG_SIZE, APPLICATION_HEADER_SIZE, CIPHER_BLOCK_ALIGNMENT,
    IPV4_HEADER_SIZE, IPV6_HEADER_SIZE, MIN_MTU, RECORD_HEADER_SIZE, UDP_HEADER_SIZE,
};

/// Round `value` down to a multiple of [`CIPHER_BLOCK_ALIGNMENT`].
pub const fn align_down(value: usize) -> usize {
    value - value % CIPHER_BLOCK_ALIGNMENT
}

/// A link MTU in bytes, with the derived payload sizes every layer needs.
///
/// ```text
/// | IP header | UDP header | record header | ciphertext ........ | tag |
///              <----------------- udp_payload_size ------------------->
///                                         <---- record_payload_size --->
///                                         <-- encrypted_payload_size -->
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MtuValue(u16);

impl MtuValue {
    /// Wrap a raw MTU, clamped up to [`MIN_MTU`].
    pub fn new(mtu: u16) -> Self {
        Self(mtu.max(MIN_MTU))
    }

    /// The raw MTU.
    pub fn get(self) -> u16 {
        self.0
    }

    /// Bytes available to a UDP payload towards `addr`.
    pub fn udp_payload_size(self, addr: IpAddr) -> usize {
        let ip_header = match addr {
            IpAddr::V4(_) => IPV4_HEADER_SIZE,
            IpAddr::V6(v6) if v6.to_ipv4_mapped().is_some() => IPV4_HEADER_SIZE,
            IpAddr::V6(_) => IPV6_HEADER_SIZE,
        };
        usize::from(self.0) - ip_header - UDP_HEADER_SIZE
    }

    /// Bytes available to a protected record body (ciphertext plus tag),
    /// block aligned.
    pub fn record_payload_size(self, addr: IpAddr) -> usize {
        align_down(self.udp_payload_size(addr) - RECORD_HEADER_SIZE)
    }

    /// Largest plaintext that still fits one protected record.
    pub fn encrypted_payload_size(self, addr: IpAddr) -> usize {
        self.record_payload_size(addr) - AEAD_TAG_SIZE
    }

    /// Application bytes carried by one fragment, block aligned.
    pub fn fragment_capacity(self, addr: IpAddr) -> usize {
        align_down(self.encrypted_payload_size(addr) - APPLICATION_HEADER_SIZE)
    }
}

impl From<u16> for MtuValue {
    fn from(mtu: u16) -> Self {
        Self::new(mtu)
    }
}

/// Per-destination path MTU table.
///
/// Destinations without a discovered value use the configured default.
#[derive(Debug)]
pub struct MtuEstimator {
    default: MtuValue,
    paths: Mutex<HashMap<Endpoint, MtuValue>>,
}

impl MtuEstimator {
    /// Create an estimator falling back to `default`.
    pub fn new(default: MtuValue) -> Self {
        Self {
            default,
            paths: Mutex::new(HashMap::new()),
        }
    }

    /// The fallback MTU.
    pub fn default_mtu(&self) -> MtuValue {
        self.default
    }

    /// Current MTU towards `destination`.
    pub fn get(&self, destination: Endpoint) -> MtuValue {
        lock(&self.paths)
            .get(&destination)
            .copied()
            .unwrap_or(self.default)
    }

    /// Record a negotiated or discovered MTU.
    pub fn record(&self, destination: Endpoint, mtu: MtuValue) {
        lock(&self.paths).insert(destination, mtu);
    }

    /// Forget a destination (e.g. after its connection closed).
    pub fn forget(&self, destination: Endpoint) {
        lock(&self.paths).remove(&destination);
    }

    /// Number of destinations with a recorded MTU.
    pub fn len(&self) -> usize {
        lock(&self.paths).len()
    }

    /// Whether no MTU was recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest unprotected control message towards `destination`.
    pub fn udp_payload_size(&self, destination: Endpoint) -> usize {
        self.get(destination).udp_payload_size(destination.ip())
    }

    /// Largest protected control message towards `destination`.
    pub fn encrypted_payload_size(&self, destination: Endpoint) -> usize {
        self.get(destination).encrypted_payload_size(destination.ip())
    }

    /// Application bytes per fragment towards `destination`.
    pub fn fragment_capacity(&self, destination: Endpoint) -> usize {
        self.get(destination).fragment_capacity(destination.ip())
    }
}
