//! Core traits for the netcode transport.
//!
//! [`PacketSink`] is the seam between bookkeeping (which decides *what* goes
//! on the wire and *when*) and the I/O tasks (which own the socket and the
//! per-connection record layers).

use bytes::Bytes;

use super::Endpoint;

/// Whether a message travels inside a protected record or in the clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckClassification {
    /// Sent and acknowledged through an established connection.
    Secure,
    /// Sent and acknowledged without a connection (probes, punch-through).
    Insecure,
}

/// Outbound datagram seam.
///
/// Implementations MUST NOT block: they queue the payload for a writer task
/// and return immediately.
pub trait PacketSink: Send + Sync {
    /// Queue serialized messages for `destination`, one datagram each.
    ///
    /// `Insecure` frames are sent as-is. `Secure` frames are plaintext and
    /// are sealed into one record each by the destination's record layer;
    /// if no connection exists they are dropped.
    fn transmit(&self, destination: Endpoint, classification: AckClassification, frames: Vec<Bytes>);
}

impl<T: PacketSink + ?Sized> PacketSink for std::sync::Arc<T> {
    fn transmit(&self, destination: Endpoint, classification: AckClassification, frames: Vec<Bytes>) {
        (**self).transmit(destination, classification, frames)
    }
}
