//! Connection identity and lifecycle events.
//!
//! Handles what the application sees of a connection:
//! - Connection ID and peer identity
//! - Close reasons
//! - Inbound messages

use std::time::Instant;

use bytes::Bytes;

use crate::core::Endpoint;
use crate::crypto::{PublicKeyBytes, Role};
use crate::transport::{ControlMessage, MtuValue};

/// Connection ID, unique within one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a connection ID from a raw value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw value.
    pub fn to_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:012x}", self.0)
    }
}

/// An established, authenticated connection as seen by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection ID.
    pub id: ConnectionId,
    /// Peer address.
    pub endpoint: Endpoint,
    /// Peer's static public key, authenticated by the handshake.
    pub remote_public_key: PublicKeyBytes,
    /// Our side of the handshake.
    pub role: Role,
    /// When the handshake completed.
    pub established_at: Instant,
    /// Path MTU towards the peer: the configured default until discovery
    /// records a better value.
    pub mtu: MtuValue,
}

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by the local application.
    Local,
    /// Peer sent close_notify.
    PeerClosed,
    /// No inbound traffic within the idle timeout.
    IdleTimeout,
    /// A new handshake from the same endpoint replaced it.
    Replaced,
    /// The service shut down.
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            CloseReason::Local => "closed locally",
            CloseReason::PeerClosed => "closed by peer",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::Replaced => "replaced by new handshake",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

/// A message received over an established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A control payload.
    Control {
        /// The decoded message.
        message: ControlMessage,
        /// Sender.
        source: Endpoint,
    },
    /// A complete, reassembled application message.
    Application {
        /// Message bytes.
        message: Bytes,
        /// Sender.
        source: Endpoint,
    },
}

impl Inbound {
    /// Sender of the message.
    pub fn source(&self) -> Endpoint {
        match self {
            Inbound::Control { source, .. } | Inbound::Application { source, .. } => *source,
        }
    }
}
