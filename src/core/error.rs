//! Error types for the netcode transport.
//!
//! Nothing here is process-fatal: every error is scoped to one message, one
//! send attempt or one connection and travels through a `Result` or a
//! completion token.

use std::io;

use thiserror::Error;

use super::Endpoint;

/// Errors in the crypto layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// AEAD encryption failed.
    #[error("AEAD encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (invalid tag or corrupted).
    #[error("AEAD decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Record sequence space exhausted - connection must be re-established.
    #[error("record sequence exhausted - connection must be re-established")]
    CounterExhaustion,

    /// Replay detected.
    #[error("replay detected")]
    ReplayDetected,

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Peer authenticated with a static key that is not on the allow-list.
    #[error("peer is not authorized")]
    UnauthorizedPeer,
}

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// ACK or handshake deadline exceeded.
    #[error("timed out")]
    Timeout,

    /// Malformed or oversized input.
    #[error("bad message: {0}")]
    BadMessage(String),

    /// Attempt to send protected traffic without an established connection.
    #[error("unauthorized: no established connection")]
    Unauthorized,

    /// Payload needs more fragments than the protocol allows, or a control
    /// message does not fit a single datagram.
    #[error("message too big: {size} bytes exceeds limit of {limit}")]
    MessageTooBig {
        /// Size of the rejected payload.
        size: usize,
        /// Largest accepted size for this destination.
        limit: usize,
    },

    /// Peer violated the protocol (e.g. acknowledged a sequence never sent).
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Operation was cancelled by connection teardown or shutdown.
    #[error("cancelled")]
    Cancelled,

    /// No established connection to the endpoint.
    #[error("not connected to {0}")]
    NotConnected(Endpoint),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The service has shut down.
    #[error("transport shut down")]
    Shutdown,

    /// I/O error (socket operations).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Shorthand for [`TransportError::BadMessage`].
    pub fn bad_message(reason: impl Into<String>) -> Self {
        TransportError::BadMessage(reason.into())
    }

    /// Shorthand for [`TransportError::ProtocolError`].
    pub fn protocol(reason: impl Into<String>) -> Self {
        TransportError::ProtocolError(reason.into())
    }

    /// Check if this error should result in a silent drop (no response, no
    /// report to the caller).
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            TransportError::BadMessage(_)
                | TransportError::Crypto(CryptoError::DecryptionFailed)
                | TransportError::Crypto(CryptoError::ReplayDetected)
        )
    }

    /// Check if this error only concerns one connection and must not tear it
    /// down.
    pub fn is_connection_local(&self) -> bool {
        matches!(
            self,
            TransportError::ProtocolError(_) | TransportError::BadMessage(_)
        )
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
