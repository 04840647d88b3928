//! Protocol constants for the netcode transport.
//!
//! Wire-level values are fixed by the protocol and MUST NOT be changed.
//! Timing values are only the documented fallbacks used by
//! [`TransportConfig::default`](crate::service::TransportConfig).

use std::time::Duration;

// =============================================================================
// CRYPTOGRAPHIC CONSTANTS
// =============================================================================

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// XChaCha20 nonce size.
pub const AEAD_NONCE_SIZE: usize = 24;

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 private key size.
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Handshake hash output size (BLAKE2s).
pub const HASH_SIZE: usize = 32;

/// Payload carried inside both Noise handshake messages.
pub const PROTOCOL_ID: &[u8] = b"netcode-dtls/1";

/// Noise protocol pattern used for the handshake.
pub const NOISE_PATTERN: &str = "Noise_IK_25519_ChaChaPoly_BLAKE2s";

/// Encrypted payloads are sized in multiples of this many bytes.
pub const CIPHER_BLOCK_ALIGNMENT: usize = 16;

/// Nonce direction: Initiator -> Responder.
pub const NONCE_DIR_INITIATOR: u8 = 0x00;

/// Nonce direction: Responder -> Initiator.
pub const NONCE_DIR_RESPONDER: u8 = 0x01;

/// Inbound record anti-replay window, in records.
pub const REPLAY_WINDOW_SIZE: usize = 2048;

/// Handshake body type of the initiator's first flight.
pub const HANDSHAKE_CLIENT_HELLO: u8 = 1;

/// Handshake body type of the responder's flight.
pub const HANDSHAKE_SERVER_HELLO: u8 = 2;

// =============================================================================
// RECORD LAYER
// =============================================================================

/// DTLS-style record header size (type + version + epoch + seq48 + length).
pub const RECORD_HEADER_SIZE: usize = 13;

/// Record layer protocol version (DTLS 1.2 wire value).
pub const RECORD_VERSION: u16 = 0xFEFD;

/// Epoch used by unprotected handshake records.
pub const HANDSHAKE_EPOCH: u16 = 0;

/// Epoch used by protected records after the handshake.
pub const ESTABLISHED_EPOCH: u16 = 1;

/// Largest record sequence number (48-bit field).
pub const MAX_RECORD_SEQUENCE: u64 = (1 << 48) - 1;

// =============================================================================
// MESSAGE FRAMING
// =============================================================================

/// First byte of every serialized control message.
pub const CONTROL_MARKER: u8 = 0x40;

/// First byte of every application fragment (inside a protected record).
pub const APPLICATION_MARKER: u8 = 0x80;

/// Filler byte used to pad PMTU discovery probes.
pub const PMTU_PADDING_SENTINEL: u8 = b'<';

/// Control header size (marker + type tag + sequence).
pub const CONTROL_HEADER_SIZE: usize = 1 + 1 + 4;

/// Application fragment header size (marker + sequence + index + count).
pub const APPLICATION_HEADER_SIZE: usize = 1 + 4 + 2 + 2;

/// Protocol ceiling on the number of fragments of one message.
pub const MAX_FRAGMENTS: usize = 256;

// =============================================================================
// MTU
// =============================================================================

/// IPv4 header size without options.
pub const IPV4_HEADER_SIZE: usize = 20;

/// IPv6 fixed header size.
pub const IPV6_HEADER_SIZE: usize = 40;

/// UDP header size.
pub const UDP_HEADER_SIZE: usize = 8;

/// Smallest MTU every IPv4 host must accept.
pub const MIN_MTU: u16 = 576;

/// MTU assumed before discovery (IPv6 minimum link MTU).
pub const DEFAULT_MTU: u16 = 1280;

/// Upper bound for PMTU discovery (Ethernet).
pub const MAX_MTU: u16 = 1500;

/// PMTU discovery stops once the search window is narrower than this.
pub const PMTU_GRANULARITY: u16 = 16;

/// Size of every pooled packet buffer.
pub const PACKET_BUFFER_SIZE: usize = 2048;

// =============================================================================
// TIMING FALLBACKS
// =============================================================================

/// Interval between resends of an unacknowledged control message.
pub const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_millis(100);

/// Send attempts (including the first) before a control message times out.
pub const DEFAULT_MAX_RESEND_ATTEMPTS: u32 = 5;

/// Multiplier applied to the resend interval after every resend.
pub const DEFAULT_RESEND_BACKOFF: u32 = 1;

/// Deadline for a handshake to complete.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Interval between ClientHello retransmissions.
pub const DEFAULT_HANDSHAKE_RESEND_INTERVAL: Duration = Duration::from_millis(250);

/// Connections without inbound traffic for this long are closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Partial fragment assemblies without progress for this long are discarded.
pub const DEFAULT_FRAGMENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Partial fragment assemblies tracked per connection.
pub const DEFAULT_MAX_PENDING_ASSEMBLIES: usize = 64;

/// Send attempts for each PMTU probe size.
pub const DEFAULT_PMTU_PROBE_ATTEMPTS: u32 = 2;

/// Upper bound on established connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Recently delivered sequences remembered per connection, so a resent
/// message is acknowledged again without being delivered twice.
pub const DELIVERED_HISTORY: usize = 1024;

/// Period of the timeout sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// A drained insecure ACK queue is kept this long so late duplicate
/// acknowledgements are still recognised as stale.
pub const DRAINED_QUEUE_LINGER: Duration = Duration::from_secs(10);
