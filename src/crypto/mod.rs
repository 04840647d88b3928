//! Security layer
//!
//! - Noise_IK handshake ([`InitiatorHandshake`], [`ResponderHandshake`])
//! - Record key derivation ([`SessionKeys`])
//! - XChaCha20-Poly1305 record protection and anti-replay
//!   ([`SecureRecordLayer`])

mod aead;
mod keys;
mod noise;
mod nonce;
mod record_layer;
mod replay;

pub use aead::{decrypt, encrypt, SessionKey, SESSION_KEY_SIZE};
pub use keys::{PublicKeyBytes, StaticKeypair};
pub use noise::{HandshakeResult, InitiatorHandshake, ResponderHandshake, Role, SessionKeys};
pub use nonce::{construct_nonce, Direction};
pub use record_layer::{
    encode_handshake_record, open_handshake_record, OpenedRecord, RecordState, SecureRecordLayer,
    CLOSE_NOTIFY,
};
pub use replay::ReplayWindow;
