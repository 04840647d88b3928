//! Nonce construction for XChaCha20-Poly1305
//!
//! Nonces are 24 bytes:
//! - Epoch (4 bytes, LE)
//! - Direction (1 byte): 0x00 = Initiator→Responder, 0x01 = Responder→Initiator
//! - Zeros (11 bytes)
//! - Record sequence (8 bytes, LE)
//!
//! The direction byte keeps both sides from ever using the same nonce even
//! though their record sequences overlap.

use crate::core::{AEAD_NONCE_SIZE, NONCE_DIR_INITIATOR, NONCE_DIR_RESPONDER};

use super::Role;

/// Direction of a record, for nonce construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Initiator → Responder (0x00)
    InitiatorToResponder,
    /// Responder → Initiator (0x01)
    ResponderToInitiator,
}

impl Direction {
    /// Direction of records sent by `role`.
    pub fn sent_by(role: Role) -> Self {
        match role {
            Role::Initiator => Direction::InitiatorToResponder,
            Role::Responder => Direction::ResponderToInitiator,
        }
    }

    /// Byte representation.
    pub fn as_byte(self) -> u8 {
        match self {
            Direction::InitiatorToResponder => NONCE_DIR_INITIATOR,
            Direction::ResponderToInitiator => NONCE_DIR_RESPONDER,
        }
    }

    /// The opposite direction.
    pub fn opposite(self) -> Self {
        match self {
            Direction::InitiatorToResponder => Direction::ResponderToInitiator,
            Direction::ResponderToInitiator => Direction::InitiatorToResponder,
        }
    }
}

/// Construct a 24-byte XChaCha20-Poly1305 nonce.
///
/// ```text
/// [ epoch (4) | direction (1) | zeros (11) | sequence (8) ]
/// ```
pub fn construct_nonce(epoch: u16, direction: Direction, sequence: u64) -> [u8; AEAD_NONCE_SIZE] {
    let mut nonce = [0u8; AEAD_NONCE_SIZE];
    nonce[0..4].copy_from_slice(&u32::from(epoch).to_le_bytes());
    nonce[4] = direction.as_byte();
    nonce[16..24].copy_from_slice(&sequence.to_le_bytes());
    nonce
}
