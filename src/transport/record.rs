//! DTLS-style record header.
//!
//! ```text
//! +--------------+-------------+-----------+------------------+-------------+
//! | content type | version     | epoch     | sequence         | length      |
//! | u8           | u16 (FEFD)  | u16       | u48              | u16         |
//! +--------------+-------------+-----------+------------------+-------------+
//! ```
//!
//! All header fields are big-endian, as in DTLS. The header doubles as the
//! AEAD additional data of protected records.

use bytes::{Buf, BufMut};

use crate::core::{
    TransportError, TransportResult, MAX_RECORD_SEQUENCE, RECORD_HEADER_SIZE, RECORD_VERSION,
};

/// Record content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContentType {
    /// Alert (close_notify).
    Alert = 21,
    /// Handshake flight, never encrypted.
    Handshake = 22,
    /// Protected messages.
    ApplicationData = 23,
}

impl ContentType {
    /// Parse a content type byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            21 => Some(Self::Alert),
            22 => Some(Self::Handshake),
            23 => Some(Self::ApplicationData),
            _ => None,
        }
    }

    /// Byte representation.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Parsed record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Content type.
    pub content_type: ContentType,
    /// Key epoch (0 for handshake records).
    pub epoch: u16,
    /// Per-epoch record sequence (48 bits).
    pub sequence: u64,
    /// Length of the record body that follows the header.
    pub length: u16,
}

impl RecordHeader {
    /// Serialize the header.
    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut out = [0u8; RECORD_HEADER_SIZE];
        let mut buf = &mut out[..];
        buf.put_u8(self.content_type.as_byte());
        buf.put_u16(RECORD_VERSION);
        buf.put_u16(self.epoch);
        buf.put_uint(self.sequence & MAX_RECORD_SEQUENCE, 6);
        buf.put_u16(self.length);
        out
    }

    /// Parse the header at the start of `datagram` and check that the body
    /// length matches.
    pub fn decode(datagram: &[u8]) -> TransportResult<Self> {
        if datagram.len() < RECORD_HEADER_SIZE {
            return Err(TransportError::bad_message("truncated record header"));
        }

        let mut buf = &datagram[..RECORD_HEADER_SIZE];
        let content_type = buf.get_u8();
        let version = buf.get_u16();
        let epoch = buf.get_u16();
        let sequence = buf.get_uint(6);
        let length = buf.get_u16();

        let content_type = ContentType::from_byte(content_type).ok_or_else(|| {
            TransportError::bad_message(format!("unknown content type {content_type}"))
        })?;
        if version != RECORD_VERSION {
            return Err(TransportError::bad_message(format!(
                "unsupported record version {version:#06x}"
            )));
        }
        if usize::from(length) != datagram.len() - RECORD_HEADER_SIZE {
            return Err(TransportError::bad_message("record length mismatch"));
        }

        Ok(Self {
            content_type,
            epoch,
            sequence,
            length,
        })
    }
}
