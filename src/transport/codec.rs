//! Sequenced message encoding and decoding.
//!
//! Every message starts with a one-byte marker:
//!
//! ```text
//! control:     [0x40][tag][sequence u32][body ...][padding]
//! application: [0x80 | ack][sequence u32][index u16][count u16][data ...]
//!
//! tag = (kind << 1) | ack
//! ```
//!
//! Integers are little-endian. The low bit of the tag (or of the application
//! marker) is set when the receiver must acknowledge the sequence. An
//! `Acknowledge` never requests an acknowledgement itself.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::core::{
    TransportError, TransportResult, APPLICATION_HEADER_SIZE, APPLICATION_MARKER,
    CONTROL_HEADER_SIZE, CONTROL_MARKER, PMTU_PADDING_SENTINEL,
};

use super::fragment::FragmentHeader;

/// Control message kind, carried in the upper bits of the tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlKind {
    /// Acknowledges the message sequence it carries.
    Acknowledge = 0,
    /// NAT punch-through probe.
    ConnectPunchthrough = 1,
    /// Path MTU probe, padded to the probed size.
    PmtuDiscovery = 2,
    /// Handshake flight (carried inside epoch 0 records).
    Handshake = 3,
    /// Opaque control payload for the application.
    Payload = 4,
}

impl ControlKind {
    /// Parse a kind from the tag byte (ack bit ignored).
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag >> 1 {
            0 => Some(Self::Acknowledge),
            1 => Some(Self::ConnectPunchthrough),
            2 => Some(Self::PmtuDiscovery),
            3 => Some(Self::Handshake),
            4 => Some(Self::Payload),
            _ => None,
        }
    }

    /// Build the tag byte for this kind.
    pub fn tag(self, needs_ack: bool) -> u8 {
        ((self as u8) << 1) | u8::from(needs_ack)
    }
}

/// Body of a [`ControlMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlBody {
    /// Acknowledgement of `ControlMessage::sequence`.
    Acknowledge,
    /// NAT punch-through probe.
    ConnectPunchthrough,
    /// PMTU probe. The encoded datagram is exactly `probe_size` bytes.
    PmtuDiscovery {
        /// Size of the UDP payload being probed.
        probe_size: u16,
    },
    /// Handshake bytes.
    Handshake(Bytes),
    /// Application-visible control payload.
    Payload(Bytes),
    /// One fragment of an application message.
    ApplicationFragment {
        /// Position of this fragment in the message.
        header: FragmentHeader,
        /// Fragment bytes.
        data: Bytes,
    },
}

impl ControlBody {
    /// Control kind of this body, or `None` for application fragments.
    pub fn kind(&self) -> Option<ControlKind> {
        match self {
            ControlBody::Acknowledge => Some(ControlKind::Acknowledge),
            ControlBody::ConnectPunchthrough => Some(ControlKind::ConnectPunchthrough),
            ControlBody::PmtuDiscovery { .. } => Some(ControlKind::PmtuDiscovery),
            ControlBody::Handshake(_) => Some(ControlKind::Handshake),
            ControlBody::Payload(_) => Some(ControlKind::Payload),
            ControlBody::ApplicationFragment { .. } => None,
        }
    }
}

/// A sequenced message: control traffic or one application fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    /// Message sequence. For acknowledgements, the acknowledged sequence.
    pub sequence: u32,
    /// Whether the receiver must acknowledge `sequence`.
    pub needs_ack: bool,
    /// Message body.
    pub body: ControlBody,
}

impl ControlMessage {
    /// Acknowledgement of `sequence`.
    pub fn acknowledge(sequence: u32) -> Self {
        Self {
            sequence,
            needs_ack: false,
            body: ControlBody::Acknowledge,
        }
    }

    /// A message with `body`.
    pub fn new(sequence: u32, needs_ack: bool, body: ControlBody) -> Self {
        let needs_ack = needs_ack && !matches!(body, ControlBody::Acknowledge);
        Self {
            sequence,
            needs_ack,
            body,
        }
    }

    /// Whether the message is a [`ControlBody::Acknowledge`].
    pub fn is_acknowledge(&self) -> bool {
        matches!(self.body, ControlBody::Acknowledge)
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        match &self.body {
            ControlBody::Acknowledge | ControlBody::ConnectPunchthrough => CONTROL_HEADER_SIZE,
            ControlBody::PmtuDiscovery { probe_size } => {
                usize::from(*probe_size).max(CONTROL_HEADER_SIZE + 2)
            }
            ControlBody::Handshake(data) | ControlBody::Payload(data) => {
                CONTROL_HEADER_SIZE + data.len()
            }
            ControlBody::ApplicationFragment { data, .. } => APPLICATION_HEADER_SIZE + data.len(),
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());

        let kind = match &self.body {
            ControlBody::ApplicationFragment { header, data } => {
                buf.put_u8(APPLICATION_MARKER | u8::from(self.needs_ack));
                buf.put_u32_le(self.sequence);
                buf.put_u16_le(header.index);
                buf.put_u16_le(header.count);
                buf.put_slice(data);
                return buf.freeze();
            }
            ControlBody::Acknowledge => ControlKind::Acknowledge,
            ControlBody::ConnectPunchthrough => ControlKind::ConnectPunchthrough,
            ControlBody::PmtuDiscovery { .. } => ControlKind::PmtuDiscovery,
            ControlBody::Handshake(_) => ControlKind::Handshake,
            ControlBody::Payload(_) => ControlKind::Payload,
        };

        buf.put_u8(CONTROL_MARKER);
        buf.put_u8(kind.tag(self.needs_ack));
        buf.put_u32_le(self.sequence);

        match &self.body {
            ControlBody::PmtuDiscovery { probe_size } => {
                buf.put_u16_le(*probe_size);
                let padding = self.encoded_len() - buf.len();
                buf.put_bytes(PMTU_PADDING_SENTINEL, padding);
            }
            ControlBody::Handshake(data) | ControlBody::Payload(data) => buf.put_slice(data),
            _ => {}
        }

        buf.freeze()
    }

    /// Parse wire bytes. Bodies are zero-copy slices of `data`.
    pub fn decode(data: Bytes) -> TransportResult<Self> {
        let Some(&marker) = data.first() else {
            return Err(TransportError::bad_message("empty message"));
        };

        match marker {
            CONTROL_MARKER => Self::decode_control(data),
            m if m & !1 == APPLICATION_MARKER => Self::decode_fragment(data),
            other => Err(TransportError::bad_message(format!(
                "unknown message marker {other:#04x}"
            ))),
        }
    }

    fn decode_control(data: Bytes) -> TransportResult<Self> {
        if data.len() < CONTROL_HEADER_SIZE {
            return Err(TransportError::bad_message("truncated control header"));
        }

        let mut header = &data[1..CONTROL_HEADER_SIZE];
        let tag = header.get_u8();
        let sequence = header.get_u32_le();
        let needs_ack = tag & 1 == 1;

        let kind = ControlKind::from_tag(tag)
            .ok_or_else(|| TransportError::bad_message(format!("unknown control tag {tag:#04x}")))?;
        let body = data.slice(CONTROL_HEADER_SIZE..);

        let body = match kind {
            ControlKind::Acknowledge => {
                if needs_ack {
                    return Err(TransportError::bad_message("acknowledge requests an ack"));
                }
                ControlBody::Acknowledge
            }
            ControlKind::ConnectPunchthrough => ControlBody::ConnectPunchthrough,
            ControlKind::PmtuDiscovery => {
                if body.len() < 2 {
                    return Err(TransportError::bad_message("truncated pmtu probe"));
                }
                let probe_size = u16::from_le_bytes([body[0], body[1]]);
                let expected = usize::from(probe_size).max(CONTROL_HEADER_SIZE + 2);
                if data.len() != expected {
                    return Err(TransportError::bad_message(format!(
                        "pmtu probe of {} bytes claims {probe_size}",
                        data.len()
                    )));
                }
                if body[2..].iter().any(|&b| b != PMTU_PADDING_SENTINEL) {
                    return Err(TransportError::bad_message("corrupt pmtu padding"));
                }
                ControlBody::PmtuDiscovery { probe_size }
            }
            ControlKind::Handshake => ControlBody::Handshake(body),
            ControlKind::Payload => ControlBody::Payload(body),
        };

        Ok(Self {
            sequence,
            needs_ack,
            body,
        })
    }

    fn decode_fragment(data: Bytes) -> TransportResult<Self> {
        if data.len() < APPLICATION_HEADER_SIZE {
            return Err(TransportError::bad_message("truncated fragment header"));
        }

        let mut header = &data[..APPLICATION_HEADER_SIZE];
        let needs_ack = header.get_u8() & 1 == 1;
        let sequence = header.get_u32_le();
        let index = header.get_u16_le();
        let count = header.get_u16_le();

        let header = FragmentHeader::new(index, count)?;

        Ok(Self {
            sequence,
            needs_ack,
            body: ControlBody::ApplicationFragment {
                header,
                data: data.slice(APPLICATION_HEADER_SIZE..),
            },
        })
    }
}

/// Whether `datagram` starts with the unprotected control marker.
pub fn is_control_datagram(datagram: &[u8]) -> bool {
    datagram.first() == Some(&CONTROL_MARKER)
}
