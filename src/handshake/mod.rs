//! Unauthenticated traffic: handshakes and pre-connection probes.
//!
//! - [`HandshakeFilterChain`]: ordered, single-consumer filter list
//! - [`ResponderFilter`]: answers ClientHello and creates connections
//! - [`InitiatorFilter`]: drives an outbound handshake
//! - [`PmtuDiscoveryFilter`]: binary-searches the path MTU
//! - [`PunchthroughFilter`]: opens a NAT mapping towards a peer
//!
//! Handshake messages travel as epoch 0 records whose body is a
//! [`ControlMessage`](crate::transport::ControlMessage) with a
//! [`ControlBody::Handshake`] body:
//!
//! ```text
//! +----------------+-------------------------------+
//! | type (1 byte)  | Noise_IK message              |
//! +----------------+-------------------------------+
//! ClientHello = 1, ServerHello = 2
//! ```

mod chain;
mod initiator;
mod pmtu;
mod punchthrough;
mod responder;

pub use chain::*;
pub use initiator::InitiatorFilter;
pub use pmtu::PmtuDiscoveryFilter;
pub use punchthrough::PunchthroughFilter;
pub use responder::ResponderFilter;

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::{CryptoError, TransportError, TransportResult, PROTOCOL_ID};
use crate::crypto::open_handshake_record;
use crate::transport::{ControlBody, ControlMessage};

/// Serialize a handshake flight: `[handshake_type][noise message]` inside a
/// control message.
pub(crate) fn handshake_message(handshake_type: u8, noise: &[u8]) -> Bytes {
    let mut body = BytesMut::with_capacity(1 + noise.len());
    body.put_u8(handshake_type);
    body.put_slice(noise);
    ControlMessage::new(0, false, ControlBody::Handshake(body.freeze())).encode()
}

/// Decode the handshake message carried by an epoch 0 record from an
/// unconnected sender.
pub(crate) fn decode_handshake_record(datagram: &[u8]) -> TransportResult<ControlMessage> {
    let message = ControlMessage::decode(open_handshake_record(datagram)?)?;
    match message.body {
        ControlBody::Handshake(ref body) if !body.is_empty() => Ok(message),
        _ => Err(TransportError::bad_message("handshake record without handshake body")),
    }
}

/// Both Noise messages carry the protocol identifier as payload.
pub(crate) fn check_protocol_id(payload: &[u8]) -> TransportResult<()> {
    if payload != PROTOCOL_ID {
        return Err(CryptoError::HandshakeFailed("protocol identifier mismatch".into()).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::HANDSHAKE_CLIENT_HELLO;
    use crate::crypto::encode_handshake_record;

    #[test]
    fn test_handshake_record_roundtrip() {
        let message = handshake_message(HANDSHAKE_CLIENT_HELLO, b"noise");
        let record = encode_handshake_record(3, &message).unwrap();
        let decoded = decode_handshake_record(&record).unwrap();
        assert_eq!(
            decoded.body,
            ControlBody::Handshake(Bytes::from_static(b"\x01noise"))
        );
    }

    #[test]
    fn test_non_handshake_body_rejected() {
        let message = ControlMessage::new(1, false, ControlBody::Payload(Bytes::from_static(b"hi")));
        let record = encode_handshake_record(0, &message.encode()).unwrap();
        assert!(decode_handshake_record(&record).is_err());
    }

    #[test]
    fn test_protocol_id() {
        assert!(check_protocol_id(PROTOCOL_ID).is_ok());
        assert!(check_protocol_id(b"netcode-dtls/2").is_err());
    }
}
