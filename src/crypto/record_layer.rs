//! Per-connection record protection.
//!
//! ```text
//! UNAUTHENTICATED ──begin_handshake──▶ HANDSHAKING ──establish──▶ ESTABLISHED
//!        │                                  │                          │
//!        └──────────────────────close───────┴──────────────────────────┴──▶ CLOSED
//! ```
//!
//! Handshake records (epoch 0) are accepted in every state but `Closed`
//! and are never encrypted. Protected records (epoch 1) are only sealed and
//! opened once `Established`; before that they are ignored, not rejected.

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::{
    CryptoError, TransportError, TransportResult, AEAD_TAG_SIZE, ESTABLISHED_EPOCH,
    HANDSHAKE_EPOCH, MAX_RECORD_SEQUENCE, RECORD_HEADER_SIZE,
};
use crate::transport::{ContentType, RecordHeader};

use super::aead::{decrypt, encrypt};
use super::nonce::{construct_nonce, Direction};
use super::replay::ReplayWindow;
use super::{Role, SessionKeys};

/// Alert body sent on graceful close: level warning (1), close_notify (0).
pub const CLOSE_NOTIFY: [u8; 2] = [1, 0];

/// Record layer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// No handshake started.
    Unauthenticated,
    /// Handshake flights in progress.
    Handshaking,
    /// Keys installed; protected traffic flows.
    Established,
    /// Torn down; every record is dropped.
    Closed,
}

/// An inbound record after [`SecureRecordLayer::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenedRecord {
    /// Handshake flight (plaintext).
    Handshake(Bytes),
    /// Decrypted application data.
    Application(Bytes),
    /// Decrypted alert.
    Alert(Bytes),
    /// Protected record that cannot be opened yet; not an error.
    Ignored,
}

/// Record layer for one connection.
pub struct SecureRecordLayer {
    state: RecordState,
    role: Role,
    keys: Option<SessionKeys>,
    handshake_sequence: u64,
    send_sequence: u64,
    replay: ReplayWindow,
}

impl SecureRecordLayer {
    /// A fresh, unauthenticated record layer for `role`.
    pub fn new(role: Role) -> Self {
        Self {
            state: RecordState::Unauthenticated,
            role,
            keys: None,
            handshake_sequence: 0,
            send_sequence: 0,
            replay: ReplayWindow::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> RecordState {
        self.state
    }

    /// Our handshake role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether protected traffic can flow.
    pub fn is_established(&self) -> bool {
        self.state == RecordState::Established
    }

    /// `Unauthenticated` → `Handshaking`.
    pub fn begin_handshake(&mut self) -> TransportResult<()> {
        match self.state {
            RecordState::Unauthenticated => {
                self.state = RecordState::Handshaking;
                Ok(())
            }
            other => Err(TransportError::protocol(format!(
                "cannot begin handshake in state {other:?}"
            ))),
        }
    }

    /// `Handshaking` → `Established` with freshly derived keys.
    pub fn establish(&mut self, keys: SessionKeys) -> TransportResult<()> {
        if self.state != RecordState::Handshaking {
            return Err(TransportError::protocol(format!(
                "cannot establish in state {:?}",
                self.state
            )));
        }
        self.keys = Some(keys);
        self.send_sequence = 0;
        self.replay = ReplayWindow::new();
        self.state = RecordState::Established;
        Ok(())
    }

    /// Move to `Closed` and discard the keys.
    pub fn close(&mut self) {
        self.keys = None;
        self.state = RecordState::Closed;
    }

    /// Frame a handshake flight in an epoch 0 record.
    pub fn seal_handshake(&mut self, payload: &[u8]) -> TransportResult<Bytes> {
        if self.state == RecordState::Closed {
            return Err(TransportError::Unauthorized);
        }
        let sequence = self.handshake_sequence;
        self.handshake_sequence += 1;
        encode_handshake_record(sequence, payload)
    }

    /// Seal `plaintext` in a protected record.
    pub fn seal(&mut self, content_type: ContentType, plaintext: &[u8]) -> TransportResult<Bytes> {
        if content_type == ContentType::Handshake {
            return Err(TransportError::protocol("handshake records are not sealed"));
        }
        let (RecordState::Established, Some(keys)) = (self.state, self.keys.as_ref()) else {
            return Err(TransportError::Unauthorized);
        };
        if self.send_sequence > MAX_RECORD_SEQUENCE {
            return Err(CryptoError::CounterExhaustion.into());
        }

        let length = record_length(plaintext.len() + AEAD_TAG_SIZE)?;
        let header = RecordHeader {
            content_type,
            epoch: ESTABLISHED_EPOCH,
            sequence: self.send_sequence,
            length,
        }
        .encode();

        let nonce = construct_nonce(ESTABLISHED_EPOCH, Direction::sent_by(self.role), self.send_sequence);
        let ciphertext = encrypt(keys.send_key(self.role), &nonce, &header, plaintext)?;
        self.send_sequence += 1;

        let mut out = BytesMut::with_capacity(RECORD_HEADER_SIZE + ciphertext.len());
        out.put_slice(&header);
        out.put_slice(&ciphertext);
        Ok(out.freeze())
    }

    /// Seal a close_notify alert.
    pub fn seal_close_notify(&mut self) -> TransportResult<Bytes> {
        self.seal(ContentType::Alert, &CLOSE_NOTIFY)
    }

    /// Open one inbound record.
    ///
    /// Errors are all silent drops ([`TransportError::is_silent_drop`]):
    /// malformed headers, replays and authentication failures.
    pub fn open(&mut self, datagram: &[u8]) -> TransportResult<OpenedRecord> {
        let header = RecordHeader::decode(datagram)?;
        let body = &datagram[RECORD_HEADER_SIZE..];

        if self.state == RecordState::Closed {
            return Ok(OpenedRecord::Ignored);
        }

        if header.content_type == ContentType::Handshake {
            if header.epoch != HANDSHAKE_EPOCH {
                return Err(TransportError::bad_message("handshake record outside epoch 0"));
            }
            return Ok(OpenedRecord::Handshake(Bytes::copy_from_slice(body)));
        }

        let (RecordState::Established, Some(keys)) = (self.state, self.keys.as_ref()) else {
            return Ok(OpenedRecord::Ignored);
        };
        if header.epoch != ESTABLISHED_EPOCH {
            return Ok(OpenedRecord::Ignored);
        }

        if self.replay.is_replay(header.sequence) {
            return Err(CryptoError::ReplayDetected.into());
        }

        let nonce = construct_nonce(
            header.epoch,
            Direction::sent_by(self.role).opposite(),
            header.sequence,
        );
        let plaintext = decrypt(
            keys.recv_key(self.role),
            &nonce,
            &datagram[..RECORD_HEADER_SIZE],
            body,
        )?;
        self.replay.mark(header.sequence);

        let plaintext = Bytes::from(plaintext);
        Ok(match header.content_type {
            ContentType::Alert => OpenedRecord::Alert(plaintext),
            _ => OpenedRecord::Application(plaintext),
        })
    }
}

impl std::fmt::Debug for SecureRecordLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureRecordLayer")
            .field("state", &self.state)
            .field("role", &self.role)
            .field("send_sequence", &self.send_sequence)
            .finish_non_exhaustive()
    }
}

fn record_length(len: usize) -> TransportResult<u16> {
    u16::try_from(len).map_err(|_| TransportError::MessageTooBig {
        size: len,
        limit: usize::from(u16::MAX),
    })
}

/// Frame `payload` as an epoch 0 handshake record.
pub fn encode_handshake_record(sequence: u64, payload: &[u8]) -> TransportResult<Bytes> {
    let header = RecordHeader {
        content_type: ContentType::Handshake,
        epoch: HANDSHAKE_EPOCH,
        sequence,
        length: record_length(payload.len())?,
    };

    let mut out = BytesMut::with_capacity(RECORD_HEADER_SIZE + payload.len());
    out.put_slice(&header.encode());
    out.put_slice(payload);
    Ok(out.freeze())
}

/// Extract the body of an epoch 0 handshake record from a sender with no
/// connection. Anything else is rejected.
pub fn open_handshake_record(datagram: &[u8]) -> TransportResult<Bytes> {
    let header = RecordHeader::decode(datagram)?;
    if header.content_type != ContentType::Handshake || header.epoch != HANDSHAKE_EPOCH {
        return Err(TransportError::bad_message(format!(
            "{:?} record from unauthenticated sender",
            header.content_type
        )));
    }
    Ok(Bytes::copy_from_slice(&datagram[RECORD_HEADER_SIZE..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SessionKey;

    fn keys() -> SessionKeys {
        SessionKeys {
            initiator_key: SessionKey::from_bytes([0x11; 32]),
            responder_key: SessionKey::from_bytes([0x22; 32]),
        }
    }

    fn established_pair() -> (SecureRecordLayer, SecureRecordLayer) {
        let mut initiator = SecureRecordLayer::new(Role::Initiator);
        let mut responder = SecureRecordLayer::new(Role::Responder);
        initiator.begin_handshake().unwrap();
        responder.begin_handshake().unwrap();
        initiator.establish(keys()).unwrap();
        responder.establish(keys()).unwrap();
        (initiator, responder)
    }

    #[test]
    fn test_state_machine() {
        let mut layer = SecureRecordLayer::new(Role::Initiator);
        assert_eq!(layer.state(), RecordState::Unauthenticated);
        assert!(layer.establish(keys()).is_err());

        layer.begin_handshake().unwrap();
        assert_eq!(layer.state(), RecordState::Handshaking);
        assert!(layer.begin_handshake().is_err());

        layer.establish(keys()).unwrap();
        assert!(layer.is_established());

        layer.close();
        assert_eq!(layer.state(), RecordState::Closed);
        assert!(matches!(
            layer.seal(ContentType::ApplicationData, b"x"),
            Err(TransportError::Unauthorized)
        ));
    }

    #[test]
    fn test_seal_open_both_directions() {
        let (mut initiator, mut responder) = established_pair();

        let record = initiator.seal(ContentType::ApplicationData, b"ping").unwrap();
        assert_eq!(record.len(), RECORD_HEADER_SIZE + 4 + AEAD_TAG_SIZE);
        assert_eq!(
            responder.open(&record).unwrap(),
            OpenedRecord::Application(Bytes::from_static(b"ping"))
        );

        let record = responder.seal(ContentType::ApplicationData, b"pong").unwrap();
        assert_eq!(
            initiator.open(&record).unwrap(),
            OpenedRecord::Application(Bytes::from_static(b"pong"))
        );
    }

    #[test]
    fn test_own_records_do_not_open() {
        let (mut initiator, _) = established_pair();
        let record = initiator.seal(ContentType::ApplicationData, b"echo").unwrap();

        let err = initiator.open(&record).unwrap_err();
        assert!(err.is_silent_drop());
    }

    #[test]
    fn test_replayed_record_dropped() {
        let (mut initiator, mut responder) = established_pair();
        let record = initiator.seal(ContentType::ApplicationData, b"once").unwrap();

        assert!(responder.open(&record).is_ok());
        let err = responder.open(&record).unwrap_err();
        assert!(matches!(err, TransportError::Crypto(CryptoError::ReplayDetected)));
        assert!(err.is_silent_drop());
    }

    #[test]
    fn test_corrupted_record_dropped_without_state_change() {
        let (mut initiator, mut responder) = established_pair();
        let record = initiator.seal(ContentType::ApplicationData, b"data").unwrap();

        let mut corrupt = record.to_vec();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        let err = responder.open(&corrupt).unwrap_err();
        assert!(matches!(err, TransportError::Crypto(CryptoError::DecryptionFailed)));

        // the genuine record still opens: the failed attempt was not recorded
        assert!(responder.open(&record).is_ok());
    }

    #[test]
    fn test_protected_records_ignored_before_established() {
        let (mut initiator, _) = established_pair();
        let record = initiator.seal(ContentType::ApplicationData, b"early").unwrap();

        let mut fresh = SecureRecordLayer::new(Role::Responder);
        assert_eq!(fresh.open(&record).unwrap(), OpenedRecord::Ignored);
        fresh.begin_handshake().unwrap();
        assert_eq!(fresh.open(&record).unwrap(), OpenedRecord::Ignored);
    }

    #[test]
    fn test_handshake_records_in_the_clear() {
        let mut layer = SecureRecordLayer::new(Role::Initiator);
        let first = layer.seal_handshake(b"hello").unwrap();
        let second = layer.seal_handshake(b"hello").unwrap();

        assert_eq!(&first[RECORD_HEADER_SIZE..], b"hello");
        assert_ne!(first, second);
        assert_eq!(open_handshake_record(&first).unwrap(), Bytes::from_static(b"hello"));

        let mut peer = SecureRecordLayer::new(Role::Responder);
        assert_eq!(
            peer.open(&first).unwrap(),
            OpenedRecord::Handshake(Bytes::from_static(b"hello"))
        );
    }

    #[test]
    fn test_unauthenticated_sender_only_handshake() {
        let (mut initiator, _) = established_pair();
        let record = initiator.seal(ContentType::ApplicationData, b"sneaky").unwrap();
        assert!(open_handshake_record(&record).is_err());
        assert!(open_handshake_record(&[22, 0xFE]).is_err());
    }

    #[test]
    fn test_close_notify_alert() {
        let (mut initiator, mut responder) = established_pair();
        let alert = initiator.seal_close_notify().unwrap();
        assert_eq!(
            responder.open(&alert).unwrap(),
            OpenedRecord::Alert(Bytes::copy_from_slice(&CLOSE_NOTIFY))
        );
    }

    #[test]
    fn test_sequence_exhaustion() {
        let (mut initiator, _) = established_pair();
        initiator.send_sequence = MAX_RECORD_SEQUENCE + 1;
        assert!(matches!(
            initiator.seal(ContentType::ApplicationData, b"x"),
            Err(TransportError::Crypto(CryptoError::CounterExhaustion))
        ));
    }
}
