//! Per-connection protocol state.
//!
//! A [`Connection`] owns everything that must be touched sequentially for
//! one peer: the record layer, fragment reassembly and the delivered-message
//! history. It performs no I/O; the strand task feeds it datagrams and acts
//! on what it returns.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::core::{
    Endpoint, TransportError, TransportResult, DELIVERED_HISTORY, HANDSHAKE_CLIENT_HELLO,
};
use crate::crypto::{OpenedRecord, SecureRecordLayer, CLOSE_NOTIFY};
use crate::transport::{ContentType, ControlBody, ControlMessage, FragmentAssembler};

use super::info::{ConnectionInfo, Inbound};

/// The responder's answer to a ClientHello, kept so a retransmitted
/// ClientHello can be answered without re-running the handshake.
#[derive(Debug, Clone)]
pub struct HandshakeCache {
    /// Handshake body of the ClientHello that was answered.
    pub client_hello: Bytes,
    /// Sealed ServerHello record.
    pub flight: Bytes,
}

/// What processing one inbound datagram produced.
#[derive(Debug, Default)]
pub(crate) struct Received {
    /// Datagram to send back to the peer (an ACK or a cached flight).
    pub reply: Option<Bytes>,
    /// Event for the service.
    pub event: Option<ConnectionEvent>,
}

impl Received {
    fn reply(reply: Option<Bytes>) -> Self {
        Self { reply, event: None }
    }
}

#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    /// Peer acknowledged one of our secure messages.
    Acknowledged(u32),
    /// A message is ready for the application.
    Delivered(Inbound),
    /// A new ClientHello arrived on the established connection.
    Rehandshake(ControlMessage),
    /// Peer sent close_notify.
    PeerClosed,
}

/// Bounded set of recently delivered sequences.
#[derive(Debug)]
struct DeliveredHistory {
    order: VecDeque<u32>,
    seen: HashSet<u32>,
    capacity: usize,
}

impl DeliveredHistory {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, sequence: u32) -> bool {
        self.seen.contains(&sequence)
    }

    /// Returns `false` if `sequence` was already delivered.
    fn insert(&mut self, sequence: u32) -> bool {
        if !self.seen.insert(sequence) {
            return false;
        }
        self.order.push_back(sequence);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// State of one established connection.
pub(crate) struct Connection {
    info: ConnectionInfo,
    record: SecureRecordLayer,
    assembler: FragmentAssembler,
    delivered: DeliveredHistory,
    handshake_cache: Option<HandshakeCache>,
    last_received: Instant,
}

impl Connection {
    pub(crate) fn new(
        info: ConnectionInfo,
        record: SecureRecordLayer,
        assembler: FragmentAssembler,
        handshake_cache: Option<HandshakeCache>,
        now: Instant,
    ) -> Self {
        Self {
            info,
            record,
            assembler,
            delivered: DeliveredHistory::new(DELIVERED_HISTORY),
            handshake_cache,
            last_received: now,
        }
    }

    pub(crate) fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub(crate) fn endpoint(&self) -> Endpoint {
        self.info.endpoint
    }

    /// Whether nothing authenticated arrived for `timeout`.
    pub(crate) fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_received) >= timeout
    }

    /// Discard stale partial messages.
    pub(crate) fn expire_fragments(&mut self, now: Instant) -> usize {
        self.assembler.expire(now)
    }

    /// Seal serialized messages, one protected record each.
    pub(crate) fn seal_frames(&mut self, frames: &[Bytes]) -> TransportResult<Vec<Bytes>> {
        frames
            .iter()
            .map(|frame| self.record.seal(ContentType::ApplicationData, frame))
            .collect()
    }

    pub(crate) fn seal_close_notify(&mut self) -> TransportResult<Bytes> {
        self.record.seal_close_notify()
    }

    pub(crate) fn close(&mut self) {
        self.record.close();
    }

    /// Process one inbound datagram from the peer.
    ///
    /// Errors are per-packet and never tear the connection down.
    pub(crate) fn receive(&mut self, datagram: &[u8], now: Instant) -> TransportResult<Received> {
        match self.record.open(datagram)? {
            OpenedRecord::Ignored => {
                trace!(endpoint = %self.info.endpoint, "record ignored");
                Ok(Received::default())
            }
            OpenedRecord::Handshake(body) => self.receive_handshake(body),
            OpenedRecord::Alert(body) => {
                self.last_received = now;
                if body[..] == CLOSE_NOTIFY {
                    return Ok(Received {
                        reply: None,
                        event: Some(ConnectionEvent::PeerClosed),
                    });
                }
                debug!(endpoint = %self.info.endpoint, alert = ?&body[..], "unknown alert ignored");
                Ok(Received::default())
            }
            OpenedRecord::Application(plaintext) => {
                self.last_received = now;
                let message = ControlMessage::decode(plaintext)?;
                self.receive_message(message, now)
            }
        }
    }

    fn receive_handshake(&mut self, body: Bytes) -> TransportResult<Received> {
        let message = ControlMessage::decode(body)?;
        let ControlBody::Handshake(hello) = &message.body else {
            return Err(TransportError::bad_message("handshake record without handshake body"));
        };

        if hello.first() != Some(&HANDSHAKE_CLIENT_HELLO) {
            trace!(endpoint = %self.info.endpoint, "late handshake flight ignored");
            return Ok(Received::default());
        }

        match &self.handshake_cache {
            Some(cache) if cache.client_hello == *hello => {
                debug!(endpoint = %self.info.endpoint, "retransmitted ClientHello answered from cache");
                Ok(Received::reply(Some(cache.flight.clone())))
            }
            _ => Ok(Received {
                reply: None,
                event: Some(ConnectionEvent::Rehandshake(message)),
            }),
        }
    }

    fn receive_message(&mut self, message: ControlMessage, now: Instant) -> TransportResult<Received> {
        let source = self.info.endpoint;
        let sequence = message.sequence;

        match &message.body {
            ControlBody::Acknowledge => Ok(Received {
                reply: None,
                event: Some(ConnectionEvent::Acknowledged(sequence)),
            }),
            ControlBody::Payload(_) => {
                let reply = self.ack_for(&message)?;
                if !self.delivered.insert(sequence) {
                    trace!(endpoint = %source, sequence, "duplicate message re-acknowledged");
                    return Ok(Received::reply(reply));
                }
                Ok(Received {
                    reply,
                    event: Some(ConnectionEvent::Delivered(Inbound::Control { message, source })),
                })
            }
            ControlBody::ApplicationFragment { header, data } => {
                if self.delivered.contains(sequence) {
                    trace!(endpoint = %source, sequence, "fragment of delivered message");
                    return Ok(Received::reply(self.ack_for(&message)?));
                }

                let Some(complete) =
                    self.assembler
                        .add_fragment(source, sequence, *header, data.clone(), now)?
                else {
                    return Ok(Received::default());
                };

                self.delivered.insert(sequence);
                Ok(Received {
                    reply: self.ack_for(&message)?,
                    event: Some(ConnectionEvent::Delivered(Inbound::Application {
                        message: complete,
                        source,
                    })),
                })
            }
            other => {
                debug!(endpoint = %source, kind = ?other.kind(), "unexpected message in protected record");
                Ok(Received::default())
            }
        }
    }

    fn ack_for(&mut self, message: &ControlMessage) -> TransportResult<Option<Bytes>> {
        if !message.needs_ack {
            return Ok(None);
        }
        let ack = ControlMessage::acknowledge(message.sequence).encode();
        self.record.seal(ContentType::ApplicationData, &ack).map(Some)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("info", &self.info)
            .field("record", &self.record)
            .field("assemblies", &self.assembler.len())
            .finish_non_exhaustive()
    }
}
