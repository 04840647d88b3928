//! Inbound datagram routing.
//!
//! ```text
//! datagram ─┬─ 0x40 marker ──► ACK ─────────────► pending store (insecure)
//!           │                  punch/PMTU probe ─► auto-ACK, filter chain
//!           │                  anything else ────► Failed
//!           ├─ < record header ─────────────────► Failed
//!           ├─ known endpoint ──────────────────► connection strand
//!           └─ unknown endpoint ────────────────► filter chain (handshake)
//! ```

use bytes::Bytes;
use tracing::{debug, trace};

use crate::connection::StrandTask;
use crate::core::{AckClassification, Endpoint, RECORD_HEADER_SIZE};
use crate::transport::{is_control_datagram, ControlBody, ControlMessage, RawPacket};

use super::shared::Shared;
use super::tasks::FilterCommand;

/// Who owns a datagram after [`try_parse_message`].
#[derive(Debug)]
pub enum ParseResult {
    /// Handed to a connection strand or the filter task.
    TookOwnership,
    /// Fully processed; the buffer may be recycled.
    Completed,
    /// Not accepted; the caller returns the buffer to the pool.
    Failed(RawPacket),
}

/// Route one inbound datagram.
pub(crate) fn try_parse_message(shared: &Shared, packet: RawPacket) -> ParseResult {
    let source = packet.source();

    if is_control_datagram(packet.data()) {
        return match ControlMessage::decode(Bytes::copy_from_slice(packet.data())) {
            Ok(message) => handle_control(shared, source, message, packet),
            Err(e) => {
                trace!(%source, error = %e, "malformed control message");
                ParseResult::Failed(packet)
            }
        };
    }

    if packet.len() < RECORD_HEADER_SIZE {
        trace!(%source, len = packet.len(), "datagram shorter than a record header");
        return ParseResult::Failed(packet);
    }

    if let Some(handle) = shared.registry.get(source) {
        return match handle.post(StrandTask::Inbound(packet)) {
            Ok(()) => ParseResult::TookOwnership,
            Err(StrandTask::Inbound(packet)) => ParseResult::Failed(packet),
            Err(_) => ParseResult::Completed,
        };
    }

    match shared.post_filters(FilterCommand::Packet(packet)) {
        Ok(()) => ParseResult::TookOwnership,
        Err(FilterCommand::Packet(packet)) => ParseResult::Failed(packet),
        Err(_) => ParseResult::Completed,
    }
}

fn handle_control(shared: &Shared, source: Endpoint, message: ControlMessage, packet: RawPacket) -> ParseResult {
    match message.body {
        ControlBody::Acknowledge => {
            match shared.pending.acknowledge(source, AckClassification::Insecure, message.sequence) {
                Ok(outcome) => trace!(%source, sequence = message.sequence, ?outcome, "insecure ack applied"),
                Err(e) => debug!(%source, sequence = message.sequence, error = %e, "insecure ack rejected"),
            }
            ParseResult::Completed
        }
        ControlBody::ConnectPunchthrough | ControlBody::PmtuDiscovery { .. } => {
            if message.needs_ack {
                let ack = ControlMessage::acknowledge(message.sequence).encode();
                shared.send_datagrams(source, vec![ack], None);
            }
            shared.forward_handshake(source, message);
            ParseResult::Completed
        }
        _ => {
            debug!(%source, kind = ?message.body.kind(), "unauthenticated message rejected");
            ParseResult::Failed(packet)
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::connection::Inbound;
    use crate::crypto::{encode_handshake_record, StaticKeypair};
    use crate::handshake::handshake_message;
    use crate::core::HANDSHAKE_CLIENT_HELLO;
    use crate::service::tasks::WriterCommand;
    use crate::service::TransportConfig;
    use crate::transport::PacketBufferPool;

    struct Harness {
        shared: Shared,
        pool: PacketBufferPool,
        writer: mpsc::UnboundedReceiver<WriterCommand>,
        filters: mpsc::UnboundedReceiver<FilterCommand>,
        _inbound: mpsc::UnboundedReceiver<Inbound>,
    }

    fn harness() -> Harness {
        let (writer_tx, writer) = mpsc::unbounded_channel();
        let (filters_tx, filters) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let shared = Shared::new(
            TransportConfig::default(),
            StaticKeypair::generate().unwrap(),
            "127.0.0.1:9000".parse().unwrap(),
            writer_tx,
            filters_tx,
            inbound_tx,
        );
        Harness {
            shared,
            pool: PacketBufferPool::new(4),
            writer,
            filters,
            _inbound: inbound,
        }
    }

    fn packet(h: &Harness, data: &[u8]) -> RawPacket {
        RawPacket::from_slice(&h.pool, data, "127.0.0.1:9100".parse().unwrap(), h.shared.local_addr)
    }

    #[test]
    fn test_probe_is_acked_and_forwarded() {
        let mut h = harness();
        let probe = ControlMessage::new(41, true, ControlBody::ConnectPunchthrough).encode();

        let result = try_parse_message(&h.shared, packet(&h, &probe));
        assert!(matches!(result, ParseResult::Completed));

        match h.writer.try_recv().unwrap() {
            WriterCommand::Send { datagrams, .. } => {
                assert_eq!(datagrams, vec![ControlMessage::acknowledge(41).encode()]);
            }
            other => panic!("unexpected writer command {other:?}"),
        }
        assert!(matches!(
            h.filters.try_recv().unwrap(),
            FilterCommand::Control { message, .. } if message.sequence == 41
        ));
    }

    #[test]
    fn test_unauthenticated_payload_fails() {
        let mut h = harness();
        let payload = ControlMessage::new(1, true, ControlBody::Payload(Bytes::from_static(b"cheat"))).encode();

        let result = try_parse_message(&h.shared, packet(&h, &payload));
        assert!(matches!(result, ParseResult::Failed(_)));
        assert!(h.writer.try_recv().is_err());
        assert!(h.filters.try_recv().is_err());
    }

    #[test]
    fn test_short_and_malformed_fail() {
        let h = harness();
        assert!(matches!(
            try_parse_message(&h.shared, packet(&h, &[0x17, 0xFE])),
            ParseResult::Failed(_)
        ));
        assert!(matches!(
            try_parse_message(&h.shared, packet(&h, &[0x40, 0xFF, 0, 0, 0, 0])),
            ParseResult::Failed(_)
        ));
    }

    #[test]
    fn test_handshake_from_stranger_goes_to_filters() {
        let mut h = harness();
        let record = encode_handshake_record(0, &handshake_message(HANDSHAKE_CLIENT_HELLO, &[1; 48])).unwrap();

        let result = try_parse_message(&h.shared, packet(&h, &record));
        assert!(matches!(result, ParseResult::TookOwnership));
        assert!(matches!(h.filters.try_recv().unwrap(), FilterCommand::Packet(_)));
    }

    #[test]
    fn test_stray_insecure_ack_is_consumed() {
        let h = harness();
        let ack = ControlMessage::acknowledge(5).encode();
        assert!(matches!(try_parse_message(&h.shared, packet(&h, &ack)), ParseResult::Completed));
    }

    #[test]
    fn test_failed_packet_returns_buffer() {
        let h = harness();
        let before = h.pool.available();
        let result = try_parse_message(&h.shared, packet(&h, &[0u8; 4]));
        drop(result);
        assert_eq!(h.pool.available(), before);
    }
}
