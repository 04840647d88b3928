//! Responder side of the handshake.

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionInfo, HandshakeCache};
use crate::core::{
    CryptoError, Endpoint, TransportError, TransportResult, HANDSHAKE_CLIENT_HELLO,
    HANDSHAKE_SERVER_HELLO, PROTOCOL_ID,
};
use crate::crypto::{ResponderHandshake, Role, SecureRecordLayer, SessionKeys};
use crate::transport::ControlBody;

use super::chain::{EstablishedSession, FilterHost, FilterInput, FilterState, FilterVerdict, HandshakeFilter};
use super::{check_protocol_id, handshake_message};

/// Answers every ClientHello. Never completes.
#[derive(Debug, Default)]
pub struct ResponderFilter {
    answered: u64,
}

impl ResponderFilter {
    /// Create a responder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handshakes answered so far.
    pub fn answered(&self) -> u64 {
        self.answered
    }

    fn answer(&self, host: &dyn FilterHost, source: Endpoint, hello: &Bytes) -> TransportResult<ConnectionInfo> {
        let config = host.config();
        if !host.is_connected(source) && host.connection_count() >= config.max_connections {
            return Err(TransportError::protocol("connection limit reached"));
        }

        let mut handshake = ResponderHandshake::new(host.local_keypair())?;
        let (payload, remote_public_key) = handshake.read_message(&hello[1..])?;
        check_protocol_id(&payload)?;
        if !config.is_authorized(&remote_public_key) {
            return Err(CryptoError::UnauthorizedPeer.into());
        }

        let (reply, result) = handshake.write_message(PROTOCOL_ID)?;
        let static_dh = host.local_keypair().compute_static_dh(&remote_public_key);
        let keys = SessionKeys::derive(&result, &static_dh)?;

        let mut record = SecureRecordLayer::new(Role::Responder);
        record.begin_handshake()?;
        record.establish(keys)?;
        let flight = record.seal_handshake(&handshake_message(HANDSHAKE_SERVER_HELLO, &reply))?;

        let info = host.establish(EstablishedSession {
            endpoint: source,
            role: Role::Responder,
            remote_public_key,
            record,
            handshake_cache: Some(HandshakeCache {
                client_hello: hello.clone(),
                flight: flight.clone(),
            }),
        })?;
        host.send_datagram(source, flight);
        Ok(info)
    }
}

impl HandshakeFilter for ResponderFilter {
    fn name(&self) -> &'static str {
        "responder"
    }

    fn state(&self) -> FilterState {
        FilterState::NotCompleted
    }

    fn run(&mut self, host: &dyn FilterHost, input: &FilterInput, _now: Instant) -> FilterVerdict {
        let ControlBody::Handshake(hello) = &input.message.body else {
            return FilterVerdict::Ignored;
        };
        if hello.first() != Some(&HANDSHAKE_CLIENT_HELLO) {
            return FilterVerdict::Ignored;
        }

        match self.answer(host, input.source, hello) {
            Ok(info) => {
                self.answered += 1;
                info!(endpoint = %info.endpoint, id = %info.id, "handshake answered");
            }
            Err(TransportError::Crypto(CryptoError::UnauthorizedPeer)) => {
                warn!(source = %input.source, "handshake from unauthorized peer refused");
            }
            Err(e) => debug!(source = %input.source, error = %e, "ClientHello rejected"),
        }
        FilterVerdict::Consumed
    }
}
