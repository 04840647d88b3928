//! Initiator side of the handshake.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::connection::ConnectionInfo;
use crate::core::{
    Endpoint, TransportError, TransportResult, HANDSHAKE_CLIENT_HELLO, HANDSHAKE_SERVER_HELLO,
    PROTOCOL_ID,
};
use crate::crypto::{
    encode_handshake_record, HandshakeResult, InitiatorHandshake, PublicKeyBytes, Role,
    SecureRecordLayer, SessionKeys, StaticKeypair,
};
use crate::reliability::{completion, Completion, CompletionToken};
use crate::service::TransportConfig;
use crate::transport::ControlBody;

use super::chain::{EstablishedSession, FilterHost, FilterInput, FilterState, FilterVerdict, HandshakeFilter};
use super::{check_protocol_id, handshake_message};

/// Sends ClientHello to one endpoint until a ServerHello completes the
/// handshake or the deadline passes.
///
/// A ServerHello that fails to authenticate restarts the handshake with a
/// fresh ClientHello.
pub struct InitiatorFilter {
    endpoint: Endpoint,
    remote_public_key: PublicKeyBytes,
    handshake: Option<InitiatorHandshake>,
    hello: Bytes,
    hello_sequence: u64,
    resend_interval: Duration,
    next_send: Instant,
    deadline: Instant,
    completion: Option<Completion<ConnectionInfo>>,
    state: FilterState,
}

impl InitiatorFilter {
    /// Prepare a handshake towards `endpoint`, whose static key must be
    /// `remote_public_key`. The first ClientHello goes out on the next poll.
    pub fn new(
        local_keypair: &StaticKeypair,
        endpoint: Endpoint,
        remote_public_key: PublicKeyBytes,
        config: &TransportConfig,
        now: Instant,
    ) -> TransportResult<(Self, CompletionToken<ConnectionInfo>)> {
        let (done, token) = completion();
        let mut filter = Self {
            endpoint,
            remote_public_key,
            handshake: None,
            hello: Bytes::new(),
            hello_sequence: 0,
            resend_interval: config.handshake_resend_interval(),
            next_send: now,
            deadline: now + config.handshake_timeout(),
            completion: Some(done),
            state: FilterState::NotCompleted,
        };
        filter.start(local_keypair)?;
        Ok((filter, token))
    }

    /// Target endpoint.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    fn start(&mut self, local_keypair: &StaticKeypair) -> TransportResult<()> {
        let mut handshake = InitiatorHandshake::new(local_keypair, &self.remote_public_key)?;
        let noise = handshake.write_message(PROTOCOL_ID)?;
        self.hello = encode_handshake_record(
            self.hello_sequence,
            &handshake_message(HANDSHAKE_CLIENT_HELLO, &noise),
        )?;
        self.hello_sequence += 1;
        self.handshake = Some(handshake);
        Ok(())
    }

    fn finish(
        &mut self,
        host: &dyn FilterHost,
        payload: &[u8],
        result: HandshakeResult,
    ) -> TransportResult<ConnectionInfo> {
        check_protocol_id(payload)?;

        let static_dh = host.local_keypair().compute_static_dh(&self.remote_public_key);
        let keys = SessionKeys::derive(&result, &static_dh)?;
        let mut record = SecureRecordLayer::new(Role::Initiator);
        record.begin_handshake()?;
        record.establish(keys)?;

        host.establish(EstablishedSession {
            endpoint: self.endpoint,
            role: Role::Initiator,
            remote_public_key: self.remote_public_key,
            record,
            handshake_cache: None,
        })
    }

    fn resolve(&mut self, state: FilterState, result: TransportResult<ConnectionInfo>) {
        self.state = state;
        self.handshake = None;
        if let Some(done) = self.completion.take() {
            done.complete(result);
        }
    }

    fn restart(&mut self, host: &dyn FilterHost, now: Instant) {
        match self.start(host.local_keypair()) {
            Ok(()) => self.next_send = now,
            Err(e) => self.resolve(FilterState::TimedOut, Err(e)),
        }
    }
}

impl HandshakeFilter for InitiatorFilter {
    fn name(&self) -> &'static str {
        "initiator"
    }

    fn state(&self) -> FilterState {
        self.state
    }

    fn check_timeout(&mut self, now: Instant) {
        if self.state == FilterState::NotCompleted && now >= self.deadline {
            warn!(endpoint = %self.endpoint, "handshake timed out");
            self.resolve(FilterState::TimedOut, Err(TransportError::Timeout));
        }
    }

    fn run(&mut self, host: &dyn FilterHost, input: &FilterInput, now: Instant) -> FilterVerdict {
        if input.source != self.endpoint || self.state != FilterState::NotCompleted {
            return FilterVerdict::Ignored;
        }
        let ControlBody::Handshake(body) = &input.message.body else {
            return FilterVerdict::Ignored;
        };
        if body.first() != Some(&HANDSHAKE_SERVER_HELLO) {
            return FilterVerdict::Ignored;
        }

        let Some(handshake) = self.handshake.take() else {
            return FilterVerdict::Consumed;
        };

        match handshake.read_message(&body[1..]) {
            Ok((payload, result)) => match self.finish(host, &payload, result) {
                Ok(info) => {
                    info!(endpoint = %info.endpoint, id = %info.id, "handshake complete");
                    self.resolve(FilterState::Completed, Ok(info));
                }
                Err(e) => {
                    warn!(endpoint = %self.endpoint, error = %e, "handshake failed");
                    self.resolve(FilterState::TimedOut, Err(e));
                }
            },
            Err(e) => {
                debug!(endpoint = %self.endpoint, error = %e, "ServerHello rejected, restarting handshake");
                self.restart(host, now);
            }
        }
        FilterVerdict::Consumed
    }

    fn poll(&mut self, host: &dyn FilterHost, now: Instant) {
        if self.state != FilterState::NotCompleted || now < self.next_send {
            return;
        }
        host.send_datagram(self.endpoint, self.hello.clone());
        self.next_send = now + self.resend_interval;
    }
}

impl std::fmt::Debug for InitiatorFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitiatorFilter")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::chain::tests::MockHost;
    use crate::handshake::{decode_handshake_record, HandshakeFilterChain, ResponderFilter};

    fn deliver(datagram: &Bytes, source: Endpoint) -> FilterInput {
        FilterInput {
            source,
            message: decode_handshake_record(datagram).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_full_handshake_between_filters() {
        let config = TransportConfig::default();
        let client_host = MockHost::new(config.clone());
        let server_host = MockHost::new(config.clone());
        let server_addr: Endpoint = "127.0.0.1:9000".parse().unwrap();
        let client_addr: Endpoint = "127.0.0.1:9001".parse().unwrap();
        let now = Instant::now();

        let (initiator, token) = InitiatorFilter::new(
            &client_host.keypair,
            server_addr,
            *server_host.keypair.public_key(),
            &config,
            now,
        )
        .unwrap();

        let mut client_chain = HandshakeFilterChain::new();
        client_chain.install(Box::new(initiator));
        client_chain.run_filters(&client_host, None, now);

        let mut server_chain = HandshakeFilterChain::new();
        server_chain.install(Box::new(ResponderFilter::new()));

        let hello = client_host.take_datagrams();
        assert_eq!(hello.len(), 1);
        assert!(server_chain.run_filters(&server_host, Some(deliver(&hello[0].1, client_addr)), now));

        let flight = server_host.take_datagrams();
        assert_eq!(flight.len(), 1);
        assert!(client_chain.run_filters(&client_host, Some(deliver(&flight[0].1, server_addr)), now));
        assert!(client_chain.is_empty());

        let info = token.await.unwrap();
        assert_eq!(info.endpoint, server_addr);
        assert_eq!(info.role, Role::Initiator);

        let client_session = client_host.sessions.lock().unwrap().pop().unwrap();
        let server_session = server_host.sessions.lock().unwrap().pop().unwrap();
        assert_eq!(server_session.remote_public_key, *client_host.keypair.public_key());

        let mut client_record = client_session.record;
        let mut server_record = server_session.record;
        let sealed = client_record
            .seal(crate::transport::ContentType::ApplicationData, b"hello")
            .unwrap();
        assert_eq!(
            server_record.open(&sealed).unwrap(),
            crate::crypto::OpenedRecord::Application(Bytes::from_static(b"hello"))
        );
    }

    #[tokio::test]
    async fn test_resends_then_times_out() {
        let config = TransportConfig::builder()
            .handshake_timeout(Duration::from_millis(1000))
            .handshake_resend_interval(Duration::from_millis(250))
            .build();
        let host = MockHost::new(config.clone());
        let now = Instant::now();
        let (initiator, token) = InitiatorFilter::new(
            &host.keypair,
            "127.0.0.1:9000".parse().unwrap(),
            [5u8; 32],
            &config,
            now,
        )
        .unwrap();

        let mut chain = HandshakeFilterChain::new();
        chain.install(Box::new(initiator));
        for ms in [0u64, 100, 250, 400, 500, 750, 999] {
            chain.run_filters(&host, None, now + Duration::from_millis(ms));
        }
        let sent = host.take_datagrams();
        assert_eq!(sent.len(), 4);
        assert!(sent.windows(2).all(|pair| pair[0].1 == pair[1].1));

        chain.run_filters(&host, None, now + Duration::from_millis(1000));
        assert!(chain.is_empty());
        assert!(matches!(token.await, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn test_forged_server_hello_restarts() {
        let config = TransportConfig::default();
        let host = MockHost::new(config.clone());
        let server: Endpoint = "127.0.0.1:9000".parse().unwrap();
        let now = Instant::now();
        let (mut initiator, mut token) =
            InitiatorFilter::new(&host.keypair, server, [5u8; 32], &config, now).unwrap();

        initiator.poll(&host, now);
        let first = host.take_datagrams().pop().unwrap().1;

        let forged = FilterInput {
            source: server,
            message: crate::transport::ControlMessage::decode(handshake_message(
                HANDSHAKE_SERVER_HELLO,
                &[7u8; 48],
            ))
            .unwrap(),
        };
        assert_eq!(initiator.run(&host, &forged, now), FilterVerdict::Consumed);
        assert_eq!(initiator.state(), FilterState::NotCompleted);
        assert!(token.try_result().is_none());

        initiator.poll(&host, now);
        let second = host.take_datagrams().pop().unwrap().1;
        assert_ne!(first, second);
    }

    #[test]
    fn test_ignores_other_sources() {
        let config = TransportConfig::default();
        let host = MockHost::new(config.clone());
        let now = Instant::now();
        let (mut initiator, _token) = InitiatorFilter::new(
            &host.keypair,
            "127.0.0.1:9000".parse().unwrap(),
            [5u8; 32],
            &config,
            now,
        )
        .unwrap();

        let stray = FilterInput {
            source: "127.0.0.1:9999".parse().unwrap(),
            message: crate::transport::ControlMessage::decode(handshake_message(
                HANDSHAKE_SERVER_HELLO,
                &[7u8; 48],
            ))
            .unwrap(),
        };
        assert_eq!(initiator.run(&host, &stray, now), FilterVerdict::Ignored);
    }
}
