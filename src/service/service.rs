//! High-level transport API.
//!
//! Provides [`TransportService`], which owns the socket and every background
//! task, and exposes send, receive, connect and probe entry points.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connection::{CloseReason, ConnectionInfo, Inbound, StrandTask};
use crate::core::{AckClassification, Endpoint, TransportError, TransportResult};
use crate::crypto::{PublicKeyBytes, StaticKeypair};
use crate::handshake::{
    HandshakeFilter, HandshakeFilterChain, InitiatorFilter, PmtuDiscoveryFilter, PunchthroughFilter,
    ResponderFilter,
};
use crate::reliability::{completion, CompletionToken, ResendPolicy};
use crate::transport::{split, ControlBody, ControlMessage, DatagramSocketBuilder, MtuValue};

use super::config::TransportConfig;
use super::shared::{ServiceHost, Shared};
use super::tasks::{filter_loop, receive_loop, sweep_loop, writer_loop, FilterCommand};

/// A message handed to [`TransportService::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Control payload. Must fit one record; never fragmented.
    Control(Bytes),
    /// Application message. Fragmented when larger than one record.
    Application(Bytes),
}

impl Outbound {
    /// Payload bytes.
    pub fn payload(&self) -> &Bytes {
        match self {
            Outbound::Control(payload) | Outbound::Application(payload) => payload,
        }
    }
}

/// Per-send delivery options.
///
/// Unset resend fields fall back to the service configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Resend until acknowledged.
    pub requires_ack: bool,
    /// Wait before the first resend.
    pub resend_interval: Option<Duration>,
    /// Send attempts before `Timeout`, the first send included.
    pub max_attempts: Option<u32>,
}

impl SendOptions {
    /// Acknowledged delivery with the configured resend policy.
    pub fn reliable() -> Self {
        Self {
            requires_ack: true,
            ..Self::default()
        }
    }

    /// Fire-and-forget.
    pub fn unreliable() -> Self {
        Self::default()
    }

    /// Override the resend interval.
    pub fn resend_interval(mut self, interval: Duration) -> Self {
        self.resend_interval = Some(interval);
        self
    }

    /// Override the attempt limit.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    fn policy(&self, config: &TransportConfig) -> ResendPolicy {
        let mut policy = config.resend_policy();
        if let Some(interval) = self.resend_interval {
            policy.interval = interval;
        }
        if let Some(attempts) = self.max_attempts {
            policy.max_attempts = attempts;
        }
        policy
    }
}

/// A reliable, secured datagram endpoint.
///
/// # Example
///
/// ```no_run
/// use netcode_transport::prelude::*;
///
/// # async fn run(server_key: PublicKeyBytes) -> TransportResult<()> {
/// let config = TransportConfig::builder()
///     .bind_addr("0.0.0.0:0".parse().unwrap())
///     .accept_incoming(false)
///     .build();
/// let mut service = TransportService::bind(config, StaticKeypair::generate()?).await?;
///
/// let server = "198.51.100.4:7777".parse().unwrap();
/// service.connect(server, server_key).await?;
/// service
///     .send(Outbound::Control("hello".into()), server, SendOptions::reliable())
///     .await?;
///
/// while let Some(inbound) = service.recv().await {
///     println!("{} sent {:?}", inbound.source(), inbound);
/// }
/// service.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct TransportService {
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    receiver: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    filters: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl TransportService {
    /// Bind the socket and start the background tasks.
    ///
    /// With `accept_incoming` set, the service answers handshakes from any
    /// peer that passes the `authorized_peers` check.
    pub async fn bind(config: TransportConfig, keypair: StaticKeypair) -> TransportResult<Self> {
        config.validate()?;

        let socket = DatagramSocketBuilder::new()
            .pool_buffers(config.pool_buffers)
            .bind(config.bind_addr)
            .await?;
        let local_addr = socket.local_addr();

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (filters_tx, filters_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        let mut chain = HandshakeFilterChain::new();
        if config.accept_incoming {
            chain.install(Box::new(ResponderFilter::new()));
        }

        let shared = Arc::new(Shared::new(
            config, keypair, local_addr, writer_tx, filters_tx, inbound_tx,
        ));

        let writer = tokio::spawn(writer_loop(socket.clone(), writer_rx));
        let filters = tokio::spawn(filter_loop(ServiceHost(shared.clone()), filters_rx, chain));
        let receiver = tokio::spawn(receive_loop(shared.clone(), socket));
        let sweeper = tokio::spawn(sweep_loop(shared.clone()));

        info!(%local_addr, accept_incoming = shared.config.accept_incoming, "transport bound");

        Ok(Self {
            shared,
            inbound,
            receiver,
            sweeper,
            filters: Some(filters),
            writer: Some(writer),
        })
    }

    /// Local socket address.
    pub fn local_addr(&self) -> Endpoint {
        self.shared.local_addr
    }

    /// Our static public key, which peers pass to [`connect`](Self::connect).
    pub fn public_key(&self) -> &PublicKeyBytes {
        self.shared.keypair.public_key()
    }

    /// Service configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Send a message over the established connection to `destination`.
    ///
    /// Size is checked before any sequence is allocated or byte is sent.
    /// Reliable sends resolve on the peer's acknowledgement, others once
    /// the datagrams were handed to the socket.
    ///
    /// # Errors
    ///
    /// The token resolves with `Unauthorized` when no connection exists,
    /// `MessageTooBig` when the message exceeds the per-destination limit,
    /// `Timeout` when no acknowledgement arrives and `Cancelled` when the
    /// connection is torn down first.
    pub fn send(&self, message: Outbound, destination: Endpoint, options: SendOptions) -> CompletionToken<()> {
        if self.shared.is_shut_down() {
            return CompletionToken::ready(Err(TransportError::Shutdown));
        }
        let Some(handle) = self.shared.registry.get(destination) else {
            return CompletionToken::ready(Err(TransportError::Unauthorized));
        };

        let messages = match self.frame(message, destination, options.requires_ack) {
            Ok(messages) => messages,
            Err(e) => return CompletionToken::ready(Err(e)),
        };

        let (done, token) = completion();
        if options.requires_ack {
            let policy = options.policy(&self.shared.config);
            if let Err(e) = self.shared.pending.register_next(
                destination,
                AckClassification::Secure,
                &self.shared.sequences,
                |sequence| sequenced(messages, sequence),
                done,
                policy,
                Instant::now(),
                &*self.shared,
            ) {
                debug!(%destination, error = %e, "send not registered");
            }
        } else {
            let frames = sequenced(messages, self.shared.sequences.next(destination));
            let seal = StrandTask::Seal {
                frames,
                completion: Some(done),
            };
            if let Err(StrandTask::Seal {
                completion: Some(done),
                ..
            }) = handle.post(seal)
            {
                done.complete(Err(TransportError::NotConnected(destination)));
            }
        }
        token
    }

    /// Split `message` into the messages it is sent as, checking its size.
    /// Sequences are stamped once the send is registered.
    fn frame(&self, message: Outbound, destination: Endpoint, needs_ack: bool) -> TransportResult<Vec<ControlMessage>> {
        match message {
            Outbound::Control(payload) => {
                let control = ControlMessage::new(0, needs_ack, ControlBody::Payload(payload));
                let limit = self.shared.mtu.encrypted_payload_size(destination);
                let size = control.encoded_len();
                if size > limit {
                    return Err(TransportError::MessageTooBig { size, limit });
                }
                Ok(vec![control])
            }
            Outbound::Application(payload) => {
                let capacity = self.shared.mtu.fragment_capacity(destination);
                split(0, &payload, capacity, needs_ack)
            }
        }
    }

    /// Handshake with `endpoint`, which must prove it holds
    /// `remote_public_key`.
    ///
    /// Resolves immediately when a connection already exists.
    pub fn connect(&self, endpoint: Endpoint, remote_public_key: PublicKeyBytes) -> CompletionToken<ConnectionInfo> {
        if self.shared.is_shut_down() {
            return CompletionToken::ready(Err(TransportError::Shutdown));
        }
        if let Some(handle) = self.shared.registry.get(endpoint) {
            return CompletionToken::ready(Ok(handle.info().clone()));
        }

        match InitiatorFilter::new(
            &self.shared.keypair,
            endpoint,
            remote_public_key,
            &self.shared.config,
            Instant::now(),
        ) {
            Ok((filter, token)) => self.install(Box::new(filter), token),
            Err(e) => CompletionToken::ready(Err(e)),
        }
    }

    /// Binary-search the path MTU towards `endpoint`. Resolves with the
    /// largest MTU that was acknowledged, which is also recorded for later
    /// sends.
    pub fn discover_pmtu(&self, endpoint: Endpoint) -> CompletionToken<u16> {
        let (filter, token) = PmtuDiscoveryFilter::new(endpoint, &self.shared.config);
        self.install(Box::new(filter), token)
    }

    /// Open a NAT mapping towards `endpoint`.
    pub fn punch_through(&self, endpoint: Endpoint) -> CompletionToken<()> {
        let (filter, token) = PunchthroughFilter::new(endpoint, self.shared.config.resend_policy());
        self.install(Box::new(filter), token)
    }

    fn install<T>(&self, filter: Box<dyn HandshakeFilter>, token: CompletionToken<T>) -> CompletionToken<T> {
        if self.shared.is_shut_down() || self.shared.post_filters(FilterCommand::Install(filter)).is_err() {
            return CompletionToken::ready(Err(TransportError::Shutdown));
        }
        token
    }

    /// Close the connection to `endpoint`, notifying the peer.
    ///
    /// Outstanding reliable sends resolve `Cancelled` before this returns;
    /// the token resolves once the close hooks ran.
    pub fn close(&self, endpoint: Endpoint) -> CompletionToken<()> {
        self.shared.close_connection(endpoint, CloseReason::Local, true)
    }

    /// Drain the messages received so far.
    ///
    /// The iterator is finite: messages arriving while it is consumed are
    /// left for the next call.
    pub fn receive(&mut self) -> std::vec::IntoIter<Inbound> {
        let mut drained = Vec::new();
        while let Ok(inbound) = self.inbound.try_recv() {
            drained.push(inbound);
        }
        drained.into_iter()
    }

    /// Wait for the next received message. Returns `None` after shutdown.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    /// Register a callback run whenever a connection is established.
    pub fn on_connection_established<F>(&self, hook: F)
    where
        F: Fn(&ConnectionInfo) + Send + Sync + 'static,
    {
        self.shared.hooks.on_established(Arc::new(hook));
    }

    /// Register a callback run whenever a connection is torn down.
    pub fn on_connection_closed<F>(&self, hook: F)
    where
        F: Fn(&ConnectionInfo, CloseReason) + Send + Sync + 'static,
    {
        self.shared.hooks.on_closed(Arc::new(hook));
    }

    /// Established connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.shared
            .registry
            .snapshot()
            .iter()
            .map(|handle| handle.snapshot())
            .collect()
    }

    /// The connection to `endpoint`, if established.
    pub fn connection(&self, endpoint: Endpoint) -> Option<ConnectionInfo> {
        self.shared.registry.get(endpoint).map(|handle| handle.snapshot())
    }

    /// Current MTU estimate towards `endpoint`.
    pub fn mtu(&self, endpoint: Endpoint) -> MtuValue {
        self.shared.mtu.get(endpoint)
    }

    /// Messages still waiting for an acknowledgement.
    pub fn pending_acks(&self) -> usize {
        self.shared.pending.len()
    }

    /// Gracefully shut down: close every connection with a close_notify,
    /// cancel outstanding sends and filters, flush the writer and stop all
    /// tasks.
    pub async fn shutdown(mut self) {
        if self.shared.begin_shutdown() {
            return;
        }

        let closing: Vec<_> = self
            .shared
            .registry
            .snapshot()
            .iter()
            .map(|handle| {
                self.shared
                    .close_connection(handle.info().endpoint, CloseReason::Shutdown, true)
            })
            .collect();
        let connections = closing.len();
        for token in closing {
            let _ = token.await;
        }

        let cancelled = self.shared.pending.cancel_all();

        let _ = self.shared.post_filters(FilterCommand::Stop);
        if let Some(filters) = self.filters.take() {
            let _ = filters.await;
        }

        let _ = self.shared.stop_writer().await;
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }

        self.receiver.abort();
        self.sweeper.abort();
        info!(local_addr = %self.shared.local_addr, connections, cancelled, "transport shut down");
    }
}

/// Stamp `sequence` on every message and encode them.
fn sequenced(messages: Vec<ControlMessage>, sequence: u32) -> Vec<Bytes> {
    messages
        .into_iter()
        .map(|mut message| {
            message.sequence = sequence;
            message.encode()
        })
        .collect()
}

impl Drop for TransportService {
    fn drop(&mut self) {
        self.receiver.abort();
        self.sweeper.abort();

        if self.shared.begin_shutdown() {
            return;
        }
        for handle in self.shared.registry.drain() {
            self.shared
                .pending
                .cancel_destination(handle.info().endpoint, &self.shared.sequences);
            let _ = handle.post(StrandTask::Close {
                reason: CloseReason::Shutdown,
                notify_peer: false,
                done: None,
            });
        }
        self.shared.pending.cancel_all();
        let _ = self.shared.post_filters(FilterCommand::Stop);
    }
}

impl std::fmt::Debug for TransportService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportService")
            .field("local_addr", &self.shared.local_addr)
            .field("connections", &self.shared.registry.len())
            .field("pending_acks", &self.shared.pending.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> TransportConfig {
        TransportConfig::builder()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .build()
    }

    #[test]
    fn test_send_options_fall_back_to_config() {
        let config = TransportConfig::builder()
            .resend_interval(Duration::from_millis(250))
            .max_resend_attempts(7)
            .build();

        let policy = SendOptions::reliable().policy(&config);
        assert_eq!(policy.interval, Duration::from_millis(250));
        assert_eq!(policy.max_attempts, 7);

        let policy = SendOptions::reliable()
            .resend_interval(Duration::from_millis(100))
            .max_attempts(3)
            .policy(&config);
        assert_eq!(policy.interval, Duration::from_millis(100));
        assert_eq!(policy.max_attempts, 3);
        assert!(!SendOptions::unreliable().requires_ack);
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_config() {
        let config = TransportConfig::builder().mtu(1500, 1200, 576).build();
        let result = TransportService::bind(config, StaticKeypair::generate().unwrap()).await;
        assert!(matches!(result, Err(TransportError::Config(_))));
    }

    #[tokio::test]
    async fn test_send_without_connection_is_unauthorized() {
        let service = TransportService::bind(loopback(), StaticKeypair::generate().unwrap())
            .await
            .unwrap();
        let peer: Endpoint = "127.0.0.1:9".parse().unwrap();

        let result = service
            .send(Outbound::Control(Bytes::from_static(b"hi")), peer, SendOptions::reliable())
            .await;
        assert!(matches!(result, Err(TransportError::Unauthorized)));
        assert_eq!(service.pending_acks(), 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_unknown_endpoint() {
        let service = TransportService::bind(loopback(), StaticKeypair::generate().unwrap())
            .await
            .unwrap();
        let peer: Endpoint = "127.0.0.1:9".parse().unwrap();
        assert!(matches!(service.close(peer).await, Err(TransportError::NotConnected(p)) if p == peer));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_forgets_destination_state() {
        let server = TransportService::bind(loopback(), StaticKeypair::generate().unwrap())
            .await
            .unwrap();
        let client = TransportService::bind(loopback(), StaticKeypair::generate().unwrap())
            .await
            .unwrap();
        let endpoint = server.local_addr();

        client.discover_pmtu(endpoint).await.unwrap();
        client.connect(endpoint, *server.public_key()).await.unwrap();
        client
            .send(Outbound::Control(Bytes::from_static(b"hi")), endpoint, SendOptions::reliable())
            .await
            .unwrap();
        assert_eq!(client.shared.sequences.len(), 1);
        assert_eq!(client.shared.mtu.len(), 1);
        assert!(client.shared.pending.queue_count() > 0);

        client.close(endpoint).await.unwrap();
        assert!(client.shared.sequences.is_empty());
        assert!(client.shared.mtu.is_empty());
        assert_eq!(client.shared.pending.queue_count(), 0);

        client.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_receive_drains_nothing_when_idle() {
        let mut service = TransportService::bind(loopback(), StaticKeypair::generate().unwrap())
            .await
            .unwrap();
        assert_eq!(service.receive().count(), 0);
        assert!(service.connections().is_empty());
        service.shutdown().await;
    }
}
