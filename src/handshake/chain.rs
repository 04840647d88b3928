//! The handshake filter chain.
//!
//! Unauthenticated control traffic is fed through an ordered list of
//! stateful filters. The first filter that consumes a message owns it;
//! finished filters are swept before every run.

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::connection::{ConnectionInfo, HandshakeCache};
use crate::core::{Endpoint, TransportResult};
use crate::crypto::{PublicKeyBytes, Role, SecureRecordLayer, StaticKeypair};
use crate::reliability::{CompletionToken, ResendPolicy};
use crate::service::TransportConfig;
use crate::transport::{ControlBody, ControlKind, ControlMessage, MtuValue};

/// Lifecycle of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    /// Still processing.
    NotCompleted,
    /// Finished successfully; removed on the next sweep.
    Completed,
    /// Gave up; removed on the next sweep.
    TimedOut,
}

/// Result of offering a message to a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    /// The filter took the message; the chain stops.
    Consumed,
    /// Not for this filter.
    Ignored,
}

/// An unauthenticated control message and its sender.
#[derive(Debug, Clone)]
pub struct FilterInput {
    /// Sender.
    pub source: Endpoint,
    /// Decoded message.
    pub message: ControlMessage,
}

/// A completed handshake, ready to become a connection.
#[derive(Debug)]
pub struct EstablishedSession {
    /// Peer address.
    pub endpoint: Endpoint,
    /// Our side of the handshake.
    pub role: Role,
    /// Peer's authenticated static key.
    pub remote_public_key: PublicKeyBytes,
    /// Record layer with keys installed.
    pub record: SecureRecordLayer,
    /// Responder's answer to the ClientHello.
    pub handshake_cache: Option<HandshakeCache>,
}

/// What filters may do to the outside world.
pub trait FilterHost {
    /// Service configuration.
    fn config(&self) -> &TransportConfig;

    /// Our static identity.
    fn local_keypair(&self) -> &StaticKeypair;

    /// Send one datagram as-is.
    fn send_datagram(&self, destination: Endpoint, datagram: Bytes);

    /// Send an ack-required control message outside any connection.
    fn send_reliable(
        &self,
        destination: Endpoint,
        body: ControlBody,
        policy: ResendPolicy,
    ) -> CompletionToken<()>;

    /// Turn a completed handshake into a registered connection.
    fn establish(&self, session: EstablishedSession) -> TransportResult<ConnectionInfo>;

    /// Record a discovered path MTU.
    fn record_mtu(&self, destination: Endpoint, mtu: MtuValue);

    /// Whether `endpoint` has an established connection.
    fn is_connected(&self, endpoint: Endpoint) -> bool;

    /// Number of established connections.
    fn connection_count(&self) -> usize;
}

/// A stateful processor of unauthenticated traffic.
pub trait HandshakeFilter: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Current state. Filters that are not `NotCompleted` are removed.
    fn state(&self) -> FilterState;

    /// Move to `TimedOut` if a deadline passed.
    fn check_timeout(&mut self, _now: Instant) {}

    /// Offer one message.
    fn run(&mut self, host: &dyn FilterHost, input: &FilterInput, now: Instant) -> FilterVerdict;

    /// Drive sends and inspect outstanding work. Called on every chain run.
    fn poll(&mut self, _host: &dyn FilterHost, _now: Instant) {}
}

/// Ordered list of active filters. Owned by a single task.
#[derive(Default)]
pub struct HandshakeFilterChain {
    filters: Vec<Box<dyn HandshakeFilter>>,
}

impl HandshakeFilterChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter.
    pub fn install(&mut self, filter: Box<dyn HandshakeFilter>) {
        debug!(filter = filter.name(), "filter installed");
        self.filters.push(filter);
    }

    /// Number of active filters.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether no filter is active.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Drop every filter; their pending completions resolve `Cancelled`.
    pub fn clear(&mut self) {
        self.filters.clear();
    }

    /// Sweep finished filters, offer `input`, then poll what remains.
    ///
    /// Returns whether a filter consumed `input`.
    pub fn run_filters(
        &mut self,
        host: &dyn FilterHost,
        input: Option<FilterInput>,
        now: Instant,
    ) -> bool {
        for filter in &mut self.filters {
            filter.check_timeout(now);
        }
        self.sweep();

        let consumed = match input {
            Some(input) => self.offer(host, &input, now),
            None => false,
        };

        for filter in &mut self.filters {
            filter.poll(host, now);
        }
        self.sweep();

        consumed
    }

    fn offer(&mut self, host: &dyn FilterHost, input: &FilterInput, now: Instant) -> bool {
        let allowed = matches!(
            input.message.body.kind(),
            Some(ControlKind::Handshake | ControlKind::ConnectPunchthrough | ControlKind::PmtuDiscovery)
        );
        if !allowed && !host.is_connected(input.source) {
            debug!(source = %input.source, kind = ?input.message.body.kind(), "unauthenticated message rejected");
            return false;
        }

        for filter in &mut self.filters {
            if filter.run(host, input, now) == FilterVerdict::Consumed {
                trace!(source = %input.source, filter = filter.name(), "message consumed");
                return true;
            }
        }

        trace!(source = %input.source, kind = ?input.message.body.kind(), "message not consumed");
        false
    }

    fn sweep(&mut self) {
        self.filters.retain(|filter| match filter.state() {
            FilterState::NotCompleted => true,
            state => {
                debug!(filter = filter.name(), ?state, "filter removed");
                false
            }
        });
    }
}

impl std::fmt::Debug for HandshakeFilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.filters.iter().map(|filter| filter.name()).collect();
        f.debug_struct("HandshakeFilterChain")
            .field("filters", &names)
            .finish()
    }
}
