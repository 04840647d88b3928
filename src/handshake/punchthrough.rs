//! NAT punch-through.

use std::time::Instant;

use tracing::{debug, info};

use crate::core::{Endpoint, TransportResult};
use crate::reliability::{completion, Completion, CompletionToken, ResendPolicy};
use crate::transport::ControlBody;

use super::chain::{FilterHost, FilterInput, FilterState, FilterVerdict, HandshakeFilter};

/// Sends ack-required punch-through messages to one endpoint.
///
/// Completes when the endpoint acknowledges one, or when its own
/// punch-through arrives (both sides punching at once).
pub struct PunchthroughFilter {
    endpoint: Endpoint,
    policy: ResendPolicy,
    probe: Option<CompletionToken<()>>,
    started: bool,
    completion: Option<Completion<()>>,
    state: FilterState,
}

impl PunchthroughFilter {
    /// Punch towards `endpoint`, resending per `policy`.
    pub fn new(endpoint: Endpoint, policy: ResendPolicy) -> (Self, CompletionToken<()>) {
        let (done, token) = completion();
        let filter = Self {
            endpoint,
            policy,
            probe: None,
            started: false,
            completion: Some(done),
            state: FilterState::NotCompleted,
        };
        (filter, token)
    }

    fn resolve(&mut self, state: FilterState, result: TransportResult<()>) {
        self.state = state;
        self.probe = None;
        if let Some(done) = self.completion.take() {
            done.complete(result);
        }
    }
}

impl HandshakeFilter for PunchthroughFilter {
    fn name(&self) -> &'static str {
        "punchthrough"
    }

    fn state(&self) -> FilterState {
        self.state
    }

    fn run(&mut self, _host: &dyn FilterHost, input: &FilterInput, _now: Instant) -> FilterVerdict {
        if self.state != FilterState::NotCompleted
            || input.source != self.endpoint
            || input.message.body != ControlBody::ConnectPunchthrough
        {
            return FilterVerdict::Ignored;
        }
        info!(endpoint = %self.endpoint, "punch-through received from peer");
        self.resolve(FilterState::Completed, Ok(()));
        FilterVerdict::Consumed
    }

    fn poll(&mut self, host: &dyn FilterHost, _now: Instant) {
        if self.state != FilterState::NotCompleted {
            return;
        }
        if !self.started {
            self.started = true;
            self.probe = Some(host.send_reliable(self.endpoint, ControlBody::ConnectPunchthrough, self.policy));
            return;
        }

        let Some(result) = self.probe.as_mut().and_then(CompletionToken::try_result) else {
            return;
        };
        match result {
            Ok(()) => {
                info!(endpoint = %self.endpoint, "punch-through acknowledged");
                self.resolve(FilterState::Completed, Ok(()));
            }
            Err(e) => {
                debug!(endpoint = %self.endpoint, error = %e, "punch-through failed");
                self.resolve(FilterState::TimedOut, Err(e));
            }
        }
    }
}

impl std::fmt::Debug for PunchthroughFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PunchthroughFilter")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TransportError;
    use crate::handshake::chain::tests::MockHost;
    use crate::handshake::HandshakeFilterChain;
    use crate::service::TransportConfig;
    use crate::transport::ControlMessage;

    fn setup() -> (MockHost, HandshakeFilterChain, CompletionToken<()>, Endpoint) {
        let host = MockHost::new(TransportConfig::default());
        let peer: Endpoint = "203.0.113.7:5000".parse().unwrap();
        let (filter, token) = PunchthroughFilter::new(peer, ResendPolicy::default());
        let mut chain = HandshakeFilterChain::new();
        chain.install(Box::new(filter));
        chain.run_filters(&host, None, Instant::now());
        (host, chain, token, peer)
    }

    #[tokio::test]
    async fn test_completes_on_ack() {
        let (host, mut chain, token, peer) = setup();
        let mut probes = host.take_reliable();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].0, peer);
        assert_eq!(probes[0].1, ControlBody::ConnectPunchthrough);

        probes.pop().unwrap().2.complete(Ok(()));
        chain.run_filters(&host, None, Instant::now());
        assert!(chain.is_empty());
        token.await.unwrap();
    }

    #[tokio::test]
    async fn test_completes_on_peer_punch() {
        let (host, mut chain, token, peer) = setup();
        let _probes = host.take_reliable();

        let input = FilterInput {
            source: peer,
            message: ControlMessage::new(99, true, ControlBody::ConnectPunchthrough),
        };
        assert!(chain.run_filters(&host, Some(input), Instant::now()));
        assert!(chain.is_empty());
        token.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_propagates() {
        let (host, mut chain, token, _) = setup();
        host.take_reliable().pop().unwrap().2.complete(Err(TransportError::Timeout));
        chain.run_filters(&host, None, Instant::now());
        assert!(chain.is_empty());
        assert!(matches!(token.await, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn test_clear_cancels_outstanding() {
        let (host, mut chain, token, _) = setup();
        let _probes = host.take_reliable();
        chain.clear();
        assert!(matches!(token.await, Err(TransportError::Cancelled)));
    }
}
