//! Path MTU discovery.
//!
//! The upper bound is probed first, since most paths carry it. If that
//! probe goes unanswered the filter binary-searches between the bounds with
//! ack-required probes padded to the candidate UDP payload size, and stops
//! once the window is narrower than [`PMTU_GRANULARITY`].
//!
//! At least one probe must be acknowledged. A search that converges without
//! any answer probes the lower bound itself, and fails with `Timeout` if
//! that is lost too.

use std::time::Instant;

use tracing::{debug, info};

use crate::core::{Endpoint, TransportError, TransportResult, PMTU_GRANULARITY};
use crate::reliability::{completion, Completion, CompletionToken, ResendPolicy};
use crate::service::TransportConfig;
use crate::transport::{ControlBody, MtuValue};

use super::chain::{FilterHost, FilterInput, FilterState, FilterVerdict, HandshakeFilter};

/// Discovers the path MTU towards one endpoint.
pub struct PmtuDiscoveryFilter {
    endpoint: Endpoint,
    low: u16,
    high: u16,
    probe: Option<(u16, CompletionToken<()>)>,
    probed_upper_bound: bool,
    probed_floor: bool,
    acknowledged: bool,
    policy: ResendPolicy,
    completion: Option<Completion<u16>>,
    state: FilterState,
}

impl PmtuDiscoveryFilter {
    /// Search between the configured MTU bounds.
    pub fn new(endpoint: Endpoint, config: &TransportConfig) -> (Self, CompletionToken<u16>) {
        let (done, token) = completion();
        let filter = Self {
            endpoint,
            low: config.min_mtu,
            high: config.max_mtu.max(config.min_mtu),
            probe: None,
            probed_upper_bound: false,
            probed_floor: false,
            acknowledged: false,
            policy: config.pmtu_probe_policy(),
            completion: Some(done),
            state: FilterState::NotCompleted,
        };
        (filter, token)
    }

    /// Current search window.
    pub fn window(&self) -> (u16, u16) {
        (self.low, self.high)
    }

    fn next_candidate(&mut self) -> u16 {
        if !self.probed_upper_bound {
            self.probed_upper_bound = true;
            return self.high;
        }
        self.low + (self.high - self.low).div_ceil(2)
    }

    fn send_probe(&mut self, host: &dyn FilterHost, candidate: u16) {
        let probe_size = MtuValue::new(candidate).udp_payload_size(self.endpoint.ip());
        let probe_size = u16::try_from(probe_size).unwrap_or(u16::MAX);
        let token = host.send_reliable(self.endpoint, ControlBody::PmtuDiscovery { probe_size }, self.policy);
        self.probe = Some((candidate, token));
    }

    fn resolve(&mut self, state: FilterState, result: TransportResult<u16>) {
        self.state = state;
        if let Some(done) = self.completion.take() {
            done.complete(result);
        }
    }
}

impl HandshakeFilter for PmtuDiscoveryFilter {
    fn name(&self) -> &'static str {
        "pmtu-discovery"
    }

    fn state(&self) -> FilterState {
        self.state
    }

    fn run(&mut self, _host: &dyn FilterHost, _input: &FilterInput, _now: Instant) -> FilterVerdict {
        // Probe ACKs complete through the pending-ack store.
        FilterVerdict::Ignored
    }

    fn poll(&mut self, host: &dyn FilterHost, _now: Instant) {
        if self.state != FilterState::NotCompleted {
            return;
        }

        if let Some((candidate, mut token)) = self.probe.take() {
            match token.try_result() {
                None => {
                    self.probe = Some((candidate, token));
                    return;
                }
                Some(Ok(())) => {
                    debug!(endpoint = %self.endpoint, mtu = candidate, "pmtu probe acknowledged");
                    self.acknowledged = true;
                    self.low = candidate;
                }
                Some(Err(TransportError::Timeout)) => {
                    debug!(endpoint = %self.endpoint, mtu = candidate, "pmtu probe lost");
                    self.high = candidate.saturating_sub(1);
                }
                Some(Err(e)) => {
                    self.resolve(FilterState::TimedOut, Err(e));
                    return;
                }
            }
        }

        if self.high <= self.low || self.high - self.low < PMTU_GRANULARITY {
            if !self.acknowledged {
                if self.probed_floor {
                    info!(endpoint = %self.endpoint, "path MTU discovery got no answer");
                    self.resolve(FilterState::TimedOut, Err(TransportError::Timeout));
                } else {
                    self.probed_floor = true;
                    self.send_probe(host, self.low);
                }
                return;
            }

            let mtu = MtuValue::new(self.low);
            host.record_mtu(self.endpoint, mtu);
            info!(endpoint = %self.endpoint, mtu = mtu.get(), "path MTU discovered");
            self.resolve(FilterState::Completed, Ok(mtu.get()));
            return;
        }

        let candidate = self.next_candidate();
        self.send_probe(host, candidate);
    }
}

impl std::fmt::Debug for PmtuDiscoveryFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmtuDiscoveryFilter")
            .field("endpoint", &self.endpoint)
            .field("low", &self.low)
            .field("high", &self.high)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
