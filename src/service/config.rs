//! Transport configuration.
//!
//! Every timing value is externally supplied in milliseconds; the defaults
//! are the documented fallbacks from [`crate::core`] constants.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{
    TransportError, TransportResult, DEFAULT_FRAGMENT_TIMEOUT, DEFAULT_HANDSHAKE_RESEND_INTERVAL,
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_PENDING_ASSEMBLIES, DEFAULT_MAX_RESEND_ATTEMPTS, DEFAULT_MTU,
    DEFAULT_PMTU_PROBE_ATTEMPTS, DEFAULT_RESEND_BACKOFF, DEFAULT_RESEND_INTERVAL,
    DEFAULT_SWEEP_INTERVAL, MAX_MTU, MIN_MTU, PACKET_BUFFER_SIZE,
};
use crate::crypto::PublicKeyBytes;
use crate::reliability::ResendPolicy;
use crate::transport::DEFAULT_POOL_BUFFERS;

/// Transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,

    /// Interval between resends of an unacknowledged message.
    pub resend_interval_ms: u64,

    /// Send attempts, the first included, before a message times out.
    pub max_resend_attempts: u32,

    /// Multiplier applied to the resend interval after each resend.
    pub resend_backoff: u32,

    /// Deadline for an outbound handshake.
    pub handshake_timeout_ms: u64,

    /// Interval between ClientHello retransmissions.
    pub handshake_resend_interval_ms: u64,

    /// Connections without inbound traffic for this long are closed.
    pub idle_timeout_ms: u64,

    /// Partial fragment assemblies idle for this long are discarded.
    pub fragment_timeout_ms: u64,

    /// Partial fragment assemblies kept per connection.
    pub max_pending_assemblies: usize,

    /// Period of the timeout sweep.
    pub sweep_interval_ms: u64,

    /// MTU assumed for destinations without a discovered value.
    pub default_mtu: u16,

    /// Lower bound of PMTU discovery.
    pub min_mtu: u16,

    /// Upper bound of PMTU discovery.
    pub max_mtu: u16,

    /// Send attempts for each PMTU probe.
    pub pmtu_probe_attempts: u32,

    /// Receive buffers preallocated in the packet pool.
    pub pool_buffers: usize,

    /// Maximum number of established connections.
    pub max_connections: usize,

    /// Answer inbound handshakes.
    pub accept_incoming: bool,

    /// Static keys allowed to connect. Empty accepts any authenticated peer.
    pub authorized_peers: Vec<PublicKeyBytes>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            resend_interval_ms: millis(DEFAULT_RESEND_INTERVAL),
            max_resend_attempts: DEFAULT_MAX_RESEND_ATTEMPTS,
            resend_backoff: DEFAULT_RESEND_BACKOFF,
            handshake_timeout_ms: millis(DEFAULT_HANDSHAKE_TIMEOUT),
            handshake_resend_interval_ms: millis(DEFAULT_HANDSHAKE_RESEND_INTERVAL),
            idle_timeout_ms: millis(DEFAULT_IDLE_TIMEOUT),
            fragment_timeout_ms: millis(DEFAULT_FRAGMENT_TIMEOUT),
            max_pending_assemblies: DEFAULT_MAX_PENDING_ASSEMBLIES,
            sweep_interval_ms: millis(DEFAULT_SWEEP_INTERVAL),
            default_mtu: DEFAULT_MTU,
            min_mtu: MIN_MTU,
            max_mtu: MAX_MTU,
            pmtu_probe_attempts: DEFAULT_PMTU_PROBE_ATTEMPTS,
            pool_buffers: DEFAULT_POOL_BUFFERS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            accept_incoming: true,
            authorized_peers: Vec::new(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl TransportConfig {
    /// Start a builder from the defaults.
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::new()
    }

    /// Resend interval.
    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }

    /// Handshake deadline.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// ClientHello retransmission interval.
    pub fn handshake_resend_interval(&self) -> Duration {
        Duration::from_millis(self.handshake_resend_interval_ms)
    }

    /// Idle connection timeout.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Fragment assembly timeout.
    pub fn fragment_timeout(&self) -> Duration {
        Duration::from_millis(self.fragment_timeout_ms)
    }

    /// Sweep period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Resend schedule for reliable sends.
    pub fn resend_policy(&self) -> ResendPolicy {
        ResendPolicy {
            interval: self.resend_interval(),
            max_attempts: self.max_resend_attempts,
            backoff: self.resend_backoff,
        }
    }

    /// Resend schedule for a single PMTU probe size.
    pub fn pmtu_probe_policy(&self) -> ResendPolicy {
        ResendPolicy {
            interval: self.resend_interval(),
            max_attempts: self.pmtu_probe_attempts,
            backoff: 1,
        }
    }

    /// Whether a peer with static key `key` may connect.
    pub fn is_authorized(&self, key: &PublicKeyBytes) -> bool {
        self.authorized_peers.is_empty() || self.authorized_peers.contains(key)
    }

    /// Reject inconsistent values.
    pub fn validate(&self) -> TransportResult<()> {
        fn check(ok: bool, reason: &str) -> TransportResult<()> {
            if ok {
                Ok(())
            } else {
                Err(TransportError::Config(reason.to_string()))
            }
        }

        check(self.resend_interval_ms > 0, "resend_interval_ms must be positive")?;
        check(self.max_resend_attempts > 0, "max_resend_attempts must be at least 1")?;
        check(self.resend_backoff > 0, "resend_backoff must be at least 1")?;
        check(self.handshake_timeout_ms > 0, "handshake_timeout_ms must be positive")?;
        check(
            self.handshake_resend_interval_ms > 0
                && self.handshake_resend_interval_ms <= self.handshake_timeout_ms,
            "handshake_resend_interval_ms must be positive and within handshake_timeout_ms",
        )?;
        check(self.idle_timeout_ms > 0, "idle_timeout_ms must be positive")?;
        check(self.fragment_timeout_ms > 0, "fragment_timeout_ms must be positive")?;
        check(self.max_pending_assemblies > 0, "max_pending_assemblies must be at least 1")?;
        check(self.sweep_interval_ms > 0, "sweep_interval_ms must be positive")?;
        check(self.min_mtu >= MIN_MTU, "min_mtu is below the protocol minimum")?;
        check(
            self.min_mtu <= self.default_mtu && self.default_mtu <= self.max_mtu,
            "MTU bounds must satisfy min_mtu <= default_mtu <= max_mtu",
        )?;
        check(
            usize::from(self.max_mtu) <= PACKET_BUFFER_SIZE,
            "max_mtu exceeds the packet buffer size",
        )?;
        check(self.pmtu_probe_attempts > 0, "pmtu_probe_attempts must be at least 1")?;
        check(self.pool_buffers > 0, "pool_buffers must be at least 1")?;
        check(self.max_connections > 0, "max_connections must be at least 1")?;
        Ok(())
    }
}

/// Builder for [`TransportConfig`].
#[derive(Debug, Clone, Default)]
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    /// Create a builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the resend interval.
    pub fn resend_interval(mut self, interval: Duration) -> Self {
        self.config.resend_interval_ms = millis(interval);
        self
    }

    /// Set the number of send attempts.
    pub fn max_resend_attempts(mut self, attempts: u32) -> Self {
        self.config.max_resend_attempts = attempts;
        self
    }

    /// Set the resend backoff multiplier.
    pub fn resend_backoff(mut self, backoff: u32) -> Self {
        self.config.resend_backoff = backoff;
        self
    }

    /// Set the handshake deadline.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout_ms = millis(timeout);
        self
    }

    /// Set the ClientHello retransmission interval.
    pub fn handshake_resend_interval(mut self, interval: Duration) -> Self {
        self.config.handshake_resend_interval_ms = millis(interval);
        self
    }

    /// Set the idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout_ms = millis(timeout);
        self
    }

    /// Set the fragment assembly timeout.
    pub fn fragment_timeout(mut self, timeout: Duration) -> Self {
        self.config.fragment_timeout_ms = millis(timeout);
        self
    }

    /// Set the sweep period.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval_ms = millis(interval);
        self
    }

    /// Set the MTU bounds and default.
    pub fn mtu(mut self, min: u16, default: u16, max: u16) -> Self {
        self.config.min_mtu = min;
        self.config.default_mtu = default;
        self.config.max_mtu = max;
        self
    }

    /// Set the maximum number of connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Enable or disable answering inbound handshakes.
    pub fn accept_incoming(mut self, accept: bool) -> Self {
        self.config.accept_incoming = accept;
        self
    }

    /// Allow a peer's static key. Once any key is added, others are refused.
    pub fn authorize_peer(mut self, key: PublicKeyBytes) -> Self {
        self.config.authorized_peers.push(key);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TransportConfig {
        self.config
    }
}
