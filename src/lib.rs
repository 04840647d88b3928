//! # Netcode Transport
//!
//! A reliable, secured datagram transport for real-time applications.
//!
//! Over a single UDP socket it provides:
//!
//! - **Security**: Noise_IK handshakes and DTLS-style records sealed with
//!   XChaCha20-Poly1305, with replay protection
//! - **Reliability**: per-message acknowledgement and resend with FIFO
//!   acknowledgement semantics
//! - **Fragmentation**: application messages up to 256 MTU-sized fragments,
//!   reassembled in any arrival order
//! - **Path probing**: PMTU discovery and NAT punch-through before a
//!   connection exists
//!
//! ## Modules
//!
//! - [`core`]: constants, error types and the [`PacketSink`](core::PacketSink) seam
//! - [`transport`]: buffers, MTU arithmetic, message codec, fragmentation, sockets
//! - [`crypto`]: keys, Noise handshake, record layer
//! - [`reliability`]: completion tokens, sequences, pending acknowledgements
//! - [`connection`]: connection state, registry and lifecycle
//! - [`handshake`]: the filter chain for unauthenticated traffic
//! - [`service`]: [`TransportService`], the public entry point
//!
//! ## Example Usage
//!
//! ```no_run
//! use netcode_transport::prelude::*;
//!
//! # async fn run() -> TransportResult<()> {
//! let server = TransportService::bind(
//!     TransportConfig::builder().bind_addr("127.0.0.1:0".parse().unwrap()).build(),
//!     StaticKeypair::generate()?,
//! )
//! .await?;
//!
//! let client = TransportService::bind(
//!     TransportConfig::builder()
//!         .bind_addr("127.0.0.1:0".parse().unwrap())
//!         .accept_incoming(false)
//!         .build(),
//!     StaticKeypair::generate()?,
//! )
//! .await?;
//!
//! let info = client.connect(server.local_addr(), *server.public_key()).await?;
//! client
//!     .send(
//!         Outbound::Application(vec![7u8; 10_000].into()),
//!         info.endpoint,
//!         SendOptions::reliable(),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod connection;
pub mod core;
pub mod crypto;
pub mod handshake;
pub mod reliability;
pub mod service;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::connection::{CloseReason, ConnectionId, ConnectionInfo, Inbound};
    pub use crate::core::{Endpoint, TransportError, TransportResult};
    pub use crate::crypto::{PublicKeyBytes, StaticKeypair};
    pub use crate::reliability::CompletionToken;
    pub use crate::service::{Outbound, SendOptions, TransportConfig, TransportService};
    pub use crate::transport::{ControlBody, ControlMessage, MtuValue};
}

// Re-export commonly used items at crate root
pub use core::{CryptoError, TransportError, TransportResult};
pub use service::{Outbound, SendOptions, TransportConfig, TransportConfigBuilder, TransportService};
