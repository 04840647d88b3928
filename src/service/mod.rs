//! The transport service.
//!
//! - [`TransportConfig`]: externally supplied settings
//! - [`TransportService`]: socket, tasks and the public send/receive API
//! - [`ParseResult`]: ownership outcome of routing one inbound datagram

mod config;
mod dispatch;
#[allow(clippy::module_inception)]
mod service;
pub(crate) mod shared;
pub(crate) mod tasks;

pub use config::{TransportConfig, TransportConfigBuilder};
pub use dispatch::ParseResult;
pub use service::{Outbound, SendOptions, TransportService};
