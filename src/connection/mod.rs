//! Established connections.
//!
//! - [`ConnectionRegistry`]: endpoint → connection routing table
//! - [`ConnectionInfo`], [`CloseReason`]: what the application sees
//! - [`Inbound`]: messages delivered to the application
//!
//! Each connection's protocol state lives on its own strand task; the
//! registry only holds a handle for queueing work onto it.

mod info;
mod registry;
mod session;
pub(crate) mod strand;

pub use info::{CloseReason, ConnectionId, ConnectionInfo, Inbound};
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use session::HandshakeCache;

pub(crate) use session::Connection;
pub(crate) use strand::{run_strand, StrandTask};
