//! Datagram plumbing below the record layer.
//!
//! - **Buffers**: [`PacketBufferPool`] and the [`RawPacket`] it backs
//! - **MTU**: [`MtuValue`] arithmetic and the per-destination [`MtuEstimator`]
//! - **Codec**: [`ControlMessage`] wire format
//! - **Records**: DTLS-style [`RecordHeader`]
//! - **Fragmentation**: [`split`] and [`FragmentAssembler`]
//! - **Sockets**: [`DatagramSocket`] over tokio UDP
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         TransportService                │
//! ├─────────────────────────────────────────┤
//! │   Record layer (crypto::SecureRecord)   │
//! ├─────────────────────────────────────────┤
//! │   codec, fragments, MTU, buffers        │  ← This module
//! ├─────────────────────────────────────────┤
//! │              UDP                        │
//! └─────────────────────────────────────────┘
//! ```

mod buffer;
mod codec;
mod fragment;
mod mtu;
mod record;
mod socket;

pub use buffer::*;
pub use codec::*;
pub use fragment::*;
pub use mtu::*;
pub use record::*;
pub use socket::*;
