//! Async UDP socket wrapper.
//!
//! Receives straight into pooled buffers so the receive loop never
//! allocates per datagram.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use super::buffer::{PacketBufferPool, RawPacket};

/// Number of buffers preallocated by [`DatagramSocketBuilder`] by default.
pub const DEFAULT_POOL_BUFFERS: usize = 64;

/// UDP socket paired with a [`PacketBufferPool`].
///
/// Cloning shares the socket and the pool, so one clone can receive while
/// others send.
#[derive(Debug, Clone)]
pub struct DatagramSocket {
    socket: Arc<UdpSocket>,
    pool: PacketBufferPool,
    local_addr: SocketAddr,
}

impl DatagramSocket {
    /// Bind a socket with the default pool size.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        DatagramSocketBuilder::new().bind(addr).await
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The buffer pool received packets are drawn from.
    pub fn pool(&self) -> &PacketBufferPool {
        &self.pool
    }

    /// Send one datagram.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(data, addr).await
    }

    /// Receive one datagram into a pooled buffer.
    ///
    /// Datagrams longer than the buffer are truncated by the OS and will
    /// fail to parse downstream.
    pub async fn recv(&self) -> io::Result<RawPacket> {
        let mut buffer = self.pool.acquire();
        let (len, source) = self.socket.recv_from(&mut buffer).await?;
        Ok(RawPacket::new(buffer, len, source, self.local_addr))
    }

    /// Receive without waiting. Returns `Ok(None)` if nothing is queued.
    pub fn try_recv(&self) -> io::Result<Option<RawPacket>> {
        let mut buffer = self.pool.acquire();
        match self.socket.try_recv_from(&mut buffer) {
            Ok((len, source)) => Ok(Some(RawPacket::new(buffer, len, source, self.local_addr))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Builder for [`DatagramSocket`].
#[derive(Debug, Clone)]
pub struct DatagramSocketBuilder {
    pool_buffers: usize,
    pool: Option<PacketBufferPool>,
}

impl Default for DatagramSocketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DatagramSocketBuilder {
    /// Create a builder with default options.
    pub fn new() -> Self {
        Self {
            pool_buffers: DEFAULT_POOL_BUFFERS,
            pool: None,
        }
    }

    /// Number of buffers to preallocate.
    pub fn pool_buffers(mut self, count: usize) -> Self {
        self.pool_buffers = count;
        self
    }

    /// Share an existing pool instead of creating one.
    pub fn pool(mut self, pool: PacketBufferPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Bind to `addr`.
    pub async fn bind(self, addr: SocketAddr) -> io::Result<DatagramSocket> {
        let socket = UdpSocket::bind(addr).await?;
        self.from_socket(socket)
    }

    /// Wrap an already bound socket.
    pub fn from_socket(self, socket: UdpSocket) -> io::Result<DatagramSocket> {
        let local_addr = socket.local_addr()?;
        let pool = self
            .pool
            .unwrap_or_else(|| PacketBufferPool::new(self.pool_buffers));
        Ok(DatagramSocket {
            socket: Arc::new(socket),
            pool,
            local_addr,
        })
    }
}
