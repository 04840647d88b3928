//! Packet buffer pooling.
//!
//! Receive and send paths borrow fixed-size buffers from a
//! [`PacketBufferPool`] instead of allocating per packet. Every borrow is a
//! [`PooledBuffer`] that returns itself to the pool when dropped, so early
//! returns and error paths release buffers deterministically.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::core::{lock, Endpoint, PACKET_BUFFER_SIZE};

struct PoolShared {
    free: Mutex<Vec<Box<[u8]>>>,
    max_retained: usize,
    allocated: AtomicUsize,
}

impl PoolShared {
    fn allocate(&self) -> Box<[u8]> {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        vec![0u8; PACKET_BUFFER_SIZE].into_boxed_slice()
    }
}

/// Recycles fixed-size packet buffers.
///
/// Cloning the pool is cheap; all clones share one free list.
#[derive(Clone)]
pub struct PacketBufferPool {
    shared: Arc<PoolShared>,
}

impl PacketBufferPool {
    /// Create a pool with `preallocated` buffers ready to use.
    ///
    /// The pool retains at most twice that many free buffers; extra returns
    /// are released to the allocator.
    pub fn new(preallocated: usize) -> Self {
        let shared = Arc::new(PoolShared {
            free: Mutex::new(Vec::with_capacity(preallocated * 2)),
            max_retained: (preallocated * 2).max(1),
            allocated: AtomicUsize::new(0),
        });

        {
            let mut free = lock(&shared.free);
            for _ in 0..preallocated {
                let buffer = shared.allocate();
                free.push(buffer);
            }
        }

        Self { shared }
    }

    /// Borrow a buffer, allocating a fresh one if the free list is empty.
    pub fn acquire(&self) -> PooledBuffer {
        let recycled = lock(&self.shared.free).pop();
        let data = recycled.unwrap_or_else(|| self.shared.allocate());

        PooledBuffer {
            data: Some(data),
            pool: Arc::downgrade(&self.shared),
        }
    }

    /// Number of buffers currently on the free list.
    pub fn available(&self) -> usize {
        lock(&self.shared.free).len()
    }

    /// Total number of buffers this pool has ever allocated.
    pub fn allocated(&self) -> usize {
        self.shared.allocated.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for PacketBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBufferPool")
            .field("available", &self.available())
            .field("allocated", &self.allocated())
            .finish()
    }
}

/// A buffer on loan from a [`PacketBufferPool`].
pub struct PooledBuffer {
    data: Option<Box<[u8]>>,
    pool: Weak<PoolShared>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let (Some(data), Some(pool)) = (self.data.take(), self.pool.upgrade()) else {
            return;
        };

        let mut free = lock(&pool.free);
        if free.len() < pool.max_retained {
            free.push(data);
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer").field("len", &self.len()).finish()
    }
}

/// A datagram held in a pooled buffer.
///
/// Dropping the packet returns its buffer to the pool.
#[derive(Debug)]
pub struct RawPacket {
    buffer: PooledBuffer,
    len: usize,
    source: Endpoint,
    destination: Endpoint,
}

impl RawPacket {
    /// Wrap `len` filled bytes of `buffer`.
    pub fn new(buffer: PooledBuffer, len: usize, source: Endpoint, destination: Endpoint) -> Self {
        let len = len.min(buffer.len());
        Self {
            buffer,
            len,
            source,
            destination,
        }
    }

    /// Copy `data` into a buffer from `pool`. Data beyond the buffer size is
    /// truncated.
    pub fn from_slice(pool: &PacketBufferPool, data: &[u8], source: Endpoint, destination: Endpoint) -> Self {
        let mut buffer = pool.acquire();
        let len = data.len().min(buffer.len());
        buffer[..len].copy_from_slice(&data[..len]);
        Self::new(buffer, len, source, destination)
    }

    /// The filled portion of the buffer.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// Number of filled bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the packet carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sender of the packet.
    pub fn source(&self) -> Endpoint {
        self.source
    }

    /// Local address the packet arrived on (or is leaving from).
    pub fn destination(&self) -> Endpoint {
        self.destination
    }
}
