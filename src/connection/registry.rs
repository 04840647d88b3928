//! Endpoint → connection map.
//!
//! Every inbound authenticated datagram is routed through
//! [`ConnectionRegistry::get`]; the handshake completion path inserts and
//! the close paths remove. At most one connection exists per endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::core::{read, write, Endpoint};

use crate::transport::MtuValue;

use super::info::{ConnectionId, ConnectionInfo};
use super::strand::StrandTask;

/// Shared handle to a connection's strand.
#[derive(Debug)]
pub struct ConnectionHandle {
    info: ConnectionInfo,
    mtu: AtomicU16,
    tasks: mpsc::UnboundedSender<StrandTask>,
}

impl ConnectionHandle {
    pub(crate) fn new(info: ConnectionInfo, tasks: mpsc::UnboundedSender<StrandTask>) -> Self {
        let mtu = AtomicU16::new(info.mtu.get());
        Self { info, mtu, tasks }
    }

    /// Connection details as of the handshake.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Connection details with the current MTU.
    pub fn snapshot(&self) -> ConnectionInfo {
        ConnectionInfo {
            mtu: self.mtu(),
            ..self.info.clone()
        }
    }

    /// Current path MTU towards the peer.
    pub fn mtu(&self) -> MtuValue {
        MtuValue::new(self.mtu.load(Ordering::Relaxed))
    }

    pub(crate) fn set_mtu(&self, mtu: MtuValue) {
        self.mtu.store(mtu.get(), Ordering::Relaxed);
    }

    /// Connection ID.
    pub fn id(&self) -> ConnectionId {
        self.info.id
    }

    /// Queue work on the connection's strand. Gives the task back if the
    /// strand has stopped.
    pub(crate) fn post(&self, task: StrandTask) -> Result<(), StrandTask> {
        self.tasks.send(task).map_err(|rejected| rejected.0)
    }

    /// Whether the strand has stopped.
    pub fn is_closed(&self) -> bool {
        self.tasks.is_closed()
    }
}

/// Registry of established connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Endpoint, Arc<ConnectionHandle>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the connection for `endpoint`.
    pub fn get(&self, endpoint: Endpoint) -> Option<Arc<ConnectionHandle>> {
        read(&self.connections).get(&endpoint).cloned()
    }

    /// Whether `endpoint` has a connection.
    pub fn contains(&self, endpoint: Endpoint) -> bool {
        read(&self.connections).contains_key(&endpoint)
    }

    /// Insert a connection, returning the one it displaced.
    pub fn insert(&self, handle: Arc<ConnectionHandle>) -> Option<Arc<ConnectionHandle>> {
        let endpoint = handle.info().endpoint;
        write(&self.connections).insert(endpoint, handle)
    }

    /// Remove the connection for `endpoint`.
    pub fn remove(&self, endpoint: Endpoint) -> Option<Arc<ConnectionHandle>> {
        write(&self.connections).remove(&endpoint)
    }

    /// Remove the connection for `endpoint` only if it is still `id`.
    pub fn remove_if(&self, endpoint: Endpoint, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let mut connections = write(&self.connections);
        match connections.get(&endpoint) {
            Some(handle) if handle.id() == id => connections.remove(&endpoint),
            _ => None,
        }
    }

    /// Remove every connection.
    pub fn drain(&self) -> Vec<Arc<ConnectionHandle>> {
        write(&self.connections).drain().map(|(_, handle)| handle).collect()
    }

    /// All current connections.
    pub fn snapshot(&self) -> Vec<Arc<ConnectionHandle>> {
        read(&self.connections).values().cloned().collect()
    }

    /// Number of connections.
    pub fn len(&self) -> usize {
        read(&self.connections).len()
    }

    /// Whether there are no connections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::crypto::Role;

    fn handle(endpoint: &str, id: u64) -> (Arc<ConnectionHandle>, mpsc::UnboundedReceiver<StrandTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let info = ConnectionInfo {
            id: ConnectionId::new(id),
            endpoint: endpoint.parse().unwrap(),
            remote_public_key: [id as u8; 32],
            role: Role::Responder,
            established_at: Instant::now(),
            mtu: MtuValue::new(1280),
        };
        (Arc::new(ConnectionHandle::new(info, tx)), rx)
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = handle("127.0.0.1:5000", 1);
        let endpoint = a.info().endpoint;

        assert!(registry.get(endpoint).is_none());
        assert!(registry.insert(a).is_none());
        assert!(registry.contains(endpoint));
        assert_eq!(registry.get(endpoint).unwrap().id(), ConnectionId::new(1));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(endpoint).is_some());
        assert!(registry.is_empty());
        assert!(registry.remove(endpoint).is_none());
    }

    #[test]
    fn test_one_connection_per_endpoint() {
        let registry = ConnectionRegistry::new();
        let (old, _rx1) = handle("127.0.0.1:5000", 1);
        let (new, _rx2) = handle("127.0.0.1:5000", 2);

        registry.insert(old);
        let displaced = registry.insert(new).unwrap();
        assert_eq!(displaced.id(), ConnectionId::new(1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_if_ignores_replacement() {
        let registry = ConnectionRegistry::new();
        let (new, _rx) = handle("127.0.0.1:5000", 2);
        let endpoint = new.info().endpoint;
        registry.insert(new);

        assert!(registry.remove_if(endpoint, ConnectionId::new(1)).is_none());
        assert!(registry.contains(endpoint));
        assert!(registry.remove_if(endpoint, ConnectionId::new(2)).is_some());
    }

    #[test]
    fn test_snapshot_carries_recorded_mtu() {
        let (a, _rx) = handle("127.0.0.1:5000", 1);
        assert_eq!(a.snapshot().mtu, MtuValue::new(1280));

        a.set_mtu(MtuValue::new(1500));
        assert_eq!(a.mtu(), MtuValue::new(1500));
        assert_eq!(a.snapshot().mtu, MtuValue::new(1500));
        assert_eq!(a.info().mtu, MtuValue::new(1280));
        assert_eq!(a.snapshot().id, a.id());
    }

    #[test]
    fn test_post_after_strand_stopped() {
        let (a, rx) = handle("127.0.0.1:5000", 1);
        drop(rx);
        assert!(a.is_closed());
        assert!(a.post(StrandTask::Tick(Instant::now())).is_err());
    }

    #[test]
    fn test_concurrent_lookup() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut receivers = Vec::new();
        for i in 0..8u64 {
            let (h, rx) = handle(&format!("127.0.0.1:{}", 6000 + i), i);
            registry.insert(h);
            receivers.push(rx);
        }

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..8u64 {
                        let endpoint = format!("127.0.0.1:{}", 6000 + i).parse().unwrap();
                        assert!(registry.get(endpoint).is_some());
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(registry.drain().len(), 8);
        assert!(registry.is_empty());
    }
}
