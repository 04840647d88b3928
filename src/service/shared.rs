//! State shared by the service tasks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::connection::{
    run_strand, CloseReason, Connection, ConnectionHandle, ConnectionId, ConnectionInfo,
    ConnectionRegistry, Inbound, StrandTask,
};
use crate::core::{
    read, write, AckClassification, Endpoint, PacketSink, TransportError, TransportResult,
};
use crate::crypto::StaticKeypair;
use crate::handshake::{EstablishedSession, FilterHost};
use crate::reliability::{
    completion, Completion, CompletionToken, PendingAckStore, ResendPolicy, SequenceAllocator,
};
use crate::transport::{ControlBody, ControlMessage, FragmentAssembler, MtuEstimator, MtuValue};

use super::config::TransportConfig;
use super::tasks::{FilterCommand, WriterCommand};

type EstablishedHook = Arc<dyn Fn(&ConnectionInfo) + Send + Sync>;
type ClosedHook = Arc<dyn Fn(&ConnectionInfo, CloseReason) + Send + Sync>;

/// Connection lifecycle callbacks.
#[derive(Default)]
pub(crate) struct Hooks {
    established: RwLock<Vec<EstablishedHook>>,
    closed: RwLock<Vec<ClosedHook>>,
}

impl Hooks {
    pub(crate) fn on_established(&self, hook: EstablishedHook) {
        write(&self.established).push(hook);
    }

    pub(crate) fn on_closed(&self, hook: ClosedHook) {
        write(&self.closed).push(hook);
    }

    // Hooks are cloned out so one may register another without deadlocking.
    pub(crate) fn connection_established(&self, info: &ConnectionInfo) {
        let hooks = read(&self.established).clone();
        for hook in hooks {
            hook(info);
        }
    }

    pub(crate) fn connection_closed(&self, info: &ConnectionInfo, reason: CloseReason) {
        let hooks = read(&self.closed).clone();
        for hook in hooks {
            hook(info, reason);
        }
    }
}

/// Everything the receive, writer, filter, sweep and strand tasks share.
pub(crate) struct Shared {
    pub(crate) config: TransportConfig,
    pub(crate) keypair: StaticKeypair,
    pub(crate) local_addr: Endpoint,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) pending: PendingAckStore,
    pub(crate) mtu: MtuEstimator,
    pub(crate) sequences: SequenceAllocator,
    pub(crate) hooks: Hooks,
    writer: mpsc::UnboundedSender<WriterCommand>,
    filters: mpsc::UnboundedSender<FilterCommand>,
    inbound: mpsc::UnboundedSender<Inbound>,
    next_connection_id: AtomicU64,
    shut_down: AtomicBool,
}

impl Shared {
    pub(crate) fn new(
        config: TransportConfig,
        keypair: StaticKeypair,
        local_addr: Endpoint,
        writer: mpsc::UnboundedSender<WriterCommand>,
        filters: mpsc::UnboundedSender<FilterCommand>,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        let mtu = MtuEstimator::new(MtuValue::new(config.default_mtu));
        Self {
            config,
            keypair,
            local_addr,
            registry: ConnectionRegistry::new(),
            pending: PendingAckStore::new(),
            mtu,
            sequences: SequenceAllocator::new(),
            hooks: Hooks::default(),
            writer,
            filters,
            inbound,
            next_connection_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Returns whether shutdown had already begun.
    pub(crate) fn begin_shutdown(&self) -> bool {
        self.shut_down.swap(true, Ordering::AcqRel)
    }

    /// Queue datagrams for the writer task.
    pub(crate) fn send_datagrams(
        &self,
        destination: Endpoint,
        datagrams: Vec<Bytes>,
        completion: Option<Completion<()>>,
    ) {
        let command = WriterCommand::Send {
            destination,
            datagrams,
            completion,
        };
        if self.writer.send(command).is_err() {
            trace!(%destination, "writer stopped, datagrams dropped");
        }
    }

    /// Ask the writer to exit once everything queued before is sent.
    pub(crate) fn stop_writer(&self) -> oneshot::Receiver<()> {
        let (ack, flushed) = oneshot::channel();
        if self.writer.send(WriterCommand::Stop(ack)).is_err() {
            trace!("writer already stopped");
        }
        flushed
    }

    /// Hand a message to the application.
    pub(crate) fn deliver(&self, inbound: Inbound) {
        if self.inbound.send(inbound).is_err() {
            trace!("receiver dropped, inbound message discarded");
        }
    }

    /// Queue work for the handshake filter task. Gives the command back if
    /// the task has stopped.
    pub(crate) fn post_filters(&self, command: FilterCommand) -> Result<(), FilterCommand> {
        self.filters.send(command).map_err(|rejected| rejected.0)
    }

    pub(crate) fn forward_handshake(&self, source: Endpoint, message: ControlMessage) {
        if self.post_filters(FilterCommand::Control { source, message }).is_err() {
            trace!(%source, "filter task stopped, handshake dropped");
        }
    }

    /// Send an ack-required control message outside any connection.
    pub(crate) fn send_reliable_insecure(
        &self,
        destination: Endpoint,
        body: ControlBody,
        policy: ResendPolicy,
    ) -> CompletionToken<()> {
        let (done, token) = completion();
        if let Err(e) = self.pending.register_next(
            destination,
            AckClassification::Insecure,
            &self.sequences,
            |sequence| vec![ControlMessage::new(sequence, true, body).encode()],
            done,
            policy,
            Instant::now(),
            self,
        ) {
            debug!(%destination, error = %e, "probe not registered");
        }
        token
    }

    /// Register a completed handshake as a connection and start its strand.
    ///
    /// An existing connection for the same endpoint is torn down first with
    /// [`CloseReason::Replaced`].
    pub(crate) fn establish(self: &Arc<Self>, session: EstablishedSession) -> TransportResult<ConnectionInfo> {
        if self.is_shut_down() {
            return Err(TransportError::Shutdown);
        }

        let endpoint = session.endpoint;
        if let Some(old) = self.registry.remove(endpoint) {
            let cancelled = self.pending.cancel_destination(endpoint, &self.sequences);
            info!(%endpoint, id = %old.id(), cancelled, "connection replaced");
            let _ = old.post(StrandTask::Close {
                reason: CloseReason::Replaced,
                notify_peer: false,
                done: None,
            });
        }

        let now = Instant::now();
        let info = ConnectionInfo {
            id: ConnectionId::new(self.next_connection_id.fetch_add(1, Ordering::Relaxed)),
            endpoint,
            remote_public_key: session.remote_public_key,
            role: session.role,
            established_at: now,
            mtu: self.mtu.get(endpoint),
        };
        let connection = Connection::new(
            info.clone(),
            session.record,
            FragmentAssembler::new(self.config.fragment_timeout(), self.config.max_pending_assemblies),
            session.handshake_cache,
            now,
        );

        let (tasks, rx) = mpsc::unbounded_channel();
        self.registry.insert(Arc::new(ConnectionHandle::new(info.clone(), tasks)));
        tokio::spawn(run_strand(self.clone(), connection, rx));

        info!(%endpoint, id = %info.id, role = ?info.role, "connection established");
        self.hooks.connection_established(&info);
        Ok(info)
    }

    /// Tear down the connection to `endpoint`: registry removal, pending
    /// ACK cancellation, then the strand stops and runs the close hooks.
    ///
    /// The token resolves once the hooks ran.
    pub(crate) fn close_connection(
        &self,
        endpoint: Endpoint,
        reason: CloseReason,
        notify_peer: bool,
    ) -> CompletionToken<()> {
        let Some(handle) = self.registry.remove(endpoint) else {
            return CompletionToken::ready(Err(TransportError::NotConnected(endpoint)));
        };
        let cancelled = self.pending.cancel_destination(endpoint, &self.sequences);
        self.mtu.forget(endpoint);
        debug!(%endpoint, id = %handle.id(), cancelled, %reason, "closing connection");

        let (done, token) = completion();
        let close = StrandTask::Close {
            reason,
            notify_peer,
            done: Some(done),
        };
        if let Err(StrandTask::Close { done: Some(done), .. }) = handle.post(close) {
            done.complete(Ok(()));
        }
        token
    }

    /// Unregister a connection whose strand is stopping on its own.
    pub(crate) fn detach(&self, endpoint: Endpoint, id: ConnectionId) {
        if self.registry.remove_if(endpoint, id).is_some() {
            let cancelled = self.pending.cancel_destination(endpoint, &self.sequences);
            self.mtu.forget(endpoint);
            debug!(%endpoint, %id, cancelled, "connection detached");
        }
    }
}

impl PacketSink for Shared {
    fn transmit(&self, destination: Endpoint, classification: AckClassification, frames: Vec<Bytes>) {
        match classification {
            AckClassification::Insecure => self.send_datagrams(destination, frames, None),
            AckClassification::Secure => match self.registry.get(destination) {
                Some(handle) => {
                    let seal = StrandTask::Seal {
                        frames,
                        completion: None,
                    };
                    if handle.post(seal).is_err() {
                        trace!(%destination, "strand stopped, frames dropped");
                    }
                }
                None => trace!(%destination, "no connection, secure frames dropped"),
            },
        }
    }
}

/// [`FilterHost`] backed by the service.
pub(crate) struct ServiceHost(pub(crate) Arc<Shared>);

impl FilterHost for ServiceHost {
    fn config(&self) -> &TransportConfig {
        &self.0.config
    }

    fn local_keypair(&self) -> &StaticKeypair {
        &self.0.keypair
    }

    fn send_datagram(&self, destination: Endpoint, datagram: Bytes) {
        self.0.send_datagrams(destination, vec![datagram], None);
    }

    fn send_reliable(
        &self,
        destination: Endpoint,
        body: ControlBody,
        policy: ResendPolicy,
    ) -> CompletionToken<()> {
        self.0.send_reliable_insecure(destination, body, policy)
    }

    fn establish(&self, session: EstablishedSession) -> TransportResult<ConnectionInfo> {
        self.0.establish(session)
    }

    fn record_mtu(&self, destination: Endpoint, mtu: MtuValue) {
        self.0.mtu.record(destination, mtu);
        if let Some(handle) = self.0.registry.get(destination) {
            handle.set_mtu(mtu);
        }
    }

    fn is_connected(&self, endpoint: Endpoint) -> bool {
        self.0.registry.contains(endpoint)
    }

    fn connection_count(&self) -> usize {
        self.0.registry.len()
    }
}
