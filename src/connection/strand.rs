//! Per-connection serial task.
//!
//! Everything touching a [`Connection`] runs here, one task at a time, so
//! two packets for the same peer are never processed concurrently.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::core::AckClassification;
use crate::reliability::Completion;
use crate::service::shared::Shared;
use crate::transport::RawPacket;

use super::info::CloseReason;
use super::session::{Connection, ConnectionEvent};

/// Work queued on a connection's strand.
#[derive(Debug)]
pub(crate) enum StrandTask {
    /// Inbound datagram from the peer.
    Inbound(RawPacket),
    /// Seal serialized messages and send them, one record each.
    Seal {
        frames: Vec<Bytes>,
        completion: Option<Completion<()>>,
    },
    /// Periodic sweep.
    Tick(Instant),
    /// Stop the strand. The caller has already removed the connection from
    /// the registry and cancelled its pending ACKs.
    Close {
        reason: CloseReason,
        notify_peer: bool,
        done: Option<Completion<()>>,
    },
}

enum Flow {
    Continue,
    Stop(CloseReason),
}

/// Run a connection until it is closed.
pub(crate) async fn run_strand(
    shared: Arc<Shared>,
    mut connection: Connection,
    mut tasks: mpsc::UnboundedReceiver<StrandTask>,
) {
    let mut waiters = Vec::new();

    let reason = loop {
        let Some(task) = tasks.recv().await else {
            break CloseReason::Shutdown;
        };
        if let Flow::Stop(reason) = handle_task(&shared, &mut connection, task, &mut waiters) {
            break reason;
        }
    };

    tasks.close();
    while let Ok(task) = tasks.try_recv() {
        if let StrandTask::Close { done: Some(done), .. } = task {
            waiters.push(done);
        }
    }

    connection.close();
    let info = connection.info();
    info!(endpoint = %info.endpoint, id = %info.id, %reason, "connection closed");
    shared.hooks.connection_closed(info, reason);

    for done in waiters {
        done.complete(Ok(()));
    }
}

fn handle_task(
    shared: &Shared,
    connection: &mut Connection,
    task: StrandTask,
    waiters: &mut Vec<Completion<()>>,
) -> Flow {
    let endpoint = connection.endpoint();

    match task {
        StrandTask::Inbound(packet) => receive(shared, connection, &packet),
        StrandTask::Seal { frames, completion } => {
            match connection.seal_frames(&frames) {
                Ok(datagrams) => shared.send_datagrams(endpoint, datagrams, completion),
                Err(e) => {
                    warn!(%endpoint, error = %e, "failed to seal outbound records");
                    if let Some(completion) = completion {
                        completion.complete(Err(e));
                    }
                }
            }
            Flow::Continue
        }
        StrandTask::Tick(now) => {
            let expired = connection.expire_fragments(now);
            if expired > 0 {
                debug!(%endpoint, expired, "stale fragment assemblies dropped");
            }
            if connection.is_idle(now, shared.config.idle_timeout()) {
                shared.detach(endpoint, connection.info().id);
                return Flow::Stop(CloseReason::IdleTimeout);
            }
            Flow::Continue
        }
        StrandTask::Close {
            reason,
            notify_peer,
            done,
        } => {
            if notify_peer {
                match connection.seal_close_notify() {
                    Ok(alert) => shared.send_datagrams(endpoint, vec![alert], None),
                    Err(e) => debug!(%endpoint, error = %e, "close_notify not sent"),
                }
            }
            waiters.extend(done);
            Flow::Stop(reason)
        }
    }
}

fn receive(shared: &Shared, connection: &mut Connection, packet: &RawPacket) -> Flow {
    let endpoint = connection.endpoint();

    let received = match connection.receive(packet.data(), Instant::now()) {
        Ok(received) => received,
        Err(e) if e.is_silent_drop() => {
            trace!(%endpoint, error = %e, "record dropped");
            return Flow::Continue;
        }
        Err(e) if e.is_connection_local() => {
            debug!(%endpoint, error = %e, "record rejected");
            return Flow::Continue;
        }
        Err(e) => {
            warn!(%endpoint, error = %e, "record failed");
            return Flow::Continue;
        }
    };

    if let Some(reply) = received.reply {
        shared.send_datagrams(endpoint, vec![reply], None);
    }

    match received.event {
        None => {}
        Some(ConnectionEvent::Acknowledged(sequence)) => {
            match shared.pending.acknowledge(endpoint, AckClassification::Secure, sequence) {
                Ok(outcome) => trace!(%endpoint, sequence, ?outcome, "ack applied"),
                Err(e) if e.is_connection_local() => debug!(%endpoint, sequence, error = %e, "ack rejected"),
                Err(e) => warn!(%endpoint, sequence, error = %e, "ack failed"),
            }
        }
        Some(ConnectionEvent::Delivered(inbound)) => shared.deliver(inbound),
        Some(ConnectionEvent::Rehandshake(message)) => {
            debug!(%endpoint, "new ClientHello on established connection");
            shared.forward_handshake(endpoint, message);
        }
        Some(ConnectionEvent::PeerClosed) => {
            shared.detach(endpoint, connection.info().id);
            return Flow::Stop(CloseReason::PeerClosed);
        }
    }
    Flow::Continue
}
