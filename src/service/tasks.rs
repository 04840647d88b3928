//! Background tasks spawned by [`TransportService`](super::TransportService).
//!
//! ```text
//!   socket ──► receive_loop ──► dispatch ──┬──► strand (per connection)
//!                                          └──► filter_loop (handshakes)
//!   sweep_loop ── Tick ──► strands, filter_loop, pending ACK timeouts
//!   strands, filters, pending ──► writer_loop ──► socket
//! ```

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

use crate::connection::StrandTask;
use crate::core::{Endpoint, TransportError, DRAINED_QUEUE_LINGER};
use crate::handshake::{decode_handshake_record, FilterInput, HandshakeFilter, HandshakeFilterChain};
use crate::reliability::Completion;
use crate::transport::{ControlMessage, DatagramSocket, RawPacket};

use super::dispatch::{try_parse_message, ParseResult};
use super::shared::{ServiceHost, Shared};

/// Work for the writer task.
pub(crate) enum WriterCommand {
    /// Send datagrams in order, then resolve `completion`.
    Send {
        destination: Endpoint,
        datagrams: Vec<Bytes>,
        completion: Option<Completion<()>>,
    },
    /// Flush and exit.
    Stop(oneshot::Sender<()>),
}

impl fmt::Debug for WriterCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriterCommand::Send {
                destination,
                datagrams,
                ..
            } => f
                .debug_struct("Send")
                .field("destination", destination)
                .field("datagrams", datagrams)
                .finish_non_exhaustive(),
            WriterCommand::Stop(_) => f.write_str("Stop"),
        }
    }
}

/// Work for the filter task.
pub(crate) enum FilterCommand {
    /// Handshake record from an unknown endpoint.
    Packet(RawPacket),
    /// Already decoded unauthenticated control message.
    Control {
        source: Endpoint,
        message: ControlMessage,
    },
    /// Add a filter to the chain.
    Install(Box<dyn HandshakeFilter>),
    /// Periodic sweep.
    Tick(Instant),
    /// Cancel every filter and exit.
    Stop,
}

impl fmt::Debug for FilterCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterCommand::Packet(packet) => f.debug_tuple("Packet").field(packet).finish(),
            FilterCommand::Control { source, message } => f
                .debug_struct("Control")
                .field("source", source)
                .field("message", message)
                .finish(),
            FilterCommand::Install(filter) => f.debug_tuple("Install").field(&filter.name()).finish(),
            FilterCommand::Tick(now) => f.debug_tuple("Tick").field(now).finish(),
            FilterCommand::Stop => f.write_str("Stop"),
        }
    }
}

/// Owns the sending half of the socket. Datagrams leave in the order they
/// were queued.
pub(crate) async fn writer_loop(socket: DatagramSocket, mut commands: mpsc::UnboundedReceiver<WriterCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Send {
                destination,
                datagrams,
                completion,
            } => {
                let result = send_all(&socket, destination, &datagrams).await;
                if let Err(e) = &result {
                    warn!(%destination, error = %e, "send failed");
                }
                if let Some(completion) = completion {
                    completion.complete(result.map_err(TransportError::from));
                }
            }
            WriterCommand::Stop(ack) => {
                let _ = ack.send(());
                break;
            }
        }
    }
    debug!("writer stopped");
}

async fn send_all(socket: &DatagramSocket, destination: Endpoint, datagrams: &[Bytes]) -> io::Result<()> {
    for datagram in datagrams {
        socket.send_to(datagram, destination).await?;
        trace!(%destination, len = datagram.len(), "datagram sent");
    }
    Ok(())
}

/// Reads datagrams and routes each one.
pub(crate) async fn receive_loop(shared: Arc<Shared>, socket: DatagramSocket) {
    loop {
        let packet = match socket.recv().await {
            Ok(packet) => packet,
            // ICMP unreachable surfaces as a receive error on some platforms.
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                trace!(error = %e, "ignoring connection reset");
                continue;
            }
            Err(e) => {
                if !shared.is_shut_down() {
                    error!(error = %e, "receive failed, stopping receive loop");
                }
                break;
            }
        };

        match try_parse_message(&shared, packet) {
            ParseResult::TookOwnership | ParseResult::Completed => {}
            ParseResult::Failed(packet) => {
                trace!(source = %packet.source(), len = packet.len(), "datagram dropped");
            }
        }
    }
}

/// Owns the handshake filter chain.
pub(crate) async fn filter_loop(
    host: ServiceHost,
    mut commands: mpsc::UnboundedReceiver<FilterCommand>,
    mut chain: HandshakeFilterChain,
) {
    while let Some(command) = commands.recv().await {
        let now = Instant::now();
        match command {
            FilterCommand::Packet(packet) => {
                let source = packet.source();
                match decode_handshake_record(packet.data()) {
                    Ok(message) => {
                        chain.run_filters(&host, Some(FilterInput { source, message }), now);
                    }
                    Err(e) => trace!(%source, error = %e, "not a handshake record"),
                }
            }
            FilterCommand::Control { source, message } => {
                chain.run_filters(&host, Some(FilterInput { source, message }), now);
            }
            FilterCommand::Install(filter) => {
                chain.install(filter);
                chain.run_filters(&host, None, now);
            }
            FilterCommand::Tick(now) => {
                chain.run_filters(&host, None, now);
            }
            FilterCommand::Stop => break,
        }
    }
    chain.clear();
    debug!("filter task stopped");
}

/// Drives every timer: ACK resends, handshake deadlines, fragment expiry
/// and idle connections.
pub(crate) async fn sweep_loop(shared: Arc<Shared>) {
    let mut ticker = interval(shared.config.sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if shared.is_shut_down() {
            break;
        }
        let now = Instant::now();

        let timed_out = shared.pending.check_timeouts(now, &*shared);
        if timed_out > 0 {
            debug!(timed_out, "pending messages gave up");
        }
        shared.pending.evict_drained(now, DRAINED_QUEUE_LINGER, &shared.sequences, |endpoint| {
            shared.registry.contains(endpoint)
        });

        if shared.post_filters(FilterCommand::Tick(now)).is_err() {
            break;
        }
        for handle in shared.registry.snapshot() {
            let _ = handle.post(StrandTask::Tick(now));
        }
    }
}
