//! Thread-per-connection dispatcher.
//!
//! Each accepted client gets a dedicated worker thread that blocks in
//! `read`. The registry sits behind one lock shared by every worker; a
//! broadcast holds it for the whole fan-out.
//!
//! Writes to peers are blocking. A peer whose receive window is full stalls
//! the broadcast currently writing to it (and, since that broadcast holds the
//! registry lock, other broadcasts and registrations), but never another
//! worker's reads. Registration happens on the new worker, so the accept
//! loop itself never waits on the lock.

use crate::broadcast::Message;
use crate::config::Config;
use crate::error::RelayError;
use crate::registry::{Peer, SharedRegistry};
use crate::runtime::{is_transient_accept_error, RelayStats};
use crate::session::{IdAllocator, Session, SessionId};
use bytes::Bytes;
use std::io::{self, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// Registry entry: the write side of a client socket.
struct StreamPeer {
    id: SessionId,
    stream: TcpStream,
}

impl Peer for StreamPeer {
    fn id(&self) -> SessionId {
        self.id
    }

    fn deliver(&mut self, line: &Bytes) -> io::Result<()> {
        self.stream.write_all(line)?;
        self.stream.flush()
    }

    fn close(&mut self) {
        // Wakes the owning worker out of its blocking read.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Accept connections forever, spawning one worker per client.
///
/// Returns only on a listener failure.
pub fn serve(listener: TcpListener, config: &Config, stats: Arc<RelayStats>) -> Result<(), RelayError> {
    let registry = Arc::new(SharedRegistry::new());
    let ids = IdAllocator::new();

    info!(
        addr = %listener.local_addr().map_err(RelayError::Listener)?,
        max_connections = config.max_connections,
        "Starting threaded dispatcher"
    );

    loop {
        let (stream, peer_addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(ref e) if is_transient_accept_error(e) => continue,
            Err(e) => {
                error!(error = %e, "Accept failed");
                return Err(RelayError::Listener(e));
            }
        };

        let writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "Failed to clone client socket");
                continue;
            }
        };

        let id = ids.next_id();
        let session = Session::new(id, stream, config.max_line_length);
        let peer = StreamPeer { id, stream: writer };
        let label = Arc::clone(session.label());

        let worker_registry = Arc::clone(&registry);
        let worker_stats = Arc::clone(&stats);
        let limits = WorkerLimits {
            max_connections: config.max_connections,
            buffer_size: config.read_buffer_size,
        };
        let spawned = thread::Builder::new()
            .name(format!("session-{id}"))
            .spawn(move || run_session(session, peer, &worker_registry, &worker_stats, limits));

        if let Err(e) = spawned {
            error!(session = %label, error = %e, "Failed to spawn session worker");
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WorkerLimits {
    max_connections: usize,
    buffer_size: usize,
}

/// Admit one client, run its CONNECTED loop, then tear it down.
fn run_session(
    mut session: Session<TcpStream>,
    peer: StreamPeer,
    registry: &SharedRegistry<StreamPeer>,
    stats: &RelayStats,
    limits: WorkerLimits,
) {
    stats.session_opened();
    if let Err((_, reason)) = registry.register_bounded(peer, limits.max_connections) {
        stats.session_closed();
        stats.connection_rejected();
        match reason {
            None => warn!(session = %session.label(), "Connection limit reached"),
            Some(e) => error!(session = %session.label(), error = %e, "Registration failed"),
        }
        session.close();
        return;
    }
    info!(session = %session.label(), online = stats.online(), "Client connected");

    let mut scratch = vec![0u8; limits.buffer_size];

    let result = loop {
        match session.poll_messages(&mut scratch) {
            Ok(Some(batch)) => {
                for message in &batch.messages {
                    relay(registry, stats, message);
                }
                if let Some(e) = batch.error {
                    break Err(e);
                }
                if !session.inbound.is_connected() {
                    break Ok(());
                }
            }
            Ok(None) => continue,
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = result {
        debug!(session = %session.label(), error = %e, "Session error");
    }

    // An eviction by another worker's broadcast may already have removed us.
    if registry.unregister(session.id()) {
        stats.session_closed();
    }
    session.close();
    info!(session = %session.label(), "Client disconnected");
}

fn relay(registry: &SharedRegistry<StreamPeer>, stats: &RelayStats, message: &Message) {
    let report = registry.broadcast(message);
    stats.record_broadcast(message, &report);
}
