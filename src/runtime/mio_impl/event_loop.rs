//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! ## Slow peers
//!
//! A broadcast never blocks the loop. Each peer owns an outbound buffer;
//! `deliver` appends the line and writes as much as the socket accepts.
//! Leftovers are flushed on WRITABLE readiness. A peer whose backlog would
//! exceed `max_backlog_bytes` counts as a failed write and is evicted.

use crate::broadcast::{self, Message};
use crate::config::Config;
use crate::error::RelayError;
use crate::registry::{Peer, Registry};
use crate::runtime::{is_transient_accept_error, RelayStats};
use crate::session::{IdAllocator, Session, SessionId};
use bytes::{Buf, Bytes, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Write};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// What a readiness token refers to, resolved once per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Listener,
    Peer(SessionId),
}

fn role(token: Token) -> Role {
    match token {
        LISTENER_TOKEN => Role::Listener,
        Token(raw) => Role::Peer(SessionId::new(raw as u64)),
    }
}

fn token(id: SessionId) -> Token {
    Token(id.as_u64() as usize)
}

/// One client owned by the loop.
struct MioPeer {
    session: Session<TcpStream>,
    outbound: BytesMut,
    max_backlog: usize,
    /// Whether the stream is currently registered for WRITABLE.
    write_interest: bool,
}

impl MioPeer {
    /// Write buffered output until it is gone or the socket would block.
    fn flush(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.session.endpoint.write(&self.outbound) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => self.outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn wanted_interest(&self) -> Interest {
        if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }
}

impl Peer for MioPeer {
    fn id(&self) -> SessionId {
        self.session.id()
    }

    fn deliver(&mut self, line: &Bytes) -> io::Result<()> {
        if self.outbound.len() + line.len() > self.max_backlog {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("outbound backlog over {} bytes", self.max_backlog),
            ));
        }
        self.outbound.extend_from_slice(line);
        self.flush()
    }

    fn close(&mut self) {
        self.session.close();
    }
}

/// Single-threaded readiness loop multiplexing the listener and every client.
pub struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    registry: Registry<MioPeer>,
    ids: IdAllocator,
    scratch: Vec<u8>,
    config: Config,
    stats: Arc<RelayStats>,
}

impl EventLoop {
    /// Take over an already-bound listener.
    pub fn new(
        listener: std::net::TcpListener,
        config: &Config,
        stats: Arc<RelayStats>,
    ) -> Result<Self, RelayError> {
        listener.set_nonblocking(true).map_err(RelayError::Listener)?;
        let mut listener = TcpListener::from_std(listener);
        let poll = Poll::new().map_err(RelayError::Listener)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(RelayError::Listener)?;

        Ok(Self {
            poll,
            listener,
            registry: Registry::new(),
            ids: IdAllocator::new(),
            scratch: vec![0u8; config.read_buffer_size],
            config: config.clone(),
            stats,
        })
    }

    /// Run until the listener or the poller fails.
    pub fn run(&mut self) -> Result<(), RelayError> {
        let mut events = Events::with_capacity(self.config.event_capacity);

        info!(
            addr = %self.listener.local_addr().map_err(RelayError::Listener)?,
            max_connections = self.config.max_connections,
            max_backlog_bytes = self.config.max_backlog_bytes,
            "Starting mio dispatcher"
        );

        loop {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RelayError::Listener(e)),
            }

            for event in events.iter() {
                match role(event.token()) {
                    Role::Listener => self.accept_connections()?,
                    Role::Peer(id) => {
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            self.handle_readable(id);
                        }
                        if event.is_writable() {
                            self.handle_writable(id);
                        }
                    }
                }
            }
        }
    }

    fn accept_connections(&mut self) -> Result<(), RelayError> {
        loop {
            let (mut stream, peer_addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if is_transient_accept_error(e) => continue,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    return Err(RelayError::Listener(e));
                }
            };

            if self.registry.len() >= self.config.max_connections {
                warn!(peer = %peer_addr, "Connection limit reached");
                self.stats.connection_rejected();
                continue;
            }

            let id = self.ids.next_id();
            if let Err(e) = self
                .poll
                .registry()
                .register(&mut stream, token(id), Interest::READABLE)
            {
                warn!(peer = %peer_addr, error = %e, "Failed to register connection");
                continue;
            }

            let peer = MioPeer {
                session: Session::new(id, stream, self.config.max_line_length),
                outbound: BytesMut::new(),
                max_backlog: self.config.max_backlog_bytes,
                write_interest: false,
            };
            let label = Arc::clone(peer.session.label());

            if let Err((peer, e)) = self.registry.register(peer) {
                error!(session = %label, error = %e, "Registration failed");
                self.release(peer);
                continue;
            }
            self.stats.session_opened();
            info!(session = %label, online = self.stats.online(), "Client connected");
        }
    }

    /// Drain every byte currently available, relaying complete lines as
    /// they are framed.
    fn handle_readable(&mut self, id: SessionId) {
        loop {
            let Some(peer) = self.registry.get_mut(id) else {
                return;
            };

            let batch = match peer.session.poll_messages(&mut self.scratch) {
                Ok(Some(batch)) => batch,
                Ok(None) => return,
                Err(e) => {
                    debug!(session = %peer.session.label(), error = %e, "Session error");
                    self.close_session(id);
                    return;
                }
            };
            if let Some(e) = &batch.error {
                debug!(session = %peer.session.label(), error = %e, "Session error");
            }
            // A framing error has already moved the session out of Connected.
            let connected = peer.session.inbound.is_connected();

            for message in &batch.messages {
                self.relay(message);
            }
            if !connected {
                self.close_session(id);
                return;
            }
        }
    }

    fn handle_writable(&mut self, id: SessionId) {
        let Some(peer) = self.registry.get_mut(id) else {
            return;
        };
        if let Err(e) = peer.flush() {
            debug!(session = %peer.session.label(), error = %e, "Write failed");
            self.close_session(id);
            return;
        }
        self.sync_interest(id);
    }

    fn relay(&mut self, message: &Message) {
        let (report, evicted) = broadcast::broadcast(&mut self.registry, message);
        self.stats.record_broadcast(message, &report);
        for peer in evicted {
            self.release(peer);
        }
        for id in report.delivered().collect::<Vec<_>>() {
            self.sync_interest(id);
        }
    }

    /// Register for WRITABLE exactly while a peer has buffered output.
    fn sync_interest(&mut self, id: SessionId) {
        let Some(peer) = self.registry.get_mut(id) else {
            return;
        };
        let wants_write = !peer.outbound.is_empty();
        if wants_write == peer.write_interest {
            return;
        }
        let interest = peer.wanted_interest();
        let result = self
            .poll
            .registry()
            .reregister(&mut peer.session.endpoint, token(id), interest);
        match result {
            Ok(()) => peer.write_interest = wants_write,
            Err(e) => {
                debug!(session = %peer.session.label(), error = %e, "Reregister failed");
                self.close_session(id);
            }
        }
    }

    /// Idempotent: only the first call for an id finds it registered.
    fn close_session(&mut self, id: SessionId) {
        if let Some(peer) = self.registry.unregister(id) {
            self.stats.session_closed();
            self.release(peer);
        }
    }

    fn release(&mut self, mut peer: MioPeer) {
        let _ = self.poll.registry().deregister(&mut peer.session.endpoint);
        peer.close();
        info!(session = %peer.session.label(), "Client disconnected");
    }
}
