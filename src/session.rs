//! Per-connection session state.
//!
//! `Inbound` holds the part of a session every dispatcher shares: the framer
//! and the lifecycle state, plus sentinel handling. Dispatchers that own a
//! synchronous endpoint wrap it in a full [`Session`].

use crate::broadcast::Message;
use crate::endpoint::{Endpoint, ReadOutcome};
use crate::error::RelayError;
use crate::framer::LineFramer;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Message text that ends a session voluntarily.
pub const SENTINEL: &str = "quit";

/// Process-unique connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(raw: u64) -> Self {
        SessionId(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out monotonically increasing session ids. Ids are never reused.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> SessionId {
        SessionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered and eligible to send and receive.
    Connected,
    /// Sentinel seen or stream ended; no further reads.
    Closing,
    /// Unregistered and endpoint released.
    Closed,
}

/// Human-readable label shown in broadcast lines and logs.
pub fn label_for(id: SessionId, peer: Option<SocketAddr>) -> Arc<str> {
    match peer {
        Some(addr) => format!("client[{}]", addr.port()).into(),
        None => format!("client#{id}").into(),
    }
}

/// Messages framed from one read, and the error that cut framing short.
#[derive(Debug, Default)]
pub struct Batch {
    pub messages: Vec<Message>,
    /// Set when the session can no longer be read; relay `messages` first.
    pub error: Option<RelayError>,
}

/// Framing state and lifecycle shared by every dispatcher.
#[derive(Debug)]
pub struct Inbound {
    id: SessionId,
    label: Arc<str>,
    framer: LineFramer,
    state: SessionState,
}

impl Inbound {
    pub fn new(id: SessionId, label: Arc<str>, max_line: usize) -> Self {
        Self {
            id,
            label,
            framer: LineFramer::new(max_line),
            state: SessionState::Connected,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn label(&self) -> &Arc<str> {
        &self.label
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Feed a raw chunk and return the messages it completes, in order.
    ///
    /// If the sentinel is among them it is the last message returned, the
    /// session moves to `Closing`, and anything after it is discarded.
    /// A decode failure stops framing but keeps the messages completed before
    /// it; the caller relays those, then disconnects.
    pub fn absorb(&mut self, chunk: &[u8]) -> Batch {
        let mut batch = Batch::default();
        if self.state != SessionState::Connected {
            batch.error = Some(RelayError::closed(self.id));
            return batch;
        }

        self.framer.extend(chunk);
        for text in self.framer.messages() {
            let text = match text {
                Ok(text) => text,
                Err(e) => {
                    self.state = SessionState::Closing;
                    batch.error = Some(e);
                    break;
                }
            };
            let quit = text == SENTINEL;
            batch
                .messages
                .push(Message::new(self.id, Arc::clone(&self.label), text));
            if quit {
                self.state = SessionState::Closing;
                break;
            }
        }
        batch
    }

    /// Stream ended or failed; skip straight to closing.
    pub fn begin_close(&mut self) {
        if self.state == SessionState::Connected {
            self.state = SessionState::Closing;
        }
    }

    pub fn mark_closed(&mut self) {
        self.state = SessionState::Closed;
    }
}

/// A session that owns its synchronous endpoint.
#[derive(Debug)]
pub struct Session<E> {
    pub inbound: Inbound,
    pub endpoint: E,
}

impl<E: Endpoint> Session<E> {
    pub fn new(id: SessionId, endpoint: E, max_line: usize) -> Self {
        let label = label_for(id, endpoint.peer_addr().ok());
        Self {
            inbound: Inbound::new(id, label, max_line),
            endpoint,
        }
    }

    pub fn id(&self) -> SessionId {
        self.inbound.id()
    }

    pub fn label(&self) -> &Arc<str> {
        self.inbound.label()
    }

    /// Perform one read and frame whatever it produced.
    ///
    /// `Ok(None)` means the endpoint had nothing available. End-of-stream
    /// moves the session to `Closing` and yields an empty batch. Transport
    /// failures are returned as `Err`; framing failures travel in the batch.
    pub fn poll_messages(&mut self, scratch: &mut [u8]) -> Result<Option<Batch>, RelayError> {
        if self.inbound.state() == SessionState::Closed {
            return Err(RelayError::closed(self.id()));
        }
        match self.endpoint.read_chunk(scratch) {
            Ok(ReadOutcome::Data(n)) => Ok(Some(self.inbound.absorb(&scratch[..n]))),
            Ok(ReadOutcome::WouldBlock) => Ok(None),
            Ok(ReadOutcome::EndOfStream) => {
                self.inbound.begin_close();
                Ok(Some(Batch::default()))
            }
            Err(e) => {
                self.inbound.begin_close();
                Err(e)
            }
        }
    }

    /// Release the endpoint. Idempotent.
    pub fn close(&mut self) {
        if self.inbound.state() != SessionState::Closed {
            self.endpoint.close();
            self.inbound.mark_closed();
        }
    }
}
