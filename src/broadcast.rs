//! Broadcast engine.
//!
//! Writes one sender's message to every other registered peer. A failed
//! write to one peer never stops delivery to the rest; the failing peer is
//! unregistered during the same pass and handed back to the caller to close.

use crate::registry::{Peer, Registry};
use crate::session::SessionId;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::sync::Arc;

/// One complete line of text from one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    sender: SessionId,
    label: Arc<str>,
    text: String,
}

impl Message {
    pub fn new(sender: SessionId, label: Arc<str>, text: String) -> Self {
        Self {
            sender,
            label,
            text,
        }
    }

    pub fn sender(&self) -> SessionId {
        self.sender
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Wire form: `<label>: <text>\n`.
    pub fn to_line(&self) -> Bytes {
        let mut line = BytesMut::with_capacity(self.label.len() + self.text.len() + 3);
        line.put_slice(self.label.as_bytes());
        line.put_slice(b": ");
        line.put_slice(self.text.as_bytes());
        line.put_u8(b'\n');
        line.freeze()
    }
}

/// What happened to one recipient.
#[derive(Debug)]
pub enum Outcome {
    Delivered,
    Failed(io::Error),
}

/// Per-peer outcomes of one broadcast.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub outcomes: Vec<(SessionId, Outcome)>,
}

impl BroadcastReport {
    pub fn delivered(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, Outcome::Delivered))
            .map(|(id, _)| *id)
    }

    pub fn failed(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, Outcome::Failed(_)))
            .map(|(id, _)| *id)
    }
}

/// Deliver `message` to every peer except its sender.
///
/// Peers whose write failed are removed from `registry` and returned; the
/// caller must close them (and drop any readiness registration).
pub fn broadcast<P: Peer>(registry: &mut Registry<P>, message: &Message) -> (BroadcastReport, Vec<P>) {
    let line = message.to_line();
    let mut report = BroadcastReport::default();

    registry.for_each_except(message.sender(), |peer| {
        let outcome = match peer.deliver(&line) {
            Ok(()) => Outcome::Delivered,
            Err(e) => Outcome::Failed(e),
        };
        report.outcomes.push((peer.id(), outcome));
    });

    let evicted = report
        .outcomes
        .iter()
        .filter_map(|(id, outcome)| match outcome {
            Outcome::Delivered => None,
            Outcome::Failed(e) => {
                tracing::warn!(peer = %id, error = %e, "Dropping peer after failed write");
                registry.unregister(*id)
            }
        })
        .collect();

    (report, evicted)
}
