//! Relay counters shared between a dispatcher and whoever observes it.

use crate::broadcast::{BroadcastReport, Message};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

/// Live counters for one server instance.
#[derive(Debug, Default)]
pub struct RelayStats {
    online: AtomicUsize,
    accepted: AtomicU64,
    rejected: AtomicU64,
    messages: AtomicU64,
    evicted: AtomicU64,
}

impl RelayStats {
    /// Sessions currently registered.
    pub fn online(&self) -> usize {
        self.online.load(Ordering::Relaxed)
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub(crate) fn session_opened(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.online.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_closed(&self) {
        self.online.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Account for one broadcast. Every failed recipient was unregistered
    /// by the same pass, so it also leaves the online count here.
    pub(crate) fn record_broadcast(&self, message: &Message, report: &BroadcastReport) {
        let failed = report.failed().count();
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.evicted.fetch_add(failed as u64, Ordering::Relaxed);
        self.online.fetch_sub(failed, Ordering::Relaxed);
        debug!(
            session = %message.label(),
            recipients = report.outcomes.len(),
            failed,
            text = message.text(),
            "Relayed message"
        );
    }
}
