//! Session registry: the single source of truth for who is online.
//!
//! `Registry` is the single-owner form used by the readiness loop.
//! `SharedRegistry` wraps it in one coarse lock so that register, unregister
//! and broadcast iteration are mutually exclusive across worker threads.

use crate::broadcast::{self, BroadcastReport, Message};
use crate::error::RelayError;
use crate::session::SessionId;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// The registry-side view of one live session: something that can be
/// handed a formatted line and closed.
pub trait Peer {
    fn id(&self) -> SessionId;

    /// Deliver one formatted line. An error means the peer is gone.
    fn deliver(&mut self, line: &Bytes) -> io::Result<()>;

    /// Release the peer's resources. Idempotent.
    fn close(&mut self);
}

/// Mapping from session id to peer.
#[derive(Debug)]
pub struct Registry<P> {
    peers: HashMap<SessionId, P>,
}

impl<P: Peer> Registry<P> {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Add a peer. A duplicate id is an invariant violation and the new
    /// peer is handed back untouched rather than overwriting the old one.
    pub fn register(&mut self, peer: P) -> Result<(), (P, RelayError)> {
        let id = peer.id();
        if self.peers.contains_key(&id) {
            return Err((peer, RelayError::duplicate_id(id)));
        }
        self.peers.insert(id, peer);
        Ok(())
    }

    /// Remove a peer. Returns it to exactly one caller; later calls for the
    /// same id are no-ops.
    pub fn unregister(&mut self, id: SessionId) -> Option<P> {
        self.peers.remove(&id)
    }

    /// Apply `f` to every registered peer except `exclude`.
    pub fn for_each_except<F>(&mut self, exclude: SessionId, mut f: F)
    where
        F: FnMut(&mut P),
    {
        for (id, peer) in self.peers.iter_mut() {
            if *id != exclude {
                f(peer);
            }
        }
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut P> {
        self.peers.get_mut(&id)
    }

    #[cfg(test)]
    pub fn contains(&self, id: SessionId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl<P: Peer> Default for Registry<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-protected registry shared by worker threads or tasks.
///
/// The lock is never held across a blocking read; it is held across peer
/// writes during a broadcast so that no worker observes a half-removed
/// session mid-iteration.
#[derive(Debug)]
pub struct SharedRegistry<P> {
    inner: Mutex<Registry<P>>,
}

impl<P: Peer> SharedRegistry<P> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registry::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry<P>> {
        // A panicking worker cannot leave the map torn; each mutation is a
        // single HashMap call.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    pub fn register(&self, peer: P) -> Result<(), (P, RelayError)> {
        self.lock().register(peer)
    }

    /// Register only while fewer than `limit` peers are online.
    pub fn register_bounded(&self, peer: P, limit: usize) -> Result<(), (P, Option<RelayError>)> {
        let mut registry = self.lock();
        if registry.len() >= limit {
            return Err((peer, None));
        }
        registry.register(peer).map_err(|(peer, e)| (peer, Some(e)))
    }

    /// Remove and close a peer. Returns whether this call did the removal.
    pub fn unregister(&self, id: SessionId) -> bool {
        // Close outside the lock.
        let removed = self.lock().unregister(id);
        match removed {
            Some(mut peer) => {
                peer.close();
                true
            }
            None => false,
        }
    }

    /// Broadcast under the lock, then close evicted peers after releasing it.
    pub fn broadcast(&self, message: &Message) -> BroadcastReport {
        let (report, evicted) = {
            let mut registry = self.lock();
            broadcast::broadcast(&mut *registry, message)
        };
        for mut peer in evicted {
            peer.close();
        }
        report
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

impl<P: Peer> Default for SharedRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}
