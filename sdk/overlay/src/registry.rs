//! Receiver registry mapping logical connection ids to their owners.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Weak;

use dashmap::DashMap;

use crate::connection::ConnectionCore;
use crate::listener::ListenerCore;

/// The roles a registered receiver can take.
///
/// Dispatch matches on the role, so adding a receiver kind forces every
/// dispatch site to handle it.
#[derive(Clone)]
pub(crate) enum Receiver {
    /// A bound listening endpoint
    Listener(Weak<ListenerCore>),
    /// An accepted logical connection
    Conn(Weak<ConnectionCore>),
}

/// Registry of inbound-capable receivers on one channel.
///
/// Ids are allocated from a channel-local counter and never reused within
/// the life of the channel. Receivers are held weakly so a dropped endpoint
/// cannot be kept alive by its registration alone.
pub(crate) struct Registry {
    receivers: DashMap<u32, Receiver>,
    next_id: AtomicU32,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry {
            receivers: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Allocate a fresh connection id without registering anything yet
    pub(crate) fn reserve(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a receiver under a previously reserved id
    pub(crate) fn insert(&self, conn_id: u32, receiver: Receiver) {
        self.receivers.insert(conn_id, receiver);
    }

    /// Remove a registration, reporting whether it was present
    pub(crate) fn remove(&self, conn_id: u32) -> bool {
        self.receivers.remove(&conn_id).is_some()
    }

    /// Clone out the receiver for an id.
    ///
    /// Returns an owned clone so callers never hold a map guard across an
    /// await point.
    pub(crate) fn get(&self, conn_id: u32) -> Option<Receiver> {
        self.receivers.get(&conn_id).map(|r| r.clone())
    }

    /// Snapshot of all registered ids
    pub(crate) fn ids(&self) -> Vec<u32> {
        self.receivers.iter().map(|entry| *entry.key()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.receivers.len()
    }
}
