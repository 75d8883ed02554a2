// src/binding_table.rs
//! Concurrent map from client connection to its relay endpoint
//!
//! Every check-then-act sequence on a single key runs under a lock owned by
//! that key alone, so allocation, replacement and removal for one connection
//! never interleave. The map itself is only touched for short reads and
//! writes; an endpoint that is slow to start holds up its own connection and
//! nothing else.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::connection::ConnectionId;
use crate::endpoint::RelayEndpoint;
use crate::error::{BindingError, BindingResult};

/// Result of binding a connection
pub(crate) struct Bound {
    /// Endpoint now registered for the connection
    pub endpoint: Arc<dyn RelayEndpoint>,

    /// Whether an existing binding was displaced
    pub replaced: bool,
}

/// Authoritative connection → relay endpoint table
#[derive(Debug, Default)]
pub struct BindingTable {
    entries: DashMap<ConnectionId, Arc<dyn RelayEndpoint>>,

    /// Per-connection operation locks, present only while an operation runs
    key_locks: DashMap<ConnectionId, Arc<Mutex<()>>>,
}

impl BindingTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoint bound to `id`, if any
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<dyn RelayEndpoint>> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }

    /// Whether `id` is bound
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of bound connections
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no connection is bound
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the currently bound connections
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    /// Bind `id` to the endpoint produced by `open`.
    ///
    /// `open` runs with the lock for `id` held. If `id` is already bound and
    /// `replace` is false, fails with `AlreadyBound` without calling `open`.
    /// Otherwise the displaced endpoint is handed to `retire` after the new one
    /// has been published, still under the lock.
    pub(crate) fn bind_with<O, R>(
        &self,
        id: ConnectionId,
        replace: bool,
        open: O,
        retire: R,
    ) -> BindingResult<Bound>
    where
        O: FnOnce() -> BindingResult<Arc<dyn RelayEndpoint>>,
        R: FnOnce(&Arc<dyn RelayEndpoint>),
    {
        self.with_key_locked(id, || {
            let existing = self.get(&id);
            if existing.is_some() && !replace {
                return Err(BindingError::AlreadyBound(id));
            }

            let endpoint = open()?;
            self.entries.insert(id, endpoint.clone());

            if let Some(displaced) = &existing {
                retire(displaced);
            }
            Ok(Bound {
                endpoint,
                replaced: existing.is_some(),
            })
        })
    }

    /// Remove the binding for `id` and run `retire` on it before the lock for
    /// `id` is released. Returns `None` when `id` was not bound.
    pub(crate) fn remove_with<R>(&self, id: &ConnectionId, retire: R) -> Option<Arc<dyn RelayEndpoint>>
    where
        R: FnOnce(&Arc<dyn RelayEndpoint>),
    {
        self.with_key_locked(*id, || {
            let (_, endpoint) = self.entries.remove(id)?;
            retire(&endpoint);
            Some(endpoint)
        })
    }

    /// Run `op` holding the lock for `id`.
    ///
    /// The map shard is never held while waiting on or holding a key lock.
    fn with_key_locked<T>(&self, id: ConnectionId, op: impl FnOnce() -> T) -> T {
        let lock = self.key_locks.entry(id).or_default().value().clone();

        let result = {
            let _held = lock.lock();
            op()
        };

        // Only the map's own reference left means nobody else is waiting
        drop(lock);
        self.key_locks.remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }
}
