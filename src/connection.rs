// src/connection.rs
//! Client connection capability and close notification
//!
//! The binding core never owns a client transport. It sees a connection only
//! through [`ClientConnection`]: a comparable identity plus the ability to
//! subscribe to its close event. [`CloseNotifier`] is the bookkeeping a
//! connection implementation embeds to deliver that event exactly once.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Source of process-unique connection ids
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of one client transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap an id assigned by the I/O layer
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Allocate a fresh process-unique id
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Observer of connection termination
pub trait CloseListener: Send + Sync {
    /// Called once when the connection identified by `id` closes or fails
    fn on_close(&self, id: &ConnectionId);
}

/// Narrow view of a client connection used by the binding core
pub trait ClientConnection: Send + Sync {
    /// Identity used as the binding table key
    fn id(&self) -> ConnectionId;

    /// Subscribe `listener` to this connection's close event.
    ///
    /// Implementations must invoke the listener exactly once. A listener added
    /// after the connection has already closed is invoked immediately.
    fn add_close_listener(&self, listener: Arc<dyn CloseListener>);
}

struct NotifierState {
    closed: bool,
    listeners: Vec<Arc<dyn CloseListener>>,
}

/// Set of close listeners for a single connection, fired at most once
pub struct CloseNotifier {
    id: ConnectionId,
    state: Mutex<NotifierState>,
}

impl CloseNotifier {
    /// Create a notifier for the connection `id`
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            state: Mutex::new(NotifierState {
                closed: false,
                listeners: Vec::new(),
            }),
        }
    }

    /// Connection this notifier belongs to
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Register a listener, or fire it right away if the connection is closed
    pub fn subscribe(&self, listener: Arc<dyn CloseListener>) {
        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            trace!("Connection {} already closed, notifying late listener", self.id);
            listener.on_close(&self.id);
            return;
        }
        state.listeners.push(listener);
    }

    /// Mark the connection closed and notify every listener.
    ///
    /// Returns `false` if the connection had already been closed, in which case
    /// nobody is notified again.
    pub fn notify_closed(&self) -> bool {
        let listeners = {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
            mem::take(&mut state.listeners)
        };

        trace!("Connection {} closed, notifying {} listeners", self.id, listeners.len());

        // Listeners run without the lock held so they may subscribe or query freely
        for listener in listeners {
            listener.on_close(&self.id);
        }
        true
    }

    /// Guard that reports the connection closed when dropped.
    ///
    /// Hold it for the lifetime of the transport so every exit path, early
    /// error returns included, fires the close event.
    pub fn close_on_drop(&self) -> CloseGuard<'_> {
        CloseGuard { notifier: self }
    }

    /// Whether the close event has fired
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of listeners still waiting for the close event
    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }
}

impl fmt::Debug for CloseNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CloseNotifier")
            .field("id", &self.id)
            .field("closed", &state.closed)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

/// Fires [`CloseNotifier::notify_closed`] on drop
#[must_use = "the connection is reported closed as soon as the guard is dropped"]
#[derive(Debug)]
pub struct CloseGuard<'a> {
    notifier: &'a CloseNotifier,
}

impl Drop for CloseGuard<'_> {
    fn drop(&mut self) {
        self.notifier.notify_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingListener {
        calls: AtomicUsize,
    }

    impl CloseListener for CountingListener {
        fn on_close(&self, _id: &ConnectionId) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert_eq!(ConnectionId::new(42).to_string(), "conn-42");
    }

    #[test]
    fn test_notify_fires_each_listener_once() {
        let notifier = CloseNotifier::new(ConnectionId::new(1));
        let first = Arc::new(CountingListener::default());
        let second = Arc::new(CountingListener::default());

        notifier.subscribe(first.clone());
        notifier.subscribe(second.clone());
        assert_eq!(notifier.listener_count(), 2);

        assert!(notifier.notify_closed());
        assert!(!notifier.notify_closed());

        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.listener_count(), 0);
        assert!(notifier.is_closed());
    }

    #[test]
    fn test_late_subscriber_notified_immediately() {
        let notifier = CloseNotifier::new(ConnectionId::new(2));
        notifier.notify_closed();

        let late = Arc::new(CountingListener::default());
        notifier.subscribe(late.clone());

        assert_eq!(late.calls.load(Ordering::SeqCst), 1);
        assert_eq!(notifier.listener_count(), 0);
    }

    #[test]
    fn test_close_guard_fires_on_early_return() {
        fn serve(notifier: &CloseNotifier, fail_reply: bool) -> std::io::Result<()> {
            let _closed = notifier.close_on_drop();
            if fail_reply {
                return Err(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
            }
            Ok(())
        }

        let notifier = CloseNotifier::new(ConnectionId::new(3));
        let listener = Arc::new(CountingListener::default());
        notifier.subscribe(listener.clone());

        assert!(serve(&notifier, true).is_err());
        assert!(notifier.is_closed());
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);

        // A second guard on an already-closed connection notifies nobody
        drop(notifier.close_on_drop());
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    }
}
