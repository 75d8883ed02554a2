// src/manager.rs
//! Relay binding manager
//!
//! Allocates a relay endpoint per client connection, tracks it in the
//! [`BindingTable`], and tears it down exactly once when the connection closes
//! or the binding is removed explicitly.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::Serialize;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::binding_table::BindingTable;
use crate::config::{BindingConfig, RebindPolicy};
use crate::connection::{ClientConnection, CloseListener, ConnectionId};
use crate::endpoint::{RelayEndpoint, RelayEndpointFactory};
use crate::error::{BindingError, BindingResult};
use crate::port_allocator::PortAllocator;
use crate::resolver::{resolver_from_config, HostResolver};

/// Manages relay bindings for client connections
pub struct BindingManager {
    /// Connection → relay endpoint mappings
    table: BindingTable,

    /// Relay port pool
    ports: Arc<PortAllocator>,

    /// Local relay host lookup
    resolver: Arc<dyn HostResolver>,

    /// Relay endpoint construction
    factory: Arc<dyn RelayEndpointFactory>,

    /// Behaviour for already-bound connections
    rebind_policy: RebindPolicy,

    /// Handed to connections as their close observer
    self_ref: Weak<BindingManager>,

    /// Statistics
    stats: ManagerStats,
}

/// Lifetime counters
#[derive(Debug, Default)]
struct ManagerStats {
    bindings_allocated: AtomicU64,
    bindings_removed: AtomicU64,
    bindings_replaced: AtomicU64,
    allocation_failures: AtomicU64,
}

/// Point-in-time view of the manager
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BindingStats {
    /// Connections currently bound
    pub active_bindings: usize,
    /// Ports currently allocated from the pool
    pub allocated_ports: usize,
    /// Share of the port range in use, in percent
    pub pool_utilization: f64,
    /// Successful allocations since start
    pub bindings_allocated: u64,
    /// Bindings torn down since start
    pub bindings_removed: u64,
    /// Bindings displaced under `RebindPolicy::Replace`
    pub bindings_replaced: u64,
    /// Failed allocation attempts
    pub allocation_failures: u64,
}

/// Close observer registered on bound connections.
///
/// Holds the manager weakly so a connection outliving the server does not keep
/// the manager alive.
struct BindingCloseObserver {
    manager: Weak<BindingManager>,
}

impl CloseListener for BindingCloseObserver {
    fn on_close(&self, id: &ConnectionId) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_close(id);
        }
    }
}

impl BindingManager {
    /// Create a manager over the given collaborators
    pub fn new(
        ports: Arc<PortAllocator>,
        resolver: Arc<dyn HostResolver>,
        factory: Arc<dyn RelayEndpointFactory>,
        rebind_policy: RebindPolicy,
    ) -> Arc<Self> {
        let (min, max) = ports.range();
        info!(
            "Initializing binding manager (ports {}-{}, rebind policy {:?})",
            min, max, rebind_policy
        );

        Arc::new_cyclic(|self_ref| Self {
            table: BindingTable::new(),
            ports,
            resolver,
            factory,
            rebind_policy,
            self_ref: self_ref.clone(),
            stats: ManagerStats::default(),
        })
    }

    /// Create a manager from configuration
    pub fn from_config(
        config: &BindingConfig,
        factory: Arc<dyn RelayEndpointFactory>,
    ) -> BindingResult<Arc<Self>> {
        let ports = Arc::new(PortAllocator::from_config(config)?);
        let resolver = resolver_from_config(config);
        Ok(Self::new(ports, resolver, factory, config.rebind_policy))
    }

    /// Allocate and start a relay endpoint for `connection`.
    ///
    /// On failure nothing is registered and any port taken for the attempt is
    /// back in the pool. A connection that closes before the binding is
    /// complete yields `ConnectionClosed`, so `Ok` always means bound.
    #[instrument(skip(self, connection), fields(conn = %connection.id()), level = "debug")]
    pub fn allocate_binding(
        &self,
        connection: &Arc<dyn ClientConnection>,
    ) -> BindingResult<Arc<dyn RelayEndpoint>> {
        let id = connection.id();
        let replace = self.rebind_policy == RebindPolicy::Replace;

        let bound = self.table.bind_with(
            id,
            replace,
            || self.open_endpoint(connection),
            |displaced| {
                warn!(
                    "Replacing relay binding {} for {}",
                    displaced.allocated_address(),
                    id
                );
                self.retire(&id, displaced);
            },
        );

        let bound = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.stats.allocation_failures.fetch_add(1, Ordering::Relaxed);
                debug!("Binding allocation for {} failed: {}", id, e);
                return Err(e);
            }
        };

        self.stats.bindings_allocated.fetch_add(1, Ordering::Relaxed);
        if bound.replaced {
            self.stats.bindings_replaced.fetch_add(1, Ordering::Relaxed);
        }

        info!("Allocated relay binding {} for {}", bound.endpoint.allocated_address(), id);

        // Subscribed outside the connection lock: an already-closed connection
        // calls straight back into remove_binding
        connection.add_close_listener(Arc::new(BindingCloseObserver {
            manager: self.self_ref.clone(),
        }));

        // The binding may already be gone if the connection closed meanwhile
        match self.table.get(&id) {
            Some(current) if Arc::ptr_eq(&current, &bound.endpoint) => Ok(bound.endpoint),
            _ => {
                debug!("Connection {} closed before its binding was reported", id);
                Err(BindingError::ConnectionClosed(id))
            }
        }
    }

    /// Relay endpoint bound to `id`, if any
    pub fn get_binding(&self, id: &ConnectionId) -> Option<Arc<dyn RelayEndpoint>> {
        self.table.get(id)
    }

    /// Remove the binding for `id`, stopping its endpoint and releasing its port.
    ///
    /// Returns the removed endpoint. Repeated or concurrent calls for the same
    /// connection tear down at most once; the others return `None`.
    #[instrument(skip(self), level = "debug")]
    pub fn remove_binding(&self, id: &ConnectionId) -> Option<Arc<dyn RelayEndpoint>> {
        trace!("Removing binding for {}", id);

        let removed = self.table.remove_with(id, |endpoint| self.retire(id, endpoint));
        if let Some(endpoint) = &removed {
            self.stats.bindings_removed.fetch_add(1, Ordering::Relaxed);
            info!("Removed relay binding {} for {}", endpoint.allocated_address(), id);
        }
        removed
    }

    /// Number of bound connections
    pub fn binding_count(&self) -> usize {
        self.table.len()
    }

    /// Port pool backing this manager
    pub fn port_allocator(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Snapshot of manager statistics
    pub fn stats(&self) -> BindingStats {
        BindingStats {
            active_bindings: self.table.len(),
            allocated_ports: self.ports.allocated_count(),
            pool_utilization: self.ports.utilization(),
            bindings_allocated: self.stats.bindings_allocated.load(Ordering::Relaxed),
            bindings_removed: self.stats.bindings_removed.load(Ordering::Relaxed),
            bindings_replaced: self.stats.bindings_replaced.load(Ordering::Relaxed),
            allocation_failures: self.stats.allocation_failures.load(Ordering::Relaxed),
        }
    }

    /// Tear down every binding. Returns the number of bindings removed
    pub fn shutdown(&self) -> usize {
        info!("Shutting down binding manager");

        let drained = self
            .table
            .connection_ids()
            .iter()
            .filter(|id| self.remove_binding(id).is_some())
            .count();

        info!("Binding manager shutdown complete, {} bindings drained", drained);
        drained
    }

    fn open_endpoint(
        &self,
        connection: &Arc<dyn ClientConnection>,
    ) -> BindingResult<Arc<dyn RelayEndpoint>> {
        let port = self.ports.allocate()?;

        let host = match self.resolver.resolve_local_host() {
            Ok(host) => host,
            Err(e) => {
                // Environment fault, not something the client caused
                error!("Could not resolve relay host for {}: {}", connection.id(), e);
                self.ports.release(port);
                return Err(match e {
                    BindingError::HostResolutionFailed(_) => e,
                    other => BindingError::HostResolutionFailed(other.to_string()),
                });
            }
        };

        let addr = SocketAddr::new(host, port);
        let endpoint = self.factory.create(addr, connection);

        if let Err(source) = endpoint.start() {
            error!("Relay endpoint on {} failed to start: {}", addr, source);
            self.ports.release(port);
            return Err(BindingError::EndpointStart { addr, source });
        }

        Ok(endpoint)
    }

    fn retire(&self, id: &ConnectionId, endpoint: &Arc<dyn RelayEndpoint>) {
        endpoint.close();
        let port = endpoint.allocated_address().port();
        if !self.ports.release(port) {
            warn!("Relay port {} of {} was not allocated", port, id);
        }
    }
}

impl CloseListener for BindingManager {
    fn on_close(&self, id: &ConnectionId) {
        trace!("Connection {} closed, removing binding", id);
        self.remove_binding(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::CloseNotifier;
    use crate::resolver::StaticResolver;
    use parking_lot::Mutex;
    use std::io;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct TestConnection {
        notifier: CloseNotifier,
    }

    impl TestConnection {
        fn new(raw: u64) -> Arc<Self> {
            Arc::new(Self { notifier: CloseNotifier::new(ConnectionId::new(raw)) })
        }
    }

    impl ClientConnection for TestConnection {
        fn id(&self) -> ConnectionId {
            self.notifier.id()
        }

        fn add_close_listener(&self, listener: Arc<dyn CloseListener>) {
            self.notifier.subscribe(listener);
        }
    }

    #[derive(Debug)]
    struct TestEndpoint {
        addr: SocketAddr,
        running: AtomicBool,
        closes: AtomicUsize,
    }

    impl RelayEndpoint for TestEndpoint {
        fn start(&self) -> io::Result<()> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) {
            self.running.store(false, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn allocated_address(&self) -> SocketAddr {
            self.addr
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct TestFactory {
        created: Mutex<Vec<Arc<TestEndpoint>>>,
    }

    impl RelayEndpointFactory for TestFactory {
        fn create(
            &self,
            addr: SocketAddr,
            _connection: &Arc<dyn ClientConnection>,
        ) -> Arc<dyn RelayEndpoint> {
            let endpoint = Arc::new(TestEndpoint {
                addr,
                running: AtomicBool::new(false),
                closes: AtomicUsize::new(0),
            });
            self.created.lock().push(endpoint.clone());
            endpoint
        }
    }

    fn manager(policy: RebindPolicy) -> (Arc<BindingManager>, Arc<TestFactory>) {
        let factory = Arc::new(TestFactory::default());
        let manager = BindingManager::new(
            Arc::new(PortAllocator::new(55000, 55099).unwrap()),
            Arc::new(StaticResolver::new(IpAddr::V4(Ipv4Addr::LOCALHOST))),
            factory.clone(),
            policy,
        );
        (manager, factory)
    }

    #[test]
    fn test_allocate_then_get_returns_same_endpoint() {
        let (manager, _) = manager(RebindPolicy::Reject);
        let conn: Arc<dyn ClientConnection> = TestConnection::new(1);

        let endpoint = manager.allocate_binding(&conn).unwrap();
        let found = manager.get_binding(&conn.id()).unwrap();

        assert!(Arc::ptr_eq(&endpoint, &found));
        assert!(endpoint.is_running());
        assert_eq!(endpoint.allocated_address().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(manager.port_allocator().is_allocated(endpoint.allocated_address().port()));
    }

    #[test]
    fn test_rebind_rejected_by_default() {
        let (manager, factory) = manager(RebindPolicy::Reject);
        let conn: Arc<dyn ClientConnection> = TestConnection::new(2);

        manager.allocate_binding(&conn).unwrap();
        let err = manager.allocate_binding(&conn).unwrap_err();

        assert!(matches!(err, BindingError::AlreadyBound(id) if id == conn.id()));
        assert_eq!(factory.created.lock().len(), 1);
        assert_eq!(manager.port_allocator().allocated_count(), 1);
        assert_eq!(manager.stats().allocation_failures, 1);
    }

    #[test]
    fn test_rebind_replace_releases_displaced_port() {
        let (manager, factory) = manager(RebindPolicy::Replace);
        let conn: Arc<dyn ClientConnection> = TestConnection::new(3);

        let first = manager.allocate_binding(&conn).unwrap();
        let second = manager.allocate_binding(&conn).unwrap();

        let created = factory.created.lock();
        assert_eq!(created[0].closes.load(Ordering::SeqCst), 1);
        assert!(!first.is_running());
        assert!(second.is_running());
        assert_eq!(manager.binding_count(), 1);
        assert_eq!(manager.port_allocator().allocated_count(), 1);
        assert!(manager.port_allocator().is_allocated(second.allocated_address().port()));
        assert_eq!(manager.stats().bindings_replaced, 1);
    }

    #[test]
    fn test_dropped_manager_ignores_close() {
        let (manager, _) = manager(RebindPolicy::Reject);
        let conn = TestConnection::new(4);
        let dyn_conn: Arc<dyn ClientConnection> = conn.clone();
        manager.allocate_binding(&dyn_conn).unwrap();

        drop(manager);
        assert!(conn.notifier.notify_closed());
    }

    #[test]
    fn test_manager_as_close_listener() {
        let (manager, _) = manager(RebindPolicy::Reject);
        let conn: Arc<dyn ClientConnection> = TestConnection::new(5);
        manager.allocate_binding(&conn).unwrap();

        manager.on_close(&conn.id());
        manager.on_close(&conn.id());

        assert!(manager.get_binding(&conn.id()).is_none());
        assert_eq!(manager.stats().bindings_removed, 1);
        assert_eq!(manager.port_allocator().allocated_count(), 0);
    }

    #[test]
    fn test_closed_connection_is_not_reported_bound() {
        let (manager, factory) = manager(RebindPolicy::Reject);
        let conn = TestConnection::new(6);
        conn.notifier.notify_closed();
        let dyn_conn: Arc<dyn ClientConnection> = conn.clone();

        let err = manager.allocate_binding(&dyn_conn).unwrap_err();

        assert!(matches!(err, BindingError::ConnectionClosed(id) if id == conn.id()));
        assert_eq!(factory.created.lock()[0].closes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.port_allocator().allocated_count(), 0);
        assert_eq!(manager.binding_count(), 0);
    }

    #[test]
    fn test_stats_report_pool_utilization() {
        let (manager, _) = manager(RebindPolicy::Reject);
        for raw in 10..20 {
            let conn: Arc<dyn ClientConnection> = TestConnection::new(raw);
            manager.allocate_binding(&conn).unwrap();
        }

        let stats = manager.stats();
        assert_eq!(stats.active_bindings, 10);
        assert_eq!(stats.allocated_ports, 10);
        assert!((stats.pool_utilization - 10.0).abs() < 1e-9);
        assert_eq!(stats.bindings_allocated, 10);
    }
}
