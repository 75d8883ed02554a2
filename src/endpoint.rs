// src/endpoint.rs
//! Relay endpoints created for bound client connections
//!
//! The binding manager only needs lifecycle control over an endpoint: start
//! it on the allocated address, stop it, and read back the address. Data
//! forwarding belongs to the endpoint implementation.

use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::connection::{ClientConnection, ConnectionId};

/// One client's relay session bound to an allocated address.
///
/// `start` and `close` are called by the binding manager while it holds the
/// lock of the owning connection, so they must not call back into the
/// manager.
pub trait RelayEndpoint: Send + Sync + fmt::Debug {
    /// Begin relaying on the allocated address
    fn start(&self) -> io::Result<()>;

    /// Stop relaying and free the underlying socket. Must be idempotent
    fn close(&self);

    /// Address this endpoint was allocated
    fn allocated_address(&self) -> SocketAddr;

    /// Whether the endpoint is currently relaying
    fn is_running(&self) -> bool;
}

/// Builds relay endpoints for newly bound connections
pub trait RelayEndpointFactory: Send + Sync {
    /// Construct an endpoint for `connection` on `addr` without starting it
    fn create(
        &self,
        addr: SocketAddr,
        connection: &Arc<dyn ClientConnection>,
    ) -> Arc<dyn RelayEndpoint>;
}

/// Relay endpoint backed by a UDP socket on the allocated address
pub struct UdpRelayEndpoint {
    addr: SocketAddr,
    connection: ConnectionId,
    socket: Mutex<Option<UdpSocket>>,
}

impl UdpRelayEndpoint {
    /// Endpoint for `connection` on `addr`, not yet started
    pub fn new(addr: SocketAddr, connection: ConnectionId) -> Self {
        Self {
            addr,
            connection,
            socket: Mutex::new(None),
        }
    }
}

impl RelayEndpoint for UdpRelayEndpoint {
    fn start(&self) -> io::Result<()> {
        let mut socket = self.socket.lock();
        if socket.is_some() {
            return Ok(());
        }

        let bound = UdpSocket::bind(self.addr)?;
        bound.set_nonblocking(true)?;
        info!("Relay endpoint for {} listening on {}", self.connection, bound.local_addr()?);
        *socket = Some(bound);
        Ok(())
    }

    fn close(&self) {
        if self.socket.lock().take().is_some() {
            info!("Relay endpoint for {} on {} closed", self.connection, self.addr);
        }
    }

    fn allocated_address(&self) -> SocketAddr {
        self.addr
    }

    fn is_running(&self) -> bool {
        self.socket.lock().is_some()
    }
}

impl fmt::Debug for UdpRelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpRelayEndpoint")
            .field("addr", &self.addr)
            .field("connection", &self.connection)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Factory producing [`UdpRelayEndpoint`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpRelayEndpointFactory;

impl RelayEndpointFactory for UdpRelayEndpointFactory {
    fn create(
        &self,
        addr: SocketAddr,
        connection: &Arc<dyn ClientConnection>,
    ) -> Arc<dyn RelayEndpoint> {
        debug!("Creating UDP relay endpoint on {} for {}", addr, connection.id());
        Arc::new(UdpRelayEndpoint::new(addr, connection.id()))
    }
}
