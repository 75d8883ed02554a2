//! Relay binding core (lib.rs)
//!
//! Allocation and lifecycle tracking of relay endpoints for a TURN-style relay
//! server: one relay endpoint per client connection, unique relay ports, and
//! exactly-once teardown when the connection closes.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Binding table
pub mod binding_table;
/// Configuration
pub mod config;
/// Client connection capability and close notification
pub mod connection;
/// Relay endpoints
pub mod endpoint;
/// Error types
pub mod error;
/// Binding manager
pub mod manager;
/// Relay port allocation
pub mod port_allocator;
/// Local host resolution
pub mod resolver;

// Re-export main types
pub use binding_table::BindingTable;
pub use config::{BindingConfig, RebindPolicy};
pub use connection::{ClientConnection, CloseGuard, CloseListener, CloseNotifier, ConnectionId};
pub use endpoint::{RelayEndpoint, RelayEndpointFactory, UdpRelayEndpoint, UdpRelayEndpointFactory};
pub use error::{BindingError, BindingResult};
pub use manager::{BindingManager, BindingStats};
pub use port_allocator::PortAllocator;
pub use resolver::{resolver_from_config, HostResolver, StaticResolver};

#[cfg(feature = "interface-resolver")]
pub use resolver::InterfaceResolver;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging system with custom configuration
///
/// # Arguments
/// * `level` - Log level (trace/debug/info/warn/error)
///
/// # Example
/// ```
/// turn_bindings::init_logging("info");
/// ```
///
pub fn init_logging(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Reduce verbosity of the runtime
    let filter = match "tokio=warn".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(true)
        )
        .with(filter)
        .try_init();
}
