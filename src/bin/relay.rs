use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use turn_bindings::{
    init_logging, BindingConfig, BindingManager, ClientConnection, CloseListener, CloseNotifier,
    ConnectionId, UdpRelayEndpointFactory,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay binding server", long_about = None)]
struct Args {
    /// Listen address for client connections
    #[arg(short, long, default_value = "0.0.0.0:3478")]
    bind: SocketAddr,

    /// JSON binding configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Client connection accepted over TCP
struct TcpClientConnection {
    peer: SocketAddr,
    notifier: CloseNotifier,
}

impl TcpClientConnection {
    fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            notifier: CloseNotifier::new(ConnectionId::next()),
        }
    }
}

impl ClientConnection for TcpClientConnection {
    fn id(&self) -> ConnectionId {
        self.notifier.id()
    }

    fn add_close_listener(&self, listener: Arc<dyn CloseListener>) {
        self.notifier.subscribe(listener);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = match &args.config {
        Some(path) => BindingConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BindingConfig::default(),
    };

    let manager = BindingManager::from_config(&config, Arc::new(UdpRelayEndpointFactory))?;
    let listener = TcpListener::bind(args.bind).await?;

    tracing::info!("Relay binding server listening on {}", listener.local_addr()?);
    tracing::info!("  Relay ports: {}-{}", config.min_port, config.max_port);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let manager = manager.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_client(manager, stream, peer).await {
                                tracing::debug!("Client {} ended with error: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("Accept error: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received");
                break;
            }
        }
    }

    let drained = manager.shutdown();
    tracing::info!("Stopped with {} bindings drained", drained);
    tracing::info!("Final stats: {}", serde_json::to_string(&manager.stats())?);
    Ok(())
}

async fn serve_client(
    manager: Arc<BindingManager>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let connection = Arc::new(TcpClientConnection::new(peer));
    let handle: Arc<dyn ClientConnection> = connection.clone();

    // Every way out of this function reports the connection closed
    let _closed = connection.notifier.close_on_drop();

    tracing::info!("Client {} connected as {}", connection.peer, connection.id());

    match manager.allocate_binding(&handle) {
        Ok(endpoint) => {
            let reply = format!("RELAY {}\n", endpoint.allocated_address());
            stream.write_all(reply.as_bytes()).await?;
        }
        Err(e) => {
            if e.is_server_fault() {
                tracing::error!("Server fault allocating binding for {}: {}", peer, e);
            }
            stream.write_all(format!("ERROR {}\n", e).as_bytes()).await?;
            return Ok(());
        }
    }

    // Client traffic is not interpreted; wait for the peer to hang up
    let mut buf = vec![0u8; 4096];
    while stream.read(&mut buf).await? != 0 {}

    tracing::info!("Client {} disconnected", peer);
    Ok(())
}
