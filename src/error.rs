use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use crate::connection::ConnectionId;

/// Errors produced by the relay binding core
#[derive(Debug, Error)]
pub enum BindingError {
    /// Every port in the candidate range is allocated
    #[error("No relay port available in range {min}-{max}")]
    NoPortAvailable {
        /// Lowest port of the range
        min: u16,
        /// Highest port of the range
        max: u16,
    },

    /// The local relay host could not be resolved
    #[error("Could not resolve local relay host: {0}")]
    HostResolutionFailed(String),

    /// The relay endpoint failed to start on its allocated address
    #[error("Relay endpoint failed to start on {addr}: {source}")]
    EndpointStart {
        /// Address the endpoint tried to bind
        addr: SocketAddr,
        /// Underlying socket error
        #[source]
        source: io::Error,
    },

    /// The connection already owns a relay binding
    #[error("Connection {0} already has a relay binding")]
    AlreadyBound(ConnectionId),

    /// The connection closed before its binding was complete
    #[error("Connection {0} closed during relay binding allocation")]
    ConnectionClosed(ConnectionId),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BindingError {
    /// Whether the failure points at the server environment rather than the client
    pub fn is_server_fault(&self) -> bool {
        matches!(
            self,
            Self::HostResolutionFailed(_) | Self::EndpointStart { .. } | Self::Io(_)
        )
    }
}

/// Result type for binding operations
pub type BindingResult<T> = Result<T, BindingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BindingError::NoPortAvailable { min: 50000, max: 50010 };
        assert_eq!(err.to_string(), "No relay port available in range 50000-50010");

        let err = BindingError::HostResolutionFailed("no interfaces".to_string());
        assert!(err.to_string().contains("no interfaces"));
    }

    #[test]
    fn test_server_fault_classification() {
        assert!(BindingError::HostResolutionFailed("x".into()).is_server_fault());
        assert!(!BindingError::NoPortAvailable { min: 1, max: 2 }.is_server_fault());
        assert!(!BindingError::AlreadyBound(ConnectionId::new(7)).is_server_fault());
        assert!(!BindingError::ConnectionClosed(ConnectionId::new(8)).is_server_fault());
    }
}
