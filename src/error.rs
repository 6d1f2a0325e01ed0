//! Error types for the Portico gateway.

use std::net::SocketAddr;

use thiserror::Error;

/// Main error type for Portico operations.
#[derive(Error, Debug)]
pub enum PorticoError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Static asset errors (missing or unreadable SPA bundle)
    #[error("Asset error: {0}")]
    Assets(String),

    /// TLS material could not be loaded
    #[error("TLS error: {0}")]
    Tls(String),

    /// The listening socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Unrecoverable error on the listener while serving
    #[error("Listener error: {0}")]
    Serve(#[source] std::io::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for PorticoError {
    fn from(err: config::ConfigError) -> Self {
        PorticoError::Config(err.to_string())
    }
}

impl From<rustls::Error> for PorticoError {
    fn from(err: rustls::Error) -> Self {
        PorticoError::Tls(err.to_string())
    }
}

/// Result type alias for Portico operations.
pub type Result<T> = std::result::Result<T, PorticoError>;
