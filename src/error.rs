//! Error Types
//!
//! Failure taxonomy for the tunnel. Startup and listener failures are fatal
//! for the process; everything else is scoped to a single session.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Tunnel error type
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Listener could not be bound to the local endpoint
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Target endpoint could not be resolved at startup
    #[error("failed to resolve {endpoint}: {source}")]
    Resolve {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// Transient accept failure, the accept loop keeps going
    #[error("accept error: {0}")]
    Accept(#[source] io::Error),

    /// The listening socket itself failed
    #[error("listener failed: {0}")]
    Listener(#[source] io::Error),

    /// Outbound connect to the target failed
    #[error("failed to connect to target {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    /// Any other transport failure inside a session
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl TunnelError {
    /// Whether this error terminates the whole process rather than one session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::Bind { .. }
                | TunnelError::Resolve { .. }
                | TunnelError::Listener(_)
                | TunnelError::Config(_)
        )
    }

    pub(crate) fn connect(addrs: &[SocketAddr], source: io::Error) -> Self {
        let target = addrs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        TunnelError::Connect { target, source }
    }
}

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, TunnelError>;
