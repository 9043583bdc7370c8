//! Server error types.
//!
//! The receive loop never fails on a single bad datagram; these errors
//! cover the fatal paths only (binding, socket teardown, configuration).

use std::{fmt, io};

/// Errors that can occur while running the server.
#[derive(Debug)]
pub enum ServerError {
    /// Failed to bind the UDP socket.
    ///
    /// The port is taken or the address is invalid. Fatal at startup.
    Bind {
        /// Address the bind was attempted on
        addr: String,
        /// Underlying I/O error
        source: io::Error,
    },

    /// The socket failed outside of per-datagram handling.
    ///
    /// Receiving or sending hit an unrecoverable I/O error. The receive
    /// loop exits; a supervisor may restart the server.
    Socket(io::Error),

    /// Invalid runtime configuration.
    ///
    /// Loss probabilities outside [0, 1] or similar. Fatal at startup.
    Config(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { addr, source } => write!(f, "failed to bind {addr}: {source}"),
            Self::Socket(err) => write!(f, "socket error: {err}"),
            Self::Config(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. } => Some(source),
            Self::Socket(err) => Some(err),
            Self::Config(_) => None,
        }
    }
}
