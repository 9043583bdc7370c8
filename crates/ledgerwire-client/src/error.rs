//! Client error types.

use ledgerwire_proto::ProtocolError;
use thiserror::Error;

/// Errors surfaced by the client transport.
///
/// A reply timeout is not an error: `send_request` returns `Ok(None)` after
/// the retry bound, because an absent reply is an expected outcome on an
/// unreliable channel.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Socket I/O failed (bind, send, or receive).
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The outgoing request could not be encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server address could not be resolved.
    #[error("invalid server address: {0}")]
    Address(String),
}
