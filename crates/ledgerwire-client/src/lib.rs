//! UDP client for the ledgerwire banking service.
//!
//! The client owns one socket and realizes the request/reply contract over
//! an unreliable channel: a request is encoded once and the identical bytes
//! are retransmitted with doubling timeouts until a correlated reply
//! arrives or the retry bound is exhausted. Callback notifications that
//! arrive while waiting are demultiplexed to a channel without disturbing
//! the wait.

mod client;
mod error;

pub use client::{BankClient, ClientConfig, RetryPolicy};
pub use error::ClientError;
