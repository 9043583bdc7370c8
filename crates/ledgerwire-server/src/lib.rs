//! UDP request/reply server for the ledgerwire banking service.
//!
//! The server owns one datagram endpoint and runs a single receive loop:
//! decode, consult the dispatcher, transmit the reply and any callback
//! fan-out. Delivery semantics (At-Least-Once vs At-Most-Once) are realized
//! here: the [`ReplyCache`] suppresses duplicate execution of AMO requests
//! by retransmitting the original reply bytes, and the [`LossSimulator`]
//! makes the channel unreliable on demand so both semantics can be observed.

mod callback_registry;
mod dispatcher;
mod error;
mod loss;
mod reply_cache;
mod transport;

pub use callback_registry::CallbackRegistry;
pub use dispatcher::{Dispatcher, DispatchOutcome, Fanout};
pub use error::ServerError;
pub use loss::{LossSimulator, LossStats};
pub use reply_cache::{ReplyCache, DEFAULT_REPLY_TTL};
pub use transport::{ServerConfig, UdpServer};
