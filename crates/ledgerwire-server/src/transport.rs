//! UDP transport: the server receive loop.
//!
//! One socket, one loop. Each datagram passes the request-loss gate, gets
//! decoded, and is handed to the dispatcher; the returned reply passes the
//! reply-loss gate before transmission, and callback fan-outs are sent
//! best-effort with no gate and no retry. A datagram whose header is
//! garbage is dropped silently (no error reply is possible); a request with
//! a parsable header but an invalid payload gets a BAD_REQUEST reply. The
//! loop never terminates because of one bad datagram.

use std::{net::SocketAddr, time::Instant};

use ledgerwire_bank::BankService;
use ledgerwire_proto::{Message, MsgType, Payload, StatusCode, DEFAULT_PORT};
use tokio::{net::UdpSocket, sync::Notify};

use crate::{
    CallbackRegistry, DispatchOutcome, Dispatcher, LossSimulator, ReplyCache, ServerError,
    DEFAULT_REPLY_TTL,
};

/// Largest datagram we will accept.
const RECV_BUFFER_SIZE: usize = 65535;

/// How often expired AMO cache entries are swept in the background.
const CACHE_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Server runtime configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the UDP socket on.
    pub bind: SocketAddr,
    /// Probability of dropping an inbound request, in [0, 1].
    pub request_loss: f64,
    /// Probability of dropping an outbound reply, in [0, 1].
    pub reply_loss: f64,
    /// AMO reply cache entry lifetime.
    pub reply_ttl: std::time::Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            request_loss: 0.0,
            reply_loss: 0.0,
            reply_ttl: DEFAULT_REPLY_TTL,
        }
    }
}

/// UDP server owning one datagram endpoint.
///
/// Lifecycle: [`UdpServer::bind`] → [`UdpServer::run`] → [`UdpServer::shutdown`].
/// The receive loop is single-threaded and dispatcher calls are synchronous,
/// which serializes the check-cache → execute → store-cache sequence per
/// request and so upholds the AMO execute-once invariant without extra
/// locking.
pub struct UdpServer {
    socket: UdpSocket,
    dispatcher: Dispatcher,
    loss: LossSimulator,
    shutdown: Notify,
}

impl UdpServer {
    /// Bind the socket and assemble the dispatcher.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] for out-of-range loss probabilities,
    /// [`ServerError::Bind`] when the socket cannot be bound.
    pub async fn bind(config: ServerConfig, bank: BankService) -> Result<Self, ServerError> {
        let loss = LossSimulator::new(config.request_loss, config.reply_loss)?;

        let socket = UdpSocket::bind(config.bind)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind.to_string(),
                source,
            })?;

        let dispatcher = Dispatcher::new(
            bank,
            ReplyCache::with_ttl(config.reply_ttl),
            CallbackRegistry::new(),
        );

        tracing::info!(
            bind = %config.bind,
            request_loss = loss.request_loss(),
            reply_loss = loss.reply_loss(),
            "server socket bound"
        );

        Ok(Self {
            socket,
            dispatcher,
            loss,
            shutdown: Notify::new(),
        })
    }

    /// Local address the socket is bound to.
    ///
    /// # Errors
    ///
    /// [`ServerError::Socket`] if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.socket.local_addr().map_err(ServerError::Socket)
    }

    /// The dispatcher backing this server (cache, registry, bank access).
    #[must_use]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The loss simulator and its counters.
    #[must_use]
    pub fn loss(&self) -> &LossSimulator {
        &self.loss
    }

    /// Ask a running receive loop to exit.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run the receive loop until [`UdpServer::shutdown`] is called.
    ///
    /// # Errors
    ///
    /// [`ServerError::Socket`] on an unrecoverable socket failure. Malformed
    /// datagrams never end the loop.
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut sweep = tokio::time::interval(CACHE_SWEEP_INTERVAL);
        tracing::info!("receive loop running");

        loop {
            tokio::select! {
                () = self.shutdown.notified() => {
                    tracing::info!(stats = ?self.loss.stats(), "receive loop stopping");
                    return Ok(());
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = received.map_err(ServerError::Socket)?;
                    self.handle_datagram(&buf[..len], peer).await;
                }
                _ = sweep.tick() => {
                    let evicted = self.dispatcher.reply_cache().sweep(Instant::now());
                    if evicted > 0 {
                        tracing::debug!(evicted, "expired reply cache entries swept");
                    }
                }
            }
        }
    }

    /// Process one inbound datagram end to end.
    async fn handle_datagram(&self, bytes: &[u8], peer: SocketAddr) {
        if self.loss.should_drop_request() {
            // Peek the header for the log line only; the message must not
            // reach any downstream logic.
            match Message::peek_header(bytes) {
                Ok(header) => tracing::info!(
                    request_id = header.request_id(),
                    %peer,
                    "simulated loss: request dropped"
                ),
                Err(_) => tracing::info!(%peer, "simulated loss: request dropped (unparsable)"),
            }
            return;
        }

        let header = match Message::peek_header(bytes) {
            Ok(header) => header,
            Err(err) => {
                tracing::warn!(%err, %peer, len = bytes.len(), "dropping unparsable datagram");
                return;
            }
        };

        if header.msg_type() != Some(MsgType::Req) {
            tracing::warn!(msg_type = ?header.msg_type(), %peer, "dropping non-request message");
            return;
        }

        let outcome = match Message::decode(bytes) {
            Ok(request) => {
                tracing::debug!(
                    request_id = header.request_id(),
                    op = ?header.op_code(),
                    semantics = ?header.semantics(),
                    %peer,
                    "request received"
                );
                self.dispatcher.dispatch(&request, peer, Instant::now())
            }
            Err(err) => {
                // The header is intact, so the reply can still be
                // correlated to the request.
                tracing::warn!(%err, %peer, "invalid request payload, replying BAD_REQUEST");
                let bare = Message {
                    header,
                    payload: Payload::new(),
                };
                let reply = Message::reply_to(&bare, StatusCode::BadRequest);
                match reply.encode() {
                    Ok(bytes) => DispatchOutcome {
                        reply: bytes.into(),
                        from_cache: false,
                        fanout: Vec::new(),
                    },
                    Err(err) => {
                        tracing::error!(%err, "failed to encode BAD_REQUEST reply");
                        return;
                    }
                }
            }
        };

        if self.loss.should_drop_reply() {
            tracing::info!(
                request_id = header.request_id(),
                %peer,
                "simulated loss: reply dropped"
            );
        } else if let Err(err) = self.socket.send_to(&outcome.reply, peer).await {
            tracing::error!(%err, %peer, "failed to send reply");
        } else {
            tracing::debug!(
                request_id = header.request_id(),
                from_cache = outcome.from_cache,
                %peer,
                "reply sent"
            );
        }

        for fanout in &outcome.fanout {
            for recipient in &fanout.recipients {
                self.send_callback(&fanout.notification, *recipient).await;
            }
        }
    }

    /// Best-effort single-datagram callback send: no retry, no ack.
    pub async fn send_callback(&self, notification: &[u8], addr: SocketAddr) {
        match self.socket.send_to(notification, addr).await {
            Ok(_) => tracing::debug!(%addr, "callback sent"),
            Err(err) => tracing::warn!(%err, %addr, "failed to send callback"),
        }
    }
}
