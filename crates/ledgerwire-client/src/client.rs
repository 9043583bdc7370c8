//! Send-wait-retry engine and request builders.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
    time::Duration,
};

use ledgerwire_proto::{
    Currency, Message, MsgType, OpCode, Semantics, TlvField,
};
use tokio::{
    net::UdpSocket,
    sync::mpsc,
    time::{timeout_at, Instant},
};

use crate::ClientError;

/// Largest datagram we will accept.
const RECV_BUFFER_SIZE: usize = 65535;

/// Retransmission policy: initial timeout, then doubling per retry.
///
/// The defaults (500 ms, 5 retries) give 6 transmissions and a worst-case
/// wait of 500 + 1000 + 2000 + 4000 + 8000 + 16000 ms.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Deadline for the first reply wait.
    pub initial_timeout: Duration,
    /// Retransmissions after the initial attempt.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_timeout: Duration::from_millis(500),
            max_retries: 5,
        }
    }
}

/// Per-client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Stable client identifier; the high half of every request id.
    pub client_id: u32,
    /// Semantics used when the caller does not override per request.
    pub default_semantics: Semantics,
    /// Whether requests carry a CRC32 trailer.
    pub checksum: bool,
    /// Retransmission policy.
    pub retry: RetryPolicy,
}

impl ClientConfig {
    /// Configuration with a given client id and library defaults otherwise.
    #[must_use]
    pub fn new(client_id: u32) -> Self {
        Self {
            client_id,
            default_semantics: Semantics::default(),
            checksum: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// A banking client bound to one UDP socket.
///
/// A request blocks its caller until a correlated reply arrives or the
/// retry bound is exhausted; the client is single-threaded per logical
/// request. The sequence counter makes request ids unique per client.
pub struct BankClient {
    socket: UdpSocket,
    server: SocketAddr,
    config: ClientConfig,
    seq_no: AtomicU32,
    callback_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl BankClient {
    /// Bind an ephemeral local socket aimed at `server`.
    ///
    /// # Errors
    ///
    /// [`ClientError::Io`] if the socket cannot be bound.
    pub async fn connect(server: SocketAddr, config: ClientConfig) -> Result<Self, ClientError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        tracing::debug!(
            client_id = config.client_id,
            local = %socket.local_addr()?,
            %server,
            "client socket bound"
        );
        Ok(Self {
            socket,
            server,
            config,
            seq_no: AtomicU32::new(0),
            callback_tx: Mutex::new(None),
        })
    }

    /// This client's identifier.
    #[must_use]
    pub fn client_id(&self) -> u32 {
        self.config.client_id
    }

    /// Local socket address (the address callbacks will be sent to while
    /// this socket stays open).
    ///
    /// # Errors
    ///
    /// [`ClientError::Io`] if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.socket.local_addr()?)
    }

    /// Subscribe to callback notifications.
    ///
    /// Every CBK received, whether during a request wait or in
    /// [`BankClient::listen_for_callbacks`], is delivered to the returned
    /// channel. Subscribing again replaces the previous subscription.
    #[allow(clippy::expect_used)]
    pub fn subscribe_callbacks(&self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .callback_tx
            .lock()
            .expect("callback subscription mutex poisoned") = Some(tx);
        rx
    }

    #[allow(clippy::expect_used)]
    fn deliver_callback(&self, callback: Message) {
        let guard = self
            .callback_tx
            .lock()
            .expect("callback subscription mutex poisoned");
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(callback).is_err() {
                    tracing::debug!("callback receiver dropped, notification discarded");
                }
            }
            None => tracing::info!("callback received with no subscriber, discarded"),
        }
    }

    /// Send a request with the configured default semantics.
    ///
    /// See [`BankClient::send_request_with`].
    pub async fn send_request(&self, request: Message) -> Result<Option<Message>, ClientError> {
        self.send_request_with(request, self.config.default_semantics)
            .await
    }

    /// Send a request, wait for the correlated reply, retransmitting with
    /// doubled timeouts up to the retry bound.
    ///
    /// The request is stamped with this client's identity and a fresh
    /// sequence number, then encoded exactly once; every retransmission
    /// reuses the same bytes, so the requestId the server deduplicates on
    /// is stable across attempts.
    ///
    /// While waiting: callbacks are delivered to the subscriber without
    /// resetting the deadline, replies with a foreign requestId and
    /// undecodable datagrams are discarded.
    ///
    /// Returns `Ok(None)` when every attempt timed out.
    ///
    /// # Errors
    ///
    /// [`ClientError::Protocol`] if the request cannot be encoded,
    /// [`ClientError::Io`] on socket failure.
    pub async fn send_request_with(
        &self,
        mut request: Message,
        semantics: Semantics,
    ) -> Result<Option<Message>, ClientError> {
        let seq_no = self.seq_no.fetch_add(1, Ordering::Relaxed) + 1;
        request.header.set_client_id(self.config.client_id);
        request.header.set_seq_no(seq_no);
        request.header.set_semantics(semantics);
        request.header.derive_request_id();
        let request = request.with_checksum(self.config.checksum);

        let request_id = request.header.request_id();
        let wire = request.encode()?;

        let attempts = self.config.retry.max_retries + 1;
        let mut timeout = self.config.retry.initial_timeout;
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        for attempt in 1..=attempts {
            tracing::debug!(request_id, attempt, ?timeout, "transmitting request");
            self.socket.send_to(&wire, self.server).await?;

            if let Some(reply) = self.wait_for_reply(request_id, timeout, &mut buf).await? {
                return Ok(Some(reply));
            }

            tracing::info!(request_id, attempt, attempts, ?timeout, "reply timeout");
            timeout *= 2;
        }

        tracing::warn!(request_id, attempts, "request failed: retry bound exhausted");
        Ok(None)
    }

    /// Wait for a reply matching `request_id` until `timeout` elapses.
    ///
    /// Returns `Ok(None)` on deadline. The deadline is absolute: consuming
    /// callbacks or foreign datagrams does not extend it.
    async fn wait_for_reply(
        &self,
        request_id: u64,
        timeout: Duration,
        buf: &mut [u8],
    ) -> Result<Option<Message>, ClientError> {
        let deadline = Instant::now() + timeout;

        loop {
            let received = match timeout_at(deadline, self.socket.recv_from(buf)).await {
                Err(_) => return Ok(None), // deadline reached
                Ok(result) => result?,
            };
            let (len, peer) = received;

            let message = match Message::decode(&buf[..len]) {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!(%err, %peer, "discarding undecodable datagram");
                    continue;
                }
            };

            match message.header.msg_type() {
                Some(MsgType::Cbk) => {
                    tracing::debug!(%peer, "callback received during request wait");
                    self.deliver_callback(message);
                }
                Some(MsgType::Rep) if message.header.request_id() == request_id => {
                    return Ok(Some(message));
                }
                Some(MsgType::Rep) => {
                    tracing::debug!(
                        got = message.header.request_id(),
                        want = request_id,
                        "discarding reply with mismatched requestId"
                    );
                }
                _ => {
                    tracing::debug!(%peer, "discarding unexpected message type");
                }
            }
        }
    }

    /// Listen for callback notifications only, for a bounded duration.
    ///
    /// Dedicated monitor mode: delivers every CBK to the subscriber and
    /// ignores everything else. Returns the number of callbacks delivered.
    ///
    /// # Errors
    ///
    /// [`ClientError::Io`] on socket failure.
    pub async fn listen_for_callbacks(&self, duration: Duration) -> Result<usize, ClientError> {
        let deadline = Instant::now() + duration;
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut delivered = 0usize;

        tracing::info!(?duration, "listening for callbacks");

        loop {
            let received = match timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(result) => result?,
            };
            let (len, peer) = received;

            match Message::decode(&buf[..len]) {
                Ok(message) if message.header.msg_type() == Some(MsgType::Cbk) => {
                    tracing::info!(%peer, "callback received");
                    self.deliver_callback(message);
                    delivered += 1;
                }
                Ok(_) => tracing::debug!(%peer, "ignoring non-callback message"),
                Err(err) => tracing::warn!(%err, %peer, "discarding undecodable datagram"),
            }
        }

        tracing::info!(delivered, "callback listening ended");
        Ok(delivered)
    }

    // Request builders. Each returns a message ready for `send_request`;
    // identity and semantics are stamped at send time.

    /// OPEN_ACCOUNT with an initial balance (may be zero).
    #[must_use]
    pub fn open_account(
        &self,
        username: &str,
        password: &str,
        currency: Currency,
        initial_balance_cents: i64,
    ) -> Message {
        self.request(OpCode::OpenAccount)
            .push(TlvField::username(username))
            .push(TlvField::password(password))
            .push(TlvField::currency(currency))
            .push(TlvField::amount_cents(initial_balance_cents))
    }

    /// CLOSE_ACCOUNT.
    #[must_use]
    pub fn close_account(&self, username: &str, password: &str, account_no: &str) -> Message {
        self.request(OpCode::CloseAccount)
            .push(TlvField::username(username))
            .push(TlvField::password(password))
            .push(TlvField::account_no(account_no))
    }

    /// DEPOSIT. A currency, when given, is validated server-side against
    /// the account.
    #[must_use]
    pub fn deposit(
        &self,
        username: &str,
        password: &str,
        account_no: &str,
        currency: Option<Currency>,
        amount_cents: i64,
    ) -> Message {
        let msg = self
            .request(OpCode::Deposit)
            .push(TlvField::username(username))
            .push(TlvField::password(password))
            .push(TlvField::account_no(account_no))
            .push(TlvField::amount_cents(amount_cents));
        match currency {
            Some(currency) => msg.push(TlvField::currency(currency)),
            None => msg,
        }
    }

    /// WITHDRAW. A currency, when given, is validated server-side against
    /// the account.
    #[must_use]
    pub fn withdraw(
        &self,
        username: &str,
        password: &str,
        account_no: &str,
        currency: Option<Currency>,
        amount_cents: i64,
    ) -> Message {
        let msg = self
            .request(OpCode::Withdraw)
            .push(TlvField::username(username))
            .push(TlvField::password(password))
            .push(TlvField::account_no(account_no))
            .push(TlvField::amount_cents(amount_cents));
        match currency {
            Some(currency) => msg.push(TlvField::currency(currency)),
            None => msg,
        }
    }

    /// QUERY_BALANCE.
    #[must_use]
    pub fn query_balance(&self, username: &str, password: &str, account_no: &str) -> Message {
        self.request(OpCode::QueryBalance)
            .push(TlvField::username(username))
            .push(TlvField::password(password))
            .push(TlvField::account_no(account_no))
    }

    /// TRANSFER from `from_account_no` to `to_account_no`.
    #[must_use]
    pub fn transfer(
        &self,
        username: &str,
        password: &str,
        from_account_no: &str,
        to_account_no: &str,
        amount_cents: i64,
    ) -> Message {
        self.request(OpCode::Transfer)
            .push(TlvField::username(username))
            .push(TlvField::password(password))
            .push(TlvField::account_no(from_account_no))
            .push(TlvField::to_account_no(to_account_no))
            .push(TlvField::amount_cents(amount_cents))
    }

    /// REGISTER_CALLBACK with a TTL in seconds.
    #[must_use]
    pub fn register_callback(&self, ttl_seconds: u32) -> Message {
        self.request(OpCode::RegisterCallback).push(TlvField::ttl_seconds(ttl_seconds))
    }

    /// UNREGISTER_CALLBACK.
    #[must_use]
    pub fn unregister_callback(&self) -> Message {
        self.request(OpCode::UnregisterCallback)
    }

    fn request(&self, op: OpCode) -> Message {
        Message::request(op, self.config.client_id, 0, self.config.default_semantics)
    }
}
