//! Request dispatcher.
//!
//! Ties together the AMO reply cache, the banking service, and the callback
//! registry. The transport hands in a decoded request and gets back actions
//! to execute: reply bytes to transmit (possibly a cache retransmit) and
//! zero or more callback fan-outs.
//!
//! The AMO path is the load-bearing part: a duplicate `(clientId,
//! requestId)` with At-Most-Once semantics is answered from the cache
//! without touching the banking service, and the cache is populated before
//! the reply ever reaches the wire so a concurrent retry cannot slip past.

use std::{net::SocketAddr, time::Instant};

use bytes::Bytes;
use ledgerwire_bank::BankService;
use ledgerwire_proto::{
    errors::Result as ProtoResult, Message, OpCode, Semantics, StatusCode, TlvField,
};

use crate::{CallbackRegistry, ReplyCache};

/// A balance change produced by a successful operation.
struct StateChange {
    account_no: String,
    new_balance_cents: i64,
}

/// One encoded callback notification and where to send it.
#[derive(Debug, Clone)]
pub struct Fanout {
    /// Encoded ACCOUNT_UPDATE message.
    pub notification: Bytes,
    /// Monitor addresses to notify, originator already excluded.
    pub recipients: Vec<SocketAddr>,
}

/// Actions the transport must execute for one request.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Encoded reply to transmit (still subject to reply-loss simulation).
    pub reply: Bytes,
    /// Whether the reply is a cache retransmit of an earlier execution.
    pub from_cache: bool,
    /// Best-effort callback sends, not subject to loss simulation.
    pub fanout: Vec<Fanout>,
}

/// Validates requests, enforces AMO deduplication, invokes the banking
/// service, and assembles replies and callback fan-outs.
#[derive(Clone)]
pub struct Dispatcher {
    bank: BankService,
    reply_cache: ReplyCache,
    callbacks: CallbackRegistry,
}

impl Dispatcher {
    /// Create a dispatcher over the given collaborators.
    #[must_use]
    pub fn new(bank: BankService, reply_cache: ReplyCache, callbacks: CallbackRegistry) -> Self {
        Self {
            bank,
            reply_cache,
            callbacks,
        }
    }

    /// The banking service backing this dispatcher.
    #[must_use]
    pub fn bank(&self) -> &BankService {
        &self.bank
    }

    /// The callback registry backing this dispatcher.
    #[must_use]
    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    /// The AMO reply cache backing this dispatcher.
    #[must_use]
    pub fn reply_cache(&self) -> &ReplyCache {
        &self.reply_cache
    }

    /// Process one validated-as-REQ message from `peer`.
    pub fn dispatch(&self, request: &Message, peer: SocketAddr, now: Instant) -> DispatchOutcome {
        let client_id = request.header.client_id();
        let request_id = request.header.request_id();
        let amo = request.header.semantics() == Some(Semantics::Amo);

        if amo {
            if let Some(cached) = self.reply_cache.lookup(client_id, request_id, now) {
                tracing::info!(client_id, request_id, "AMO cache hit, retransmitting reply");
                return DispatchOutcome {
                    reply: cached,
                    from_cache: true,
                    fanout: Vec::new(),
                };
            }
        }

        let mut changes = Vec::new();
        let reply = self.execute(request, peer, now, &mut changes);
        let reply_bytes = self.encode_reply(&reply, request);

        // Store before the transport can transmit, so a duplicate arriving
        // right behind this one hits the cache instead of the bank.
        if amo {
            self.reply_cache
                .store(client_id, request_id, reply_bytes.clone(), now);
            tracing::debug!(client_id, request_id, "reply cached for AMO");
        }

        let fanout = changes
            .iter()
            .filter_map(|change| self.build_fanout(change, client_id, now))
            .collect();

        DispatchOutcome {
            reply: reply_bytes,
            from_cache: false,
            fanout,
        }
    }

    /// Execute the operation and build the reply message.
    ///
    /// Every failure mode maps to an error reply; nothing propagates to the
    /// receive loop.
    fn execute(
        &self,
        request: &Message,
        peer: SocketAddr,
        now: Instant,
        changes: &mut Vec<StateChange>,
    ) -> Message {
        let Some(op) = request.header.op_code() else {
            return Message::reply_to(request, StatusCode::BadRequest);
        };

        if let Err(err) = request.validate_required() {
            tracing::warn!(%err, op = ?op, "request missing required fields");
            return Message::reply_to(request, StatusCode::BadRequest);
        }

        match op {
            OpCode::OpenAccount => self.op_open_account(request, changes),
            OpCode::CloseAccount => self.op_close_account(request, changes),
            OpCode::Deposit => self.op_deposit(request, changes),
            OpCode::Withdraw => self.op_withdraw(request, changes),
            OpCode::QueryBalance => self.op_query_balance(request),
            OpCode::Transfer => self.op_transfer(request, changes),
            OpCode::RegisterCallback => self.op_register_callback(request, peer, now),
            OpCode::UnregisterCallback => self.op_unregister_callback(request),
            // Server-to-client only; a client must never send it.
            OpCode::AccountUpdate => Message::reply_to(request, StatusCode::BadRequest),
        }
    }

    fn op_open_account(&self, request: &Message, changes: &mut Vec<StateChange>) -> Message {
        let p = &request.payload;
        let parsed: ProtoResult<_> = (|| {
            Ok((
                p.username()?,
                p.password()?,
                p.currency()?,
                p.amount_cents_opt()?,
            ))
        })();
        let Ok((username, password, currency, initial)) = parsed else {
            return Message::reply_to(request, StatusCode::BadRequest);
        };

        match self
            .bank
            .open_account(username, password, currency, initial.unwrap_or(0))
        {
            Ok(opened) => {
                changes.push(StateChange {
                    account_no: opened.account_no.clone(),
                    new_balance_cents: opened.balance_cents,
                });
                Message::reply_to(request, StatusCode::Ok)
                    .push(TlvField::account_no(&opened.account_no))
                    .push(TlvField::amount_cents(opened.balance_cents))
            }
            Err(err) => Message::reply_to(request, err.into()),
        }
    }

    fn op_close_account(&self, request: &Message, changes: &mut Vec<StateChange>) -> Message {
        let p = &request.payload;
        let parsed: ProtoResult<_> = (|| Ok((p.username()?, p.password()?, p.account_no()?)))();
        let Ok((username, password, account_no)) = parsed else {
            return Message::reply_to(request, StatusCode::BadRequest);
        };

        match self.bank.close_account(username, password, account_no) {
            Ok(final_balance) => {
                changes.push(StateChange {
                    account_no: account_no.to_string(),
                    new_balance_cents: final_balance,
                });
                Message::reply_to(request, StatusCode::Ok)
                    .push(TlvField::amount_cents(final_balance))
            }
            Err(err) => Message::reply_to(request, err.into()),
        }
    }

    fn op_deposit(&self, request: &Message, changes: &mut Vec<StateChange>) -> Message {
        let p = &request.payload;
        let parsed: ProtoResult<_> = (|| {
            Ok((
                p.username()?,
                p.password()?,
                p.account_no()?,
                p.currency_opt()?,
                p.amount_cents()?,
            ))
        })();
        let Ok((username, password, account_no, currency, amount)) = parsed else {
            return Message::reply_to(request, StatusCode::BadRequest);
        };

        match self
            .bank
            .deposit(username, password, account_no, currency, amount)
        {
            Ok(new_balance) => {
                changes.push(StateChange {
                    account_no: account_no.to_string(),
                    new_balance_cents: new_balance,
                });
                Message::reply_to(request, StatusCode::Ok).push(TlvField::amount_cents(new_balance))
            }
            Err(err) => Message::reply_to(request, err.into()),
        }
    }

    fn op_withdraw(&self, request: &Message, changes: &mut Vec<StateChange>) -> Message {
        let p = &request.payload;
        let parsed: ProtoResult<_> = (|| {
            Ok((
                p.username()?,
                p.password()?,
                p.account_no()?,
                p.currency_opt()?,
                p.amount_cents()?,
            ))
        })();
        let Ok((username, password, account_no, currency, amount)) = parsed else {
            return Message::reply_to(request, StatusCode::BadRequest);
        };

        match self
            .bank
            .withdraw(username, password, account_no, currency, amount)
        {
            Ok(new_balance) => {
                changes.push(StateChange {
                    account_no: account_no.to_string(),
                    new_balance_cents: new_balance,
                });
                Message::reply_to(request, StatusCode::Ok).push(TlvField::amount_cents(new_balance))
            }
            Err(err) => Message::reply_to(request, err.into()),
        }
    }

    fn op_query_balance(&self, request: &Message) -> Message {
        let p = &request.payload;
        let parsed: ProtoResult<_> = (|| Ok((p.username()?, p.password()?, p.account_no()?)))();
        let Ok((username, password, account_no)) = parsed else {
            return Message::reply_to(request, StatusCode::BadRequest);
        };

        match self.bank.query_balance(username, password, account_no) {
            Ok((balance, currency)) => Message::reply_to(request, StatusCode::Ok)
                .push(TlvField::amount_cents(balance))
                .push(TlvField::currency(currency)),
            Err(err) => Message::reply_to(request, err.into()),
        }
    }

    fn op_transfer(&self, request: &Message, changes: &mut Vec<StateChange>) -> Message {
        let p = &request.payload;
        let parsed: ProtoResult<_> = (|| {
            Ok((
                p.username()?,
                p.password()?,
                p.account_no()?,
                p.to_account_no()?,
                p.amount_cents()?,
            ))
        })();
        let Ok((username, password, from, to, amount)) = parsed else {
            return Message::reply_to(request, StatusCode::BadRequest);
        };

        match self.bank.transfer(username, password, from, to, amount) {
            Ok(outcome) => {
                changes.push(StateChange {
                    account_no: from.to_string(),
                    new_balance_cents: outcome.source_balance_cents,
                });
                changes.push(StateChange {
                    account_no: to.to_string(),
                    new_balance_cents: outcome.dest_balance_cents,
                });
                Message::reply_to(request, StatusCode::Ok)
                    .push(TlvField::amount_cents(outcome.source_balance_cents))
            }
            Err(err) => Message::reply_to(request, err.into()),
        }
    }

    fn op_register_callback(&self, request: &Message, peer: SocketAddr, now: Instant) -> Message {
        let ttl = match request.payload.ttl_seconds() {
            Ok(ttl) if ttl > 0 => ttl,
            _ => return Message::reply_to(request, StatusCode::BadRequest),
        };

        let client_id = request.header.client_id();
        self.callbacks.register(
            client_id,
            peer,
            std::time::Duration::from_secs(u64::from(ttl)),
            now,
        );
        tracing::info!(client_id, %peer, ttl, "client registered for callbacks");
        Message::reply_to(request, StatusCode::Ok)
    }

    fn op_unregister_callback(&self, request: &Message) -> Message {
        let client_id = request.header.client_id();
        let was_registered = self.callbacks.unregister(client_id);
        tracing::info!(client_id, was_registered, "client unregistered from callbacks");
        Message::reply_to(request, StatusCode::Ok)
    }

    /// Encode a reply, falling back to a bare INTERNAL_ERROR reply.
    #[allow(clippy::expect_used)]
    fn encode_reply(&self, reply: &Message, request: &Message) -> Bytes {
        match reply.encode() {
            Ok(bytes) => bytes.into(),
            Err(err) => {
                tracing::error!(%err, "failed to encode reply, degrading to INTERNAL_ERROR");
                let fallback = Message::reply_to(request, StatusCode::InternalError);
                // A REP with an empty payload has nothing left that can
                // fail to encode.
                fallback
                    .encode()
                    .expect("invariant: empty error reply always encodes")
                    .into()
            }
        }
    }

    /// Build one ACCOUNT_UPDATE fan-out, excluding the originating client.
    fn build_fanout(&self, change: &StateChange, origin: u32, now: Instant) -> Option<Fanout> {
        let recipients = self.callbacks.addresses(origin, now);
        if recipients.is_empty() {
            return None;
        }

        let notification = Message::callback(OpCode::AccountUpdate)
            .push(TlvField::account_no(&change.account_no))
            .push(TlvField::amount_cents(change.new_balance_cents));

        match notification.encode() {
            Ok(bytes) => Some(Fanout {
                notification: bytes.into(),
                recipients,
            }),
            Err(err) => {
                tracing::error!(%err, account_no = %change.account_no, "failed to encode callback");
                None
            }
        }
    }
}
