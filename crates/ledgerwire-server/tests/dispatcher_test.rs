//! Dispatcher behavior without sockets.
//!
//! Drives the dispatcher directly with constructed requests and checks
//! reply payloads, AMO deduplication, and callback fan-out assembly.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use ledgerwire_bank::BankService;
use ledgerwire_proto::{
    Currency, Message, MsgType, OpCode, Semantics, StatusCode, TlvField,
};
use ledgerwire_server::{CallbackRegistry, Dispatcher, ReplyCache};

fn peer(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn dispatcher() -> Dispatcher {
    Dispatcher::new(BankService::new(), ReplyCache::new(), CallbackRegistry::new())
}

/// Dispatcher with alice's ACC-1001 (SGD, $1000) and bob's ACC-1002 (SGD, $1000).
fn dispatcher_with_accounts() -> Dispatcher {
    let dispatcher = dispatcher();
    dispatcher
        .bank()
        .open_account("alice", "pw", Currency::Sgd, 100_000)
        .unwrap();
    dispatcher
        .bank()
        .open_account("bob", "pw", Currency::Sgd, 100_000)
        .unwrap();
    dispatcher
}

fn request(op: OpCode, client_id: u32, seq_no: u32, semantics: Semantics) -> Message {
    Message::request(op, client_id, seq_no, semantics)
}

fn decode_reply(bytes: &[u8]) -> Message {
    let reply = Message::decode(bytes).expect("reply should decode");
    assert_eq!(reply.header.msg_type(), Some(MsgType::Rep));
    reply
}

#[test]
fn open_account_reply_carries_account_and_balance() {
    let dispatcher = dispatcher();
    let req = request(OpCode::OpenAccount, 1001, 1, Semantics::Amo)
        .push(TlvField::username("carol"))
        .push(TlvField::password("pw"))
        .push(TlvField::currency(Currency::Usd))
        .push(TlvField::amount_cents(5_000));

    let outcome = dispatcher.dispatch(&req, peer(4000), Instant::now());
    let reply = decode_reply(&outcome.reply);

    assert_eq!(reply.header.status(), Some(StatusCode::Ok));
    assert_eq!(reply.header.request_id(), req.header.request_id());
    assert_eq!(reply.payload.account_no().unwrap(), "ACC-1001");
    assert_eq!(reply.payload.amount_cents().unwrap(), 5_000);
}

#[test]
fn amo_duplicate_executes_once_and_replies_identically() {
    let dispatcher = dispatcher_with_accounts();
    let req = request(OpCode::Deposit, 1001, 7, Semantics::Amo)
        .push(TlvField::username("alice"))
        .push(TlvField::password("pw"))
        .push(TlvField::account_no("ACC-1001"))
        .push(TlvField::amount_cents(10_000));

    let now = Instant::now();
    let first = dispatcher.dispatch(&req, peer(4000), now);
    let second = dispatcher.dispatch(&req, peer(4000), now + Duration::from_millis(700));

    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(first.reply, second.reply, "cached reply must be byte-identical");
    assert!(second.fanout.is_empty(), "cache hit must not re-notify monitors");

    // Exactly one execution observed by the bank.
    assert_eq!(dispatcher.bank().peek_balance("ACC-1001"), Some(110_000));
}

#[test]
fn alo_duplicate_executes_twice() {
    let dispatcher = dispatcher_with_accounts();
    let req = request(OpCode::Deposit, 1001, 7, Semantics::Alo)
        .push(TlvField::username("alice"))
        .push(TlvField::password("pw"))
        .push(TlvField::account_no("ACC-1001"))
        .push(TlvField::amount_cents(10_000));

    let now = Instant::now();
    let first = dispatcher.dispatch(&req, peer(4000), now);
    let second = dispatcher.dispatch(&req, peer(4000), now);

    assert!(!first.from_cache);
    assert!(!second.from_cache);
    assert_eq!(dispatcher.bank().peek_balance("ACC-1001"), Some(120_000));

    let first_reply = decode_reply(&first.reply);
    let second_reply = decode_reply(&second.reply);
    assert_eq!(first_reply.payload.amount_cents().unwrap(), 110_000);
    assert_eq!(second_reply.payload.amount_cents().unwrap(), 120_000);
}

#[test]
fn amo_error_replies_are_cached_too() {
    let dispatcher = dispatcher_with_accounts();
    let req = request(OpCode::Withdraw, 1001, 3, Semantics::Amo)
        .push(TlvField::username("alice"))
        .push(TlvField::password("pw"))
        .push(TlvField::account_no("ACC-1001"))
        .push(TlvField::amount_cents(999_999_999));

    let now = Instant::now();
    let first = dispatcher.dispatch(&req, peer(4000), now);
    let second = dispatcher.dispatch(&req, peer(4000), now);

    assert_eq!(
        decode_reply(&first.reply).header.status(),
        Some(StatusCode::InsufficientFunds)
    );
    assert!(second.from_cache);
    assert_eq!(first.reply, second.reply);
}

#[test]
fn missing_required_tlv_yields_bad_request() {
    let dispatcher = dispatcher_with_accounts();
    // DEPOSIT without amountCents.
    let req = request(OpCode::Deposit, 1001, 1, Semantics::Alo)
        .push(TlvField::username("alice"))
        .push(TlvField::password("pw"))
        .push(TlvField::account_no("ACC-1001"));

    let outcome = dispatcher.dispatch(&req, peer(4000), Instant::now());
    let reply = decode_reply(&outcome.reply);

    assert_eq!(reply.header.status(), Some(StatusCode::BadRequest));
    assert!(reply.header.flags().has_error());
    assert!(reply.payload.is_empty());
    assert_eq!(dispatcher.bank().peek_balance("ACC-1001"), Some(100_000));
}

#[test]
fn account_update_from_client_is_rejected() {
    let dispatcher = dispatcher_with_accounts();
    let req = request(OpCode::AccountUpdate, 1001, 1, Semantics::Alo)
        .push(TlvField::account_no("ACC-1001"))
        .push(TlvField::amount_cents(0));

    let outcome = dispatcher.dispatch(&req, peer(4000), Instant::now());
    assert_eq!(
        decode_reply(&outcome.reply).header.status(),
        Some(StatusCode::BadRequest)
    );
}

#[test]
fn register_callback_requires_positive_ttl() {
    let dispatcher = dispatcher();
    let zero_ttl = request(OpCode::RegisterCallback, 1001, 1, Semantics::Amo)
        .push(TlvField::ttl_seconds(0));
    let outcome = dispatcher.dispatch(&zero_ttl, peer(4000), Instant::now());
    assert_eq!(
        decode_reply(&outcome.reply).header.status(),
        Some(StatusCode::BadRequest)
    );

    let ok_ttl = request(OpCode::RegisterCallback, 1001, 2, Semantics::Amo)
        .push(TlvField::ttl_seconds(60));
    let outcome = dispatcher.dispatch(&ok_ttl, peer(4000), Instant::now());
    assert_eq!(
        decode_reply(&outcome.reply).header.status(),
        Some(StatusCode::Ok)
    );
    assert!(dispatcher
        .callbacks()
        .is_registered(1001, Instant::now()));
}

#[test]
fn unregister_is_safe_when_not_registered() {
    let dispatcher = dispatcher();
    let req = request(OpCode::UnregisterCallback, 1001, 1, Semantics::Amo);
    let outcome = dispatcher.dispatch(&req, peer(4000), Instant::now());
    assert_eq!(
        decode_reply(&outcome.reply).header.status(),
        Some(StatusCode::Ok)
    );
}

#[test]
fn deposit_fans_out_to_monitors_excluding_originator() {
    let dispatcher = dispatcher_with_accounts();
    let now = Instant::now();
    dispatcher
        .callbacks()
        .register(9999, peer(5001), Duration::from_secs(60), now);
    dispatcher
        .callbacks()
        .register(1001, peer(5002), Duration::from_secs(60), now);

    let req = request(OpCode::Deposit, 1001, 1, Semantics::Amo)
        .push(TlvField::username("alice"))
        .push(TlvField::password("pw"))
        .push(TlvField::account_no("ACC-1001"))
        .push(TlvField::amount_cents(5_000));

    let outcome = dispatcher.dispatch(&req, peer(4000), now);

    assert_eq!(outcome.fanout.len(), 1);
    let fanout = &outcome.fanout[0];
    assert_eq!(fanout.recipients, vec![peer(5001)]);

    let notification = Message::decode(&fanout.notification).unwrap();
    assert_eq!(notification.header.msg_type(), Some(MsgType::Cbk));
    assert_eq!(notification.header.op_code(), Some(OpCode::AccountUpdate));
    assert_eq!(notification.payload.account_no().unwrap(), "ACC-1001");
    assert_eq!(notification.payload.amount_cents().unwrap(), 105_000);
}

#[test]
fn transfer_emits_one_callback_per_affected_account() {
    let dispatcher = dispatcher_with_accounts();
    let now = Instant::now();
    dispatcher
        .callbacks()
        .register(9999, peer(5001), Duration::from_secs(60), now);

    let req = request(OpCode::Transfer, 1001, 1, Semantics::Amo)
        .push(TlvField::username("alice"))
        .push(TlvField::password("pw"))
        .push(TlvField::account_no("ACC-1001"))
        .push(TlvField::to_account_no("ACC-1002"))
        .push(TlvField::amount_cents(10_000));

    let outcome = dispatcher.dispatch(&req, peer(4000), now);
    let reply = decode_reply(&outcome.reply);
    assert_eq!(reply.payload.amount_cents().unwrap(), 90_000);

    assert_eq!(outcome.fanout.len(), 2);
    let source = Message::decode(&outcome.fanout[0].notification).unwrap();
    let dest = Message::decode(&outcome.fanout[1].notification).unwrap();
    assert_eq!(source.payload.account_no().unwrap(), "ACC-1001");
    assert_eq!(source.payload.amount_cents().unwrap(), 90_000);
    assert_eq!(dest.payload.account_no().unwrap(), "ACC-1002");
    assert_eq!(dest.payload.amount_cents().unwrap(), 110_000);
}

#[test]
fn query_balance_reply_includes_currency() {
    let dispatcher = dispatcher_with_accounts();
    let req = request(OpCode::QueryBalance, 1001, 1, Semantics::Alo)
        .push(TlvField::username("alice"))
        .push(TlvField::password("pw"))
        .push(TlvField::account_no("ACC-1001"));

    let outcome = dispatcher.dispatch(&req, peer(4000), Instant::now());
    let reply = decode_reply(&outcome.reply);

    assert_eq!(reply.header.status(), Some(StatusCode::Ok));
    assert_eq!(reply.payload.amount_cents().unwrap(), 100_000);
    assert_eq!(reply.payload.currency().unwrap(), Currency::Sgd);
    assert!(outcome.fanout.is_empty(), "queries must not notify monitors");
}

#[test]
fn auth_failure_reply_has_empty_payload() {
    let dispatcher = dispatcher_with_accounts();
    let req = request(OpCode::QueryBalance, 1001, 1, Semantics::Alo)
        .push(TlvField::username("alice"))
        .push(TlvField::password("wrong"))
        .push(TlvField::account_no("ACC-1001"));

    let outcome = dispatcher.dispatch(&req, peer(4000), Instant::now());
    let reply = decode_reply(&outcome.reply);

    assert_eq!(reply.header.status(), Some(StatusCode::AuthFail));
    assert!(reply.payload.is_empty());
}

#[test]
fn expired_cache_entry_re_executes() {
    let dispatcher = Dispatcher::new(
        {
            let bank = BankService::new();
            bank.open_account("alice", "pw", Currency::Sgd, 100_000).unwrap();
            bank
        },
        ReplyCache::with_ttl(Duration::from_secs(10)),
        CallbackRegistry::new(),
    );

    let req = request(OpCode::Deposit, 1001, 1, Semantics::Amo)
        .push(TlvField::username("alice"))
        .push(TlvField::password("pw"))
        .push(TlvField::account_no("ACC-1001"))
        .push(TlvField::amount_cents(1_000));

    let t0 = Instant::now();
    dispatcher.dispatch(&req, peer(4000), t0);
    let late = dispatcher.dispatch(&req, peer(4000), t0 + Duration::from_secs(11));

    assert!(!late.from_cache, "expired entry must not satisfy the retry");
    assert_eq!(dispatcher.bank().peek_balance("ACC-1001"), Some(102_000));
}
