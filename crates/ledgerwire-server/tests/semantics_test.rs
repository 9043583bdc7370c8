//! End-to-end delivery-semantics scenarios over loopback UDP.
//!
//! Each test runs a real server (and, where a deterministic drop is needed,
//! a small relay that discards the first reply) against the real client
//! with a shortened retry policy.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use ledgerwire_bank::BankService;
use ledgerwire_client::{BankClient, ClientConfig, RetryPolicy};
use ledgerwire_proto::{
    Currency, Message, MsgType, OpCode, Semantics, StatusCode, TlvField,
};
use ledgerwire_server::{ServerConfig, UdpServer};
use tokio::net::UdpSocket;

const FAST_RETRY: RetryPolicy = RetryPolicy {
    initial_timeout: Duration::from_millis(250),
    max_retries: 3,
};

async fn spawn_server(request_loss: f64, reply_loss: f64) -> (Arc<UdpServer>, SocketAddr) {
    let config = ServerConfig {
        bind: SocketAddr::from(([127, 0, 0, 1], 0)),
        request_loss,
        reply_loss,
        ..Default::default()
    };
    let server = Arc::new(
        UdpServer::bind(config, BankService::new())
            .await
            .expect("server should bind"),
    );
    let addr = server.local_addr().expect("bound socket has an address");

    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    (server, addr)
}

/// Relay between client and server that silently discards the first
/// `drop_replies` server→client datagrams. Stands in for reply loss when a
/// test needs the drop to be deterministic rather than Bernoulli.
async fn spawn_reply_dropping_relay(server: SocketAddr, drop_replies: usize) -> SocketAddr {
    let client_side = UdpSocket::bind("127.0.0.1:0").await.expect("relay bind");
    let server_side = UdpSocket::bind("127.0.0.1:0").await.expect("relay bind");
    let addr = client_side.local_addr().expect("relay address");

    tokio::spawn(async move {
        let mut client_peer: Option<SocketAddr> = None;
        let mut remaining_drops = drop_replies;
        let mut inbound = vec![0u8; 65535];
        let mut outbound = vec![0u8; 65535];

        loop {
            tokio::select! {
                received = client_side.recv_from(&mut inbound) => {
                    let Ok((len, peer)) = received else { break };
                    client_peer = Some(peer);
                    let _ = server_side.send_to(&inbound[..len], server).await;
                }
                received = server_side.recv_from(&mut outbound) => {
                    let Ok((len, _)) = received else { break };
                    if remaining_drops > 0 {
                        remaining_drops -= 1;
                        continue;
                    }
                    if let Some(peer) = client_peer {
                        let _ = client_side.send_to(&outbound[..len], peer).await;
                    }
                }
            }
        }
    });

    addr
}

async fn client(server: SocketAddr, client_id: u32) -> BankClient {
    let mut config = ClientConfig::new(client_id);
    config.retry = FAST_RETRY;
    BankClient::connect(server, config)
        .await
        .expect("client should bind")
}

#[tokio::test]
async fn s1_amo_transfer_under_reply_loss_executes_once() {
    let (server, server_addr) = spawn_server(0.0, 0.0).await;
    let bank = server.dispatcher().bank();
    bank.open_account("alice", "pw", Currency::Sgd, 100_000).unwrap(); // ACC-1001
    bank.open_account("bob", "pw", Currency::Sgd, 100_000).unwrap(); // ACC-1002

    let relay = spawn_reply_dropping_relay(server_addr, 1).await;
    let client = client(relay, 1001).await;

    let reply = client
        .send_request_with(
            client.transfer("alice", "pw", "ACC-1001", "ACC-1002", 10_000),
            Semantics::Amo,
        )
        .await
        .unwrap()
        .expect("the retransmission should be answered from the cache");

    assert_eq!(reply.header.status(), Some(StatusCode::Ok));
    assert_eq!(reply.payload.amount_cents().unwrap(), 90_000);

    // Exactly one transfer was applied despite two server-reaching attempts.
    assert_eq!(bank.peek_balance("ACC-1001"), Some(90_000));
    assert_eq!(bank.peek_balance("ACC-1002"), Some(110_000));
    assert_eq!(server.loss().stats().requests_seen, 2);

    server.shutdown();
}

#[tokio::test]
async fn s2_alo_deposit_under_reply_loss_executes_twice() {
    let (server, server_addr) = spawn_server(0.0, 0.0).await;
    let bank = server.dispatcher().bank();
    bank.open_account("alice", "pw", Currency::Sgd, 100_000).unwrap(); // ACC-1001

    let relay = spawn_reply_dropping_relay(server_addr, 1).await;
    let client = client(relay, 1001).await;

    let reply = client
        .send_request_with(
            client.deposit("alice", "pw", "ACC-1001", None, 10_000),
            Semantics::Alo,
        )
        .await
        .unwrap()
        .expect("the retransmission should be answered");

    assert_eq!(reply.header.status(), Some(StatusCode::Ok));
    // Both executions landed: $1000 + 2 x $100.
    assert_eq!(bank.peek_balance("ACC-1001"), Some(120_000));

    server.shutdown();
}

#[tokio::test]
async fn s3_duplicate_open_account_under_alo_reports_already_exists() {
    let (server, server_addr) = spawn_server(0.0, 0.0).await;

    let relay = spawn_reply_dropping_relay(server_addr, 1).await;
    let client = client(relay, 1001).await;

    let reply = client
        .send_request_with(
            client.open_account("alice", "pw", Currency::Sgd, 100_000),
            Semantics::Alo,
        )
        .await
        .unwrap()
        .expect("second attempt should be answered");

    // The first execution created the account; the lost reply hid it from
    // the client, and the re-executed attempt collides with it.
    assert_eq!(reply.header.status(), Some(StatusCode::AlreadyExists));
    assert!(reply.header.flags().has_error());
    assert_eq!(server.dispatcher().bank().account_count(), 1);

    server.shutdown();
}

#[tokio::test]
async fn s4_callback_fan_out_excludes_originator() {
    let (server, server_addr) = spawn_server(0.0, 0.0).await;
    server
        .dispatcher()
        .bank()
        .open_account("alice", "pw", Currency::Sgd, 100_000)
        .unwrap(); // ACC-1001

    // Monitor registers with ttl 60 and keeps listening.
    let monitor = Arc::new(client(server_addr, 9999).await);
    let mut monitor_updates = monitor.subscribe_callbacks();
    let registered = monitor
        .send_request(monitor.register_callback(60))
        .await
        .unwrap()
        .expect("registration reply");
    assert_eq!(registered.header.status(), Some(StatusCode::Ok));

    let listener = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.listen_for_callbacks(Duration::from_secs(2)).await })
    };

    // The originator is registered too: it must still not be notified
    // about its own change.
    let originator = client(server_addr, 1001).await;
    let mut own_updates = originator.subscribe_callbacks();
    originator
        .send_request(originator.register_callback(60))
        .await
        .unwrap()
        .expect("registration reply");

    let reply = originator
        .send_request(originator.deposit("alice", "pw", "ACC-1001", None, 5_000))
        .await
        .unwrap()
        .expect("deposit reply");
    assert_eq!(reply.header.status(), Some(StatusCode::Ok));

    let update = tokio::time::timeout(Duration::from_secs(2), monitor_updates.recv())
        .await
        .expect("monitor should be notified")
        .expect("channel open");
    assert_eq!(update.header.msg_type(), Some(MsgType::Cbk));
    assert_eq!(update.header.op_code(), Some(OpCode::AccountUpdate));
    assert_eq!(update.payload.account_no().unwrap(), "ACC-1001");
    assert_eq!(update.payload.amount_cents().unwrap(), 105_000);

    listener.await.expect("listener task").expect("listen ok");

    // Nothing was addressed to the originator's socket.
    let own_count = originator
        .listen_for_callbacks(Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(own_count, 0);
    assert!(own_updates.try_recv().is_err());

    server.shutdown();
}

#[tokio::test]
async fn s5_retry_exhaustion_sends_six_identical_transmissions() {
    // A sink that counts datagrams and never replies: total reply loss.
    let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let sink_addr = sink.local_addr().unwrap();
    let collector = tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        let mut transmissions = Vec::new();
        for _ in 0..6 {
            let (len, _) = sink.recv_from(&mut buf).await.unwrap();
            transmissions.push(buf[..len].to_vec());
        }
        transmissions
    });

    let mut config = ClientConfig::new(42);
    config.retry = RetryPolicy {
        initial_timeout: Duration::from_millis(50),
        max_retries: 5,
    };
    let client = BankClient::connect(sink_addr, config).await.unwrap();

    let started = std::time::Instant::now();
    let reply = client
        .send_request(client.query_balance("alice", "pw", "ACC-1001"))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(reply.is_none(), "exhausted retries must surface as absent");
    // Six waits with doubling deadlines: 50+100+200+400+800+1600 ms.
    assert!(
        elapsed >= Duration::from_millis(3100),
        "waited only {elapsed:?}"
    );

    let transmissions = collector.await.unwrap();
    assert_eq!(transmissions.len(), 6);
    for (i, t) in transmissions.iter().enumerate().skip(1) {
        assert_eq!(t, &transmissions[0], "transmission {i} differed");
    }
}

#[tokio::test]
async fn s6_callback_interleaved_into_request_wait() {
    // Hand-rolled peer: answers the request with a callback first, then
    // the real reply after a delay, on the same socket.
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let responder = tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        let request = Message::decode(&buf[..len]).unwrap();

        let callback = Message::callback(OpCode::AccountUpdate)
            .push(TlvField::account_no("ACC-7777"))
            .push(TlvField::amount_cents(123_456));
        peer.send_to(&callback.encode().unwrap(), from).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let reply = Message::reply_to(&request, StatusCode::Ok)
            .push(TlvField::amount_cents(90_000));
        peer.send_to(&reply.encode().unwrap(), from).await.unwrap();
    });

    let client = client(peer_addr, 1001).await;
    let mut callbacks = client.subscribe_callbacks();

    let reply = client
        .send_request_with(
            client.transfer("alice", "pw", "ACC-1001", "ACC-1002", 10_000),
            Semantics::Amo,
        )
        .await
        .unwrap()
        .expect("the delayed reply should still be returned");

    assert_eq!(reply.header.status(), Some(StatusCode::Ok));
    assert_eq!(reply.payload.amount_cents().unwrap(), 90_000);

    let callback = callbacks
        .try_recv()
        .expect("the interleaved callback should already be delivered");
    assert_eq!(callback.header.msg_type(), Some(MsgType::Cbk));
    assert_eq!(callback.payload.account_no().unwrap(), "ACC-7777");
    assert_eq!(callback.payload.amount_cents().unwrap(), 123_456);

    responder.await.unwrap();
}

#[tokio::test]
async fn invalid_payload_with_intact_header_gets_bad_request() {
    let (server, server_addr) = spawn_server(0.0, 0.0).await;

    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut wire = Message::request(OpCode::QueryBalance, 1001, 1, Semantics::Alo)
        .push(TlvField::username("alice"))
        .push(TlvField::password("pw"))
        .push(TlvField::account_no("ACC-1001"))
        .encode()
        .unwrap();
    // Corrupt the first TLV's type to an unknown code; the header stays valid.
    wire[32] = 0x00;
    wire[33] = 0x99;

    probe.send_to(&wire, server_addr).await.unwrap();

    let mut buf = vec![0u8; 65535];
    let (len, _) = tokio::time::timeout(Duration::from_secs(1), probe.recv_from(&mut buf))
        .await
        .expect("server should reply")
        .unwrap();

    let reply = Message::decode(&buf[..len]).unwrap();
    assert_eq!(reply.header.msg_type(), Some(MsgType::Rep));
    assert_eq!(reply.header.status(), Some(StatusCode::BadRequest));
    assert_eq!(reply.header.request_id(), (1001u64 << 32) | 1);
    assert!(reply.payload.is_empty());

    server.shutdown();
}

#[tokio::test]
async fn non_request_messages_are_dropped() {
    let (server, server_addr) = spawn_server(0.0, 0.0).await;

    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let request = Message::request(OpCode::QueryBalance, 1, 1, Semantics::Alo)
        .push(TlvField::username("a"))
        .push(TlvField::password("b"))
        .push(TlvField::account_no("ACC-1001"));
    let rogue_reply = Message::reply_to(&request, StatusCode::Ok);
    probe
        .send_to(&rogue_reply.encode().unwrap(), server_addr)
        .await
        .unwrap();

    let mut buf = vec![0u8; 65535];
    let response =
        tokio::time::timeout(Duration::from_millis(300), probe.recv_from(&mut buf)).await;
    assert!(response.is_err(), "a REP sent to the server must be ignored");

    server.shutdown();
}

#[tokio::test]
async fn stale_reply_with_foreign_request_id_is_ignored() {
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    let responder = tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        let request = Message::decode(&buf[..len]).unwrap();

        // A reply correlated to some other request.
        let mut stale = Message::reply_to(&request, StatusCode::Ok);
        stale.header.set_seq_no(request.header.seq_no() + 100);
        stale.header.derive_request_id();
        let stale = stale.push(TlvField::amount_cents(1));
        peer.send_to(&stale.encode().unwrap(), from).await.unwrap();

        let genuine = Message::reply_to(&request, StatusCode::Ok)
            .push(TlvField::amount_cents(42_000));
        peer.send_to(&genuine.encode().unwrap(), from).await.unwrap();
    });

    let client = client(peer_addr, 77).await;
    let reply = client
        .send_request(client.query_balance("alice", "pw", "ACC-1001"))
        .await
        .unwrap()
        .expect("genuine reply should be returned");

    assert_eq!(reply.payload.amount_cents().unwrap(), 42_000);
    responder.await.unwrap();
}
