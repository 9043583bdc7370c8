//! Ledgerwire client binary.
//!
//! # Usage
//!
//! ```bash
//! # Interactive shell
//! ledgerwire-client 127.0.0.1 8888
//!
//! # Dedicated monitor: register for callbacks and print updates
//! ledgerwire-client 127.0.0.1 8888 --monitor --ttl 300 --duration 300
//! ```

use std::{net::SocketAddr, process::ExitCode, time::Duration};

use clap::Parser;
use ledgerwire_client::{BankClient, ClientConfig, ClientError};
use ledgerwire_proto::{Currency, Message, Semantics, StatusCode};
use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Interactive client and callback monitor for the ledgerwire server
#[derive(Parser, Debug)]
#[command(name = "ledgerwire-client")]
#[command(about = "UDP banking client")]
#[command(version)]
struct Args {
    /// Server host
    host: String,

    /// Server port
    port: u16,

    /// Client identifier (random five-digit id if omitted)
    #[arg(long)]
    client_id: Option<u32>,

    /// Default invocation semantics (alo or amo)
    #[arg(long, default_value = "amo")]
    semantics: String,

    /// Append a CRC32 checksum to requests
    #[arg(long)]
    checksum: bool,

    /// Run as a callback monitor instead of the interactive shell
    #[arg(long)]
    monitor: bool,

    /// Callback registration TTL in seconds (monitor mode)
    #[arg(long, default_value_t = 300)]
    ttl: u32,

    /// How long to listen for callbacks in seconds (monitor mode)
    #[arg(long, default_value_t = 300)]
    duration: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return ExitCode::FAILURE;
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let semantics = match args.semantics.to_ascii_lowercase().as_str() {
        "alo" => Semantics::Alo,
        "amo" => Semantics::Amo,
        other => {
            eprintln!("invalid semantics '{other}' (expected alo or amo)");
            return ExitCode::FAILURE;
        }
    };

    let server: SocketAddr = match format!("{}:{}", args.host, args.port).parse() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("invalid server address: {err}");
            return ExitCode::FAILURE;
        }
    };

    let client_id = args
        .client_id
        .unwrap_or_else(|| rand::thread_rng().gen_range(10_000..100_000));

    let mut config = ClientConfig::new(client_id);
    config.default_semantics = semantics;
    config.checksum = args.checksum;

    let client = match BankClient::connect(server, config).await {
        Ok(client) => client,
        Err(err) => {
            eprintln!("failed to create client: {err}");
            return ExitCode::FAILURE;
        }
    };

    let result = if args.monitor {
        run_monitor(&client, args.ttl, Duration::from_secs(args.duration)).await
    } else {
        run_shell(&client).await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fatal: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Register for callbacks and print every ACCOUNT_UPDATE until the
/// listening window closes.
async fn run_monitor(client: &BankClient, ttl: u32, duration: Duration) -> Result<(), ClientError> {
    println!(
        "monitor {} registering for callbacks (ttl {ttl}s)...",
        client.client_id()
    );

    let mut updates = client.subscribe_callbacks();
    let printer = tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            let account = update.payload.account_no().unwrap_or("<missing>").to_string();
            match update.payload.amount_cents() {
                Ok(balance) => {
                    println!("ACCOUNT_UPDATE {account}: balance {}", format_cents(balance));
                }
                Err(_) => println!("ACCOUNT_UPDATE {account}: <malformed>"),
            }
        }
    });

    match client.send_request(client.register_callback(ttl)).await? {
        Some(reply) if reply.header.status() == Some(StatusCode::Ok) => {
            println!("registered; listening for {}s", duration.as_secs());
        }
        Some(reply) => {
            println!("registration failed: {}", status_name(&reply));
            printer.abort();
            return Ok(());
        }
        None => {
            println!("registration timed out");
            printer.abort();
            return Ok(());
        }
    }

    let delivered = client.listen_for_callbacks(duration).await?;
    println!("done, {delivered} notification(s) received");
    printer.abort();
    Ok(())
}

/// Minimal interactive shell over the client library.
async fn run_shell(client: &BankClient) -> Result<(), ClientError> {
    println!("ledgerwire client {} (type 'help' for commands)", client.client_id());

    let mut credentials: Option<(String, String)> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let Ok(Some(line)) = lines.next_line().await else {
            break;
        };
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = parts.first() else {
            continue;
        };

        match (command, parts.as_slice()) {
            ("help" | "?", _) => print_help(),
            ("quit" | "exit", _) => break,
            ("login", [_, user, pass]) => {
                credentials = Some(((*user).to_string(), (*pass).to_string()));
                println!("logged in as {user}");
            }
            ("logout", _) => {
                credentials = None;
                println!("logged out");
            }
            ("open", [_, currency, rest @ ..]) => {
                let Some((user, pass)) = credentials.as_ref() else {
                    println!("login first");
                    continue;
                };
                let Some(currency) = Currency::from_code(currency) else {
                    println!("unknown currency (SGD, USD, EUR, GBP, JPY, CNY)");
                    continue;
                };
                let initial = rest.first().and_then(|c| c.parse().ok()).unwrap_or(0i64);
                let reply = client
                    .send_request(client.open_account(user, pass, currency, initial))
                    .await?;
                print_reply(reply);
            }
            ("close", [_, account]) => {
                let Some((user, pass)) = credentials.as_ref() else {
                    println!("login first");
                    continue;
                };
                let reply = client
                    .send_request(client.close_account(user, pass, account))
                    .await?;
                print_reply(reply);
            }
            ("deposit" | "withdraw", [_, account, cents]) => {
                let Some((user, pass)) = credentials.as_ref() else {
                    println!("login first");
                    continue;
                };
                let Ok(amount) = cents.parse::<i64>() else {
                    println!("invalid amount (minor units)");
                    continue;
                };
                let request = if command == "deposit" {
                    client.deposit(user, pass, account, None, amount)
                } else {
                    client.withdraw(user, pass, account, None, amount)
                };
                print_reply(client.send_request(request).await?);
            }
            ("balance", [_, account]) => {
                let Some((user, pass)) = credentials.as_ref() else {
                    println!("login first");
                    continue;
                };
                let reply = client
                    .send_request(client.query_balance(user, pass, account))
                    .await?;
                print_reply(reply);
            }
            ("transfer", [_, from, to, cents]) => {
                let Some((user, pass)) = credentials.as_ref() else {
                    println!("login first");
                    continue;
                };
                let Ok(amount) = cents.parse::<i64>() else {
                    println!("invalid amount (minor units)");
                    continue;
                };
                let reply = client
                    .send_request(client.transfer(user, pass, from, to, amount))
                    .await?;
                print_reply(reply);
            }
            ("register", [_, ttl]) => {
                let Ok(ttl) = ttl.parse::<u32>() else {
                    println!("invalid ttl");
                    continue;
                };
                print_reply(client.send_request(client.register_callback(ttl)).await?);
            }
            ("unregister", _) => {
                print_reply(client.send_request(client.unregister_callback()).await?);
            }
            _ => println!("unknown or malformed command, type 'help'"),
        }
    }

    Ok(())
}

fn print_help() {
    println!("commands:");
    println!("  login <user> <password>");
    println!("  logout");
    println!("  open <currency> [initialCents]");
    println!("  close <accountNo>");
    println!("  deposit <accountNo> <cents>");
    println!("  withdraw <accountNo> <cents>");
    println!("  balance <accountNo>");
    println!("  transfer <fromAccount> <toAccount> <cents>");
    println!("  register <ttlSeconds>");
    println!("  unregister");
    println!("  quit");
}

fn print_reply(reply: Option<Message>) {
    let Some(reply) = reply else {
        println!("no reply (timed out after all retries)");
        return;
    };

    let status = status_name(&reply);
    if reply.header.status() != Some(StatusCode::Ok) {
        println!("error: {status}");
        return;
    }

    let mut parts = vec![format!("status {status}")];
    if let Ok(account) = reply.payload.account_no() {
        parts.push(format!("account {account}"));
    }
    if let Ok(Some(balance)) = reply.payload.amount_cents_opt() {
        parts.push(format!("balance {}", format_cents(balance)));
    }
    if let Ok(Some(currency)) = reply.payload.currency_opt() {
        parts.push(currency.code().to_string());
    }
    println!("{}", parts.join(", "));
}

fn status_name(reply: &Message) -> String {
    reply
        .header
        .status()
        .map_or_else(|| format!("status {}", reply.header.status_raw()), |s| s.to_string())
}

fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.abs();
    format!("{sign}{}.{:02}", cents / 100, cents % 100)
}
