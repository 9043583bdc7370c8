//! Ledgerwire server binary.
//!
//! # Usage
//!
//! ```bash
//! # Listen on port 8888 with a reliable channel
//! ledgerwire-server 8888
//!
//! # Drop 20% of requests and 20% of replies
//! ledgerwire-server 8888 20 20
//! ```

use std::{net::SocketAddr, process::ExitCode};

use clap::Parser;
use ledgerwire_bank::BankService;
use ledgerwire_server::{ServerConfig, UdpServer};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// UDP banking server with selectable invocation semantics
#[derive(Parser, Debug)]
#[command(name = "ledgerwire-server")]
#[command(about = "UDP request/reply banking server")]
#[command(version)]
struct Args {
    /// UDP port to listen on
    port: u16,

    /// Percentage of inbound requests to drop (0-100)
    #[arg(default_value_t = 0.0)]
    request_loss: f64,

    /// Percentage of outbound replies to drop (0-100)
    #[arg(default_value_t = 0.0)]
    reply_loss: f64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
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

    for (name, pct) in [
        ("request loss", args.request_loss),
        ("reply loss", args.reply_loss),
    ] {
        if !(0.0..=100.0).contains(&pct) {
            eprintln!("invalid {name} percentage: {pct} (must be 0-100)");
            return ExitCode::FAILURE;
        }
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = ServerConfig {
        bind: SocketAddr::from(([0, 0, 0, 0], args.port)),
        request_loss: args.request_loss / 100.0,
        reply_loss: args.reply_loss / 100.0,
        ..Default::default()
    };

    tracing::info!("ledgerwire server starting");
    if config.request_loss > 0.0 || config.reply_loss > 0.0 {
        tracing::info!(
            request_loss_pct = args.request_loss,
            reply_loss_pct = args.reply_loss,
            "loss simulation enabled"
        );
    }

    let server = match UdpServer::bind(config, BankService::new()).await {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(%err, "failed to start server");
            return ExitCode::FAILURE;
        }
    };

    match server.local_addr() {
        Ok(addr) => tracing::info!(%addr, "server listening"),
        Err(err) => tracing::warn!(%err, "could not read local address"),
    }

    tokio::select! {
        result = server.run() => {
            if let Err(err) = result {
                tracing::error!(%err, "receive loop failed");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
            server.shutdown();
        }
    }

    ExitCode::SUCCESS
}
