//! busbridge-mock - run a mock bridge broker from the command line.
//!
//! Serves the bridge protocol over WebSocket until Ctrl-C. Useful for
//! driving front-end clients without a real broker:
//!
//! ```text
//! busbridge-mock --port 9870 --echo echo --tick ticker --tick-interval 500
//! ```

// Rust guideline compliant 2026-02

use std::time::Duration;

use anyhow::{Context, Result};
use busbridge::options::{DEFAULT_HOSTNAME, DEFAULT_PORT, DEFAULT_PREFIX};
use busbridge::{ListenOptions, MockBroker, MockBrokerOptions};
use clap::Parser;
use mimalloc::MiMalloc;
use serde_json::json;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "busbridge-mock", version, about = "Mock event-bus bridge broker")]
struct Cli {
    /// TCP port to listen on.
    #[arg(long, env = "BUSBRIDGE_MOCK_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Interface to bind.
    #[arg(long, env = "BUSBRIDGE_MOCK_HOSTNAME", default_value = DEFAULT_HOSTNAME)]
    hostname: String,

    /// Path prefix of the bridge endpoint.
    #[arg(long, env = "BUSBRIDGE_MOCK_PREFIX", default_value = DEFAULT_PREFIX)]
    prefix: String,

    /// Answer `send` frames on this address with their own body (repeatable).
    #[arg(long = "echo", value_name = "ADDRESS")]
    echo: Vec<String>,

    /// Broadcast an incrementing counter on this address (repeatable).
    #[arg(long = "tick", value_name = "ADDRESS")]
    tick: Vec<String>,

    /// Milliseconds between ticks.
    #[arg(long, default_value_t = 1000)]
    tick_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let broker = MockBroker::new(MockBrokerOptions { prefix: cli.prefix });

    for address in &cli.echo {
        log::info!("Echoing sends on {}", address);
        broker.handle_send(address.as_str(), |body, responder| {
            responder.respond(body.clone());
        });
    }

    let addr = broker
        .listen(&ListenOptions {
            port: cli.port,
            hostname: cli.hostname,
        })
        .await
        .context("failed to start mock broker")?;
    println!("Mock broker listening on ws://{}{}", addr, broker.options().prefix);

    if !cli.tick.is_empty() {
        let ticker = broker.clone();
        let addresses = cli.tick;
        let period = Duration::from_millis(cli.tick_interval.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            let mut counter: u64 = 0;
            loop {
                interval.tick().await;
                counter += 1;
                for address in &addresses {
                    if let Err(e) = ticker.send(address.as_str(), json!({ "count": counter })) {
                        log::warn!("Tick on {} failed: {}", address, e);
                    }
                }
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    log::info!("Shutting down");
    broker.close().await;
    Ok(())
}
