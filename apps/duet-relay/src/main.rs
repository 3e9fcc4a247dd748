use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use duet_relay::config::Config;
use duet_relay::telemetry::init_tracing;
use tokio::net::TcpListener;
use transport_bus::LocalBroker;

#[derive(Debug, Parser)]
#[command(name = "duet-relay", about = "Relay for duet truth-or-dare sessions")]
struct Cli {
    /// Address to listen on; overrides DUET_RELAY_ADDR.
    #[arg(long)]
    addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(addr) = cli.addr {
        config.addr = addr;
    }
    init_tracing(&config.log_filter);

    let listener = TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("binding {}", config.addr))?;
    duet_relay::serve(listener, LocalBroker::new())
        .await
        .context("relay server failed")
}
