use anyhow::Context;
use clap::Parser;
use tracing::info;
use veilmatch_relay::{
    spawn_chain_worker, spawn_history_worker, Config, LogHistorySink, OffchainLedger, Relay,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML config file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<String>,

    /// Overrides the configured listen port.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("could not read config file {path}"))?;
            serde_yaml::from_str::<Config>(&raw).context("could not parse config file")?
        }
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }

    let (relay, chain_rx, history_rx) = Relay::new(config.relay_config());
    spawn_chain_worker(OffchainLedger, chain_rx);
    spawn_history_worker(LogHistorySink, history_rx);
    relay.spawn_timers();

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(listener, relay.router())
        .await
        .context("axum server error")?;

    Ok(())
}
