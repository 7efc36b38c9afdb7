mod bencode;
mod cli;
mod client;
mod error;
mod peer;
mod piece;
mod storage;
mod torrent;

use anyhow::Context;
use cli::Cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default of info
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    cli.run().await.context("bittorrent-peerwire failed")?;

    Ok(())
}
