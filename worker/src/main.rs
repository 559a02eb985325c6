mod config;
mod executor;
mod worker;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("worker=debug,reqwest=info")),
        )
        .init();

    let config = Config::parse();

    tokio::select! {
        res = worker::run(config) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("apagando worker");
            Ok(())
        }
    }
}
