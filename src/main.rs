// src/main.rs

//! The main entry point for the peridot node daemon.

use anyhow::Result;
use peridot::config::Config;
use peridot::server;
use std::env;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("peridot version {VERSION}");
        return Ok(());
    }

    let config = match args.get(1) {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.node.log_level.clone())),
        )
        .init();

    info!("peridot {} starting", VERSION);
    server::run(config).await
}
