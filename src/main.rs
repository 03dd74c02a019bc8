// Copyright (c) 2026 The Freja Authors
//
// SPDX-License-Identifier: Apache-2.0
//! `freja` binary: parse flags, load config from the environment, start
//! the platform, wait for shutdown. All real behavior lives in the
//! library crates.

mod app;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use freja_config::Config;

#[derive(Parser)]
#[command(name = "freja", version, about = "Multi-tenant agent orchestration platform")]
struct Cli {
    /// Print the effective configuration as JSON and exit.
    #[arg(long)]
    dump_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    if cli.dump_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let _app = app::App::start(config).await?;
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
