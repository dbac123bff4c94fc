//! Tiller gateway — HTTP/SSE boundary over the run engine.

mod api;
mod bootstrap;
mod builtins;
mod run_lock;
mod state;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use tiller_domain::config::Config;

#[derive(Debug, Parser)]
#[command(name = "tiller", about = "LLM agent runtime gateway")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = "tiller.toml")]
    config: PathBuf,

    /// Override the configured port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the configured host.
    #[arg(long)]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = bootstrap::build_state(config)?;
    let router = api::router::build(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "tiller gateway listening");
    axum::serve(listener, router).await?;
    Ok(())
}
