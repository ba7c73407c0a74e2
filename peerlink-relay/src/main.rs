// Peerlink signaling relay: presence and offer/answer routing over WebSocket.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use peerlink_relay::{config, server};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "peerlink-relay", version, about = "Peerlink signaling relay")]
struct Args {
    /// Config file (default: ~/.config/peerlink/relay.toml, then /etc/peerlink/relay.toml)
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Listen address; overrides config and PEERLINK_BIND
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        cfg.bind = bind;
    }
    let listener = tokio::net::TcpListener::bind(&cfg.bind)
        .await
        .with_context(|| format!("binding {}", cfg.bind))?;
    tracing::info!("peerlink-relay v{} starting", env!("CARGO_PKG_VERSION"));

    tokio::select! {
        result = server::serve(listener, cfg.relay(), Duration::from_millis(cfg.tick_ms.max(1))) => result?,
        result = shutdown_signal() => {
            result?;
            tracing::info!("shutdown signal received");
        }
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
