// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ingest_relay::shutdown::{wait_for_signal, DrainOutcome};
use ingest_relay::{Relay, RelayArgs, RelayConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ingest_relay=info")),
        )
        .init();

    let config = RelayConfig::from(RelayArgs::parse());
    let listen_addr = config.listen_addr.clone();

    let relay = Relay::start(config).await.context("failed to start relay")?;

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", listen_addr))?;
    info!(addr = %listen_addr, "Listening");

    // A signal raises the drain flag first so in-flight requests start getting 503s
    let drain = relay.drain_signal();
    let shutdown_signal = async move {
        if let Err(e) = wait_for_signal().await {
            error!(error = %e, "Failed to install signal handlers");
            drain.cancelled().await;
        }
        drain.cancel();
    };

    axum::serve(listener, relay.router())
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("http server failed")?;

    let report = relay.shutdown().await;
    if report.outcome == DrainOutcome::TimedOut {
        warn!("Exited before the worker finished draining; unacked entries stay pending");
    }

    Ok(())
}
