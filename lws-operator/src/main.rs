//! The LeaderWorkerSet operator.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

use lws_operator::app::App;
use lws_operator::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Arc::new(Config::new()?);

    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the configured directives.
        .with(tracing_subscriber::EnvFilter::new(&cfg.rust_log))
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    tracing::info!(
        http_port = %cfg.http_port,
        namespace = cfg.namespace.as_deref().unwrap_or("*"),
        field_manager = %cfg.field_manager,
        "starting LeaderWorkerSet operator",
    );
    if let Err(err) = App::new(cfg).await?.spawn().await {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
