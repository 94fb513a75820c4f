//! `mcp-hub` — start every configured child server and supervise it until
//! interrupted.
//!
//! Usage: `mcp-hub [CONFIG]`. Without an argument the config is found via
//! `MCP_HUB_CONFIG` or by searching upward for `mcp-hub.yaml`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;

use mcp_hub::assistant::CodeAssistant;
use mcp_hub::logging;
use mcp_hub::supervisor::{config, ServerRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Must run before the first tracing call.
    let log_path = logging::init_tracing().context("failed to initialize logging")?;

    let config_path = match std::env::args_os().nth(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let cwd = std::env::current_dir().context("cannot read current directory")?;
            config::find_config_path(&cwd)?
        }
    };
    let hub_config = config::load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let registry = Arc::new(ServerRegistry::new(hub_config.servers, hub_config.settings));
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!(
                    server = %event.server,
                    from = %event.from,
                    to = %event.to,
                    "lifecycle event"
                ),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "lifecycle events dropped")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let failed = registry.start_all().await.len();
    let total = registry.names().len();

    let assistant = CodeAssistant::new(Arc::clone(&registry));
    tracing::info!(
        ready = total - failed,
        total,
        assistant_ready = assistant.is_ready(),
        log_file = %log_path.display(),
        "hub initialized"
    );
    eprintln!(
        "mcp-hub: {} of {total} servers ready (logs: {})",
        total - failed,
        log_path.display()
    );

    wait_for_shutdown_signal().await?;

    tracing::info!("shutdown requested");
    registry.shutdown_all().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for Ctrl-C")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")
}
